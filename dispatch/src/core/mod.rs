use std::ptr;

use raw_sync::locks::{LockImpl, LockInit, Mutex};
use shared_memory::{Shmem, ShmemConf};
use tracing::debug;

use crate::config::DispatchConfig;
use crate::errors::{DispatchError, Result};
use crate::queue::BoundedQueue;
use crate::record::{REQUEST_LEN, RESPONSE_LEN};

pub mod layout;

use self::layout::{PendingEntry, RegionLayout};

pub type RequestQueue = BoundedQueue<REQUEST_LEN>;
pub type ResponseQueue = BoundedQueue<RESPONSE_LEN>;

/// A key's table cell and pending entry, borrowed while the key's lock is held.
pub struct KeySlot<'a> {
    pub value: &'a mut i32,
    pub pending: &'a mut PendingEntry,
}

/// The single shared mapping holding every piece of dispatcher state.
///
/// The mapping is `MAP_SHARED`, so a process forked after `create` sees the
/// same table, queues and (process-shared) locks.
pub struct SharedRegion {
    // Locks and queues are declared before `shmem` so they are released
    // before the memory under them is unmapped.
    key_locks: Vec<Box<dyn LockImpl>>,
    requests: Vec<RequestQueue>,
    responses: ResponseQueue,
    table: *mut i32,
    pending: *mut PendingEntry,
    layout: RegionLayout,
    shmem: Shmem,
}

// Every raw pointer above is dereferenced only while the matching
// process-shared lock is held.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn create(cfg: &DispatchConfig) -> Result<SharedRegion> {
        cfg.validate()?;
        let layout = RegionLayout::new(cfg);

        let mut conf = ShmemConf::new().size(layout.size);
        if let Some(link) = cfg.link_path() {
            conf = conf.flink(link);
        }
        let shmem = conf.create()?;
        let base = shmem.as_ptr();

        unsafe {
            ptr::write_bytes(base, 0, layout.size);
        }
        let table = unsafe { base.add(layout.table) } as *mut i32;
        let pending = unsafe { base.add(layout.pending) } as *mut PendingEntry;
        for key in 0..cfg.num_keys {
            unsafe { table.add(key).write(key as i32) };
        }

        let mut key_locks = Vec::with_capacity(cfg.num_keys + 1);
        for index in 0..=cfg.num_keys {
            let (lock, _) = unsafe {
                Mutex::new(base.add(layout.key_lock(index)), table.add(index) as *mut u8)
            }
            .map_err(DispatchError::lock)?;
            key_locks.push(lock);
        }

        let mut requests = Vec::with_capacity(cfg.num_workers);
        for worker in 0..cfg.num_workers {
            let lane = unsafe { RequestQueue::init(base.add(layout.request_lane(worker)), cfg.backlog)? };
            requests.push(lane);
        }
        let responses = unsafe { ResponseQueue::init(base.add(layout.responses), cfg.response_backlog)? };

        debug!(
            os_id = shmem.get_os_id(),
            size = layout.size,
            num_keys = cfg.num_keys,
            num_workers = cfg.num_workers,
            "shared region mapped"
        );

        Ok(SharedRegion {
            key_locks,
            requests,
            responses,
            table,
            pending,
            layout,
            shmem,
        })
    }

    pub fn num_keys(&self) -> usize {
        self.layout.num_keys
    }

    pub fn num_workers(&self) -> usize {
        self.layout.num_workers
    }

    pub fn os_id(&self) -> &str {
        self.shmem.get_os_id()
    }

    /// Worker index that owns `key`.
    #[inline]
    pub fn owner_of(&self, key: u16) -> usize {
        key as usize % self.layout.num_workers
    }

    pub fn check_key(&self, key: u16) -> Result<()> {
        if (key as usize) < self.layout.num_keys {
            Ok(())
        } else {
            Err(DispatchError::InvalidKey {
                key,
                num_keys: self.layout.num_keys,
            })
        }
    }

    pub fn request_lane(&self, worker: usize) -> &RequestQueue {
        &self.requests[worker]
    }

    pub fn responses(&self) -> &ResponseQueue {
        &self.responses
    }

    /// Runs `f` on `key`'s cell and pending entry under the key's lock.
    pub fn with_key<R, F>(&self, key: u16, f: F) -> Result<R>
    where
        F: FnOnce(&mut KeySlot<'_>) -> R,
    {
        self.check_key(key)?;
        let index = key as usize;
        let _guard = self.key_locks[index].lock().map_err(DispatchError::lock)?;
        let mut slot = unsafe {
            KeySlot {
                value: &mut *self.table.add(index),
                pending: &mut *self.pending.add(index),
            }
        };
        Ok(f(&mut slot))
    }

    /// Bumps the completion counter and returns its new value.
    pub fn mark_worker_done(&self) -> Result<usize> {
        self.with_completion(|count| {
            *count += 1;
            *count as usize
        })
    }

    pub fn completed_workers(&self) -> Result<usize> {
        self.with_completion(|count| *count as usize)
    }

    pub fn is_drained(&self) -> Result<bool> {
        Ok(self.completed_workers()? == self.layout.num_workers)
    }

    fn with_completion<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut i32) -> R,
    {
        let index = self.layout.num_keys;
        let _guard = self.key_locks[index].lock().map_err(DispatchError::lock)?;
        Ok(f(unsafe { &mut *self.table.add(index) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(num_keys: usize, num_workers: usize) -> SharedRegion {
        let cfg = DispatchConfig::builder()
            .num_keys(num_keys)
            .num_workers(num_workers)
            .backlog(4)
            .response_backlog(4)
            .build()
            .unwrap();
        SharedRegion::create(&cfg).unwrap()
    }

    #[test]
    fn table_is_seeded_with_key_ids() -> Result<()> {
        let region = region(5, 2);
        for key in 0..5u16 {
            assert_eq!(region.with_key(key, |slot| *slot.value)?, key as i32);
            assert_eq!(region.with_key(key, |slot| slot.pending.in_flight())?, None);
        }
        assert_eq!(region.completed_workers()?, 0);
        Ok(())
    }

    #[test]
    fn out_of_range_key_is_rejected() {
        let region = region(3, 1);
        assert!(matches!(
            region.with_key(3, |_| ()),
            Err(DispatchError::InvalidKey { key: 3, num_keys: 3 })
        ));
    }

    #[test]
    fn keys_route_round_robin() {
        let region = region(10, 3);
        assert_eq!(region.owner_of(0), 0);
        assert_eq!(region.owner_of(4), 1);
        assert_eq!(region.owner_of(8), 2);
    }

    #[test]
    fn completion_counter_reaches_drained() -> Result<()> {
        let region = region(4, 2);
        assert_eq!(region.mark_worker_done()?, 1);
        assert!(!region.is_drained()?);
        assert_eq!(region.mark_worker_done()?, 2);
        assert!(region.is_drained()?);
        Ok(())
    }

    #[test]
    fn link_file_names_the_mapping() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = DispatchConfig::builder()
            .num_keys(2)
            .num_workers(1)
            .data_dir(dir.path().to_str().unwrap().to_string())
            .shmem_file_name("dispatch.ipc".to_string())
            .build()?;
        let region = SharedRegion::create(&cfg)?;
        assert!(dir.path().join("dispatch.ipc").exists());
        assert!(!region.os_id().is_empty());
        Ok(())
    }
}
