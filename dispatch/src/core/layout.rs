use std::mem;

use raw_sync::events::{Event, EventInit};
use raw_sync::locks::{LockInit, Mutex};

use crate::config::DispatchConfig;
use crate::queue::BoundedQueue;
use crate::record::{REQUEST_LEN, RESPONSE_LEN};

#[inline]
pub fn align_up(offset: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (offset + align - 1) & !(align - 1)
}

const PRIMITIVE_ALIGN: usize = mem::align_of::<u64>();

/// Stride reserved for one process-shared mutex.
#[inline]
pub fn mutex_stride() -> usize {
    align_up(Mutex::size_of(None), PRIMITIVE_ALIGN)
}

/// Stride reserved for one process-shared event.
#[inline]
pub fn event_stride() -> usize {
    align_up(Event::size_of(None), PRIMITIVE_ALIGN)
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct PendingEntry {
    pub is_pending: u8,
    _pad: u8,
    pub message_id: u16,
}

impl PendingEntry {
    pub fn in_flight(&self) -> Option<u16> {
        if self.is_pending != 0 {
            Some(self.message_id)
        } else {
            None
        }
    }

    pub fn set(&mut self, message_id: u16) {
        self.is_pending = 1;
        self.message_id = message_id;
    }

    pub fn clear(&mut self) {
        self.is_pending = 0;
        self.message_id = 0;
    }
}

/// Byte offsets of every section of the shared mapping:
///
/// ```text
/// KeyTable [i32; num_keys + 1] | PendingMap [PendingEntry; num_keys]
/// | request lanes (one per worker) | response queue | key locks [num_keys + 1]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLayout {
    pub num_keys: usize,
    pub num_workers: usize,
    pub table: usize,
    pub pending: usize,
    pub requests: usize,
    pub request_stride: usize,
    pub responses: usize,
    pub key_locks: usize,
    pub lock_stride: usize,
    pub size: usize,
}

const SECTION_ALIGN: usize = 64;

impl RegionLayout {
    pub fn new(cfg: &DispatchConfig) -> RegionLayout {
        let table = 0;
        let pending = align_up(
            table + mem::size_of::<i32>() * (cfg.num_keys + 1),
            mem::align_of::<PendingEntry>(),
        );
        let requests = align_up(
            pending + mem::size_of::<PendingEntry>() * cfg.num_keys,
            SECTION_ALIGN,
        );
        let request_stride = align_up(
            BoundedQueue::<REQUEST_LEN>::footprint(cfg.backlog),
            SECTION_ALIGN,
        );
        let responses = requests + request_stride * cfg.num_workers;
        let key_locks = align_up(
            responses + BoundedQueue::<RESPONSE_LEN>::footprint(cfg.response_backlog),
            SECTION_ALIGN,
        );
        let lock_stride = mutex_stride();
        let size = key_locks + lock_stride * (cfg.num_keys + 1);
        RegionLayout {
            num_keys: cfg.num_keys,
            num_workers: cfg.num_workers,
            table,
            pending,
            requests,
            request_stride,
            responses,
            key_locks,
            lock_stride,
            size,
        }
    }

    #[inline]
    pub fn request_lane(&self, worker: usize) -> usize {
        debug_assert!(worker < self.num_workers);
        self.requests + worker * self.request_stride
    }

    /// Lock `num_keys` guards the completion counter.
    #[inline]
    pub fn key_lock(&self, index: usize) -> usize {
        debug_assert!(index <= self.num_keys);
        self.key_locks + index * self.lock_stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(num_keys: usize, num_workers: usize, backlog: usize) -> RegionLayout {
        let cfg = DispatchConfig::builder()
            .num_keys(num_keys)
            .num_workers(num_workers)
            .backlog(backlog)
            .response_backlog(backlog)
            .build()
            .unwrap();
        RegionLayout::new(&cfg)
    }

    #[test]
    fn table_is_followed_by_pending_map() {
        let l = layout(3, 3, 2);
        assert_eq!(l.table, 0);
        assert_eq!(l.pending, 4 * 4);
        assert!(l.requests >= l.pending + 3 * mem::size_of::<PendingEntry>());
    }

    #[test]
    fn sections_do_not_overlap() {
        let l = layout(10_000, 16, 1000);
        assert!(l.request_lane(15) + BoundedQueue::<REQUEST_LEN>::footprint(1000) <= l.responses);
        assert!(l.responses + BoundedQueue::<RESPONSE_LEN>::footprint(1000) <= l.key_locks);
        assert_eq!(l.key_lock(10_000) + l.lock_stride, l.size);
    }

    #[test]
    fn queues_start_aligned() {
        let l = layout(7, 3, 5);
        for w in 0..3 {
            assert_eq!(l.request_lane(w) % SECTION_ALIGN, 0);
        }
        assert_eq!(l.responses % SECTION_ALIGN, 0);
    }

    #[test]
    fn pending_entry_tracks_message() {
        let mut entry = PendingEntry::default();
        assert_eq!(entry.in_flight(), None);
        entry.set(42);
        assert_eq!(entry.in_flight(), Some(42));
        entry.clear();
        assert_eq!(entry.in_flight(), None);
    }
}
