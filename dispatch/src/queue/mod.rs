use std::mem;
use std::ptr;
use std::time::{Duration, Instant};

use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use tracing::debug;

use crate::core::layout::{align_up, event_stride, mutex_stride};
use crate::errors::{DispatchError, Result};

#[derive(Default, Copy, Clone, Debug)]
#[repr(C)]
struct QueueHeader {
    capacity: u32,
    // occupied slots
    size: u32,
    // oldest unread slot
    left: u32,
    // next free slot
    right: u32,
}

#[derive(Copy, Clone, Debug)]
enum Wait {
    Never,
    Forever,
    Until(Instant),
}

impl Wait {
    fn after(timeout: Duration) -> Wait {
        Wait::Until(Instant::now() + timeout)
    }
}

/// Fixed-capacity circular buffer of `W`-byte records living in shared memory.
///
/// One process-shared mutex guards the header and slots; two auto-reset events
/// play the role of the not-empty and not-full condition variables. A waiter
/// re-checks the header after every wake-up, and a consumer that leaves records
/// behind re-arms not-empty so a single signal never strands other waiters.
pub struct BoundedQueue<const W: usize> {
    lock: Box<dyn LockImpl>,
    not_empty: Box<dyn EventImpl>,
    not_full: Box<dyn EventImpl>,
    header: *mut QueueHeader,
    slots: *mut u8,
}

// The header and slots are only touched while `lock` is held, and the
// raw_sync primitives are process-shared pthread objects.
unsafe impl<const W: usize> Send for BoundedQueue<W> {}
unsafe impl<const W: usize> Sync for BoundedQueue<W> {}

impl<const W: usize> BoundedQueue<W> {
    const HEADER_SIZE: usize = mem::size_of::<QueueHeader>();

    fn slots_end(capacity: usize) -> usize {
        align_up(Self::HEADER_SIZE + W * capacity, mem::align_of::<u64>())
    }

    /// Bytes of shared memory needed for a queue of `capacity` records,
    /// including its lock and events.
    pub fn footprint(capacity: usize) -> usize {
        Self::slots_end(capacity) + mutex_stride() + 2 * event_stride()
    }

    /// Lays out a fresh queue at `base`.
    ///
    /// # Safety
    /// `base` must be 8-byte aligned, zero-filled, valid for
    /// `footprint(capacity)` bytes and outlive the returned queue.
    pub unsafe fn init(base: *mut u8, capacity: usize) -> Result<Self> {
        assert!(capacity > 0 && capacity <= u32::MAX as usize);
        let header = base as *mut QueueHeader;
        header.write(QueueHeader {
            capacity: capacity as u32,
            ..Default::default()
        });
        let slots = base.add(Self::HEADER_SIZE);

        let lock_p = base.add(Self::slots_end(capacity));
        let (lock, _) = Mutex::new(lock_p, base).map_err(DispatchError::lock)?;
        let not_empty_p = lock_p.add(mutex_stride());
        let (not_empty, _) = Event::new(not_empty_p, true).map_err(DispatchError::lock)?;
        let not_full_p = not_empty_p.add(event_stride());
        let (not_full, _) = Event::new(not_full_p, true).map_err(DispatchError::lock)?;

        Ok(BoundedQueue { lock, not_empty, not_full, header, slots })
    }

    /// Appends `record`, or returns `false` without blocking when the queue is full.
    pub fn push(&self, record: &[u8; W]) -> Result<bool> {
        self.push_with(record, Wait::Never)
    }

    /// Like `push`, but waits up to `timeout` for a slot to free up.
    pub fn push_timeout(&self, record: &[u8; W], timeout: Duration) -> Result<bool> {
        self.push_with(record, Wait::after(timeout))
    }

    /// Removes the oldest record. An empty queue yields `None` unless
    /// `blocking`, in which case the call waits for a producer.
    pub fn pop(&self, blocking: bool) -> Result<Option<[u8; W]>> {
        self.pop_with(if blocking { Wait::Forever } else { Wait::Never })
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<[u8; W]>> {
        self.pop_with(Wait::after(timeout))
    }

    pub fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock().map_err(DispatchError::lock)?;
        Ok(unsafe { (*self.header).size } as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> usize {
        // immutable after init
        unsafe { (*self.header).capacity as usize }
    }

    fn push_with(&self, record: &[u8; W], wait: Wait) -> Result<bool> {
        loop {
            if self.try_push(record)? {
                return Ok(true);
            }
            if !park(self.not_full.as_ref(), wait)? {
                return Ok(false);
            }
        }
    }

    fn pop_with(&self, wait: Wait) -> Result<Option<[u8; W]>> {
        loop {
            if let Some(record) = self.try_pop()? {
                return Ok(Some(record));
            }
            if !park(self.not_empty.as_ref(), wait)? {
                return Ok(None);
            }
        }
    }

    fn try_push(&self, record: &[u8; W]) -> Result<bool> {
        let _guard = self.lock.lock().map_err(DispatchError::lock)?;
        let header = unsafe { &mut *self.header };
        if header.size == header.capacity {
            return Ok(false);
        }
        unsafe {
            ptr::copy_nonoverlapping(record.as_ptr(), self.slot(header.right), W);
        }
        header.right = (header.right + 1) % header.capacity;
        header.size += 1;
        if header.size < header.capacity {
            self.not_full.set(EventState::Signaled).map_err(DispatchError::lock)?;
        }
        self.not_empty.set(EventState::Signaled).map_err(DispatchError::lock)?;
        Ok(true)
    }

    fn try_pop(&self) -> Result<Option<[u8; W]>> {
        let _guard = self.lock.lock().map_err(DispatchError::lock)?;
        let header = unsafe { &mut *self.header };
        if header.size == 0 {
            return Ok(None);
        }
        let mut record = [0u8; W];
        unsafe {
            ptr::copy_nonoverlapping(self.slot(header.left), record.as_mut_ptr(), W);
        }
        header.left = (header.left + 1) % header.capacity;
        header.size -= 1;
        if header.size > 0 {
            self.not_empty.set(EventState::Signaled).map_err(DispatchError::lock)?;
        }
        self.not_full.set(EventState::Signaled).map_err(DispatchError::lock)?;
        Ok(Some(record))
    }

    #[inline]
    unsafe fn slot(&self, index: u32) -> *mut u8 {
        self.slots.add(index as usize * W)
    }
}

/// Sleeps on `event` according to `wait`. Returns `false` once the caller
/// should give up.
fn park(event: &dyn EventImpl, wait: Wait) -> Result<bool> {
    match wait {
        Wait::Never => Ok(false),
        Wait::Forever => {
            event.wait(Timeout::Infinite).map_err(DispatchError::lock)?;
            Ok(true)
        }
        Wait::Until(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let outcome = event.wait(Timeout::Val(deadline - now));
            note_early_wake(outcome, deadline);
            Ok(true)
        }
    }
}

/// raw_sync reports an expired timed wait as an error, so only a failure
/// before the deadline is worth reporting. Returns whether it was one; the
/// caller re-checks the queue and the deadline either way.
fn note_early_wake<E: std::fmt::Display>(outcome: std::result::Result<(), E>, deadline: Instant) -> bool {
    match outcome {
        Err(e) if Instant::now() < deadline => {
            debug!(error = %e, "timed wait failed before its deadline");
            true
        }
        _ => false,
    }
}
