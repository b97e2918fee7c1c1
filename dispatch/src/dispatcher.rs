use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use crate::config::DispatchConfig;
use crate::core::SharedRegion;
use crate::errors::{DispatchError, Result};
use crate::record::{Request, Response, ResponseBytes};
use crate::worker::{ResponsePolicy, Worker, WorkerHandle, WorkerReport};

const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Outcome of `Dispatcher::join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub workers: Vec<WorkerReport>,
    /// Final value of the completion counter.
    pub completed: usize,
}

impl DrainReport {
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn failed(&self) -> u64 {
        self.workers.iter().map(|w| w.failed).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.workers.iter().map(|w| w.dropped).sum()
    }
}

/// Owns the shared region and the worker pool for their whole lifetime.
///
/// Every operation takes `&self`, so host threads can put requests, drain
/// responses and join at the same time. `join` waits for every worker to
/// consume a termination sentinel; it blocks forever if none are sent (see
/// `shutdown`). The region is unmapped once the dispatcher is dropped and
/// every worker has exited. Dropping a dispatcher that was not joined sends
/// the sentinels and waits for the workers.
pub struct Dispatcher {
    region: Arc<SharedRegion>,
    // A slot is emptied once its worker has been joined.
    workers: Mutex<Vec<Option<WorkerHandle>>>,
    joining: AtomicBool,
    joined: AtomicBool,
}

impl Dispatcher {
    pub fn init(cfg: &DispatchConfig) -> Result<Dispatcher> {
        Dispatcher::start(cfg, Worker::spawn)
    }

    /// Spawns the pool through `spawn`. If a spawn fails, the workers that
    /// already started are sent their sentinel and joined before the error
    /// is returned.
    fn start<S>(cfg: &DispatchConfig, mut spawn: S) -> Result<Dispatcher>
    where
        S: FnMut(Worker) -> io::Result<WorkerHandle>,
    {
        let region = Arc::new(SharedRegion::create(cfg)?);
        let policy = ResponsePolicy::from_config(cfg);
        let mut dispatcher = Dispatcher {
            region: Arc::clone(&region),
            workers: Mutex::new(Vec::with_capacity(cfg.num_workers)),
            joining: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        };

        for index in 0..cfg.num_workers {
            match spawn(Worker::new(index, Arc::clone(&region), policy)) {
                Ok(handle) => dispatcher.workers.get_mut()?.push(Some(handle)),
                Err(e) => {
                    error!(worker = index, error = %e, "failed to spawn worker, stopping the pool");
                    drop(dispatcher);
                    return Err(e.into());
                }
            }
        }
        info!(
            num_keys = cfg.num_keys,
            num_workers = cfg.num_workers,
            backlog = cfg.backlog,
            "dispatcher started"
        );
        Ok(dispatcher)
    }

    pub fn num_keys(&self) -> usize {
        self.region.num_keys()
    }

    pub fn num_workers(&self) -> usize {
        self.region.num_workers()
    }

    /// Routes `request` to the lane of the worker owning its key.
    ///
    /// `Ok(false)` means the lane is full and the caller should retry later.
    /// A key that already has a request in flight is refused with
    /// `KeyPending`; termination sentinels bypass that check.
    pub fn put_request(&self, request: &Request) -> Result<bool> {
        if self.joined.load(Ordering::Acquire) {
            return Err(DispatchError::AlreadyJoined);
        }
        self.region.check_key(request.key)?;
        let lane = self.region.request_lane(self.region.owner_of(request.key));
        let record = request.encode();
        if request.is_sentinel() {
            return lane.push(&record);
        }

        self.region.with_key(request.key, |slot| match slot.pending.in_flight() {
            Some(message_id) => Err(DispatchError::KeyPending {
                key: request.key,
                message_id,
            }),
            None => {
                slot.pending.set(request.message_id);
                Ok(())
            }
        })??;

        if lane.push(&record)? {
            return Ok(true);
        }
        self.region.with_key(request.key, |slot| slot.pending.clear())?;
        Ok(false)
    }

    /// Validates a raw record before it can reach a queue.
    pub fn put_request_bytes(&self, bytes: &[u8]) -> Result<bool> {
        let request = Request::decode(bytes)?;
        self.put_request(&request)
    }

    /// Non-blocking poll of the response queue.
    pub fn get_response(&self) -> Result<Option<Response>> {
        match self.region.responses().pop(false)? {
            Some(bytes) => Ok(Some(Response::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_response_timeout(&self, timeout: Duration) -> Result<Option<Response>> {
        match self.region.responses().pop_timeout(timeout)? {
            Some(bytes) => Ok(Some(Response::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_response_bytes(&self) -> Result<Option<ResponseBytes>> {
        self.region.responses().pop(false)
    }

    /// Message id of the request in flight for `key`, if any.
    pub fn pending(&self, key: u16) -> Result<Option<u16>> {
        self.region.with_key(key, |slot| slot.pending.in_flight())
    }

    pub fn completed_workers(&self) -> Result<usize> {
        self.region.completed_workers()
    }

    /// Sends one termination sentinel to every live worker, waiting for lane
    /// space as needed. Safe to call while another thread is in `join`.
    pub fn shutdown(&self) -> Result<()> {
        self.send_sentinels(false)
    }

    fn send_sentinels(&self, discard_responses: bool) -> Result<()> {
        let spawned = self.workers.lock()?.len();
        for index in 0..spawned {
            let sentinel = Request::end(index as u16).encode();
            let lane = self.region.request_lane(index);
            while !lane.push_timeout(&sentinel, SHUTDOWN_POLL)? {
                if self.worker_exited(index)? {
                    break;
                }
                if discard_responses {
                    self.region.responses().pop(false)?;
                }
            }
        }
        Ok(())
    }

    fn worker_exited(&self, index: usize) -> Result<bool> {
        let workers = self.workers.lock()?;
        Ok(workers
            .get(index)
            .and_then(Option::as_ref)
            .map_or(true, JoinHandle::is_finished))
    }

    /// Blocks until every worker has exited. Other threads keep draining
    /// responses and sending sentinels meanwhile. A second call, or a
    /// `put_request` after it returns, fails with `AlreadyJoined`.
    pub fn join(&self) -> Result<DrainReport> {
        if self.joining.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyJoined);
        }
        let outcomes = self.reap(false);
        self.joined.store(true, Ordering::Release);

        let mut reports = Vec::new();
        let mut failure = None;
        for outcome in outcomes? {
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        reports.sort_by_key(|r| r.worker);
        let completed = self.region.completed_workers()?;
        info!(completed, "workers joined");
        match failure {
            Some(e) => Err(e),
            None => Ok(DrainReport { workers: reports, completed }),
        }
    }

    pub fn shutdown_and_join(&self) -> Result<DrainReport> {
        self.shutdown()?;
        self.join()
    }

    /// Joins workers as they finish, without holding the handle list while
    /// waiting. With `discard_responses` the wait pops responses nobody will
    /// read so workers blocked on a full response queue can move on.
    fn reap(&self, discard_responses: bool) -> Result<Vec<Result<WorkerReport>>> {
        let mut outcomes = Vec::new();
        loop {
            let remaining = {
                let mut workers = self.workers.lock()?;
                for (index, slot) in workers.iter_mut().enumerate() {
                    if !slot.as_ref().map_or(false, JoinHandle::is_finished) {
                        continue;
                    }
                    if let Some(handle) = slot.take() {
                        let outcome = match handle.join() {
                            Ok(outcome) => outcome,
                            Err(_) => Err(DispatchError::WorkerPanicked(index)),
                        };
                        if let Err(e) = &outcome {
                            error!(worker = index, error = %e, "worker failed");
                        }
                        outcomes.push(outcome);
                    }
                }
                workers.iter().filter(|slot| slot.is_some()).count()
            };
            if remaining == 0 {
                return Ok(outcomes);
            }
            if discard_responses {
                self.region.responses().pop_timeout(SHUTDOWN_POLL)?;
            } else {
                thread::sleep(SHUTDOWN_POLL);
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if self.joining.load(Ordering::Acquire) {
            return;
        }
        // Nobody will read responses any more; discarding them keeps workers
        // blocked on a full response queue moving towards their sentinel.
        if let Err(e) = self.send_sentinels(true) {
            error!(error = %e, "failed to stop workers, leaving them detached");
            return;
        }
        if let Err(e) = self.reap(true) {
            error!(error = %e, "failed to join workers");
        }
    }
}
