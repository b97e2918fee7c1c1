use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::DispatchConfig;
use crate::core::SharedRegion;
use crate::errors::Result;
use crate::record::{FailureCode, Opcode, Request, Response};

/// What a worker does when the response queue stays full.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResponsePolicy {
    /// `None` keeps retrying until the host drains responses.
    pub retry_limit: Option<u32>,
    pub backoff: Duration,
}

impl ResponsePolicy {
    pub fn from_config(cfg: &DispatchConfig) -> ResponsePolicy {
        ResponsePolicy {
            retry_limit: cfg.response_retry_limit,
            backoff: cfg.response_backoff(),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub worker: usize,
    pub processed: u64,
    pub failed: u64,
    /// Responses given up on under a bounded `ResponsePolicy`.
    pub dropped: u64,
    /// Records that could not be decoded.
    pub rejected: u64,
}

pub type WorkerHandle = JoinHandle<Result<WorkerReport>>;

pub struct Worker {
    index: usize,
    region: Arc<SharedRegion>,
    policy: ResponsePolicy,
}

impl Worker {
    pub fn new(index: usize, region: Arc<SharedRegion>, policy: ResponsePolicy) -> Worker {
        Worker { index, region, policy }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spawn(self) -> io::Result<WorkerHandle> {
        thread::Builder::new()
            .name(format!("dispatch-worker-{}", self.index))
            .spawn(move || self.run())
    }

    /// Serves this worker's lane until a termination sentinel arrives.
    pub fn run(self) -> Result<WorkerReport> {
        let lane = self.region.request_lane(self.index);
        let mut report = WorkerReport {
            worker: self.index,
            ..Default::default()
        };
        debug!(worker = self.index, "worker started");

        loop {
            let bytes = match lane.pop(true)? {
                Some(bytes) => bytes,
                None => continue,
            };
            let request = match Request::decode(&bytes) {
                Ok(request) => request,
                Err(e) => {
                    warn!(worker = self.index, error = %e, "discarding undecodable request");
                    report.rejected += 1;
                    continue;
                }
            };

            if request.is_sentinel() {
                let done = self.region.mark_worker_done()?;
                debug!(worker = self.index, done, "worker exiting");
                if done == self.region.num_workers() {
                    info!(workers = done, "all workers drained");
                }
                return Ok(report);
            }

            let response = process(&self.region, &request, |current| {
                apply(request.opcode, current, request.operand)
            })?;
            if response.is_ack() {
                report.processed += 1;
            } else {
                report.failed += 1;
            }
            if !self.publish(&response)? {
                report.dropped += 1;
            }
        }
    }

    fn publish(&self, response: &Response) -> Result<bool> {
        let record = response.encode();
        let responses = self.region.responses();
        if responses.push(&record)? {
            return Ok(true);
        }
        let mut retries = 0u32;
        loop {
            if let Some(limit) = self.policy.retry_limit {
                if retries >= limit {
                    warn!(
                        worker = self.index,
                        message_id = response.message_id,
                        retries,
                        "response queue full, dropping response"
                    );
                    return Ok(false);
                }
            }
            retries += 1;
            if responses.push_timeout(&record, self.policy.backoff)? {
                return Ok(true);
            }
        }
    }
}

/// Applies `update` to the request's key under its lock and clears the key's
/// pending entry. A panicking update leaves the cell untouched.
pub(crate) fn process<F>(region: &SharedRegion, request: &Request, update: F) -> Result<Response>
where
    F: FnOnce(i32) -> std::result::Result<i32, FailureCode>,
{
    region.with_key(request.key, |slot| {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| update(*slot.value)));
        slot.pending.clear();
        match outcome {
            Ok(Ok(next)) => {
                *slot.value = next;
                Response::ack(request.message_id, next as u16)
            }
            Ok(Err(code)) => Response::cancel(request.message_id, code),
            Err(_) => {
                warn!(key = request.key, message_id = request.message_id, "update panicked");
                Response::cancel(request.message_id, FailureCode::WorkerPanic)
            }
        }
    })
}

/// Table values stay within the `u16` range carried by responses.
pub(crate) fn apply(opcode: Opcode, current: i32, operand: u16) -> std::result::Result<i32, FailureCode> {
    let next = match opcode {
        Opcode::Get | Opcode::End => current,
        Opcode::Set => operand as i32,
        Opcode::Add => current + (operand as i16) as i32,
    };
    if (0..=u16::MAX as i32).contains(&next) {
        Ok(next)
    } else {
        Err(FailureCode::OutOfRange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> SharedRegion {
        let cfg = DispatchConfig::builder()
            .num_keys(4)
            .num_workers(1)
            .backlog(2)
            .response_backlog(2)
            .build()
            .unwrap();
        SharedRegion::create(&cfg).unwrap()
    }

    #[test]
    fn apply_semantics() {
        assert_eq!(apply(Opcode::Get, 7, 99), Ok(7));
        assert_eq!(apply(Opcode::Set, 7, 99), Ok(99));
        assert_eq!(apply(Opcode::Add, 7, 5), Ok(12));
        assert_eq!(apply(Opcode::Add, 7, (-7i16) as u16), Ok(0));
        assert_eq!(apply(Opcode::Add, 7, (-8i16) as u16), Err(FailureCode::OutOfRange));
        assert_eq!(apply(Opcode::Add, 65_535, 1), Err(FailureCode::OutOfRange));
    }

    #[test]
    fn process_updates_cell_and_clears_pending() -> Result<()> {
        let region = region();
        region.with_key(1, |slot| slot.pending.set(11))?;
        let request = Request::add(11, 1, 5);
        let response = process(&region, &request, |v| apply(Opcode::Add, v, 5))?;
        assert_eq!(response, Response::ack(11, 6));
        assert_eq!(region.with_key(1, |slot| (*slot.value, slot.pending.in_flight()))?, (6, None));
        Ok(())
    }

    #[test]
    fn failed_update_leaves_cell_alone() -> Result<()> {
        let region = region();
        let request = Request::add(3, 2, -10);
        let response = process(&region, &request, |v| apply(Opcode::Add, v, request.operand))?;
        assert_eq!(response, Response::cancel(3, FailureCode::OutOfRange));
        assert_eq!(region.with_key(2, |slot| *slot.value)?, 2);
        Ok(())
    }

    #[test]
    fn panicking_update_is_contained() -> Result<()> {
        let region = region();
        region.with_key(3, |slot| slot.pending.set(8))?;
        let request = Request::set(8, 3, 100);
        let response = process(&region, &request, |_| panic!("update blew up"))?;
        assert_eq!(response.failure(), Some(FailureCode::WorkerPanic));
        assert_eq!(region.with_key(3, |slot| (*slot.value, slot.pending.in_flight()))?, (3, None));
        // The key lock was released on the way out.
        assert_eq!(region.with_key(3, |slot| *slot.value)?, 3);
        Ok(())
    }

    #[test]
    fn bounded_policy_drops_when_responses_back_up() -> Result<()> {
        let region = Arc::new(region());
        let worker = Worker::new(
            0,
            Arc::clone(&region),
            ResponsePolicy {
                retry_limit: Some(2),
                backoff: Duration::from_millis(1),
            },
        );
        assert!(worker.publish(&Response::ack(1, 1))?);
        assert!(worker.publish(&Response::ack(2, 2))?);
        assert!(!worker.publish(&Response::ack(3, 3))?);
        assert_eq!(region.responses().len()?, 2);
        Ok(())
    }
}
