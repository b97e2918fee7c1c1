//! Process-wide `init` / `join` / `put_request` / `get_response` entry points
//! over raw records, for hosts that bind a flat call surface (FFI, scripting
//! runtimes). Holds at most one `Dispatcher` at a time.

use std::process;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::error;

use crate::config::DispatchConfig;
use crate::dispatcher::{Dispatcher, DrainReport};
use crate::errors::{DispatchError, Result};
use crate::record::ResponseBytes;

pub const EXIT_SPAWN_FAILED: i32 = 1;
pub const EXIT_MAP_FAILED: i32 = 2;

static DISPATCHER: Lazy<RwLock<Option<Arc<Dispatcher>>>> = Lazy::new(|| RwLock::new(None));

fn current() -> Result<Arc<Dispatcher>> {
    DISPATCHER.read()?.clone().ok_or(DispatchError::NotInitialized)
}

pub fn init() -> Result<()> {
    init_with(&DispatchConfig::default())
}

/// Starts the dispatcher. A region that cannot be mapped or a worker that
/// cannot be spawned terminates the process.
pub fn init_with(cfg: &DispatchConfig) -> Result<()> {
    cfg.validate()?;
    let mut slot = DISPATCHER.write()?;
    if slot.is_some() {
        return Err(DispatchError::AlreadyInitialized);
    }
    match Dispatcher::init(cfg) {
        Ok(dispatcher) => {
            *slot = Some(Arc::new(dispatcher));
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "dispatcher init failed");
            let code = match e {
                DispatchError::Io(_) => EXIT_SPAWN_FAILED,
                _ => EXIT_MAP_FAILED,
            };
            process::exit(code)
        }
    }
}

/// Waits for every worker to drain. The dispatcher stays reachable while
/// waiting, so other threads can still send sentinels and read responses;
/// it is released once every worker has exited. Later calls see
/// `NotInitialized`.
pub fn join() -> Result<DrainReport> {
    let dispatcher = current()?;
    let report = dispatcher.join();
    if !matches!(report, Err(DispatchError::AlreadyJoined)) {
        let mut slot = DISPATCHER.write()?;
        if slot.as_ref().map_or(false, |d| Arc::ptr_eq(d, &dispatcher)) {
            *slot = None;
        }
    }
    report
}

pub fn put_request(record: &[u8]) -> Result<bool> {
    current()?.put_request_bytes(record)
}

pub fn get_response() -> Result<Option<ResponseBytes>> {
    current()?.get_response_bytes()
}

/// Queues a termination sentinel for every worker.
pub fn shutdown() -> Result<()> {
    current()?.shutdown()
}
