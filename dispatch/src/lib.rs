//! Shared-memory key dispatch: a pool of workers owning the keys of a shared
//! table, fed through bounded request lanes and answering through a bounded
//! response queue.

pub mod config;
pub mod core;
pub mod dispatcher;
pub mod errors;
pub mod host;
pub mod queue;
pub mod record;
pub mod worker;


pub use crate::config::DispatchConfig;
pub use crate::dispatcher::{Dispatcher, DrainReport};
pub use crate::errors::{DispatchError, Result};
pub use crate::record::{FailureCode, Opcode, Request, Response, Status, REQUEST_LEN, RESPONSE_LEN};
