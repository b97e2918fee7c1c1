use std::io;

use thiserror::Error;

// raw_sync hands back Box<dyn Error> without Send; those are flattened into
// DispatchError::Lock so the error can travel out of worker threads.

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] shared_memory::ShmemError),
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Mutex was poisoned")]
    PoisonedLock,
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Malformed record: {0}")]
    MalformedRecord(String),
    #[error("Key {key} is out of range (table has {num_keys} keys)")]
    InvalidKey { key: u16, num_keys: usize },
    #[error("Key {key} already has request {message_id} in flight")]
    KeyPending { key: u16, message_id: u16 },
    #[error("Dispatcher is not initialized")]
    NotInitialized,
    #[error("Dispatcher is already initialized")]
    AlreadyInitialized,
    #[error("Dispatcher has already been joined")]
    AlreadyJoined,
    #[error("Worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("Logic error: {0}")]
    Logic(String),
}

impl DispatchError {
    pub(crate) fn lock<E: std::fmt::Display>(err: E) -> DispatchError {
        DispatchError::Lock(err.to_string())
    }
}

// Helper for poisoned locks, typically from std::sync::RwLock
impl<T> From<std::sync::PoisonError<T>> for DispatchError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        DispatchError::PoisonedLock
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
