#![deny(missing_docs, clippy::all, clippy::pedantic)]
#![doc = include_str!("../README.md")]

pub mod deferred;
pub use deferred::{Deferred, join_all};

pub mod error;
pub use error::Error;

pub mod lock;
pub use lock::FairRwLock;

pub mod named_lock;
pub use named_lock::{NamedReadLockToken, NamedRwLock, NamedWriteLockToken};

pub mod token;
pub use token::{ReadLockToken, WriteLockToken};

mod opcode;
mod sync_primitive;
mod wait_queue;
