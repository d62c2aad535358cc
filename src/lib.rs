#![deny(missing_docs, unsafe_code, clippy::all, clippy::pedantic)]
#![doc = include_str!("../README.md")]

pub mod config;
pub use config::{Config, DefaultConfig};

pub mod error;
pub use error::Error;

pub mod guard;
pub use guard::Guard;

pub mod keyed_lock;
pub use keyed_lock::KeyedLock;

pub use tokio_util::sync::CancellationToken;

mod entry;
mod wait_queue;
