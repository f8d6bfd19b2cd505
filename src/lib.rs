#![forbid(unsafe_code)]

//! Sandbox execution and session continuity for agent turns.

pub mod config;
pub mod container;
pub mod continuity;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod protocol;
pub mod router;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod transport;
pub mod trust;

use std::future::Future;
use std::pin::Pin;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};

/// Boxed, `Send` future used at the crate's object-safe async seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
