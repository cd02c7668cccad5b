//! faceindex-worker: runtime lifecycle, operation dispatch and worker threads.
//!
//! A worker owns one [`runtime::RuntimeManager`] and one [`cache::WorkerCache`]
//! on a dedicated thread. Callers talk to it through a [`WorkerHandle`] using
//! kebab-case operation tags and JSON arguments.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod ops;
pub mod protocol;
pub mod runtime;
pub mod worker;

pub use config::Config;
pub use dispatcher::{DispatchError, Dispatcher};
pub use ops::Operation;
pub use runtime::{ModelLoader, OrtLoader, RuntimeConfig, RuntimeManager};
pub use worker::{spawn_worker, WorkerError, WorkerHandle};
