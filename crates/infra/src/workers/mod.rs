//! Background executors: the worker pool and the reaper.

pub mod builtin;
pub mod handler;
pub mod pool;
pub mod reaper;

pub use builtin::{builtin_registry, register_builtins};
pub use handler::{FnHandler, HandlerRegistry, TaskContext, TaskFailure, TaskHandler, handler_fn};
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use reaper::{Reaper, ReaperHandle};
