//! Background task execution: a durable task type, a fixed-size worker
//! pool, and the executor routing tasks to converters and the toolbox.

pub mod executor;
pub mod pool;
pub mod task;

pub use executor::Executor;
pub use pool::{TaskSender, WorkerPool};
pub use task::Task;
