pub mod cache;
pub mod reconciler;
pub mod service;
pub mod task_queue;

pub use cache::ResourceCache;
pub use reconciler::{LoggingReconciler, ReconcileError, Reconciler};
pub use service::{EventWorker, WorkerContext};
pub use task_queue::{Task, TaskError, TaskHandler, TaskQueue, TaskQueueHandle};
