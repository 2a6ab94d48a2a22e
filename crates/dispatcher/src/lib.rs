pub mod ingest;
pub mod normalizer;
pub mod ring;
pub mod scheduler;

pub use ingest::NotificationPump;
pub use normalizer::normalize;
pub use ring::HashRing;
pub use scheduler::{run_dispatch_loop, Scheduler, SchedulerState, WorkerFactory};
