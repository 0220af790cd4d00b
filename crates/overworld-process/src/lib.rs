pub mod scheduler;

pub use scheduler::{DelegateError, SchedulerDelegate, StageEvent, StageScheduler};
