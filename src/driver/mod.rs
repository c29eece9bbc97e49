//! Coordinates the execution of an operation graph: allocation of outputs, dispatch of tasks,
//! retries, straggler backups and failure handling.
mod callback;
mod clock;
mod executor;
mod trace;

pub use self::callback::{Callback, TaskCounter};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::executor::Executor;
