//! Turns operation graphs into work: memory projections, fusion and task generation.
pub mod memory;
pub mod optimize;
pub mod tasks;

pub use self::optimize::{optimize, optimize_with};
pub use self::tasks::{generate_tasks, payload_kind};
