//! Foundation types shared by the tessera planner, executor and workers.
mod data_type;
mod geom;
pub mod prelude;
pub mod util;

pub use data_type::*;
pub use geom::*;
