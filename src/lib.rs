//! Tessera: chunked arrays computed as a graph of blockwise and rechunk operations, with a
//! fusion optimizer and a fault-tolerant executor.
#![allow(clippy::too_many_arguments, clippy::many_single_char_names)]

#[macro_use]
mod prelude;
pub mod api;
pub mod backend;
pub mod driver;
pub mod graph;
pub mod planner;
pub mod storage;
pub mod types;
pub mod worker;

pub use crate::api::{execute, Engine};
pub use crate::graph::OperationGraph;
pub use crate::types::Config;

pub fn hostname() -> &'static str {
    lazy_static::lazy_static! {
        static ref HOSTNAME: String = {
            match ::hostname::get() {
                Ok(s) => s.to_string_lossy().into_owned(),
                Err(_) => "<anonymous>".into(),
            }
        };
    };

    &*HOSTNAME
}

pub fn initialize_logger() {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref START_TIMING: Instant = Instant::now();
    }

    let _ = *START_TIMING;

    env_logger::Builder::from_default_env()
        .format(|formatter, record| {
            use std::io::Write;
            let duration = START_TIMING.elapsed();

            writeln!(
                formatter,
                "[{} {} {:.03}] {}: {}",
                hostname(),
                record.module_path().unwrap_or("?"),
                duration.as_secs_f64(),
                record.level(),
                record.args(),
            )
        })
        .init();
}
