pub mod build_id;
pub mod callchain;
pub mod cli;
pub mod commands;
pub mod environment;
pub mod error;
pub mod event;
pub mod io_loop;
pub mod perf;
pub mod record;
pub mod record_file;
pub mod sample_tree;
pub mod symbols;
pub mod thread_tree;

pub use error::{Error, Result};
