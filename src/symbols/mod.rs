//! Symbol lookup for reports and build ids for recorded files.

pub mod dso;
pub mod elf;

pub use dso::{DsoCache, UNKNOWN_SYMBOL};
pub use elf::{ElfInfo, Symbol, parse_elf, parse_kallsyms, read_build_id};
