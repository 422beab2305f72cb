//! CLI command implementations.

pub mod dump_index;
pub mod inspect;
