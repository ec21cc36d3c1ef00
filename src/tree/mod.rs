//! The tree engine: node structure, search/insert/delete with split and
//! merge, copy-on-write sharing, range scans, diff, and lazy persistence.

mod imp;

pub use imp::{EditDirective, Tree, TreeOptions};
