//! File system helpers: deterministic tree walking and whole-tree copies.

pub mod tree;
pub mod walker;
