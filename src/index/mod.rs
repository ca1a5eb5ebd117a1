// Page-backed ordered indexes.

pub mod btree;
pub mod node;

pub use btree::{BPlusTree, RootChangeCallback};
