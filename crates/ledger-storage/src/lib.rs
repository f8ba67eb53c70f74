//! Storage backends for the ledger daemon. Both implement
//! [`ledger_core::chain::Repository`]; the trait itself lives in the core
//! crate so that the node can be written against it alone.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;
