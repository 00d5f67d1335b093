//! Sled-backed persistence for the ledger; implements the core's
//! `ChainStore` trait.

pub mod sled_store;

pub use sled_store::SledStore;
