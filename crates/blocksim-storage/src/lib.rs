//! Persistence for simulation sessions.
//!
//! The engine only knows the [`StateStore`] trait; this crate backs it with
//! sled, keeping the whole session as one JSON value under a single key.

pub mod sled_store;

pub use blocksim_core::StateStore;
pub use sled_store::SledStore;
