//! Data layer module
//!
//! Plain records shared by the remote source, storage and sync engine.

mod models;

pub use models::*;
