//! Append-only history shadows for live entities.
//!
//! [`attach_history`] derives a history entity from a live one and wires
//! hooks so every insert, update, delete, restore and bulk write of the live
//! entity leaves a snapshot row behind. This crate holds no database code:
//! hosts provide the [`Registry`] and implement [`Engine`].

pub mod associations;
pub mod config;
pub mod derive;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod intercept;
pub mod model;
pub mod query;
pub mod registry;

#[cfg(test)]
mod testing;

pub use config::HistoryConfig;
pub use derive::derive_history_schema;
pub use engine::Engine;
pub use error::{Error, Result};
pub use intercept::attach_history;
pub use registry::Registry;
