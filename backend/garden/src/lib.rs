//! Reach Together garden service.
//!
//! Keeps a donor's spendable water-drop balance consistent between the
//! canonical donor record and the derived garden record, and hosts the
//! controllers and REST API built on top of that layer.

pub mod api;
pub mod config;
pub mod content;
pub mod context;
pub mod db;
pub mod device;
pub mod donation;
pub mod errors;
pub mod events;
pub mod gameplay;
pub mod latch;
pub mod layout;
pub mod password;
pub mod records;
pub mod session;
pub mod sync;
