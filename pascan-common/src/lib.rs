//! Shared types for the pascan CANopen stack
//!
//! This crate holds the vocabulary both sides of a CANopen link agree on:
//! CAN frame types, the SDO frame codec with its abort codes, the typed
//! value model for the CANopen data types, node IDs, standard object
//! indices, and the TOML device description.

pub mod constants;
pub mod device_config;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod values;

pub use messages::{CanId, CanMessage};
pub use node_id::NodeId;
