//! Passive CANopen protocol engine
//!
//! pascan-node implements the protocol side of a CANopen device without
//! touching the CAN bus or a clock: the host pumps inbound frames and
//! monotonic time (microseconds) into a [`Node`], and the engine pushes
//! outbound frames through a host-supplied send callback. No threads are
//! created and no I/O is performed; all calls on one node must be
//! serialized by the host.
//!
//! The pieces, usable individually or through the [`Node`] facade:
//!
//! - [`od`]: the object dictionary — devices, objects and sub-objects
//!   with packed value storage and download/upload indication hooks
//! - [`sdo_server`] / [`sdo_client`]: the SDO state machines (expedited,
//!   segmented and block transfer in both directions)
//! - [`pdo`]: receive and transmit PDO services
//! - [`sync`], [`time`], [`emcy`]: the broadcast object services
//! - [`nmt`]: the NMT slave state machine and heartbeat producer
//! - [`dispatch`]: the frame dispatcher and timer queue
//! - [`persist`]: concise-DCF snapshots of dictionary values
//!
//! # Example
//!
//! ```rust
//! use pascan_common::device_config::DeviceConfig;
//! use pascan_common::NodeId;
//! use pascan_node::Node;
//!
//! let config = DeviceConfig::from_toml_str(
//!     r#"
//!     device_name = "demo"
//!
//!     [identity]
//!     vendor_id = 0x1234
//!     product_code = 1
//!     revision_number = 1
//!
//!     [[objects]]
//!     index = 0x2000
//!     parameter_name = "Setpoint"
//!     data_type = "uint32"
//!     access_type = "rw"
//!     "#,
//! )
//! .unwrap();
//!
//! let mut node = Node::from_config(NodeId::Assigned(5), &config).unwrap();
//! let mut sent = Vec::new();
//! node.start(0, &mut |frame| sent.push(frame));
//! // The host now pumps frames with node.recv(..) and time with
//! // node.process(..), waking up at node.next_deadline().
//! ```

pub mod dispatch;
pub mod emcy;
mod error;
pub mod nmt;
pub mod node;
pub mod od;
#[cfg(feature = "pdo")]
pub mod pdo;
pub mod persist;
pub mod profile;
pub mod sdo_client;
pub mod sdo_server;
pub mod sync;
pub mod time;

pub use error::DeviceError;
pub use node::{Node, NodeEvent};
pub use od::{Device, Object, SubObject};

// Re-export the shared types used throughout the public API
pub use pascan_common as common;
