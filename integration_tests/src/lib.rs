//! Shared helpers for the integration tests

use pascan_common::device_config::DeviceConfig;
use pascan_common::messages::{CanMessage, NmtCommand, NmtCommandSpecifier};
use pascan_common::NodeId;
use pascan_node::{Node, NodeEvent};

/// The device description used by all integration test nodes
pub const DEVICE_CONFIG: &str = r#"
    device_name = "integration"
    heartbeat_period = 0
    emcy_history_size = 4
    emcy_consumers = [0x82]

    [identity]
    vendor_id = 0x12345678
    product_code = 100
    revision_number = 1

    [pdos]
    num_rpdo = 4
    num_tpdo = 4

    [[objects]]
    index = 0x2000
    object_type = "record"
    parameter_name = "Command"

    [[objects.subs]]
    sub_index = 1
    name = "Setpoint"
    data_type = "uint32"
    access_type = "rw"
    low_limit = 0
    high_limit = 0xFFFFFFFF
    pdo_mapping = "both"
    persist = true

    [[objects]]
    index = 0x2001
    parameter_name = "Label"
    data_type = "octet_string"
    access_type = "rw"
    default_value = "abcdefghij"
    persist = true

    [[objects]]
    index = 0x2002
    parameter_name = "Process value"
    data_type = "uint16"
    access_type = "rw"
    pdo_mapping = "both"
"#;

/// Build an unstarted node with the shared test dictionary
pub fn make_node(node_id: u8) -> Node {
    let config = DeviceConfig::from_toml_str(DEVICE_CONFIG).unwrap();
    Node::from_config(NodeId::new(node_id).unwrap(), &config).unwrap()
}

/// Build a node, boot it and switch it to Operational
pub fn started_node(node_id: u8) -> Node {
    let mut node = make_node(node_id);
    let mut sink = Vec::new();
    node.start(0, &mut |m| sink.push(m));
    let start: CanMessage = NmtCommand {
        cs: NmtCommandSpecifier::Start,
        node: 0,
    }
    .into();
    node.recv(&start, 0, &mut |m| sink.push(m));
    node
}

/// Deliver `to_b` to node `b`, then shuttle replies back and forth until
/// both sides go quiet; events from both nodes are returned in order
pub fn shuttle(
    a: &mut Node,
    b: &mut Node,
    mut to_b: Vec<CanMessage>,
    now: u64,
) -> Vec<NodeEvent> {
    let mut events = Vec::new();
    while !to_b.is_empty() {
        let mut to_a: Vec<CanMessage> = Vec::new();
        for msg in to_b.drain(..) {
            events.extend(b.recv(&msg, now, &mut |m| to_a.push(m)));
        }
        for msg in to_a.drain(..) {
            events.extend(a.recv(&msg, now, &mut |m| to_b.push(m)));
        }
    }
    events
}
