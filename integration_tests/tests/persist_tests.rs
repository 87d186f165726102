//! Concise-DCF snapshots through the node facade

use integration_tests::{make_node, started_node};
use pascan_common::values::Value;
use pascan_node::persist;

#[test]
fn snapshot_survives_a_restart() {
    let mut node = started_node(5);
    node.write(0x2000, 1, &Value::UInt32(123_456), 0).unwrap();
    node.write(
        0x2001,
        0,
        &Value::OctetString(b"persisted".to_vec()),
        0,
    )
    .unwrap();
    // PDO configuration is persistent as well
    node.write(0x1400, 2, &Value::UInt8(1), 0).unwrap();

    let snapshot = persist::store(node.device());

    // A freshly built node starts from defaults
    let mut restored = make_node(5);
    assert_eq!(Value::UInt32(0), restored.read(0x2000, 1).unwrap());

    let installed = persist::load(restored.device_mut(), &snapshot).unwrap();
    assert!(installed > 0);
    let mut sink = Vec::new();
    restored.start(0, &mut |m| sink.push(m));

    assert_eq!(Value::UInt32(123_456), restored.read(0x2000, 1).unwrap());
    assert_eq!(
        Value::OctetString(b"persisted".to_vec()),
        restored.read(0x2001, 0).unwrap()
    );
    assert_eq!(Value::UInt8(1), restored.read(0x1400, 2).unwrap());
}

#[test]
fn snapshot_ignores_stale_entries() {
    let node = started_node(5);
    let snapshot = persist::store(node.device());

    let mut restored = make_node(5);
    // Drop one of the persisted objects before loading
    restored.device_mut().remove_object(0x2001);
    let installed = persist::load(restored.device_mut(), &snapshot).unwrap();
    assert!(installed > 0);
}
