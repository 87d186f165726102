//! End-to-end SDO transfers between a client node and a server node

use integration_tests::{shuttle, started_node};
use pascan_common::messages::CanMessage;
use pascan_common::sdo::AbortCode;
use pascan_common::values::Value;
use pascan_node::sdo_client::{RawAbortCode, SdoClientEvent};
use pascan_node::NodeEvent;

fn client_event(events: &[NodeEvent]) -> Option<&SdoClientEvent> {
    events.iter().find_map(|e| match e {
        NodeEvent::SdoClient { event, .. } => Some(event),
        _ => None,
    })
}

#[test]
fn expedited_download_and_upload() {
    let mut server = started_node(5);
    let mut client = started_node(6);
    let channel = client.add_sdo_client(5);

    let mut frames = Vec::new();
    client
        .sdo_download(channel, 0x2000, 1, &0xCAFE_F00Du32.to_le_bytes(), 0, &mut |m| {
            frames.push(m)
        })
        .unwrap();
    let events = shuttle(&mut client, &mut server, frames, 0);
    assert_eq!(
        Some(&SdoClientEvent::DownloadComplete {
            index: 0x2000,
            sub: 1
        }),
        client_event(&events)
    );
    assert_eq!(Value::UInt32(0xCAFE_F00D), server.read(0x2000, 1).unwrap());

    let mut frames = Vec::new();
    client
        .sdo_upload(channel, 0x2000, 1, 0, &mut |m| frames.push(m))
        .unwrap();
    let events = shuttle(&mut client, &mut server, frames, 0);
    assert_eq!(
        Some(&SdoClientEvent::UploadComplete {
            index: 0x2000,
            sub: 1,
            data: 0xCAFE_F00Du32.to_le_bytes().to_vec()
        }),
        client_event(&events)
    );
}

#[test]
fn segmented_download_and_upload() {
    let mut server = started_node(5);
    let mut client = started_node(6);
    let channel = client.add_sdo_client(5);
    let data = b"a string longer than one segment".to_vec();

    let mut frames = Vec::new();
    client
        .sdo_download(channel, 0x2001, 0, &data, 0, &mut |m| frames.push(m))
        .unwrap();
    let events = shuttle(&mut client, &mut server, frames, 0);
    assert_eq!(
        Some(&SdoClientEvent::DownloadComplete {
            index: 0x2001,
            sub: 0
        }),
        client_event(&events)
    );
    assert_eq!(
        Value::OctetString(data.clone()),
        server.read(0x2001, 0).unwrap()
    );

    let mut frames = Vec::new();
    client
        .sdo_upload(channel, 0x2001, 0, 0, &mut |m| frames.push(m))
        .unwrap();
    let events = shuttle(&mut client, &mut server, frames, 0);
    assert_eq!(
        Some(&SdoClientEvent::UploadComplete {
            index: 0x2001,
            sub: 0,
            data
        }),
        client_event(&events)
    );
}

#[test]
fn block_download_and_upload() {
    let mut server = started_node(5);
    let mut client = started_node(6);
    let channel = client.add_sdo_client(5);
    // Long enough for several full blocks
    let data: Vec<u8> = (0..2000usize).map(|i| (i % 251) as u8).collect();

    let mut frames = Vec::new();
    client
        .sdo_block_download(channel, 0x2001, 0, &data, 0, &mut |m| frames.push(m))
        .unwrap();
    let events = shuttle(&mut client, &mut server, frames, 0);
    assert_eq!(
        Some(&SdoClientEvent::DownloadComplete {
            index: 0x2001,
            sub: 0
        }),
        client_event(&events)
    );
    assert_eq!(
        Value::OctetString(data.clone()),
        server.read(0x2001, 0).unwrap()
    );

    let mut frames = Vec::new();
    client
        .sdo_block_upload(channel, 0x2001, 0, 0, &mut |m| frames.push(m))
        .unwrap();
    let events = shuttle(&mut client, &mut server, frames, 0);
    assert_eq!(
        Some(&SdoClientEvent::UploadComplete {
            index: 0x2001,
            sub: 0,
            data
        }),
        client_event(&events)
    );
}

#[test]
fn server_abort_is_surfaced_to_the_client() {
    let mut server = started_node(5);
    let mut client = started_node(6);
    let channel = client.add_sdo_client(5);

    let mut frames = Vec::new();
    client
        .sdo_upload(channel, 0x7777, 0, 0, &mut |m| frames.push(m))
        .unwrap();
    let events = shuttle(&mut client, &mut server, frames, 0);
    assert_eq!(
        Some(&SdoClientEvent::TransferFailed {
            index: 0x7777,
            sub: 0,
            code: RawAbortCode::Valid(AbortCode::NoSuchObject)
        }),
        client_event(&events)
    );
}

#[test]
fn client_times_out_without_a_server() {
    let mut client = started_node(6);
    let channel = client.add_sdo_client(5);

    let mut frames: Vec<CanMessage> = Vec::new();
    client
        .sdo_upload(channel, 0x2000, 1, 0, &mut |m| frames.push(m))
        .unwrap();
    assert_eq!(1, frames.len());
    assert!(client.next_deadline().is_some());

    // Nobody answers; at the deadline the client gives up and emits an
    // abort frame
    let mut frames: Vec<CanMessage> = Vec::new();
    let events = client.process(100_000, &mut |m| frames.push(m));
    assert_eq!(
        Some(&SdoClientEvent::TransferFailed {
            index: 0x2000,
            sub: 1,
            code: RawAbortCode::Valid(AbortCode::Timeout)
        }),
        client_event(&events)
    );
    assert_eq!(1, frames.len());
    assert_eq!(0x80, frames[0].data()[0]);
}

#[test]
fn server_commits_exactly_the_declared_size() {
    // A segmented download whose final length undershoots the declared
    // size must abort instead of committing
    let mut server = started_node(5);
    let mut out = Vec::new();

    use pascan_common::sdo::{SdoRequest, SdoResponse};
    let req = SdoRequest::initiate_download(0x2001, 0, Some(10))
        .to_can_message(pascan_common::messages::CanId::Std(0x605));
    server.recv(&req, 0, &mut |m| out.push(m));
    out.clear();

    // Send a single final segment of 3 bytes: 3 != 10
    let req = SdoRequest::download_segment(false, true, b"abc")
        .to_can_message(pascan_common::messages::CanId::Std(0x605));
    let events = server.recv(&req, 0, &mut |m| out.push(m));
    assert!(events.is_empty());
    assert_eq!(
        SdoResponse::abort(0x2001, 0, AbortCode::TypeMismatchLengthLow),
        SdoResponse::try_from(out[0].data()).unwrap()
    );
    // The stored value is untouched
    assert_eq!(
        Value::OctetString(b"abcdefghij".to_vec()),
        server.read(0x2001, 0).unwrap()
    );
}
