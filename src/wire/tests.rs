use super::*;
use bytes::{Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};

fn addr(last: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
}

fn full_request() -> Message {
    Message {
        tid: 0xBEEF,
        to: addr(1, 49737),
        id: Some([0x11; 32]),
        token: Some([0x22; 32]),
        kind: Kind::Request {
            command: "find_node".to_string(),
            target: Some([0x33; 32]),
        },
        value: Bytes::from_static(b"hello"),
    }
}

fn full_response() -> Message {
    Message {
        tid: 7,
        to: addr(2, 1),
        id: Some([0x44; 32]),
        token: Some([0x55; 32]),
        kind: Kind::Response {
            status: 300,
            closer_nodes: Some(vec![addr(3, 1000), addr(4, 65535)]),
        },
        value: Bytes::from(vec![9u8; 300]),
    }
}

#[test]
fn test_request_round_trip() {
    let msg = full_request();
    let encoded = msg.encode();
    assert_eq!(encoded.len(), msg.preencode());
    assert_eq!(Message::decode(&encoded).unwrap(), msg);
}

#[test]
fn test_response_round_trip() {
    let msg = full_response();
    let encoded = msg.encode();
    assert_eq!(encoded.len(), msg.preencode());
    assert_eq!(Message::decode(&encoded).unwrap(), msg);
}

#[test]
fn test_minimal_messages() {
    let req = Message::request("ping", addr(1, 1));
    let encoded = req.encode();
    // version, flags, tid, to, command "ping", empty value
    assert_eq!(encoded.len(), 1 + 1 + 2 + 6 + 5 + 1);
    assert_eq!(encoded[0], 1);
    assert_eq!(encoded[1], flags::IS_REQUEST);
    assert_eq!(Message::decode(&encoded).unwrap(), req);

    let res = Message::response(3, addr(1, 1), status::OK);
    let encoded = res.encode();
    assert_eq!(encoded[1], 0);
    let decoded = Message::decode(&encoded).unwrap();
    assert_eq!(decoded.status(), Some(status::OK));
    assert!(decoded.closer_nodes().is_none());
    assert!(decoded.value.is_empty());
}

#[test]
fn test_empty_closer_list_is_preserved() {
    let mut res = Message::response(3, addr(1, 1), status::OK);
    res.kind = Kind::Response {
        status: status::OK,
        closer_nodes: Some(Vec::new()),
    };
    let decoded = Message::decode(&res.encode()).unwrap();
    assert_eq!(decoded.closer_nodes(), Some(&[][..]));
}

#[test]
fn test_field_layout() {
    let msg = full_request();
    let encoded = msg.encode();

    assert_eq!(
        encoded[1],
        flags::IS_REQUEST | flags::HAS_ID | flags::HAS_TOKEN | flags::HAS_ROUTE
    );
    assert_eq!(&encoded[2..4], &0xBEEFu16.to_le_bytes());
    assert_eq!(&encoded[4..8], &[10, 0, 0, 1]);
    assert_eq!(&encoded[8..10], &49737u16.to_le_bytes());
    assert_eq!(&encoded[10..42], &[0x11; 32]);
    assert_eq!(&encoded[42..74], &[0x22; 32]);
    assert_eq!(&encoded[74..106], &[0x33; 32]);
    assert_eq!(encoded[106], 9);
    assert_eq!(&encoded[107..116], b"find_node");
}

#[test]
fn test_rejects_unsupported_version() {
    let mut encoded = BytesMut::from(&full_request().encode()[..]);
    encoded[0] = 2;
    assert_eq!(
        Message::decode(&encoded),
        Err(ProtocolError::UnsupportedVersion(2))
    );
}

#[test]
fn test_every_truncated_prefix_fails() {
    for msg in [full_request(), full_response()] {
        let encoded = msg.encode();
        for len in 0..encoded.len() {
            assert!(
                Message::decode(&encoded[..len]).is_err(),
                "prefix of {} bytes decoded",
                len
            );
        }
    }
}

#[test]
fn test_rejects_oversized_peer_list() {
    let mut buf = vec![1u8, flags::HAS_ROUTE, 0, 0, 127, 0, 0, 1, 0x10, 0x00];
    // u32 count far beyond the remaining bytes
    buf.extend_from_slice(&[0xfe, 0xff, 0xff, 0xff, 0x0f]);
    assert!(matches!(
        Message::decode(&buf),
        Err(ProtocolError::Truncated { .. })
    ));
}

#[test]
fn test_rejects_invalid_command() {
    let mut buf = vec![1u8, flags::IS_REQUEST, 0, 0, 127, 0, 0, 1, 0x10, 0x00];
    buf.extend_from_slice(&[2, 0xff, 0xfe, 0]);
    assert_eq!(Message::decode(&buf), Err(ProtocolError::InvalidString));
}

#[test]
fn test_status_varint_widths() {
    for (status, width) in [(0u64, 1usize), (0xfc, 1), (0xfd, 3), (0x1_0000, 5), (u64::MAX, 9)] {
        let res = Message::response(1, addr(1, 1), status);
        let base = Message::response(1, addr(1, 1), 0).preencode();
        assert_eq!(res.preencode(), base - 1 + width);
        assert_eq!(Message::decode(&res.encode()).unwrap().status(), Some(status));
    }
}
