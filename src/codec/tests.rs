//! Codec Tests
//!
//! Byte-level checks of the client encoder and the server-packet decoder.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;
use test_case::test_case;

use crate::codec::{read_variable_int, write_variable_int, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, DecodeError, EncodeError, Packet, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription,
};

fn encode_packet(packet: &Packet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(packet, &mut buf).unwrap();
    buf.to_vec()
}

fn decode_packet(buf: &[u8]) -> Result<Packet, DecodeError> {
    match Decoder::new().decode(buf)? {
        Some((packet, consumed)) => {
            assert_eq!(consumed, buf.len());
            Ok(packet)
        }
        None => Err(DecodeError::InsufficientData),
    }
}

// ============================================================================
// Encoder
// ============================================================================

#[test]
fn test_connect_without_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "cb".to_string(),
        keep_alive: 30,
        ..Default::default()
    }));

    let expected = vec![
        0x10, 0x0E, // fixed header
        0x00, 0x04, b'M', b'Q', b'T', b'T', // protocol name
        0x04, // level
        0x02, // clean session
        0x00, 0x1E, // keep alive
        0x00, 0x02, b'c', b'b', // client id
    ];
    assert_eq!(encode_packet(&packet), expected);
}

#[test]
fn test_connect_with_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "cb".to_string(),
        keep_alive: 30,
        username: Some("u".to_string()),
        password: Some(Bytes::from_static(b"p")),
        ..Default::default()
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[1], 20);
    assert_eq!(encoded[9], 0xC2);
    assert_eq!(&encoded[16..], &[0x00, 0x01, b'u', 0x00, 0x01, b'p']);
}

#[test]
fn test_connect_drops_password_without_username() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "cb".to_string(),
        password: Some(Bytes::from_static(b"secret")),
        ..Default::default()
    }));

    let encoded = encode_packet(&packet);
    assert_eq!(encoded[1], 14);
    assert_eq!(encoded[9] & 0xC0, 0x00);
}

#[test]
fn test_publish_qos0() {
    let packet = Packet::Publish(Publish::new(
        "a/b",
        Bytes::from_static(b"hi"),
        QoS::AtMostOnce,
        None,
    ));

    assert_eq!(
        encode_packet(&packet),
        vec![0x30, 0x07, 0x00, 0x03, b'a', b'/', b'b', b'h', b'i']
    );
}

#[test]
fn test_publish_qos1_carries_packet_id() {
    let packet = Packet::Publish(Publish::new(
        "a/b",
        Bytes::from_static(b"hi"),
        QoS::AtLeastOnce,
        Some(10),
    ));

    assert_eq!(
        encode_packet(&packet),
        vec![0x32, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x0A, b'h', b'i']
    );
}

#[test]
fn test_publish_qos2_requires_packet_id() {
    let packet = Packet::Publish(Publish::new(
        "a/b",
        Bytes::new(),
        QoS::ExactlyOnce,
        None,
    ));

    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::new().encode(&packet, &mut buf),
        Err(EncodeError::MissingPacketId)
    );
}

#[test]
fn test_subscribe() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "a/+".to_string(),
            qos: QoS::AtMostOnce,
        }],
    });

    assert_eq!(
        encode_packet(&packet),
        vec![0x82, 0x08, 0x00, 0x01, 0x00, 0x03, b'a', b'/', b'+', 0x00]
    );
}

#[test]
fn test_subscribe_rejects_empty_list() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: Vec::new(),
    });

    let mut buf = BytesMut::new();
    assert_eq!(
        Encoder::new().encode(&packet, &mut buf),
        Err(EncodeError::EmptySubscription)
    );
}

#[test_case(Packet::PubAck(PubAck { packet_id: 5 }), 0x40; "puback")]
#[test_case(Packet::PubRec(PubRec { packet_id: 5 }), 0x50; "pubrec")]
#[test_case(Packet::PubRel(PubRel { packet_id: 5 }), 0x62; "pubrel")]
#[test_case(Packet::PubComp(PubComp { packet_id: 5 }), 0x70; "pubcomp")]
fn test_acknowledgements(packet: Packet, first_byte: u8) {
    assert_eq!(encode_packet(&packet), vec![first_byte, 0x02, 0x00, 0x05]);
}

#[test]
fn test_pingreq_and_disconnect() {
    assert_eq!(encode_packet(&Packet::PingReq), vec![0xC0, 0x00]);
    assert_eq!(encode_packet(&Packet::Disconnect), vec![0xE0, 0x00]);
}

#[test]
fn test_server_packets_are_not_encoded() {
    let mut buf = BytesMut::new();
    assert!(matches!(
        Encoder::new().encode(&Packet::PingResp, &mut buf),
        Err(EncodeError::UnsupportedPacket(_))
    ));
    assert!(buf.is_empty());
}

// ============================================================================
// Decoder
// ============================================================================

#[test_case(0x00, ConnectReturnCode::Accepted; "accepted")]
#[test_case(0x04, ConnectReturnCode::BadUserNameOrPassword; "bad credentials")]
#[test_case(0x05, ConnectReturnCode::NotAuthorized; "not authorized")]
fn test_decode_connack(code: u8, expected: ConnectReturnCode) {
    let packet = decode_packet(&[0x20, 0x02, 0x00, code]).unwrap();
    assert_eq!(
        packet,
        Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: expected,
        })
    );
}

#[test]
fn test_decode_connack_invalid_return_code() {
    assert_eq!(
        decode_packet(&[0x20, 0x02, 0x00, 0x09]),
        Err(DecodeError::InvalidReturnCode(0x09))
    );
}

#[test]
fn test_decode_publish_qos2() {
    let packet = decode_packet(&[0x34, 0x06, 0x00, 0x01, b't', 0x00, 0x07, b'x']).unwrap();
    assert_eq!(
        packet,
        Packet::Publish(Publish {
            dup: false,
            qos: QoS::ExactlyOnce,
            retain: false,
            topic: "t".to_string(),
            packet_id: Some(7),
            payload: Bytes::from_static(b"x"),
        })
    );
}

#[test]
fn test_decode_publish_rejects_wildcard_topic() {
    assert!(matches!(
        decode_packet(&[0x30, 0x04, 0x00, 0x01, b'#', b'x']),
        Err(DecodeError::MalformedPacket(_))
    ));
}

#[test]
fn test_decode_suback_with_failure() {
    let packet = decode_packet(&[0x90, 0x04, 0x00, 0x01, 0x00, 0x80]).unwrap();
    assert_eq!(
        packet,
        Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![
                SubAckReturnCode::Granted(QoS::AtMostOnce),
                SubAckReturnCode::Failure
            ],
        })
    );
}

#[test]
fn test_decode_acknowledgements() {
    assert_eq!(
        decode_packet(&[0x40, 0x02, 0x00, 0x03]),
        Ok(Packet::PubAck(PubAck { packet_id: 3 }))
    );
    assert_eq!(
        decode_packet(&[0x62, 0x02, 0x00, 0x03]),
        Ok(Packet::PubRel(PubRel { packet_id: 3 }))
    );
    assert_eq!(decode_packet(&[0xD0, 0x00]), Ok(Packet::PingResp));
}

#[test]
fn test_decode_pubrel_requires_flags() {
    assert_eq!(
        decode_packet(&[0x60, 0x02, 0x00, 0x01]),
        Err(DecodeError::InvalidFlags)
    );
}

#[test]
fn test_decode_rejects_client_packets() {
    assert_eq!(
        decode_packet(&[0x10, 0x00]),
        Err(DecodeError::InvalidPacketType(1))
    );
    assert_eq!(
        decode_packet(&[0x82, 0x00]),
        Err(DecodeError::InvalidPacketType(8))
    );
}

#[test]
fn test_decode_rejects_unsolicited_unsuback() {
    // The client never unsubscribes
    assert_eq!(
        decode_packet(&[0xB0, 0x02, 0x00, 0x03]),
        Err(DecodeError::InvalidPacketType(11))
    );
}

#[test]
fn test_decode_incomplete_frame() {
    let decoder = Decoder::new();
    assert_eq!(decoder.decode(&[0x30]), Ok(None));
    assert_eq!(decoder.decode(&[0x30, 0x05, 0x00]), Ok(None));
    assert_eq!(decoder.decode(&[0x30, 0x80]), Ok(None));
}

#[test]
fn test_decode_packet_too_large() {
    let decoder = Decoder::new().with_max_packet_size(4);
    assert_eq!(
        decoder.decode(&[0x30, 0x05, 0x00]),
        Err(DecodeError::PacketTooLarge)
    );
}

#[test]
fn test_decode_consumes_one_frame_at_a_time() {
    let buf = [0xD0, 0x00, 0x40, 0x02, 0x00, 0x09];
    let decoder = Decoder::new();

    let (first, consumed) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    assert_eq!(consumed, 2);

    let (second, consumed) = decoder.decode(&buf[consumed..]).unwrap().unwrap();
    assert_eq!(second, Packet::PubAck(PubAck { packet_id: 9 }));
    assert_eq!(consumed, 4);
}

// ============================================================================
// Variable byte integers
// ============================================================================

#[test_case(0, &[0x00]; "zero")]
#[test_case(127, &[0x7F]; "one byte max")]
#[test_case(128, &[0x80, 0x01]; "two bytes min")]
#[test_case(16_383, &[0xFF, 0x7F]; "two bytes max")]
#[test_case(268_435_455, &[0xFF, 0xFF, 0xFF, 0x7F]; "four bytes max")]
fn test_variable_int(value: u32, bytes: &[u8]) {
    let mut buf = BytesMut::new();
    assert_eq!(write_variable_int(&mut buf, value).unwrap(), bytes.len());
    assert_eq!(&buf[..], bytes);
    assert_eq!(read_variable_int(bytes).unwrap(), (value, bytes.len()));
}

#[test]
fn test_variable_int_too_long() {
    assert_eq!(
        read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
        Err(DecodeError::InvalidRemainingLength)
    );
}
