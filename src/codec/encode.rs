//! MQTT Packet Encoder
//!
//! Encodes client-to-server packets for MQTT v3.1.1

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    Connect, EncodeError, Packet, Publish, QoS, Subscribe, PROTOCOL_LEVEL,
    PROTOCOL_NAME,
};

/// MQTT Packet Encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.encode_connect(p, buf),
            Packet::Publish(p) => self.encode_publish(p, buf),
            Packet::PubAck(p) => {
                self.encode_ack(0x40, p.packet_id, buf);
                Ok(())
            }
            Packet::PubRec(p) => {
                self.encode_ack(0x50, p.packet_id, buf);
                Ok(())
            }
            // PUBREL carries the mandatory flags 0010
            Packet::PubRel(p) => {
                self.encode_ack(0x62, p.packet_id, buf);
                Ok(())
            }
            Packet::PubComp(p) => {
                self.encode_ack(0x70, p.packet_id, buf);
                Ok(())
            }
            Packet::Subscribe(p) => self.encode_subscribe(p, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::ConnAck(_) => Err(EncodeError::UnsupportedPacket("CONNACK")),
            Packet::SubAck(_) => Err(EncodeError::UnsupportedPacket("SUBACK")),
            Packet::PingResp => Err(EncodeError::UnsupportedPacket("PINGRESP")),
        }
    }

    fn encode_connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        // [MQTT-3.1.2-22] a password is only sent together with a username
        let password = packet.username.as_ref().and(packet.password.as_ref());

        // Protocol name, level, connect flags, keep alive
        let mut remaining_length = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;

        remaining_length += 2 + packet.client_id.len();
        if let Some(ref username) = packet.username {
            remaining_length += 2 + username.len();
        }
        if let Some(password) = password {
            remaining_length += 2 + password.len();
        }

        buf.put_u8(0x10);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut connect_flags: u8 = 0;
        if packet.clean_session {
            connect_flags |= 0x02;
        }
        if password.is_some() {
            connect_flags |= 0x40;
        }
        if packet.username.is_some() {
            connect_flags |= 0x80;
        }
        buf.put_u8(connect_flags);

        buf.put_u16(packet.keep_alive);

        write_string(buf, &packet.client_id)?;

        if let Some(ref username) = packet.username {
            write_string(buf, username)?;
        }
        if let Some(password) = password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn encode_publish(&self, packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut remaining_length = 2 + packet.topic.len();

        let packet_id = if packet.qos != QoS::AtMostOnce {
            match packet.packet_id {
                Some(id) if id != 0 => Some(id),
                _ => return Err(EncodeError::MissingPacketId),
            }
        } else {
            None
        };
        if packet_id.is_some() {
            remaining_length += 2;
        }

        remaining_length += packet.payload.len();

        let mut first_byte: u8 = 0x30;
        if packet.dup && packet.qos != QoS::AtMostOnce {
            first_byte |= 0x08;
        }
        first_byte |= (packet.qos as u8) << 1;
        if packet.retain {
            first_byte |= 0x01;
        }
        buf.put_u8(first_byte);
        write_variable_int(buf, remaining_length as u32)?;

        write_string(buf, &packet.topic)?;

        if let Some(packet_id) = packet_id {
            buf.put_u16(packet_id);
        }

        buf.put_slice(&packet.payload);

        Ok(())
    }

    fn encode_ack(&self, first_byte: u8, packet_id: u16, buf: &mut BytesMut) {
        buf.put_u8(first_byte);
        buf.put_u8(0x02);
        buf.put_u16(packet_id);
    }

    fn encode_subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.subscriptions.is_empty() {
            return Err(EncodeError::EmptySubscription);
        }
        if packet.packet_id == 0 {
            return Err(EncodeError::MissingPacketId);
        }

        let mut remaining_length = 2;
        for sub in &packet.subscriptions {
            remaining_length += 2 + sub.filter.len() + 1;
        }

        // SUBSCRIBE carries the mandatory flags 0010
        buf.put_u8(0x82);
        write_variable_int(buf, remaining_length as u32)?;

        buf.put_u16(packet.packet_id);

        for sub in &packet.subscriptions {
            write_string(buf, &sub.filter)?;
            buf.put_u8(sub.qos as u8);
        }

        Ok(())
    }
}
