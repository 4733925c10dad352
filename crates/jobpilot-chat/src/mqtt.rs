//! MQTT 3.1.1 packet codec, limited to what the chat backend uses.
//!
//! Supported: CONNECT, CONNACK, PUBLISH (QoS 0/1), PUBACK, SUBSCRIBE,
//! SUBACK, PINGREQ, PINGRESP, DISCONNECT. Anything else, QoS 2 and
//! last-will connects are rejected as protocol errors.
//!
//! The backend sends PUBACKs whose remaining length is longer than the two
//! bytes the standard allows. Those are accepted; the packet id is read
//! from the first two bytes and the rest ignored.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use jobpilot_core::AppError;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// CONNACK return codes that mean the credentials were rejected.
pub const CONNACK_BAD_CREDENTIALS: u8 = 4;
pub const CONNACK_NOT_AUTHORIZED: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

impl QoS {
    fn from_bits(bits: u8) -> Result<Self, AppError> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Err(AppError::ProtocolError("QoS 2 is not supported".into())),
            other => Err(AppError::ProtocolError(format!("Invalid QoS {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
}

impl ConnAck {
    pub fn accepted() -> Self {
        Self {
            session_present: false,
            return_code: 0,
        }
    }

    pub fn refused(return_code: u8) -> Self {
        Self {
            session_present: false,
            return_code,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.return_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    /// Present iff `qos` is at least once.
    pub packet_id: Option<u16>,
    pub dup: bool,
    pub retain: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }

    /// Append the wire form of this packet to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), AppError> {
        let mut body = BytesMut::new();
        let header = match self {
            Packet::Connect(c) => {
                put_str(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if c.password.is_some() {
                    flags |= 0x40;
                }
                if c.username.is_some() {
                    flags |= 0x80;
                }
                body.put_u8(flags);
                body.put_u16(c.keep_alive_secs);
                put_str(&mut body, &c.client_id)?;
                if let Some(username) = &c.username {
                    put_str(&mut body, username)?;
                }
                if let Some(password) = &c.password {
                    put_str(&mut body, password)?;
                }
                0x10
            }
            Packet::ConnAck(a) => {
                body.put_u8(u8::from(a.session_present));
                body.put_u8(a.return_code);
                0x20
            }
            Packet::Publish(p) => {
                put_str(&mut body, &p.topic)?;
                match (p.qos, p.packet_id) {
                    (QoS::AtMostOnce, None) => {}
                    (QoS::AtLeastOnce, Some(id)) if id != 0 => body.put_u16(id),
                    _ => {
                        return Err(AppError::ProtocolError(
                            "PUBLISH packet id must be set exactly when QoS > 0".into(),
                        ));
                    }
                }
                body.put_slice(&p.payload);
                let mut header = 0x30 | ((p.qos as u8) << 1);
                if p.dup {
                    header |= 0x08;
                }
                if p.retain {
                    header |= 0x01;
                }
                header
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                0x40
            }
            Packet::Subscribe(s) => {
                body.put_u16(s.packet_id);
                for (filter, qos) in &s.filters {
                    put_str(&mut body, filter)?;
                    body.put_u8(*qos as u8);
                }
                0x82
            }
            Packet::SubAck(s) => {
                body.put_u16(s.packet_id);
                body.put_slice(&s.return_codes);
                0x90
            }
            Packet::PingReq => 0xC0,
            Packet::PingResp => 0xD0,
            Packet::Disconnect => 0xE0,
        };

        out.put_u8(header);
        put_remaining_length(out, body.len())?;
        out.put_slice(&body);
        Ok(())
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched while the frame is
    /// incomplete. On success the frame is consumed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, AppError> {
        let Some((remaining, header_len)) = peek_remaining_length(buf)? else {
            return Ok(None);
        };
        let total = header_len + remaining;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total).freeze();
        let header = frame.get_u8();
        frame.advance(header_len - 1);
        let flags = header & 0x0F;

        let packet = match header >> 4 {
            1 => Packet::Connect(decode_connect(&mut frame)?),
            2 => {
                need(&frame, 2, "CONNACK")?;
                Packet::ConnAck(ConnAck {
                    session_present: frame.get_u8() & 0x01 == 1,
                    return_code: frame.get_u8(),
                })
            }
            3 => Packet::Publish(decode_publish(flags, &mut frame)?),
            4 => {
                need(&frame, 2, "PUBACK")?;
                Packet::PubAck {
                    packet_id: frame.get_u16(),
                }
            }
            8 => {
                if flags != 0x02 {
                    return Err(AppError::ProtocolError(
                        "SUBSCRIBE with invalid header flags".into(),
                    ));
                }
                need(&frame, 2, "SUBSCRIBE")?;
                let packet_id = frame.get_u16();
                let mut filters = Vec::new();
                while frame.has_remaining() {
                    let filter = get_str(&mut frame)?;
                    need(&frame, 1, "SUBSCRIBE")?;
                    filters.push((filter, QoS::from_bits(frame.get_u8() & 0x03)?));
                }
                Packet::Subscribe(Subscribe { packet_id, filters })
            }
            9 => {
                need(&frame, 2, "SUBACK")?;
                let packet_id = frame.get_u16();
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes: frame.to_vec(),
                })
            }
            12 => Packet::PingReq,
            13 => Packet::PingResp,
            14 => Packet::Disconnect,
            other => {
                return Err(AppError::ProtocolError(format!(
                    "Unsupported packet type {other}"
                )));
            }
        };
        Ok(Some(packet))
    }
}

fn decode_connect(frame: &mut Bytes) -> Result<Connect, AppError> {
    let name = get_str(frame)?;
    need(frame, 4, "CONNECT")?;
    let level = frame.get_u8();
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(AppError::ProtocolError(format!(
            "Unsupported protocol {name} level {level}"
        )));
    }
    let flags = frame.get_u8();
    if flags & 0x04 != 0 {
        return Err(AppError::ProtocolError("Last will is not supported".into()));
    }
    let keep_alive_secs = frame.get_u16();
    let client_id = get_str(frame)?;
    let username = if flags & 0x80 != 0 {
        Some(get_str(frame)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(get_str(frame)?)
    } else {
        None
    };
    Ok(Connect {
        client_id,
        username,
        password,
        keep_alive_secs,
        clean_session: flags & 0x02 != 0,
    })
}

fn decode_publish(flags: u8, frame: &mut Bytes) -> Result<Publish, AppError> {
    let qos = QoS::from_bits((flags >> 1) & 0x03)?;
    let topic = get_str(frame)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce => {
            need(frame, 2, "PUBLISH")?;
            Some(frame.get_u16())
        }
    };
    Ok(Publish {
        topic,
        qos,
        packet_id,
        dup: flags & 0x08 != 0,
        retain: flags & 0x01 != 0,
        payload: frame.split_to(frame.remaining()),
    })
}

/// Returns `(remaining_length, fixed_header_len)` once the header is complete.
fn peek_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, AppError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in buf.iter().skip(1).take(4).enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 2)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 5 {
        return Err(AppError::ProtocolError(
            "Remaining length exceeds four bytes".into(),
        ));
    }
    Ok(None)
}

fn put_remaining_length(out: &mut BytesMut, mut len: usize) -> Result<(), AppError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(AppError::ProtocolError(format!(
            "Packet too large: {len} bytes"
        )));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

fn put_str(out: &mut BytesMut, s: &str) -> Result<(), AppError> {
    let len = u16::try_from(s.len())
        .map_err(|_| AppError::ProtocolError(format!("String too long: {} bytes", s.len())))?;
    out.put_u16(len);
    out.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(frame: &mut Bytes) -> Result<String, AppError> {
    need(frame, 2, "string length")?;
    let len = usize::from(frame.get_u16());
    need(frame, len, "string")?;
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| AppError::ProtocolError("String is not valid UTF-8".into()))
}

fn need(frame: &Bytes, n: usize, what: &str) -> Result<(), AppError> {
    if frame.remaining() < n {
        return Err(AppError::ProtocolError(format!("Truncated {what}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: &Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        packet.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn connect_carries_credentials_and_clean_session() {
        let connect = Packet::Connect(Connect {
            client_id: "ws-0123456789ABCDEF".into(),
            username: Some("token|0".into()),
            password: Some("wt2".into()),
            keep_alive_secs: 5,
            clean_session: true,
        });
        let mut buf = encode(&connect);
        assert_eq!(buf[0], 0x10);
        // Protocol name, level 4, flags: username + password + clean session.
        assert_eq!(&buf[2..10], b"\x00\x04MQTT\x04\xC2");

        assert_eq!(Packet::decode(&mut buf).unwrap(), Some(connect));
        assert!(buf.is_empty());
    }

    #[test]
    fn publish_qos1_layout() {
        let publish = Packet::Publish(Publish {
            topic: "chat".into(),
            qos: QoS::AtLeastOnce,
            packet_id: Some(7),
            dup: false,
            retain: false,
            payload: Bytes::from_static(b"\x08\x01"),
        });
        let buf = encode(&publish);
        assert_eq!(&buf[..], b"\x32\x0A\x00\x04chat\x00\x07\x08\x01");
    }

    #[test]
    fn publish_without_packet_id_is_rejected() {
        let publish = Packet::Publish(Publish {
            topic: "chat".into(),
            qos: QoS::AtLeastOnce,
            packet_id: None,
            dup: false,
            retain: false,
            payload: Bytes::new(),
        });
        assert!(publish.encode(&mut BytesMut::new()).is_err());
    }

    #[test]
    fn oversized_puback_is_accepted() {
        let mut buf = BytesMut::from(&b"\x40\x04\x01\x02\xAA\xBB"[..]);
        let packet = Packet::decode(&mut buf).unwrap();
        assert_eq!(packet, Some(Packet::PubAck { packet_id: 0x0102 }));
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_frame_waits_for_more_bytes() {
        let full = encode(&Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![0],
        }));
        let mut buf = BytesMut::new();
        for (i, byte) in full.iter().enumerate() {
            assert_eq!(Packet::decode(&mut buf).unwrap(), None, "byte {i}");
            buf.put_u8(*byte);
        }
        assert!(matches!(
            Packet::decode(&mut buf).unwrap(),
            Some(Packet::SubAck(_))
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = encode(&Packet::PingResp);
        buf.extend_from_slice(&encode(&Packet::PubAck { packet_id: 3 }));
        assert_eq!(Packet::decode(&mut buf).unwrap(), Some(Packet::PingResp));
        assert_eq!(
            Packet::decode(&mut buf).unwrap(),
            Some(Packet::PubAck { packet_id: 3 })
        );
        assert_eq!(Packet::decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn qos2_publish_is_protocol_error() {
        let mut buf = BytesMut::from(&b"\x34\x08\x00\x04chat\x00\x01"[..]);
        let err = Packet::decode(&mut buf).unwrap_err();
        assert!(matches!(err, AppError::ProtocolError(_)));
    }

    #[test]
    fn multi_byte_remaining_length() {
        let publish = Packet::Publish(Publish {
            topic: "chat".into(),
            qos: QoS::AtMostOnce,
            packet_id: None,
            dup: false,
            retain: false,
            payload: Bytes::from(vec![0u8; 300]),
        });
        let mut buf = encode(&publish);
        // 306 = 0b10_0110010 -> 0xB2 0x02
        assert_eq!(&buf[1..3], &[0xB2, 0x02]);
        assert_eq!(Packet::decode(&mut buf).unwrap(), Some(publish));
    }

    #[test]
    fn unsupported_packet_type_is_protocol_error() {
        // PUBREC
        let mut buf = BytesMut::from(&b"\x50\x02\x00\x01"[..]);
        assert!(Packet::decode(&mut buf).is_err());
    }
}
