//! Protobuf envelope carried in every chat PUBLISH payload.

use bytes::Bytes;
use jobpilot_core::AppError;
use jobpilot_core::models::{ImageRef, OutboundMessage};
use prost::Message;

/// Envelope `type` for a chat delivery.
pub const PROTOCOL_CHAT: i32 = 1;
/// Message `type` for a user-originated message.
pub const MESSAGE_USER: i32 = 1;
/// Body `type` values.
pub const BODY_TEXT: i32 = 1;
pub const BODY_IMAGE: i32 = 3;
const TEMPLATE_DEFAULT: i32 = 1;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatProtocol {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(message, repeated, tag = "3")]
    pub messages: Vec<ChatMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatMessage {
    #[prost(message, optional, tag = "1")]
    pub from: Option<ChatUser>,
    #[prost(message, optional, tag = "2")]
    pub to: Option<ChatUser>,
    #[prost(int32, tag = "3")]
    pub r#type: i32,
    #[prost(int64, tag = "4")]
    pub mid: i64,
    #[prost(int64, tag = "5")]
    pub time: i64,
    #[prost(message, optional, tag = "6")]
    pub body: Option<MessageBody>,
    #[prost(int64, tag = "11")]
    pub cmid: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatUser {
    #[prost(int64, tag = "1")]
    pub uid: i64,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageBody {
    #[prost(int32, tag = "1")]
    pub r#type: i32,
    #[prost(int32, tag = "2")]
    pub template_id: i32,
    #[prost(string, tag = "3")]
    pub text: String,
    #[prost(message, optional, tag = "5")]
    pub image: Option<ChatImage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChatImage {
    #[prost(int64, tag = "1")]
    pub iid: i64,
    #[prost(message, optional, tag = "2")]
    pub tiny_image: Option<ImageInfo>,
    #[prost(message, optional, tag = "3")]
    pub origin_image: Option<ImageInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ImageInfo {
    #[prost(string, tag = "1")]
    pub url: String,
    #[prost(int32, tag = "2")]
    pub width: i32,
    #[prost(int32, tag = "3")]
    pub height: i32,
}

impl From<&ImageRef> for ImageInfo {
    fn from(image: &ImageRef) -> Self {
        Self {
            url: image.url.clone(),
            width: i32::try_from(image.width).unwrap_or(i32::MAX),
            height: i32::try_from(image.height).unwrap_or(i32::MAX),
        }
    }
}

/// Wrap one outbound message in a chat envelope.
///
/// `mid`, `time` and `cmid` all carry `now_ms`; the recipient is addressed
/// by name, the uid fields stay zero.
pub fn build_envelope(message: &OutboundMessage, sender_uid: i64, now_ms: i64) -> ChatProtocol {
    let body = match message {
        OutboundMessage::Text { body, .. } => MessageBody {
            r#type: BODY_TEXT,
            template_id: TEMPLATE_DEFAULT,
            text: body.clone(),
            image: None,
        },
        OutboundMessage::Image { image_ref, .. } => MessageBody {
            r#type: BODY_IMAGE,
            template_id: TEMPLATE_DEFAULT,
            text: String::new(),
            image: Some(ChatImage {
                iid: 0,
                tiny_image: None,
                origin_image: Some(ImageInfo::from(image_ref)),
            }),
        },
    };

    ChatProtocol {
        r#type: PROTOCOL_CHAT,
        messages: vec![ChatMessage {
            from: Some(ChatUser {
                uid: sender_uid,
                name: String::new(),
            }),
            to: Some(ChatUser {
                uid: 0,
                name: message.recipient_id().to_string(),
            }),
            r#type: MESSAGE_USER,
            mid: now_ms,
            time: now_ms,
            body: Some(body),
            cmid: now_ms,
        }],
    }
}

pub fn encode_envelope(envelope: &ChatProtocol) -> Bytes {
    Bytes::from(envelope.encode_to_vec())
}

pub fn decode_envelope(payload: &[u8]) -> Result<ChatProtocol, AppError> {
    ChatProtocol::decode(payload)
        .map_err(|e| AppError::ProtocolError(format!("Malformed chat envelope: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_envelope_fields() {
        let message = OutboundMessage::text("boss-42", "Hello");
        let envelope = build_envelope(&message, 0, 1_700_000_000_123);

        assert_eq!(envelope.r#type, PROTOCOL_CHAT);
        assert_eq!(envelope.messages.len(), 1);
        let m = &envelope.messages[0];
        assert_eq!(m.from.as_ref().unwrap().uid, 0);
        let to = m.to.as_ref().unwrap();
        assert_eq!((to.uid, to.name.as_str()), (0, "boss-42"));
        assert_eq!(m.r#type, MESSAGE_USER);
        assert_eq!(m.mid, 1_700_000_000_123);
        assert_eq!(m.time, m.mid);
        assert_eq!(m.cmid, m.mid);
        let body = m.body.as_ref().unwrap();
        assert_eq!(body.r#type, BODY_TEXT);
        assert_eq!(body.template_id, 1);
        assert_eq!(body.text, "Hello");
        assert!(body.image.is_none());
    }

    #[test]
    fn image_envelope_carries_origin_image() {
        let message = OutboundMessage::Image {
            recipient_id: "boss-7".into(),
            security_token: "sec".into(),
            image_ref: ImageRef {
                url: "https://img.example/r.png".into(),
                width: 1240,
                height: 1754,
            },
        };
        let envelope = build_envelope(&message, 0, 5);
        let body = envelope.messages[0].body.clone().unwrap();
        assert_eq!(body.r#type, BODY_IMAGE);
        let origin = body.image.unwrap().origin_image.unwrap();
        assert_eq!(origin.url, "https://img.example/r.png");
        assert_eq!((origin.width, origin.height), (1240, 1754));
    }

    #[test]
    fn wire_bytes_decode_to_same_envelope() {
        let envelope = build_envelope(&OutboundMessage::text("boss-1", "你好"), 0, 99);
        let bytes = encode_envelope(&envelope);
        assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
    }

    #[test]
    fn image_survives_the_wire() {
        let message = OutboundMessage::Image {
            recipient_id: "boss-7".into(),
            security_token: "sec".into(),
            image_ref: ImageRef {
                url: "https://img.example/r.png".into(),
                width: 1240,
                height: 1754,
            },
        };
        let envelope = build_envelope(&message, 0, 6);
        let decoded = decode_envelope(&encode_envelope(&envelope)).unwrap();
        assert_eq!(decoded, envelope);

        let body = decoded.messages[0].body.clone().unwrap();
        assert_eq!(body.r#type, BODY_IMAGE);
        let origin = body.image.unwrap().origin_image.unwrap();
        assert_eq!(origin.url, "https://img.example/r.png");
        assert_eq!(origin.width, 1240);
        assert_eq!(origin.height, 1754);
    }

    #[test]
    fn garbage_payload_is_protocol_error() {
        let err = decode_envelope(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(err, AppError::ProtocolError(_)));
    }
}
