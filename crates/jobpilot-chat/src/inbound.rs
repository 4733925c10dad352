//! Inbound chat traffic: decode a PUBLISH payload into a typed event.

use jobpilot_core::AppError;

use crate::envelope::{BODY_TEXT, ChatMessage, ChatProtocol, decode_envelope};

/// Envelope `type` values the backend pushes to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Chat = 1,
    Suggest = 4,
    Sync = 6,
    ResumeRequest = 7,
}

impl TryFrom<i32> for ProtocolType {
    type Error = AppError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProtocolType::Chat),
            4 => Ok(ProtocolType::Suggest),
            6 => Ok(ProtocolType::Sync),
            7 => Ok(ProtocolType::ResumeRequest),
            other => Err(AppError::ProtocolError(format!(
                "Unknown chat protocol type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A chat message; `text` is set for text bodies only.
    Chat {
        from_uid: i64,
        body_type: i32,
        text: Option<String>,
        time: i64,
    },
    Suggest {
        messages: usize,
    },
    Sync {
        messages: usize,
    },
    /// A recruiter asked for the candidate's resume.
    ResumeRequest {
        from_uid: i64,
        mid: i64,
    },
}

impl InboundEvent {
    pub fn protocol_type(&self) -> ProtocolType {
        match self {
            InboundEvent::Chat { .. } => ProtocolType::Chat,
            InboundEvent::Suggest { .. } => ProtocolType::Suggest,
            InboundEvent::Sync { .. } => ProtocolType::Sync,
            InboundEvent::ResumeRequest { .. } => ProtocolType::ResumeRequest,
        }
    }

    /// Sender uid, for events that carry one.
    pub fn from_uid(&self) -> Option<i64> {
        match self {
            InboundEvent::Chat { from_uid, .. } | InboundEvent::ResumeRequest { from_uid, .. } => {
                Some(*from_uid)
            }
            InboundEvent::Suggest { .. } | InboundEvent::Sync { .. } => None,
        }
    }

    pub fn from_envelope(envelope: &ChatProtocol) -> Result<Self, AppError> {
        let event = match ProtocolType::try_from(envelope.r#type)? {
            ProtocolType::Chat => {
                let last = last_message(envelope)?;
                let body = last.body.as_ref();
                let body_type = body.map_or(0, |b| b.r#type);
                InboundEvent::Chat {
                    from_uid: sender_uid(last),
                    body_type,
                    text: body
                        .filter(|b| b.r#type == BODY_TEXT)
                        .map(|b| b.text.clone()),
                    time: last.time,
                }
            }
            ProtocolType::Suggest => InboundEvent::Suggest {
                messages: envelope.messages.len(),
            },
            ProtocolType::Sync => InboundEvent::Sync {
                messages: envelope.messages.len(),
            },
            ProtocolType::ResumeRequest => {
                let last = last_message(envelope)?;
                InboundEvent::ResumeRequest {
                    from_uid: sender_uid(last),
                    mid: last.mid,
                }
            }
        };
        Ok(event)
    }
}

/// Decode a raw PUBLISH payload.
pub fn decode_inbound(payload: &[u8]) -> Result<InboundEvent, AppError> {
    InboundEvent::from_envelope(&decode_envelope(payload)?)
}

fn last_message(envelope: &ChatProtocol) -> Result<&ChatMessage, AppError> {
    envelope
        .messages
        .last()
        .ok_or_else(|| AppError::ProtocolError("Chat envelope has no messages".into()))
}

fn sender_uid(message: &ChatMessage) -> i64 {
    message.from.as_ref().map_or(0, |u| u.uid)
}

/// Receives decoded inbound events on the chat thread.
///
/// Called inline from the network loop, so implementations must not block.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, event: &InboundEvent);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInboundHandler;

impl InboundHandler for TracingInboundHandler {
    fn handle(&self, event: &InboundEvent) {
        match event {
            InboundEvent::Chat {
                from_uid,
                text: Some(text),
                ..
            } => {
                tracing::info!(from_uid, text = %text, "Chat message received");
            }
            InboundEvent::Chat {
                from_uid,
                body_type,
                ..
            } => {
                tracing::debug!(from_uid, body_type, "Non-text chat message received");
            }
            InboundEvent::Suggest { messages } => {
                tracing::debug!(messages, "Suggestion received");
            }
            InboundEvent::Sync { messages } => {
                tracing::debug!(messages, "Sync received");
            }
            InboundEvent::ResumeRequest { from_uid, mid } => {
                tracing::info!(from_uid, mid, "Recruiter requested the resume");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ChatUser, MessageBody, encode_envelope};

    fn envelope(kind: i32, from_uid: i64, body: Option<MessageBody>) -> ChatProtocol {
        ChatProtocol {
            r#type: kind,
            messages: vec![ChatMessage {
                from: Some(ChatUser {
                    uid: from_uid,
                    name: String::new(),
                }),
                to: None,
                r#type: 1,
                mid: 11,
                time: 22,
                body,
                cmid: 11,
            }],
        }
    }

    fn text(s: &str) -> Option<MessageBody> {
        Some(MessageBody {
            r#type: BODY_TEXT,
            template_id: 1,
            text: s.into(),
            image: None,
        })
    }

    #[test]
    fn text_chat_event() {
        let payload = encode_envelope(&envelope(1, 99, text("hi there")));
        let event = decode_inbound(&payload).unwrap();
        assert_eq!(
            event,
            InboundEvent::Chat {
                from_uid: 99,
                body_type: BODY_TEXT,
                text: Some("hi there".into()),
                time: 22,
            }
        );
        assert_eq!(event.from_uid(), Some(99));
    }

    #[test]
    fn non_text_chat_has_no_text() {
        let image_body = Some(MessageBody {
            r#type: 3,
            ..MessageBody::default()
        });
        let event = InboundEvent::from_envelope(&envelope(1, 5, image_body)).unwrap();
        assert!(matches!(event, InboundEvent::Chat { text: None, body_type: 3, .. }));
    }

    #[test]
    fn resume_request_event() {
        let event = InboundEvent::from_envelope(&envelope(7, 42, None)).unwrap();
        assert_eq!(event, InboundEvent::ResumeRequest { from_uid: 42, mid: 11 });
        assert_eq!(event.protocol_type(), ProtocolType::ResumeRequest);
    }

    #[test]
    fn suggest_and_sync_count_messages() {
        let event = InboundEvent::from_envelope(&envelope(4, 1, None)).unwrap();
        assert_eq!(event, InboundEvent::Suggest { messages: 1 });
        let event = InboundEvent::from_envelope(&envelope(6, 1, None)).unwrap();
        assert_eq!(event, InboundEvent::Sync { messages: 1 });
    }

    #[test]
    fn unknown_type_is_protocol_error() {
        let err = InboundEvent::from_envelope(&envelope(9, 1, None)).unwrap_err();
        assert!(matches!(err, AppError::ProtocolError(_)));
    }

    #[test]
    fn chat_without_messages_is_protocol_error() {
        let empty = ChatProtocol {
            r#type: 1,
            messages: vec![],
        };
        assert!(InboundEvent::from_envelope(&empty).is_err());
    }
}
