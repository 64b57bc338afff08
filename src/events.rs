use serde::{Deserialize, Serialize};

use crate::models::{ConversationId, MessageId, MessageView};

/// Live events pushed to connected participants. Serialized as
/// `{"type": "<kind>", ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    NewMessage {
        conversation_id: ConversationId,
        message: MessageView,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message: MessageView,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    // The reader's own unread count after a read cursor moved.
    ConversationUpdated {
        conversation_id: ConversationId,
        unread_count: i64,
    },
}

impl DeliveryEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryEvent::NewMessage { .. } => "new_message",
            DeliveryEvent::MessageEdited { .. } => "message_edited",
            DeliveryEvent::MessageDeleted { .. } => "message_deleted",
            DeliveryEvent::ConversationUpdated { .. } => "conversation_updated",
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        match self {
            DeliveryEvent::NewMessage {
                conversation_id, ..
            }
            | DeliveryEvent::MessageEdited {
                conversation_id, ..
            }
            | DeliveryEvent::MessageDeleted {
                conversation_id, ..
            }
            | DeliveryEvent::ConversationUpdated {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deleted_event_wire_shape() {
        let event = DeliveryEvent::MessageDeleted {
            conversation_id: 4,
            message_id: 17,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "message_deleted", "conversation_id": 4, "message_id": 17})
        );
        assert_eq!(event.kind(), "message_deleted");
        assert_eq!(event.conversation_id(), 4);
    }

    #[test]
    fn new_message_carries_message_body() {
        let created_at = chrono::Utc::now();
        let event = DeliveryEvent::NewMessage {
            conversation_id: 1,
            message: MessageView {
                id: 9,
                conversation_id: 1,
                sender_id: 2,
                content: "hi".into(),
                created_at,
                edited_at: None,
                attachments: Vec::new(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "new_message");
        assert_eq!(value["message"]["id"], 9);
        assert_eq!(value["message"]["content"], "hi");

        let back: DeliveryEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
