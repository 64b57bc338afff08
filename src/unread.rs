use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::{
    actors::delivery_bus::DeliveryBus,
    error::ChatResult,
    events::DeliveryEvent,
    models::{ConversationId, MessageId, UserId},
    store::ChatStore,
};

/// Read cursors and the unread counts derived from them.
#[derive(Clone)]
pub struct UnreadTracker {
    store: Arc<dyn ChatStore>,
    bus: DeliveryBus,
}

impl UnreadTracker {
    pub fn new(store: Arc<dyn ChatStore>, bus: DeliveryBus) -> Self {
        Self { store, bus }
    }

    /// Moves the caller's read cursor forward to `upto`, or to the newest
    /// live message when `upto` is absent. The cursor never moves backwards
    /// and a non-participant is ignored. Returns whether the cursor moved.
    #[instrument(skip(self))]
    pub async fn mark_read(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        upto: Option<MessageId>,
    ) -> ChatResult<bool> {
        if self
            .store
            .participant(conversation_id, user_id)
            .await?
            .is_none()
        {
            debug!("Ignoring read marker from non-participant");
            return Ok(false);
        }

        let upto = match upto {
            Some(id) => id,
            None => match self.store.latest_message_id(conversation_id).await? {
                Some(id) => id,
                None => return Ok(false),
            },
        };

        let moved = self
            .store
            .advance_read_cursor(conversation_id, user_id, upto, Utc::now())
            .await?;

        if moved {
            let unread_count = self.store.count_unread(conversation_id, user_id, upto).await?;
            self.bus.publish(
                &DeliveryEvent::ConversationUpdated {
                    conversation_id,
                    unread_count,
                },
                &[user_id],
            );
        }

        Ok(moved)
    }

    /// Visible messages from the peer above the caller's read cursor.
    #[instrument(skip(self))]
    pub async fn unread_count(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<i64> {
        match self.store.participant(conversation_id, user_id).await? {
            Some(participant) => {
                self.store
                    .count_unread(conversation_id, user_id, participant.read_cursor())
                    .await
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    async fn setup() -> (UnreadTracker, Arc<MemoryStore>, DeliveryBus, ConversationId) {
        let store = Arc::new(MemoryStore::new());
        let bus = DeliveryBus::spawn();
        let conversation_id = store.create_dialog(1, 2, Utc::now()).await.unwrap();
        (
            UnreadTracker::new(store.clone(), bus.clone()),
            store,
            bus,
            conversation_id,
        )
    }

    async fn say(store: &MemoryStore, conversation_id: ConversationId, from: UserId) -> MessageId {
        store
            .insert_message(NewMessage {
                conversation_id,
                sender_id: from,
                content: "ping".to_string(),
                created_at: Utc::now(),
                attachments: Vec::new(),
            })
            .await
            .unwrap()
            .0
            .id
    }

    #[tokio::test]
    async fn counts_only_peer_messages_above_cursor() {
        let (tracker, store, _, cid) = setup().await;
        let first = say(&store, cid, 1).await;
        say(&store, cid, 1).await;
        say(&store, cid, 2).await;

        assert_eq!(tracker.unread_count(cid, 2).await.unwrap(), 2);
        assert_eq!(tracker.unread_count(cid, 1).await.unwrap(), 1);

        assert!(tracker.mark_read(cid, 2, Some(first)).await.unwrap());
        assert_eq!(tracker.unread_count(cid, 2).await.unwrap(), 1);

        store.hide_message(first + 1, 2).await.unwrap();
        assert_eq!(tracker.unread_count(cid, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let (tracker, store, _, cid) = setup().await;
        let first = say(&store, cid, 1).await;
        let second = say(&store, cid, 1).await;

        assert!(tracker.mark_read(cid, 2, None).await.unwrap());
        assert!(!tracker.mark_read(cid, 2, Some(first)).await.unwrap());

        let participant = store.participant(cid, 2).await.unwrap().unwrap();
        assert_eq!(participant.last_read_message_id, Some(second));
        assert!(participant.last_read_at.is_some());
    }

    #[tokio::test]
    async fn empty_conversation_and_strangers_are_no_ops() {
        let (tracker, store, _, cid) = setup().await;
        assert!(!tracker.mark_read(cid, 2, None).await.unwrap());

        say(&store, cid, 1).await;
        assert!(!tracker.mark_read(cid, 9, None).await.unwrap());
        assert_eq!(tracker.unread_count(cid, 9).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn moving_the_cursor_notifies_the_reader() {
        let (tracker, store, bus, cid) = setup().await;
        say(&store, cid, 1).await;
        let (tx, mut rx) = mpsc::channel(4);
        bus.register(2, tx);

        tracker.mark_read(cid, 2, None).await.unwrap();
        let event: DeliveryEvent = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            event,
            DeliveryEvent::ConversationUpdated {
                conversation_id: cid,
                unread_count: 0,
            }
        );
    }
}
