use chrono::Utc;
use std::{sync::Arc, time::Instant};
use tracing::{debug, instrument, warn};

use crate::{
    actors::delivery_bus::DeliveryBus,
    error::{ChatError, ChatResult},
    events::DeliveryEvent,
    metrics::Metrics,
    models::{ConversationId, ConversationSummary, Scope, UserId, preview},
    store::ChatStore,
};

/// A lost creation race is resolved by re-reading the pair; more attempts
/// than this means the store is misbehaving.
const DIALOG_CREATE_ATTEMPTS: usize = 3;

/// Dialog lifecycle: dedup on creation, per-user hide and clear, and the
/// conversation list.
#[derive(Clone)]
pub struct ConversationRegistry {
    store: Arc<dyn ChatStore>,
    bus: DeliveryBus,
}

impl ConversationRegistry {
    pub fn new(store: Arc<dyn ChatStore>, bus: DeliveryBus) -> Self {
        Self { store, bus }
    }

    /// Returns the single conversation of the pair, creating it if needed.
    /// Re-contact un-hides the conversation for both users.
    #[instrument(skip(self))]
    pub async fn get_or_create_dialog(&self, a: UserId, b: UserId) -> ChatResult<ConversationId> {
        if a == b {
            return Err(ChatError::SelfDialog);
        }

        for attempt in 1..=DIALOG_CREATE_ATTEMPTS {
            if let Some(conversation_id) = self.store.find_dialog(a, b).await? {
                self.store.unhide(conversation_id, &[a, b]).await?;
                return Ok(conversation_id);
            }

            match self.store.create_dialog(a, b, Utc::now()).await {
                Ok(conversation_id) => {
                    debug!("Started conversation {}", conversation_id);
                    return Ok(conversation_id);
                }
                Err(ChatError::Conflict(reason)) => {
                    debug!("Lost dialog creation race (attempt {}): {}", attempt, reason);
                }
                Err(e) => return Err(e),
            }
        }

        warn!("Dialog for users {} and {} could not be resolved", a, b);
        Err(ChatError::Conflict(format!(
            "dialog for users {} and {} kept changing",
            a, b
        )))
    }

    /// Sets the caller's own hidden flag and returns it.
    #[instrument(skip(self))]
    pub async fn hide(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        hide: bool,
    ) -> ChatResult<bool> {
        if !self.store.set_hidden(conversation_id, user_id, hide).await? {
            return Err(ChatError::not_participant());
        }
        Ok(hide)
    }

    /// `me` hides the whole history for the caller only; `all` deletes it
    /// for both participants and tells them which messages went away.
    #[instrument(skip(self))]
    pub async fn clear(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        scope: &str,
    ) -> ChatResult<()> {
        self.ensure_participant(conversation_id, user_id).await?;

        match scope.parse::<Scope>()? {
            Scope::Me => self.store.clear_for_user(conversation_id, user_id).await,
            Scope::All => {
                let deleted = self.store.clear_for_all(conversation_id).await?;
                let recipients = self.participant_ids(conversation_id).await?;
                debug!("Cleared {} messages for everyone", deleted.len());
                for message_id in deleted {
                    self.bus.publish(
                        &DeliveryEvent::MessageDeleted {
                            conversation_id,
                            message_id,
                        },
                        &recipients,
                    );
                }
                Ok(())
            }
        }
    }

    /// Non-hidden conversations of the user, most recently active first.
    #[instrument(skip(self))]
    pub async fn list_conversations(&self, user_id: UserId) -> ChatResult<Vec<ConversationSummary>> {
        let start = Instant::now();
        let mut summaries = Vec::new();

        for membership in self.store.memberships(user_id).await? {
            if membership.is_hidden {
                continue;
            }
            let conversation_id = membership.conversation_id;

            let peer_id = self
                .participant_ids(conversation_id)
                .await?
                .into_iter()
                .find(|id| *id != user_id);
            let Some(peer_id) = peer_id else {
                warn!("Conversation {} has no peer for {}", conversation_id, user_id);
                continue;
            };

            let last = self
                .store
                .latest_visible_message(conversation_id, user_id)
                .await?;
            let unread_count = self
                .store
                .count_unread(conversation_id, user_id, membership.read_cursor())
                .await?;

            summaries.push(ConversationSummary {
                conversation_id,
                peer_id,
                last_message_id: last.as_ref().map(|m| m.id),
                last_message_preview: last.as_ref().and_then(|m| preview(&m.content)),
                last_message_at: last.as_ref().map(|m| m.created_at),
                unread_count,
            });
        }

        // Newest activity first; conversations without a visible message last.
        summaries.sort_by(|x, y| {
            y.last_message_at
                .cmp(&x.last_message_at)
                .then(y.conversation_id.cmp(&x.conversation_id))
        });

        Metrics::observe_store_operation("list_conversations", start.elapsed());
        Ok(summaries)
    }

    pub async fn participant_ids(&self, conversation_id: ConversationId) -> ChatResult<Vec<UserId>> {
        Ok(self
            .store
            .participants(conversation_id)
            .await?
            .into_iter()
            .map(|p| p.user_id)
            .collect())
    }

    async fn ensure_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> ChatResult<()> {
        match self.store.participant(conversation_id, user_id).await? {
            Some(_) => Ok(()),
            None => Err(ChatError::not_participant()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;
    use crate::store::MemoryStore;
    use tokio::sync::mpsc;

    fn registry() -> (ConversationRegistry, Arc<MemoryStore>, DeliveryBus) {
        let store = Arc::new(MemoryStore::new());
        let bus = DeliveryBus::spawn();
        (
            ConversationRegistry::new(store.clone(), bus.clone()),
            store,
            bus,
        )
    }

    async fn say(store: &MemoryStore, conversation_id: ConversationId, from: UserId, text: &str) -> i64 {
        let (message, _) = store
            .insert_message(NewMessage {
                conversation_id,
                sender_id: from,
                content: text.to_string(),
                created_at: Utc::now(),
                attachments: Vec::new(),
            })
            .await
            .unwrap();
        message.id
    }

    #[tokio::test]
    async fn self_dialog_is_rejected() {
        let (registry, _, _) = registry();
        assert_eq!(
            registry.get_or_create_dialog(5, 5).await,
            Err(ChatError::SelfDialog)
        );
    }

    #[tokio::test]
    async fn dialog_is_reused_and_unhidden() {
        let (registry, store, _) = registry();
        let id = registry.get_or_create_dialog(1, 2).await.unwrap();
        assert!(registry.hide(id, 2, true).await.unwrap());

        assert_eq!(registry.get_or_create_dialog(1, 2).await.unwrap(), id);
        let participant = store.participant(id, 2).await.unwrap().unwrap();
        assert!(!participant.is_hidden);
    }

    #[tokio::test]
    async fn hide_and_clear_require_membership() {
        let (registry, _, _) = registry();
        let id = registry.get_or_create_dialog(1, 2).await.unwrap();

        assert_eq!(
            registry.hide(id, 3, true).await,
            Err(ChatError::not_participant())
        );
        assert_eq!(
            registry.clear(id, 3, "me").await,
            Err(ChatError::not_participant())
        );
        assert_eq!(
            registry.clear(id, 1, "everyone").await,
            Err(ChatError::InvalidScope("everyone".to_string()))
        );
    }

    #[tokio::test]
    async fn clear_for_all_notifies_each_deleted_message() {
        let (registry, store, bus) = registry();
        let id = registry.get_or_create_dialog(1, 2).await.unwrap();
        let first = say(&store, id, 1, "one").await;
        let second = say(&store, id, 2, "two").await;

        let (tx, mut rx) = mpsc::channel(8);
        bus.register(2, tx);
        registry.clear(id, 1, "all").await.unwrap();

        let mut deleted = Vec::new();
        for _ in 0..2 {
            let raw = rx.recv().await.unwrap();
            let event: DeliveryEvent = serde_json::from_str(&raw).unwrap();
            match event {
                DeliveryEvent::MessageDeleted { message_id, .. } => deleted.push(message_id),
                other => panic!("unexpected event {:?}", other),
            }
        }
        deleted.sort();
        assert_eq!(deleted, vec![first, second]);
        assert!(store.latest_visible_message(id, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_activity_and_skips_hidden() {
        let (registry, store, _) = registry();
        let quiet = registry.get_or_create_dialog(1, 2).await.unwrap();
        let busy = registry.get_or_create_dialog(1, 3).await.unwrap();
        let hidden = registry.get_or_create_dialog(1, 4).await.unwrap();

        say(&store, busy, 3, "hello there").await;
        say(&store, busy, 3, "are you around?").await;
        say(&store, hidden, 4, "psst").await;
        registry.hide(hidden, 1, true).await.unwrap();

        let list = registry.list_conversations(1).await.unwrap();
        let ids: Vec<_> = list.iter().map(|s| s.conversation_id).collect();
        assert_eq!(ids, vec![busy, quiet]);

        assert_eq!(list[0].peer_id, 3);
        assert_eq!(list[0].unread_count, 2);
        assert_eq!(
            list[0].last_message_preview.as_deref(),
            Some("are you around?")
        );
        assert_eq!(list[1].last_message_id, None);
        assert_eq!(list[1].unread_count, 0);
    }
}
