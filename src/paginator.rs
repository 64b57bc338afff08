use std::{sync::Arc, time::Instant};
use tracing::{debug, instrument};

use crate::{
    error::ChatResult,
    metrics::Metrics,
    models::{ConversationId, MessagePage, PageRequest, UserId},
    store::ChatStore,
};

pub const MAX_PAGE_SIZE: i64 = 100;

/// Backward, cursor-based history reads. The cursor is an exclusive upper
/// bound on message id, so messages arriving between two calls never shift
/// rows that were already returned.
#[derive(Clone)]
pub struct Paginator {
    store: Arc<dyn ChatStore>,
    default_limit: i64,
}

impl Paginator {
    pub fn new(store: Arc<dyn ChatStore>, default_limit: i64) -> Self {
        Self {
            store,
            default_limit,
        }
    }

    #[instrument(skip(self))]
    pub async fn fetch_page(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        request: PageRequest,
    ) -> ChatResult<MessagePage> {
        if self
            .store
            .participant(conversation_id, user_id)
            .await?
            .is_none()
        {
            debug!("Page requested by non-participant");
            return Ok(MessagePage::empty());
        }

        let start = Instant::now();
        let limit = request
            .limit
            .unwrap_or(self.default_limit)
            .clamp(1, MAX_PAGE_SIZE);
        let search = request
            .search
            .as_deref()
            .filter(|s| !s.trim().is_empty());

        // One extra row tells us whether an older page exists.
        let mut items = self
            .store
            .visible_messages_before(conversation_id, user_id, request.before_id, search, limit + 1)
            .await?;

        let has_more = items.len() as i64 > limit;
        items.truncate(limit as usize);
        items.reverse();
        let next_before_id = items.first().map(|m| m.id);

        Metrics::observe_store_operation("fetch_page", start.elapsed());
        Ok(MessagePage {
            items,
            has_more,
            next_before_id,
        })
    }
}
