use std::sync::Arc;

use interfaces::{Article, ArticleDraft, InsertOutcome, Store};
use tracing::debug;

use crate::types::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    Inserted(Article),
    /// Already stored under the same fingerprint or URL. Not an error.
    Skipped,
}

impl DedupOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, DedupOutcome::Inserted(_))
    }
}

/// The lookups are a fast path only. The store's unique constraints decide,
/// so two fetchers racing on the same draft still produce one article.
pub struct Deduplicator {
    store: Arc<dyn Store>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn try_insert(&self, draft: ArticleDraft) -> Result<DedupOutcome> {
        if self.store.find_article_by_fingerprint(&draft.fingerprint).await?.is_some() {
            debug!("Skipping known fingerprint for '{}'", draft.title);
            return Ok(DedupOutcome::Skipped);
        }
        if let Some(url) = &draft.url {
            if self.store.find_article_by_url(url).await?.is_some() {
                debug!("Skipping known URL {}", url);
                return Ok(DedupOutcome::Skipped);
            }
        }

        match self.store.insert_article(draft).await? {
            InsertOutcome::Inserted(article) => Ok(DedupOutcome::Inserted(article)),
            InsertOutcome::Conflict => {
                debug!("Lost insert race; article already stored");
                Ok(DedupOutcome::Skipped)
            }
        }
    }
}
