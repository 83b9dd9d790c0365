use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::defs::{
    Analysis, Article, ArticleDraft, ArticleFilter, FetchLog, SourceConfig, SourceKind, SourceSettings, Summary,
};
use crate::state::{InsertOutcome, Store, StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    articles: Vec<Article>,
    by_fingerprint: HashMap<String, usize>,
    by_url: HashMap<String, usize>,
    sources: Vec<SourceConfig>,
    fetch_logs: Vec<FetchLog>,
    summaries: Vec<Summary>,
    by_language: HashMap<(Uuid, String), usize>,
    analyses: HashMap<Uuid, Analysis>,
}

impl Tables {
    fn site_url_taken(&self, source: &SourceConfig) -> Option<String> {
        let key = source.site_url_key()?;
        self.sources
            .iter()
            .filter(|s| s.id != source.id)
            .any(|s| s.site_url_key().as_deref() == Some(key.as_str()))
            .then_some(key)
    }
}

/// Process-local store. All uniqueness checks run under the same write
/// guard as the insert they protect.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_article(&self, draft: ArticleDraft) -> StoreResult<InsertOutcome<Article>> {
        let mut tables = self.tables.write().await;
        if tables.by_fingerprint.contains_key(&draft.fingerprint) {
            return Ok(InsertOutcome::Conflict);
        }
        if let Some(url) = &draft.url {
            if tables.by_url.contains_key(url) {
                return Ok(InsertOutcome::Conflict);
            }
        }

        let article = Article::from_draft(draft, Uuid::new_v4(), Utc::now());
        let index = tables.articles.len();
        tables.by_fingerprint.insert(article.fingerprint.clone(), index);
        if let Some(url) = &article.url {
            tables.by_url.insert(url.clone(), index);
        }
        tables.articles.push(article.clone());
        Ok(InsertOutcome::Inserted(article))
    }

    async fn get_article(&self, id: Uuid) -> StoreResult<Option<Article>> {
        let tables = self.tables.read().await;
        Ok(tables.articles.iter().find(|a| a.id == id).cloned())
    }

    async fn find_article_by_fingerprint(&self, fingerprint: &str) -> StoreResult<Option<Article>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_fingerprint
            .get(fingerprint)
            .map(|&i| tables.articles[i].clone()))
    }

    async fn find_article_by_url(&self, url: &str) -> StoreResult<Option<Article>> {
        let tables = self.tables.read().await;
        Ok(tables.by_url.get(url).map(|&i| tables.articles[i].clone()))
    }

    async fn list_articles(&self, filter: &ArticleFilter) -> StoreResult<Vec<Article>> {
        let now = Utc::now();
        let tables = self.tables.read().await;
        let mut matching: Vec<(usize, &Article)> = tables
            .articles
            .iter()
            .enumerate()
            .filter(|(_, a)| filter.matches(a, now))
            .collect();
        matching.sort_by(|(ia, a), (ib, b)| {
            b.published_at.cmp(&a.published_at).then(ia.cmp(ib))
        });
        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.effective_limit())
            .map(|(_, a)| a.clone())
            .collect())
    }

    async fn count_articles(&self) -> StoreResult<u64> {
        Ok(self.tables.read().await.articles.len() as u64)
    }

    async fn create_source(&self, source: SourceConfig) -> StoreResult<SourceConfig> {
        let mut tables = self.tables.write().await;
        if let Some(url) = tables.site_url_taken(&source) {
            return Err(StoreError::DuplicateSource { url });
        }
        tables.sources.push(source.clone());
        Ok(source)
    }

    async fn get_source(&self, id: Uuid) -> StoreResult<Option<SourceConfig>> {
        let tables = self.tables.read().await;
        Ok(tables.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sources(&self, kind: Option<SourceKind>) -> StoreResult<Vec<SourceConfig>> {
        let tables = self.tables.read().await;
        Ok(tables
            .sources
            .iter()
            .filter(|s| kind.is_none_or(|k| s.kind() == k))
            .cloned()
            .collect())
    }

    async fn update_source(&self, source: &SourceConfig) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if let Some(url) = tables.site_url_taken(source) {
            return Err(StoreError::DuplicateSource { url });
        }
        let stored = tables
            .sources
            .iter_mut()
            .find(|s| s.id == source.id)
            .ok_or(StoreError::SourceNotFound { id: source.id })?;

        let last_fetched = stored.last_fetched;
        let processed = stored.mailbox().map(|m| m.total_emails_processed);
        *stored = source.clone();
        stored.last_fetched = last_fetched;
        if let (SourceSettings::Mailbox(mailbox), Some(processed)) = (&mut stored.settings, processed) {
            mailbox.total_emails_processed = processed;
        }
        Ok(())
    }

    async fn delete_source(&self, id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        let before = tables.sources.len();
        tables.sources.retain(|s| s.id != id);
        tables.fetch_logs.retain(|log| log.source_id != id);
        Ok(tables.sources.len() != before)
    }

    async fn record_fetch(
        &self,
        id: Uuid,
        fetched_at: DateTime<Utc>,
        emails_ingested: u64,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::SourceNotFound { id })?;
        stored.last_fetched = Some(stored.last_fetched.map_or(fetched_at, |t| t.max(fetched_at)));
        if let SourceSettings::Mailbox(mailbox) = &mut stored.settings {
            mailbox.total_emails_processed += emails_ingested;
        }
        Ok(())
    }

    async fn append_fetch_log(&self, log: FetchLog) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.sources.iter().any(|s| s.id == log.source_id) {
            return Err(StoreError::SourceNotFound { id: log.source_id });
        }
        tables.fetch_logs.push(log);
        Ok(())
    }

    async fn list_fetch_logs(&self, source_id: Uuid, offset: usize, limit: usize) -> StoreResult<Vec<FetchLog>> {
        let tables = self.tables.read().await;
        let mut logs: Vec<&FetchLog> = tables.fetch_logs.iter().filter(|l| l.source_id == source_id).collect();
        // Ties go to the later append.
        logs.reverse();
        logs.sort_by(|a, b| b.fetched_at.cmp(&a.fetched_at));
        Ok(logs.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn latest_fetch_log(&self) -> StoreResult<Option<FetchLog>> {
        let tables = self.tables.read().await;
        Ok(tables
            .fetch_logs
            .iter()
            .max_by_key(|log| log.fetched_at)
            .cloned())
    }

    async fn get_summary(&self, article_id: Uuid, language: &str) -> StoreResult<Option<Summary>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_language
            .get(&(article_id, language.to_string()))
            .map(|&i| tables.summaries[i].clone()))
    }

    async fn get_summary_by_id(&self, id: Uuid) -> StoreResult<Option<Summary>> {
        let tables = self.tables.read().await;
        Ok(tables.summaries.iter().find(|s| s.id == id).cloned())
    }

    async fn list_summaries(&self, article_id: Uuid) -> StoreResult<Vec<Summary>> {
        let tables = self.tables.read().await;
        Ok(tables
            .summaries
            .iter()
            .filter(|s| s.article_id == article_id)
            .cloned()
            .collect())
    }

    async fn create_summary(&self, summary: Summary) -> StoreResult<InsertOutcome<Summary>> {
        let mut tables = self.tables.write().await;
        if !tables.articles.iter().any(|a| a.id == summary.article_id) {
            return Err(StoreError::ArticleNotFound { id: summary.article_id });
        }
        let key = (summary.article_id, summary.language.clone());
        if tables.by_language.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        let index = tables.summaries.len();
        tables.by_language.insert(key, index);
        tables.summaries.push(summary.clone());
        Ok(InsertOutcome::Inserted(summary))
    }

    async fn get_analysis(&self, article_id: Uuid) -> StoreResult<Option<Analysis>> {
        let tables = self.tables.read().await;
        Ok(tables.analyses.get(&article_id).cloned())
    }

    async fn create_analysis(&self, analysis: Analysis) -> StoreResult<InsertOutcome<Analysis>> {
        let mut tables = self.tables.write().await;
        if !tables.articles.iter().any(|a| a.id == analysis.article_id) {
            return Err(StoreError::ArticleNotFound { id: analysis.article_id });
        }
        if tables.analyses.contains_key(&analysis.article_id) {
            return Ok(InsertOutcome::Conflict);
        }
        tables.analyses.insert(analysis.article_id, analysis.clone());
        Ok(InsertOutcome::Inserted(analysis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::SourceKind;
    use crate::defs::{FetchLog, FetchLogStatus};
    use crate::requests::{NewMailboxSource, NewSiteSource};
    use chrono::Duration;

    fn draft(fingerprint: &str, url: Option<&str>) -> ArticleDraft {
        ArticleDraft {
            title: "Title".into(),
            description: String::new(),
            body: String::new(),
            source_kind: SourceKind::Site,
            source_id: None,
            source_name: "test".into(),
            url: url.map(str::to_string),
            published_at: Utc::now(),
            language: "en".into(),
            category: "technology".into(),
            tags: vec![],
            fingerprint: fingerprint.into(),
        }
    }

    #[tokio::test]
    async fn fingerprint_and_url_are_unique() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.insert_article(draft("a", Some("https://x.com/1"))).await.unwrap(),
            InsertOutcome::Inserted(_)
        ));
        assert_eq!(
            store.insert_article(draft("a", None)).await.unwrap(),
            InsertOutcome::Conflict
        );
        assert_eq!(
            store.insert_article(draft("b", Some("https://x.com/1"))).await.unwrap(),
            InsertOutcome::Conflict
        );
        assert_eq!(store.count_articles().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_fetch_is_monotonic() {
        let store = MemoryStore::new();
        let source = NewMailboxSource::new("inbox").into_config().unwrap();
        let id = source.id;
        store.create_source(source).await.unwrap();

        let now = Utc::now();
        store.record_fetch(id, now, 3).await.unwrap();
        store.record_fetch(id, now - Duration::hours(2), 2).await.unwrap();

        let stored = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(stored.last_fetched, Some(now));
        assert_eq!(stored.mailbox().unwrap().total_emails_processed, 5);
    }

    #[tokio::test]
    async fn update_source_does_not_touch_bookkeeping() {
        let store = MemoryStore::new();
        let source = NewMailboxSource::new("inbox").into_config().unwrap();
        let id = source.id;
        store.create_source(source.clone()).await.unwrap();
        store.record_fetch(id, Utc::now(), 4).await.unwrap();

        let mut edited = source;
        edited.name = "renamed".into();
        store.update_source(&edited).await.unwrap();

        let stored = store.get_source(id).await.unwrap().unwrap();
        assert_eq!(stored.name, "renamed");
        assert!(stored.last_fetched.is_some());
        assert_eq!(stored.mailbox().unwrap().total_emails_processed, 4);
    }

    #[tokio::test]
    async fn site_urls_are_unique_after_normalization() {
        let store = MemoryStore::new();
        let first = NewSiteSource::new("TLDR", "https://tldr.tech/").into_config().unwrap();
        store.create_source(first.clone()).await.unwrap();

        let again = NewSiteSource::new("TLDR again", "https://TLDR.tech#latest").into_config().unwrap();
        assert_eq!(
            store.create_source(again).await.unwrap_err(),
            StoreError::DuplicateSource { url: "https://tldr.tech/".into() }
        );

        let other = NewSiteSource::new("Batch", "https://www.deeplearning.ai/the-batch/").into_config().unwrap();
        store.create_source(other.clone()).await.unwrap();
        let mut moved = other;
        moved.settings = first.settings.clone();
        assert!(matches!(
            store.update_source(&moved).await.unwrap_err(),
            StoreError::DuplicateSource { .. }
        ));
        // Re-saving a source with its own URL is not a conflict.
        store.update_source(&first).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_logs_are_newest_first_and_go_with_their_source() {
        let store = MemoryStore::new();
        let source = NewMailboxSource::new("inbox").into_config().unwrap();
        let id = source.id;
        store.create_source(source).await.unwrap();

        let now = Utc::now();
        let log = |minutes_ago: i64, status| FetchLog {
            id: Uuid::new_v4(),
            source_id: id,
            fetched_at: now - Duration::minutes(minutes_ago),
            status,
            items_found: 1,
            articles_saved: 1,
            duplicates: 0,
            error_message: None,
            processing_ms: 5,
        };
        store.append_fetch_log(log(10, FetchLogStatus::Success)).await.unwrap();
        store.append_fetch_log(log(0, FetchLogStatus::Failed)).await.unwrap();
        store.append_fetch_log(log(5, FetchLogStatus::Partial)).await.unwrap();

        let logs = store.list_fetch_logs(id, 0, 10).await.unwrap();
        let statuses: Vec<_> = logs.iter().map(|l| l.status).collect();
        assert_eq!(
            statuses,
            vec![FetchLogStatus::Failed, FetchLogStatus::Partial, FetchLogStatus::Success]
        );
        assert_eq!(store.list_fetch_logs(id, 1, 1).await.unwrap()[0].status, FetchLogStatus::Partial);
        assert_eq!(store.latest_fetch_log().await.unwrap().unwrap().status, FetchLogStatus::Failed);

        assert!(matches!(
            store.append_fetch_log(FetchLog { source_id: Uuid::new_v4(), ..log(0, FetchLogStatus::Success) }).await,
            Err(StoreError::SourceNotFound { .. })
        ));

        store.delete_source(id).await.unwrap();
        assert!(store.list_fetch_logs(id, 0, 10).await.unwrap().is_empty());
        assert!(store.latest_fetch_log().await.unwrap().is_none());
    }
}
