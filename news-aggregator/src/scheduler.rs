use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use interfaces::{
    AdapterError, FetchLog, FetchLogStatus, SourceConfig, SourceContext, SourceKind, Store, ValidationError,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::{DedupOutcome, Deduplicator};
use crate::normalizer::normalize;
use crate::sources::SourceAdapters;
use crate::types::{AggregatorError, BatchReport, FetchStatus, Result, SourceOutcome};

pub const DEFAULT_FETCH_WORKERS: usize = 4;
pub const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceState {
    Idle,
    Due,
    Fetching,
    /// Passed through when a fetch completes; it resolves to `Idle` at once,
    /// so the interval is re-evaluated on the next tick.
    Cooling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    DueOnly,
    Always,
}

type Registry = Mutex<HashMap<Uuid, SourceState>>;

/// Marks a source `Fetching` for as long as it lives, including when the
/// fetch future is cancelled.
struct FetchGuard<'a> {
    registry: &'a Registry,
    source_id: Uuid,
}

impl<'a> FetchGuard<'a> {
    fn claim(registry: &'a Registry, source_id: Uuid) -> Option<Self> {
        let mut states = registry.lock().unwrap_or_else(|e| e.into_inner());
        if states.get(&source_id) == Some(&SourceState::Fetching) {
            return None;
        }
        states.insert(source_id, SourceState::Fetching);
        Some(Self { registry, source_id })
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        let mut states = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        states.remove(&self.source_id);
    }
}

/// Runs sources through their adapters, the normalizer and the
/// deduplicator. Distinct sources run concurrently up to `workers`; one
/// source never runs twice at once.
pub struct FetchScheduler {
    store: Arc<dyn Store>,
    adapters: SourceAdapters,
    dedup: Deduplicator,
    registry: Registry,
    workers: usize,
    adapter_timeout: Duration,
}

impl FetchScheduler {
    pub fn new(store: Arc<dyn Store>, adapters: SourceAdapters) -> Self {
        Self {
            dedup: Deduplicator::new(store.clone()),
            store,
            adapters,
            registry: Mutex::new(HashMap::new()),
            workers: DEFAULT_FETCH_WORKERS,
            adapter_timeout: DEFAULT_ADAPTER_TIMEOUT,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_adapter_timeout(mut self, adapter_timeout: Duration) -> Self {
        self.adapter_timeout = adapter_timeout;
        self
    }

    pub fn state_of(&self, source: &SourceConfig, now: DateTime<Utc>) -> SourceState {
        let states = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        match states.get(&source.id) {
            Some(state) => *state,
            None if source.is_due(now) => SourceState::Due,
            None => SourceState::Idle,
        }
    }

    /// Fetches every enabled source of `kinds` whose interval has elapsed.
    pub async fn run_due(&self, kinds: &[SourceKind], now: DateTime<Utc>) -> Result<BatchReport> {
        let mut sources = Vec::new();
        for kind in kinds {
            sources.extend(self.store.list_sources(Some(*kind)).await?);
        }
        Ok(self.run_batch(sources, now, Selection::DueOnly).await)
    }

    /// Fetches every enabled source of `kind`, ignoring the interval.
    pub async fn fetch_all(&self, kind: SourceKind) -> Result<BatchReport> {
        let sources = self.store.list_sources(Some(kind)).await?;
        Ok(self.run_batch(sources, Utc::now(), Selection::Always).await)
    }

    pub async fn fetch_one(&self, source_id: Uuid) -> Result<SourceOutcome> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or(AggregatorError::SourceNotFound { id: source_id })?;
        if !source.enabled {
            return Err(ValidationError::Invalid {
                field: "enabled",
                reason: format!("source '{}' is disabled", source.name),
            }
            .into());
        }
        Ok(self.fetch_source(source, Utc::now(), Selection::Always).await)
    }

    /// Runs `run_due` over every source kind on a fixed cadence.
    pub fn spawn_ticker(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_due(&SourceKind::ALL, Utc::now()).await {
                    Ok(report) => info!(
                        "Scheduler tick: {} sources, {} new articles, {} failures",
                        report.outcomes.len(),
                        report.total_inserted(),
                        report.failures().count()
                    ),
                    Err(e) => error!("Scheduler tick failed: {}", e),
                }
            }
        })
    }

    async fn run_batch(&self, sources: Vec<SourceConfig>, now: DateTime<Utc>, selection: Selection) -> BatchReport {
        let started_at = Utc::now();
        let outcomes = stream::iter(sources)
            .map(|source| self.fetch_source(source, now, selection))
            .buffer_unordered(self.workers)
            .collect::<Vec<_>>()
            .await;
        BatchReport {
            started_at,
            finished_at: Utc::now(),
            outcomes,
        }
    }

    async fn fetch_source(&self, listed: SourceConfig, now: DateTime<Utc>, selection: Selection) -> SourceOutcome {
        let start = Instant::now();
        let outcome = |status| SourceOutcome {
            source_id: listed.id,
            source_name: listed.name.clone(),
            kind: listed.kind(),
            status,
            processing_ms: start.elapsed().as_millis() as u64,
        };

        if !listed.enabled {
            return outcome(FetchStatus::Disabled);
        }
        if selection == Selection::DueOnly && !listed.is_due(now) {
            return outcome(FetchStatus::NotDue);
        }
        let Some(_guard) = FetchGuard::claim(&self.registry, listed.id) else {
            info!("Source '{}' is already being fetched", listed.name);
            return outcome(FetchStatus::AlreadyRunning);
        };

        // The listing may predate a fetch by an overlapping batch; decide on
        // the stored row while holding the claim.
        let source = match self.store.get_source(listed.id).await {
            Ok(Some(current)) => current,
            Ok(None) => {
                let error = AggregatorError::SourceNotFound { id: listed.id }.to_string();
                return outcome(FetchStatus::Failed { error, auth: false });
            }
            Err(e) => {
                let error = AggregatorError::from(e).to_string();
                return outcome(FetchStatus::Failed { error, auth: false });
            }
        };
        if !source.enabled {
            return outcome(FetchStatus::Disabled);
        }
        if selection == Selection::DueOnly && !source.is_due(now) {
            debug!("Source '{}' was fetched by another batch", source.name);
            return outcome(FetchStatus::NotDue);
        }

        let adapter = self.adapters.for_kind(source.kind());
        let listed_items = match timeout(self.adapter_timeout, adapter.list_raw_items(&source)).await {
            Ok(listed_items) => listed_items,
            Err(_) => Err(AdapterError::Fetch(format!(
                "timed out after {}s",
                self.adapter_timeout.as_secs()
            ))),
        };
        let items = match listed_items {
            Ok(items) => items,
            Err(e) => {
                warn!("Source '{}' failed: {}", source.name, e);
                let auth = matches!(e, AdapterError::Auth(_));
                let error = AggregatorError::from_adapter(&source.name, e).to_string();
                let status = FetchStatus::Failed { error, auth };
                self.log_fetch(&source, now, &status, start).await;
                return outcome(status);
            }
        };

        let ctx = SourceContext::for_source(&source, now);
        let found = items.len();
        let (mut inserted, mut duplicates, mut failed) = (0, 0, 0);
        for raw in &items {
            match self.dedup.try_insert(normalize(raw, &ctx)).await {
                Ok(DedupOutcome::Inserted(_)) => inserted += 1,
                Ok(DedupOutcome::Skipped) => duplicates += 1,
                Err(e) => {
                    warn!("Could not store item '{}' from '{}': {}", raw.title, source.name, e);
                    failed += 1;
                }
            }
        }

        let emails = if source.kind() == SourceKind::Mailbox { inserted as u64 } else { 0 };
        if let Err(e) = self.store.record_fetch(source.id, now, emails).await {
            error!("Could not record fetch of '{}': {}", source.name, e);
        }

        info!(
            "Source '{}': {} found, {} new, {} duplicates, {} failed",
            source.name, found, inserted, duplicates, failed
        );
        let status = FetchStatus::Fetched {
            found,
            inserted,
            duplicates,
            failed,
        };
        self.log_fetch(&source, now, &status, start).await;
        outcome(status)
    }

    async fn log_fetch(&self, source: &SourceConfig, now: DateTime<Utc>, status: &FetchStatus, start: Instant) {
        let count = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        let (log_status, found, saved, duplicates, error_message) = match status {
            FetchStatus::Fetched {
                found,
                inserted,
                duplicates,
                failed,
            } => {
                let log_status = if *failed == 0 { FetchLogStatus::Success } else { FetchLogStatus::Partial };
                (log_status, count(*found), count(*inserted), count(*duplicates), None)
            }
            FetchStatus::Failed { error, .. } => (FetchLogStatus::Failed, 0, 0, 0, Some(error.clone())),
            _ => return,
        };
        let log = FetchLog {
            id: Uuid::new_v4(),
            source_id: source.id,
            fetched_at: now,
            status: log_status,
            items_found: found,
            articles_saved: saved,
            duplicates,
            error_message,
            processing_ms: start.elapsed().as_millis() as u64,
        };
        if let Err(e) = self.store.append_fetch_log(log).await {
            error!("Could not log fetch of '{}': {}", source.name, e);
        }
    }
}
