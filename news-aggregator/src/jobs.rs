use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use interfaces::{Analysis, SourceKind};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{timeout_at, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::analysis::AnalysisOrchestrator;
use crate::scheduler::FetchScheduler;
use crate::types::{AggregatorError, BatchReport, Result, SourceOutcome};

pub type JobId = Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    RunDue { kinds: Vec<SourceKind> },
    FetchAll { kind: SourceKind },
    FetchOne { source_id: Uuid },
    GenerateAnalysis { article_id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output", content = "value", rename_all = "snake_case")]
pub enum JobOutput {
    Batch(BatchReport),
    Source(SourceOutcome),
    Analysis(Analysis),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed(JobOutput),
    Failed(String),
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed(_) | JobStatus::Failed(_))
    }
}

/// How long finished jobs stay queryable.
#[derive(Debug, Clone, Copy)]
pub struct JobRetention {
    pub ttl: Duration,
    /// Upper bound on finished entries; the oldest go first.
    pub max_finished: usize,
}

impl Default for JobRetention {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
            max_finished: 1000,
        }
    }
}

struct JobEntry {
    status: JobStatus,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct JobTable {
    entries: HashMap<JobId, JobEntry>,
}

impl JobTable {
    fn set(&mut self, id: JobId, status: JobStatus) {
        self.entries.insert(id, JobEntry { status, finished_at: None });
    }

    /// Records a terminal status, dropping finished entries that are past
    /// the TTL or over the cap. The entry just finished is always kept.
    fn finish(&mut self, id: JobId, status: JobStatus, retention: &JobRetention) {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.finished_at.is_none_or(|at| now.duration_since(at) < retention.ttl));

        let mut finished: Vec<(Instant, JobId)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| entry.finished_at.map(|at| (at, *id)))
            .collect();
        let keep = retention.max_finished.max(1) - 1;
        if finished.len() > keep {
            finished.sort();
            for (_, stale) in &finished[..finished.len() - keep] {
                self.entries.remove(stale);
            }
        }

        self.entries.insert(
            id,
            JobEntry {
                status,
                finished_at: Some(now),
            },
        );
    }

    fn status(&self, id: JobId) -> Option<JobStatus> {
        self.entries.get(&id).map(|entry| entry.status.clone())
    }
}

type StatusMap = Arc<RwLock<JobTable>>;

#[derive(Clone)]
struct JobRunner {
    scheduler: Arc<FetchScheduler>,
    analysis: Arc<AnalysisOrchestrator>,
}

impl JobRunner {
    async fn run(&self, job: Job) -> Result<JobOutput> {
        match job {
            Job::RunDue { kinds } => self.scheduler.run_due(&kinds, Utc::now()).await.map(JobOutput::Batch),
            Job::FetchAll { kind } => self.scheduler.fetch_all(kind).await.map(JobOutput::Batch),
            Job::FetchOne { source_id } => self.scheduler.fetch_one(source_id).await.map(JobOutput::Source),
            Job::GenerateAnalysis { article_id } => {
                self.analysis.generate_analysis(article_id).await.map(JobOutput::Analysis)
            }
        }
    }
}

/// Fire-and-forget work: `submit` hands the job to a consumer task and
/// returns its id; callers poll `status` or block on `wait`.
pub struct JobQueue {
    sender: mpsc::UnboundedSender<(JobId, Job)>,
    statuses: StatusMap,
    notify: Arc<Notify>,
}

impl JobQueue {
    /// Spawns the consumer; must be called inside a Tokio runtime.
    pub fn start(scheduler: Arc<FetchScheduler>, analysis: Arc<AnalysisOrchestrator>) -> Self {
        Self::start_with_retention(scheduler, analysis, JobRetention::default())
    }

    pub fn start_with_retention(
        scheduler: Arc<FetchScheduler>,
        analysis: Arc<AnalysisOrchestrator>,
        retention: JobRetention,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let statuses: StatusMap = Arc::new(RwLock::new(JobTable::default()));
        let notify = Arc::new(Notify::new());
        let runner = JobRunner { scheduler, analysis };

        let consumer_statuses = statuses.clone();
        let consumer_notify = notify.clone();
        tokio::spawn(async move {
            UnboundedReceiverStream::new(receiver)
                .for_each(|(id, job): (JobId, Job)| {
                    let runner = runner.clone();
                    let statuses = consumer_statuses.clone();
                    let notify = consumer_notify.clone();
                    async move {
                        tokio::spawn(async move {
                            statuses.write().await.set(id, JobStatus::Running);
                            info!("Job {} started: {:?}", id, job);
                            let status = match runner.run(job).await {
                                Ok(output) => {
                                    info!("Job {} completed", id);
                                    JobStatus::Completed(output)
                                }
                                Err(e) => {
                                    error!("Job {} failed: {}", id, e);
                                    JobStatus::Failed(e.to_string())
                                }
                            };
                            statuses.write().await.finish(id, status, &retention);
                            notify.notify_waiters();
                        });
                    }
                })
                .await;
            debug!("Job queue closed");
        });

        Self { sender, statuses, notify }
    }

    pub async fn submit(&self, job: Job) -> Result<JobId> {
        let id = Uuid::new_v4();
        self.statuses.write().await.set(id, JobStatus::Queued);
        if self.sender.send((id, job)).is_err() {
            self.statuses.write().await.entries.remove(&id);
            return Err(AggregatorError::General("job queue is not running".to_string()));
        }
        debug!("Job {} queued", id);
        Ok(id)
    }

    /// `None` for unknown ids and for finished jobs past retention.
    pub async fn status(&self, id: JobId) -> Option<JobStatus> {
        self.statuses.read().await.status(id)
    }

    /// Waits for `id` to reach `Completed` or `Failed`.
    pub async fn wait(&self, id: JobId, limit: Duration) -> Result<JobStatus> {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.notify.notified();
            match self.status(id).await {
                None => return Err(AggregatorError::General(format!("unknown job {id}"))),
                Some(status) if status.is_terminal() => return Ok(status),
                Some(_) => {}
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(AggregatorError::General(format!(
                    "job {id} still running after {}s",
                    limit.as_secs()
                )));
            }
        }
    }
}
