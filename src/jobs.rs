#![forbid(unsafe_code)]

//! Lifecycle of in-flight downloads.
//!
//! A job is `Pending` from registration until its transfer slot opens, then
//! `Running` while a ticker publishes progress from a [`ProgressSource`], and
//! finally `Completed` or `Failed`. Concluded jobs leave the tracker; only the
//! metadata of successful ones is persisted elsewhere.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{JobError, JobResult},
    hub::NotificationHub,
    progress::{ProgressSource, SyntheticProgress},
};

/// Client-supplied, time-based identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Millisecond wall-clock id for callers that did not supply one. Ids
    /// issued within the same millisecond are bumped so none repeats.
    pub fn from_clock() -> Self {
        static LAST_ISSUED: AtomicU64 = AtomicU64::new(0);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        let next = |last: u64| now.max(last.saturating_add(1));
        let previous = LAST_ISSUED
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| Some(next(last)))
            .unwrap_or_else(|last| last);
        Self(next(previous))
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "sourceURL")]
    pub source_url: String,
    pub status: JobStatus,
    pub progress_percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Job {
    fn pending(id: JobId, source_url: String) -> Self {
        Self {
            id,
            source_url,
            status: JobStatus::Pending,
            progress_percent: 0,
            result_filename: None,
            error_message: None,
        }
    }
}

pub type ProgressFactory = Arc<dyn Fn() -> Box<dyn ProgressSource> + Send + Sync>;

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct TrackedJob {
    job: Job,
    ticker: Option<Ticker>,
}

type JobTable = Arc<Mutex<HashMap<JobId, TrackedJob>>>;

enum Outcome {
    Success(String),
    Failure(String),
}

pub struct JobTracker {
    jobs: JobTable,
    hub: Arc<NotificationHub>,
    interval: Duration,
    progress: ProgressFactory,
}

impl JobTracker {
    /// Tracker driving the fixed-step synthetic progress signal.
    pub fn new(hub: Arc<NotificationHub>, interval: Duration, step: u8) -> Self {
        Self::with_progress(
            hub,
            interval,
            Arc::new(move || Box::new(SyntheticProgress::new(step)) as Box<dyn ProgressSource>),
        )
    }

    pub fn with_progress(
        hub: Arc<NotificationHub>,
        interval: Duration,
        progress: ProgressFactory,
    ) -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            hub,
            interval,
            progress,
        }
    }

    /// Tracks a new job in `Pending`. An id that is still in flight is refused.
    pub fn register(&self, id: JobId, source_url: impl Into<String>) -> JobResult<()> {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&id) {
            return Err(JobError::invalid(format!("job {id} is already in progress")));
        }
        jobs.insert(
            id,
            TrackedJob {
                job: Job::pending(id, source_url.into()),
                ticker: None,
            },
        );
        Ok(())
    }

    /// Moves a pending job to `Running` and starts its progress ticker.
    /// Returns `false` when the job is unknown or not pending.
    pub fn start(&self, id: JobId) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(entry) = jobs.get_mut(&id) else {
            return false;
        };
        if entry.job.status != JobStatus::Pending {
            return false;
        }
        entry.job.status = JobStatus::Running;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_ticker(
            id,
            self.jobs.clone(),
            self.hub.clone(),
            (self.progress)(),
            self.interval,
            cancel.clone(),
        ));
        entry.ticker = Some(Ticker { cancel, handle });
        tracing::info!(job = %id, "download running");
        true
    }

    /// Publishes 100 followed by a successful completion, then forgets the job.
    pub async fn complete(&self, id: JobId, filename: impl Into<String>) -> Option<Job> {
        self.conclude(id, Outcome::Success(filename.into())).await
    }

    /// Publishes a failed completion without touching progress, then forgets
    /// the job.
    pub async fn fail(&self, id: JobId, message: impl Into<String>) -> Option<Job> {
        self.conclude(id, Outcome::Failure(message.into())).await
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().get(&id).map(|entry| entry.job.clone())
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Stops every ticker. Jobs stay tracked; no terminal events are sent.
    pub async fn shutdown(&self) {
        let tickers: Vec<Ticker> = {
            let mut jobs = self.jobs.lock();
            jobs.values_mut()
                .filter_map(|entry| entry.ticker.take())
                .inspect(|ticker| ticker.cancel.cancel())
                .collect()
        };
        for ticker in tickers {
            let _ = ticker.handle.await;
        }
    }

    async fn conclude(&self, id: JobId, outcome: Outcome) -> Option<Job> {
        // Ticks publish under the table lock, so after cancel + join no tick
        // can follow the terminal events.
        let ticker = {
            let mut jobs = self.jobs.lock();
            let ticker = jobs.get_mut(&id).and_then(|entry| entry.ticker.take());
            if let Some(ticker) = &ticker {
                ticker.cancel.cancel();
            }
            ticker
        };
        if let Some(ticker) = ticker {
            let _ = ticker.handle.await;
        }

        let Some(TrackedJob { mut job, .. }) = self.jobs.lock().remove(&id) else {
            tracing::warn!(job = %id, "conclusion for unknown job ignored");
            return None;
        };

        match outcome {
            Outcome::Success(filename) => {
                job.status = JobStatus::Completed;
                job.progress_percent = 100;
                job.result_filename = Some(filename);
                self.hub.broadcast_progress(id, 100);
                self.hub.broadcast_completion(id, true, None);
                tracing::info!(job = %id, "download completed");
            }
            Outcome::Failure(message) => {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.clone());
                self.hub.broadcast_completion(id, false, Some(message));
                tracing::warn!(job = %id, "download failed");
            }
        }
        Some(job)
    }
}

async fn run_ticker(
    id: JobId,
    jobs: JobTable,
    hub: Arc<NotificationHub>,
    mut source: Box<dyn ProgressSource>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {}
        }
        if !apply_tick(id, &jobs, &hub, source.as_mut(), &cancel) {
            break;
        }
    }
}

/// Publishes one tick. Returns `false` once the ticker should stop.
fn apply_tick(
    id: JobId,
    jobs: &JobTable,
    hub: &NotificationHub,
    source: &mut dyn ProgressSource,
    cancel: &CancellationToken,
) -> bool {
    let mut jobs = jobs.lock();
    if cancel.is_cancelled() {
        return false;
    }
    let Some(entry) = jobs.get_mut(&id) else {
        return false;
    };
    let Some(percent) = source.tick() else {
        return true;
    };
    let percent = percent.min(crate::progress::PROGRESS_CEILING);
    if percent <= entry.job.progress_percent {
        return true;
    }
    entry.job.progress_percent = percent;
    tracing::debug!(job = %id, percent, "progress");
    hub.broadcast_progress(id, percent);
    true
}
