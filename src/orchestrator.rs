//! Run driver: work source to bounded-concurrency extraction to result sink.
//!
//! All shared run state (session rotation, pacing, the per-run URL cache)
//! is owned here and only touched between task completions. Extraction
//! tasks get a session lease and an item, nothing else.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::block::BlockDetector;
use crate::config::HarvestConfig;
use crate::dedup::normalize_key;
use crate::extract::{Extractor, FieldExtractor};
use crate::model::{ExtractionResult, Field, Outcome, RowKey, WorkItem};
use crate::pacing::{Pacing, PacingConfig};
use crate::retry::{Progress, Resolution, RetryController, Termination};
use crate::session::{
    BrowserLauncher, RotationReason, SessionError, SessionLease, SessionManager, SessionSignal,
};
use crate::sink::{with_backoff, BatchWriteRequest, ResultSink, SinkConfig, WriteReport};
use crate::source::{Cursor, WorkSource};
use crate::store::{StoreError, TabularStore};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to load work source: {0}")]
    Source(#[from] StoreError),
    #[error("failed to start browser session: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Concurrent extraction tasks sharing the live session.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub pacing: PacingConfig,
    /// Wall-clock budget for the run, checked between batches.
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
    /// Reprocess rows that already carry values.
    #[serde(default)]
    pub force: bool,
    /// Write `BLOCKED` into cells of items that stayed blocked.
    #[serde(default)]
    pub write_blocked_sentinel: bool,
    /// Stop after this many items.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Fresh-session retries for an item whose session died under it.
    #[serde(default = "default_crash_requeues")]
    pub crash_requeues: u32,
}

fn default_concurrency() -> usize {
    3
}

fn default_crash_requeues() -> u32 {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            pacing: PacingConfig::default(),
            time_budget_secs: None,
            force: false,
            write_blocked_sentinel: false,
            limit: None,
            crash_requeues: default_crash_requeues(),
        }
    }
}

/// Progress events emitted during a run.
#[derive(Debug, Clone)]
pub enum RunEvent {
    BatchStarted {
        batch: usize,
        items: usize,
    },
    ItemResolved {
        key: RowKey,
        outcome: Outcome,
        attempts: u32,
    },
    /// An item was answered from an earlier visit of the same page.
    ItemReused {
        key: RowKey,
        outcome: Outcome,
    },
    SessionRotated {
        reason: RotationReason,
    },
    Cooldown {
        duration: Duration,
    },
    BatchCompleted {
        batch: usize,
        written: usize,
        failed: usize,
    },
    BudgetExhausted,
}

/// Run-end report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub outcomes: BTreeMap<Outcome, usize>,
    pub write_failed: usize,
    pub rotations: BTreeMap<RotationReason, u32>,
    pub elapsed_secs: f64,
    pub batches: usize,
    /// Items answered from an earlier visit of the same page.
    pub reused: usize,
    pub stopped_by_budget: bool,
    /// Rows whose write failed after retries.
    pub failed_keys: Vec<RowKey>,
    /// Rows whose page could not be loaded on any attempt.
    pub errored_keys: Vec<RowKey>,
}

impl RunSummary {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    pub fn items(&self) -> usize {
        self.outcomes.values().sum()
    }

    fn record(&mut self, key: &RowKey, outcome: Outcome) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
        if outcome == Outcome::Error {
            self.errored_keys.push(key.clone());
        }
    }
}

/// An item waiting for (another) turn on a session.
#[derive(Clone)]
struct Pending {
    item: WorkItem,
    /// Fields extracted from the page: the leader's plus every follower's.
    fields: BTreeSet<Field>,
    progress: Progress,
    crashes: u32,
    /// Rows in the same batch pointing at the same page.
    followers: Vec<WorkItem>,
}

impl Pending {
    fn new(item: WorkItem) -> Self {
        Self {
            fields: item.fields_needed.clone(),
            item,
            progress: Progress::default(),
            crashes: 0,
            followers: Vec::new(),
        }
    }

    fn follow(&mut self, item: WorkItem) {
        self.fields.extend(item.fields_needed.iter().copied());
        self.followers.push(item);
    }

    /// The leader's item, asking for every field the group needs.
    fn extraction_item(&self) -> WorkItem {
        let mut item = self.item.clone();
        item.fields_needed = self.fields.clone();
        item
    }
}

/// A page visited earlier in the run and the fields looked for on it.
struct Visit {
    fields: BTreeSet<Field>,
    result: ExtractionResult,
}

impl Visit {
    fn covers(&self, item: &WorkItem) -> bool {
        item.fields_needed.is_subset(&self.fields)
    }
}

pub struct Orchestrator {
    source: WorkSource,
    sessions: SessionManager,
    retry: Arc<RetryController>,
    sink: ResultSink,
    pacing: Pacing,
    config: RunConfig,
    store_retry: SinkConfig,
    /// Results of pages visited this run, by normalized URL.
    visited: HashMap<String, Visit>,
    events: Option<mpsc::Sender<RunEvent>>,
}

impl Orchestrator {
    pub fn new(
        source: WorkSource,
        sessions: SessionManager,
        retry: RetryController,
        sink: ResultSink,
        config: RunConfig,
    ) -> Self {
        let pacing = Pacing::new(config.pacing.clone());
        Self {
            source,
            sessions,
            retry: Arc::new(retry),
            sink,
            pacing,
            config,
            store_retry: SinkConfig::default(),
            visited: HashMap::new(),
            events: None,
        }
    }

    /// Wire every component from one configuration.
    pub fn from_config(
        config: &HarvestConfig,
        store: Arc<dyn TabularStore>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Self {
        let required = config.extract.required_set();
        let detector = Arc::new(BlockDetector::new(&config.block));
        let extractor: Arc<dyn Extractor> = Arc::new(FieldExtractor::new(config.extract.clone()));
        let source = WorkSource::new(
            store.clone(),
            config.source.clone(),
            required.clone(),
            config.run.force,
        );
        let retry = RetryController::new(
            config.retry.clone(),
            detector,
            extractor,
            required,
            config.session.page_timeout(),
        );
        let sink = ResultSink::new(
            store,
            config.source.layout.clone(),
            config.sink.clone(),
            config.run.force,
            config.run.write_blocked_sentinel,
        );
        let sessions = SessionManager::new(launcher, config.session.clone());
        Self::new(source, sessions, retry, sink, config.run.clone())
            .with_store_retry(config.sink.clone())
    }

    pub fn with_events(mut self, events: mpsc::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Backoff used for work-source reads.
    pub fn with_store_retry(mut self, config: SinkConfig) -> Self {
        self.store_retry = config;
        self
    }

    async fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn next_batch(&self, cursor: Cursor) -> Result<crate::source::Batch, StoreError> {
        with_backoff(&self.store_retry, "work source read", || {
            self.source.next_batch(cursor)
        })
        .await
    }

    /// Drive the whole run. Per-item failures never abort it; only an
    /// unreachable store or a session that cannot be launched do.
    pub async fn run(&mut self) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        let deadline = self
            .config
            .time_budget_secs
            .map(|secs| started + Duration::from_secs(secs));
        let mut summary = RunSummary::default();

        let result = self.run_batches(deadline, &mut summary).await;
        self.sessions.shutdown().await;

        summary.rotations = self.sessions.rotations().clone();
        summary.elapsed_secs = started.elapsed().as_secs_f64();
        result?;

        info!(
            "Run finished: {} items in {} batches ({:.1}s)",
            summary.items(),
            summary.batches,
            summary.elapsed_secs
        );
        Ok(summary)
    }

    async fn run_batches(
        &mut self,
        deadline: Option<Instant>,
        summary: &mut RunSummary,
    ) -> Result<(), OrchestratorError> {
        let mut cursor = with_backoff(&self.store_retry, "work source start", || {
            self.source.start()
        })
        .await?;
        let mut taken = 0usize;

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.stop_for_budget(summary).await;
                break;
            }
            let remaining = match self.config.limit {
                Some(limit) if taken >= limit => {
                    info!("Item limit {} reached", limit);
                    break;
                }
                Some(limit) => limit - taken,
                None => usize::MAX,
            };

            let batch = self.next_batch(cursor).await?;
            cursor = batch.next;
            let mut items = batch.items;
            items.truncate(remaining);
            taken += items.len();

            if !items.is_empty() {
                summary.batches += 1;
                let number = summary.batches;
                self.emit(RunEvent::BatchStarted {
                    batch: number,
                    items: items.len(),
                })
                .await;
                info!("Batch {}: {} items", number, items.len());

                let blocked = self.run_batch(number, items, deadline, summary).await?;
                if !blocked {
                    self.pacing.on_clean_batch();
                }
            }

            if batch.exhausted {
                debug!("Work source exhausted");
                break;
            }
            let delay = self.pacing.inter_batch_delay();
            if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                self.stop_for_budget(summary).await;
                break;
            }
            self.pacing.wait_between_batches().await;
        }
        Ok(())
    }

    async fn stop_for_budget(&self, summary: &mut RunSummary) {
        info!("Time budget exhausted; leaving remaining rows for the next run");
        summary.stopped_by_budget = true;
        self.emit(RunEvent::BudgetExhausted).await;
    }

    /// Group rows pointing at the same page and answer rows whose page was
    /// already searched this run for every field they need.
    fn plan(&self, items: Vec<WorkItem>) -> (VecDeque<Pending>, Vec<(WorkItem, ExtractionResult)>) {
        let mut queue: VecDeque<Pending> = VecDeque::new();
        let mut leaders: HashMap<String, usize> = HashMap::new();
        let mut reused = Vec::new();

        for item in items {
            let Some(key) = normalize_key(&item.source_url) else {
                queue.push_back(Pending::new(item));
                continue;
            };
            if let Some(visit) = self.visited.get(&key).filter(|v| v.covers(&item)) {
                reused.push((item, visit.result.clone()));
            } else if let Some(&idx) = leaders.get(&key) {
                queue[idx].follow(item);
            } else {
                leaders.insert(key, queue.len());
                queue.push_back(Pending::new(item));
            }
        }
        (queue, reused)
    }

    async fn run_batch(
        &mut self,
        number: usize,
        items: Vec<WorkItem>,
        deadline: Option<Instant>,
        summary: &mut RunSummary,
    ) -> Result<bool, OrchestratorError> {
        let (mut queue, reused) = self.plan(items);
        let mut blocked_any = false;
        let mut report = WriteReport::default();

        let mut requests = Vec::new();
        for (item, mut result) in reused {
            result.fill_missing(&item.fields_needed);
            let outcome = Outcome::classify(&result, &self.retry.required_for(&item));
            debug!("{}: reusing result for {}", item.key, item.source_url);
            summary.reused += 1;
            summary.record(&item.key, outcome);
            self.emit(RunEvent::ItemReused {
                key: item.key.clone(),
                outcome,
            })
            .await;
            requests.extend(self.sink.request_for(&item, &result));
        }

        while !queue.is_empty() {
            let lease = self.sessions.acquire().await?;
            let width = self
                .config
                .concurrency
                .max(1)
                .min(self.sessions.remaining_capacity() as usize)
                .min(queue.len())
                .max(1);
            let wave: Vec<Pending> = queue.drain(..width).collect();
            let finished = self.run_wave(&lease, wave).await;

            let mut wave_blocked = false;
            for (pending, resolution) in finished {
                let signal = match resolution.termination {
                    Termination::Blocked => SessionSignal::Blocked,
                    Termination::SessionCrash => SessionSignal::Crashed,
                    _ => SessionSignal::Completed,
                };
                self.sessions.release(&lease, signal);
                wave_blocked |= signal == SessionSignal::Blocked;

                if let Some(pending) = self.requeue(pending.clone(), &resolution) {
                    queue.push_back(pending);
                    continue;
                }
                requests.extend(self.finish(pending, resolution, summary).await);
            }

            if let Some(reason) = self.sessions.pending_rotation() {
                self.sessions.rotate(reason).await;
                self.emit(RunEvent::SessionRotated { reason }).await;
            }
            if wave_blocked {
                blocked_any = true;
                self.pacing.on_block();
                self.cool_down(deadline).await;
            }

            // Flushed per wave, not per batch.
            report.absorb(self.flush(&mut requests, summary).await);
        }
        report.absorb(self.flush(&mut requests, summary).await);

        self.emit(RunEvent::BatchCompleted {
            batch: number,
            written: report.written.len(),
            failed: report.failed.len(),
        })
        .await;
        Ok(blocked_any)
    }

    async fn flush(
        &self,
        requests: &mut Vec<BatchWriteRequest>,
        summary: &mut RunSummary,
    ) -> WriteReport {
        if requests.is_empty() {
            return WriteReport::default();
        }
        let report = self.sink.write(requests).await;
        requests.clear();
        summary.write_failed += report.failed.len();
        summary.failed_keys.extend(report.failed.iter().cloned());
        report
    }

    /// Run one wave of items concurrently on the leased session.
    async fn run_wave(&self, lease: &SessionLease, wave: Vec<Pending>) -> Vec<(Pending, Resolution)> {
        let mut handles = Vec::with_capacity(wave.len());
        for (index, pending) in wave.into_iter().enumerate() {
            let retry = self.retry.clone();
            let lease = lease.clone();
            let stagger = self.pacing.stagger(index);
            let item = pending.extraction_item();
            let progress = pending.progress.clone();

            let handle = tokio::spawn(async move {
                if !stagger.is_zero() {
                    tokio::time::sleep(stagger).await;
                }
                retry.resume(&item, lease.browser(), progress).await
            });
            handles.push((pending, handle));
        }

        let mut finished = Vec::with_capacity(handles.len());
        for (pending, handle) in handles {
            let resolution = match handle.await {
                Ok(resolution) => resolution,
                Err(e) => {
                    error!("{}: extraction task failed: {}", pending.item.key, e);
                    let mut result = pending.progress.best.clone();
                    result.merge(ExtractionResult::error(&pending.fields));
                    Resolution {
                        result,
                        attempts: pending.progress.attempts + 1,
                        termination: Termination::Exhausted,
                    }
                }
            };
            finished.push((pending, resolution));
        }
        finished
    }

    /// Put an item back on the queue for a fresh session, if it has turns left.
    fn requeue(&self, mut pending: Pending, resolution: &Resolution) -> Option<Pending> {
        let max_attempts = self.retry.config().max_attempts.max(1);
        if resolution.attempts >= max_attempts {
            return None;
        }
        match resolution.termination {
            Termination::Blocked => {}
            Termination::SessionCrash if pending.crashes < self.config.crash_requeues => {
                pending.crashes += 1;
            }
            _ => return None,
        }
        debug!(
            "{}: re-queued after {} attempts ({:?})",
            pending.item.key, resolution.attempts, resolution.termination
        );
        pending.progress = Progress {
            attempts: resolution.attempts,
            best: resolution.result.clone(),
        };
        Some(pending)
    }

    /// Record a finished item (and its followers) and build their writes.
    async fn finish(
        &mut self,
        pending: Pending,
        resolution: Resolution,
        summary: &mut RunSummary,
    ) -> Vec<BatchWriteRequest> {
        let Pending {
            item,
            fields,
            followers,
            ..
        } = pending;
        let outcome = Outcome::classify(&resolution.result, &self.retry.required_for(&item));
        debug!(
            "{}: {} after {} attempts",
            item.key, outcome, resolution.attempts
        );
        summary.record(&item.key, outcome);
        self.emit(RunEvent::ItemResolved {
            key: item.key.clone(),
            outcome,
            attempts: resolution.attempts,
        })
        .await;

        if !resolution.result.is_blocked() {
            if let Some(key) = normalize_key(&item.source_url) {
                let visit = self.visited.entry(key).or_insert_with(|| Visit {
                    fields: BTreeSet::new(),
                    result: ExtractionResult::new(),
                });
                visit.fields.extend(fields);
                visit.result.merge(resolution.result.clone());
            }
        }

        let mut requests: Vec<BatchWriteRequest> =
            self.sink.request_for(&item, &resolution.result).into_iter().collect();
        for follower in followers {
            let mut result = resolution.result.clone();
            result.fill_missing(&follower.fields_needed);
            let outcome = Outcome::classify(&result, &self.retry.required_for(&follower));
            summary.reused += 1;
            summary.record(&follower.key, outcome);
            self.emit(RunEvent::ItemReused {
                key: follower.key.clone(),
                outcome,
            })
            .await;
            requests.extend(self.sink.request_for(&follower, &result));
        }
        requests
    }

    /// Post-block cooldown, cut short by the run deadline.
    async fn cool_down(&self, deadline: Option<Instant>) {
        let mut duration = Pacing::cooldown(self.sessions.config().cooldown_range());
        if let Some(deadline) = deadline {
            duration = duration.min(deadline.saturating_duration_since(Instant::now()));
        }
        if duration.is_zero() {
            return;
        }
        warn!("Cooling down for {:?} after a block", duration);
        self.emit(RunEvent::Cooldown { duration }).await;
        tokio::time::sleep(duration).await;
    }
}
