// Copyright 2024 dprewarm developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Single-flight periodic driver of pre-warm runs.
//!
//! The scheduler owns the run lifecycle: a timer loop that re-reads the
//! configured interval on every iteration, on-demand triggers, run
//! cancellation, and exactly one persisted record per run. At most one run
//! is active per scheduler instance; invalid transitions return typed
//! errors.

use crate::{
    cache::CacheSink,
    ifaces::{InterfaceList, InterfaceProbe, SysfsList, SysfsProbe},
    ipset::IpsetOps,
    plan::DomainGroup,
    resolver::Resolve,
    settings::{RawSettings, SettingsError, DEFAULT_INTERVAL_SECS},
    store::{NewRun, RunRecord, RunStore},
    wildcard::WildcardExpand,
    worker::{
        ErrorCallback, PrewarmWorker, Progress, ProgressCallback, RunError, WorkerConfig,
    },
};
use std::{
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Invalid lifecycle transitions and rejected triggers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// A trigger arrived while a run was active.
    #[error("run already in progress")]
    RunInProgress,

    /// A cancellation arrived while idle.
    #[error("run is not active")]
    RunNotActive,

    /// The current settings are malformed; no run was started and no
    /// record persisted.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Point-in-time scheduler state for the status surface.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    /// Whether a run is active.
    pub running: bool,
    /// Most recent run record, if any run ever completed.
    pub last_run: Option<RunRecord>,
    /// Most recent progress snapshot.
    pub progress: Option<Progress>,
}

/// Narrow view of the configuration store the scheduler reads on every
/// tick and trigger, so config changes take effect at the next run.
pub trait ConfigSource: Send + Sync {
    /// Current routing groups.
    fn domain_groups(&self) -> Vec<DomainGroup>;

    /// Interface names of the configured VPN profiles.
    fn profile_interfaces(&self) -> Vec<String>;

    /// Current raw pre-warm settings.
    fn settings(&self) -> RawSettings;
}

struct State {
    running: bool,
    progress: Option<Progress>,
    last_run: Option<RunRecord>,
    run_cancel: Option<CancellationToken>,
    run_join: Option<JoinHandle<()>>,
    loop_cancel: Option<CancellationToken>,
    loop_join: Option<JoinHandle<()>>,
}

struct Inner {
    config: Arc<dyn ConfigSource>,
    store: Arc<RunStore>,
    cache: Arc<dyn CacheSink>,
    ipset: Arc<dyn IpsetOps>,
    probe: Arc<dyn InterfaceProbe>,
    lister: Arc<dyn InterfaceList>,
    wildcard: Option<Arc<dyn WildcardExpand>>,
    resolvers: Option<Vec<Arc<dyn Resolve>>>,
    on_error: ErrorCallback,
    handler: Mutex<Option<ProgressCallback>>,
    // All running runs derive their token from this one, so shutdown
    // reaches them in one cancel.
    shutdown: CancellationToken,
    state: RwLock<State>,
}

/// Builds a [`Scheduler`] from its collaborators.
pub struct SchedulerBuilder {
    config: Arc<dyn ConfigSource>,
    store: Arc<RunStore>,
    cache: Arc<dyn CacheSink>,
    ipset: Arc<dyn IpsetOps>,
    probe: Arc<dyn InterfaceProbe>,
    lister: Arc<dyn InterfaceList>,
    wildcard: Option<Arc<dyn WildcardExpand>>,
    resolvers: Option<Vec<Arc<dyn Resolve>>>,
    on_error: ErrorCallback,
}

impl SchedulerBuilder {
    /// Substitute the interface probe (default: sysfs).
    pub fn probe(mut self, probe: Arc<dyn InterfaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Substitute the interface lister (default: sysfs).
    pub fn lister(mut self, lister: Arc<dyn InterfaceList>) -> Self {
        self.lister = lister;
        self
    }

    /// Substitute the wildcard discovery source (default: crt.sh).
    pub fn wildcard(mut self, wildcard: Arc<dyn WildcardExpand>) -> Self {
        self.wildcard = Some(wildcard);
        self
    }

    /// Replace constructed resolvers for every run. Test seam.
    pub fn resolvers(mut self, resolvers: Vec<Arc<dyn Resolve>>) -> Self {
        self.resolvers = Some(resolvers);
        self
    }

    /// Install the per-query error callback handed to workers.
    pub fn on_error(mut self, on_error: ErrorCallback) -> Self {
        self.on_error = on_error;
        self
    }

    /// Finish the build.
    pub fn build(self) -> Scheduler {
        Scheduler {
            inner: Arc::new(Inner {
                config: self.config,
                store: self.store,
                cache: self.cache,
                ipset: self.ipset,
                probe: self.probe,
                lister: self.lister,
                wildcard: self.wildcard,
                resolvers: self.resolvers,
                on_error: self.on_error,
                handler: Mutex::new(None),
                shutdown: CancellationToken::new(),
                state: RwLock::new(State {
                    running: false,
                    progress: None,
                    last_run: None,
                    run_cancel: None,
                    run_join: None,
                    loop_cancel: None,
                    loop_join: None,
                }),
            }),
        }
    }
}

/// The single-flight periodic driver. Created once at process start,
/// stopped once at shutdown; outlives all runs.
pub struct Scheduler {
    inner: Arc<Inner>,
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl Scheduler {
    /// Start a builder over the mandatory collaborators.
    pub fn builder(
        config: Arc<dyn ConfigSource>,
        store: Arc<RunStore>,
        cache: Arc<dyn CacheSink>,
        ipset: Arc<dyn IpsetOps>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            store,
            cache,
            ipset,
            probe: Arc::new(SysfsProbe),
            lister: Arc::new(SysfsList),
            wildcard: None,
            resolvers: None,
            on_error: Arc::new(|_| {}),
        }
    }

    /// Enter the timer loop. Idempotent.
    pub fn start(&self) {
        let mut state = self.inner.state.write().unwrap();
        if state.loop_join.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        state.loop_cancel = Some(cancel.clone());
        let inner = self.inner.clone();
        state.loop_join = Some(tokio::spawn(async move {
            timer_loop(inner, cancel).await;
        }));
        log::info!("pre-warm scheduler started");
    }

    /// Exit the loop, cancel any active run, and wait for both to finish.
    pub async fn stop(&self) {
        let (loop_join, run_join) = {
            let mut state = self.inner.state.write().unwrap();
            if let Some(cancel) = state.loop_cancel.take() {
                cancel.cancel();
            }
            self.inner.shutdown.cancel();
            (state.loop_join.take(), state.run_join.take())
        };
        if let Some(join) = loop_join {
            let _ = join.await;
        }
        if let Some(join) = run_join {
            let _ = join.await;
        }
        log::info!("pre-warm scheduler stopped");
    }

    /// Start a run now. Fails when a run is already active.
    pub fn trigger_now(&self) -> Result<(), ScheduleError> {
        trigger(&self.inner)
    }

    /// Clear the cache sink, then start a run. Fails when a run is
    /// already active.
    pub fn clear_cache_and_run(&self) -> Result<(), ScheduleError> {
        if self.inner.state.read().unwrap().running {
            return Err(ScheduleError::RunInProgress);
        }
        if let Err(e) = self.inner.cache.clear() {
            log::warn!("clearing cache failed: {}", e);
        }
        trigger(&self.inner)
    }

    /// Cancel the active run. Fails when idle.
    pub fn cancel_run(&self) -> Result<(), ScheduleError> {
        let state = self.inner.state.read().unwrap();
        if !state.running {
            return Err(ScheduleError::RunNotActive);
        }
        if let Some(cancel) = &state.run_cancel {
            cancel.cancel();
        }
        Ok(())
    }

    /// Current state, last run, and latest progress snapshot.
    pub fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.read().unwrap();
        let last_run = match &state.last_run {
            Some(record) => Some(record.clone()),
            // Nothing ran in this process yet; fall back to history.
            None => self.inner.store.last_run().ok().flatten(),
        };
        SchedulerStatus {
            running: state.running,
            last_run,
            progress: state.progress.clone(),
        }
    }

    /// Install the snapshot handler invoked on every progress emission.
    pub fn set_progress_handler(&self, handler: ProgressCallback) {
        *self.inner.handler.lock().unwrap() = Some(handler);
    }
}

async fn timer_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        // Recomputed every iteration so config edits apply at the next
        // tick, not mid-sleep.
        let interval = inner
            .config
            .settings()
            .validate()
            .map(|s| s.interval)
            .unwrap_or(Duration::from_secs(DEFAULT_INTERVAL_SECS as u64));
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => match trigger(&inner) {
                Ok(()) => {}
                Err(ScheduleError::RunInProgress) => {
                    log::debug!("skipping scheduled run: previous run still active");
                }
                Err(e) => log::warn!("scheduled trigger failed: {}", e),
            },
        }
    }
}

fn trigger(inner: &Arc<Inner>) -> Result<(), ScheduleError> {
    let mut state = inner.state.write().unwrap();
    if state.running {
        return Err(ScheduleError::RunInProgress);
    }
    // Malformed settings reject the trigger outright. The run re-reads
    // and re-validates, so a config edit racing the spawn still ends up
    // as a persisted failed record instead of a half-configured run.
    inner.config.settings().validate()?;
    state.running = true;
    let cancel = inner.shutdown.child_token();
    state.run_cancel = Some(cancel.clone());
    let task_inner = inner.clone();
    state.run_join = Some(tokio::spawn(async move {
        run_once(task_inner, cancel).await;
    }));
    Ok(())
}

// One complete run: validate, build, execute, publish, persist exactly
// one record, emit one final snapshot.
async fn run_once(inner: Arc<Inner>, cancel: CancellationToken) {
    let started_at = epoch_secs();
    let clock = Instant::now();
    log::info!("pre-warm run started");

    let settings = match inner.config.settings().validate() {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("pre-warm settings rejected: {}", e);
            finish_failed(&inner, started_at, &clock, e.to_string());
            return;
        }
    };

    let mut builder = PrewarmWorker::builder(
        WorkerConfig::from(&settings),
        inner.ipset.clone(),
        inner.probe.clone(),
        inner.lister.clone(),
    )
    .on_progress(progress_callback(&inner))
    .on_error(inner.on_error.clone());
    if let Some(wildcard) = &inner.wildcard {
        builder = builder.wildcard(wildcard.clone());
    }
    if let Some(resolvers) = &inner.resolvers {
        builder = builder.resolvers(resolvers.clone());
    }
    let worker = match builder.build() {
        Ok(worker) => worker,
        Err(e) => {
            log::warn!("worker construction failed: {}", e);
            finish_failed(&inner, started_at, &clock, e.to_string());
            return;
        }
    };

    let groups = inner.config.domain_groups();
    let profiles = inner.config.profile_interfaces();
    let outcome = worker.run(cancel, &groups, &profiles).await;

    let canceled = matches!(&outcome.error, Some(RunError::Canceled));
    let mut error_text = match &outcome.error {
        Some(error) if !error.is_canceled() => error.to_string(),
        _ => String::new(),
    };

    // The snapshot goes to the sink even on failure so partial progress
    // is visible; sink errors join the run error.
    if let Err(e) = inner.cache.replace(&outcome.stats.sets) {
        error_text = if error_text.is_empty() {
            e.to_string()
        } else {
            format!("{}; {}", error_text, e)
        };
    }

    if canceled {
        log::info!("pre-warm run canceled");
    }

    let progress = outcome.stats.progress;
    let record = persist(
        &inner,
        NewRun {
            started_at,
            finished_at: Some(epoch_secs()),
            duration_ms: Some(clock.elapsed().as_millis() as i64),
            domains_total: progress.total_domains as i64,
            domains_done: progress.processed_domains as i64,
            ips_inserted: progress.total_ips as i64,
            error: if error_text.is_empty() {
                None
            } else {
                Some(error_text)
            },
        },
    );

    log::info!(
        "pre-warm run finished: {}/{} domains, {} addresses{}",
        record.domains_done,
        record.domains_total,
        record.ips_inserted,
        if record.error.is_empty() {
            String::new()
        } else {
            format!(", error: {}", record.error)
        }
    );

    let handler = {
        let mut state = inner.state.write().unwrap();
        state.running = false;
        state.run_cancel = None;
        state.progress = Some(progress.clone());
        state.last_run = Some(record);
        inner.handler.lock().unwrap().clone()
    };
    // One final snapshot, emitted outside the lock.
    if let Some(handler) = handler {
        handler(progress);
    }
}

// Validation and construction failures still persist a record; the run
// itself never starts.
fn finish_failed(inner: &Arc<Inner>, started_at: i64, clock: &Instant, error: String) {
    let record = persist(
        inner,
        NewRun {
            started_at,
            finished_at: Some(epoch_secs()),
            duration_ms: Some(clock.elapsed().as_millis() as i64),
            domains_total: 0,
            domains_done: 0,
            ips_inserted: 0,
            error: Some(error),
        },
    );
    let mut state = inner.state.write().unwrap();
    state.running = false;
    state.run_cancel = None;
    state.last_run = Some(record);
}

// Exactly one record per run. A store failure falls back to the
// in-memory record with the store error appended.
fn persist(inner: &Arc<Inner>, run: NewRun) -> RunRecord {
    match inner.store.save_run(&run) {
        Ok(record) => record,
        Err(e) => {
            log::error!("persisting run record failed: {}", e);
            let mut error = run.error.clone().unwrap_or_default();
            if error.is_empty() {
                error = e.to_string();
            } else {
                error = format!("{}; {}", error, e);
            }
            RunRecord {
                id: 0,
                started_at: run.started_at,
                finished_at: run.finished_at.unwrap_or_default(),
                duration_ms: run.duration_ms.unwrap_or_default(),
                domains_total: run.domains_total,
                domains_done: run.domains_done,
                ips_inserted: run.ips_inserted,
                error,
            }
        }
    }
}

fn progress_callback(inner: &Arc<Inner>) -> ProgressCallback {
    let inner = inner.clone();
    Arc::new(move |progress: Progress| {
        {
            inner.state.write().unwrap().progress = Some(progress.clone());
        }
        let handler = inner.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(progress);
        }
    })
}
