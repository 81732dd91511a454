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

//! The pre-warm worker: a bounded-parallel executor that fans each task
//! out per interface and per resolver, aggregates the unique addresses,
//! applies them to the destination IP-sets, and reports incremental
//! progress.
//!
//! Resolver failures are local: they bump per-interface error counters
//! and never abort a task. An IP-set insertion failure is fatal: it is
//! latched once, cancels the shared run token, and siblings drain out.

mod progress;

pub use progress::{InterfaceProgress, Progress};

use crate::{
    cache::{CacheSnapshot, SetAddrs},
    ifaces::{active_interfaces, IfaceError, InterfaceList, InterfaceProbe},
    ipset::{IpsetError, IpsetOps},
    plan::{plan_tasks, DomainGroup, PrewarmTask},
    resolver::{
        normalize_domain, DohClient, NsClient, QueryStage, Resolve, ResolveError,
    },
    settings::{
        EcsProfile, QuerySettings, DEFAULT_PARALLELISM, DEFAULT_TIMEOUT_SECS, MAX_PARALLELISM,
        MAX_TIMEOUT_SECS,
    },
    wildcard::{CrtShClient, WildcardExpand},
};
use futures::future::join_all;
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Entry expiry used for every IP-set insertion, seconds (12 hours).
pub const IPSET_ENTRY_EXPIRY: u32 = 43_200;

/// Invoked with a deep-copied snapshot after the initial seed and after
/// every completed task.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Invoked for every non-fatal resolver failure. Cancellations are never
/// reported here.
pub type ErrorCallback = Arc<dyn Fn(&QueryFailure) + Send + Sync>;

/// A non-fatal query failure, labeled for operators.
#[derive(Debug, Clone)]
pub struct QueryFailure {
    /// Pipeline stage the failure was observed in.
    pub stage: QueryStage,
    /// Domain being resolved.
    pub domain: String,
    /// Egress interface, empty for interface-independent stages.
    pub interface: String,
    /// Resolver label, `discovery` for the wildcard stage.
    pub resolver: String,
    /// Failure text.
    pub error: String,
}

/// Fatal run outcomes.
#[derive(Debug, Error)]
pub enum RunError {
    /// The run was canceled before completing.
    #[error("run canceled")]
    Canceled,

    /// No active egress interface was available.
    #[error(transparent)]
    Iface(#[from] IfaceError),

    /// A destination-set mutation failed.
    #[error(transparent)]
    Ipset(#[from] IpsetError),

    /// The latched fatal error plus any errors joined onto it.
    #[error("{0}")]
    Joined(String),
}

impl RunError {
    /// Whether the run ended by cancellation rather than failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    fn join(self, other: RunError) -> RunError {
        RunError::Joined(format!("{}; {}", self, other))
    }
}

/// Final state of a run: last progress snapshot plus the per-set address
/// unions collected along the way.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Progress at run end.
    pub progress: Progress,
    /// Everything inserted, grouped by destination set.
    pub sets: CacheSnapshot,
}

/// What a run produced. `stats` is populated even when `error` is set,
/// carrying whatever partial progress was made.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Final stats; partial on cancellation or failure.
    pub stats: RunStats,
    /// `None` on success.
    pub error: Option<RunError>,
}

/// Enumerable worker knobs; collaborators are wired via [`WorkerBuilder`].
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Bounded pool size; defaulted and capped on build.
    pub parallelism: usize,
    /// Per-resolver attempt timeout; defaulted and capped on build.
    pub timeout: Duration,
    /// Primary DoH endpoint.
    pub doh_url: String,
    /// Additional DoH endpoints, queried in the given order.
    pub additional_doh: Vec<String>,
    /// UDP/53 nameservers, one client each; deduplicated by IP.
    pub extra_nameservers: Vec<IpAddr>,
    /// Extra DoH clients with an EDNS Client Subnet hint each.
    pub ecs_profiles: Vec<EcsProfile>,
}

impl From<&QuerySettings> for WorkerConfig {
    fn from(settings: &QuerySettings) -> Self {
        Self {
            parallelism: settings.parallelism,
            timeout: settings.timeout,
            doh_url: settings.doh_url.clone(),
            additional_doh: settings.additional_doh.clone(),
            extra_nameservers: settings.extra_nameservers.clone(),
            ecs_profiles: settings.ecs_profiles.clone(),
        }
    }
}

/// Assembles a [`PrewarmWorker`] from knobs and collaborators.
pub struct WorkerBuilder {
    config: WorkerConfig,
    ipset: Arc<dyn IpsetOps>,
    wildcard: Option<Arc<dyn WildcardExpand>>,
    probe: Arc<dyn InterfaceProbe>,
    lister: Arc<dyn InterfaceList>,
    on_progress: ProgressCallback,
    on_error: ErrorCallback,
    resolvers: Option<Vec<Arc<dyn Resolve>>>,
}

impl WorkerBuilder {
    /// Start a builder with the mandatory collaborators.
    pub fn new(
        config: WorkerConfig,
        ipset: Arc<dyn IpsetOps>,
        probe: Arc<dyn InterfaceProbe>,
        lister: Arc<dyn InterfaceList>,
    ) -> Self {
        Self {
            config,
            ipset,
            wildcard: None,
            probe,
            lister,
            on_progress: Arc::new(|_| {}),
            on_error: Arc::new(|_| {}),
            resolvers: None,
        }
    }

    /// Substitute the wildcard discovery source.
    pub fn wildcard(mut self, wildcard: Arc<dyn WildcardExpand>) -> Self {
        self.wildcard = Some(wildcard);
        self
    }

    /// Install a progress callback.
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.on_progress = callback;
        self
    }

    /// Install an error callback.
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = callback;
        self
    }

    /// Replace the constructed resolver set wholesale. The given order is
    /// the query order.
    pub fn resolvers(mut self, resolvers: Vec<Arc<dyn Resolve>>) -> Self {
        self.resolvers = Some(resolvers);
        self
    }

    /// Build the worker, constructing the resolver chain: primary DoH,
    /// additional DoH endpoints, one UDP/53 client per nameserver, one
    /// DoH-ECS client per profile. Construction fails on invalid inputs
    /// so a run never starts half-wired.
    pub fn build(self) -> Result<PrewarmWorker, ResolveError> {
        let parallelism = match self.config.parallelism {
            0 => DEFAULT_PARALLELISM as usize,
            n => n.min(MAX_PARALLELISM as usize),
        };
        let timeout = if self.config.timeout.is_zero() {
            Duration::from_secs(DEFAULT_TIMEOUT_SECS as u64)
        } else {
            self.config
                .timeout
                .min(Duration::from_secs(MAX_TIMEOUT_SECS as u64))
        };

        let resolvers = match self.resolvers {
            Some(resolvers) => resolvers,
            None => {
                let mut resolvers: Vec<Arc<dyn Resolve>> =
                    vec![Arc::new(DohClient::new(&self.config.doh_url, timeout)?)];
                for url in &self.config.additional_doh {
                    resolvers.push(Arc::new(DohClient::new(url, timeout)?));
                }
                let mut seen = Vec::new();
                for ip in &self.config.extra_nameservers {
                    if seen.contains(ip) {
                        continue;
                    }
                    seen.push(*ip);
                    resolvers.push(Arc::new(NsClient::new(*ip, timeout)));
                }
                for profile in &self.config.ecs_profiles {
                    resolvers.push(Arc::new(DohClient::with_ecs(
                        &self.config.doh_url,
                        timeout,
                        &profile.name,
                        profile.subnet,
                    )?));
                }
                resolvers
            }
        };

        let wildcard: Arc<dyn WildcardExpand> = match self.wildcard {
            Some(wildcard) => wildcard,
            None => Arc::new(CrtShClient::new(timeout).map_err(|e| match e {
                crate::wildcard::WildcardError::Http(e) => ResolveError::Http(e),
                other => ResolveError::InvalidUri(other.to_string()),
            })?),
        };

        Ok(PrewarmWorker {
            parallelism,
            resolvers,
            wildcard,
            ipset: self.ipset,
            probe: self.probe,
            lister: self.lister,
            on_progress: self.on_progress,
            on_error: self.on_error,
        })
    }
}

/// The run executor. Created per run by the scheduler and discarded at
/// run exit.
pub struct PrewarmWorker {
    parallelism: usize,
    resolvers: Vec<Arc<dyn Resolve>>,
    wildcard: Arc<dyn WildcardExpand>,
    ipset: Arc<dyn IpsetOps>,
    probe: Arc<dyn InterfaceProbe>,
    lister: Arc<dyn InterfaceList>,
    on_progress: ProgressCallback,
    on_error: ErrorCallback,
}

// Result of one fully processed task, before folding.
struct TaskOutcome {
    task: PrewarmTask,
    v4: BTreeSet<Ipv4Addr>,
    v6: BTreeSet<Ipv6Addr>,
    per_iface: BTreeMap<String, IfaceTally>,
}

#[derive(Default, Clone)]
struct IfaceTally {
    ips: u64,
    errors: u64,
}

// Progress and cache accumulators share one mutex; critical sections are
// counter updates and map inserts only.
struct Accum {
    progress: Progress,
    sets: BTreeMap<String, SetAccum>,
}

#[derive(Default)]
struct SetAccum {
    v4: BTreeSet<Ipv4Addr>,
    v6: BTreeSet<Ipv6Addr>,
}

struct RunCtx {
    interfaces: Vec<String>,
    cancel: CancellationToken,
    accum: Mutex<Accum>,
    fatal: Mutex<Option<RunError>>,
}

fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, ResolveError>>,
) -> Result<T, ResolveError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ResolveError::Canceled),
        result = fut => result,
    }
}

impl PrewarmWorker {
    /// Start building a worker.
    pub fn builder(
        config: WorkerConfig,
        ipset: Arc<dyn IpsetOps>,
        probe: Arc<dyn InterfaceProbe>,
        lister: Arc<dyn InterfaceList>,
    ) -> WorkerBuilder {
        WorkerBuilder::new(config, ipset, probe, lister)
    }

    /// Execute one run over `groups` through the interfaces of
    /// `profile_interfaces` (with managed-prefix fallback).
    ///
    /// Always returns the stats accumulated so far; `error` is set on
    /// cancellation, missing egress, or fatal set mutation failure.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        groups: &[DomainGroup],
        profile_interfaces: &[String],
    ) -> RunOutcome {
        let started_at = epoch_secs();

        if cancel.is_cancelled() {
            return RunOutcome {
                stats: RunStats {
                    progress: Progress::begin(started_at, 0, &[]),
                    sets: CacheSnapshot::new(),
                },
                error: Some(RunError::Canceled),
            };
        }

        let interfaces =
            match active_interfaces(profile_interfaces, self.probe.as_ref(), self.lister.as_ref())
            {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    return RunOutcome {
                        stats: RunStats {
                            progress: Progress::begin(started_at, 0, &[]),
                            sets: CacheSnapshot::new(),
                        },
                        error: Some(e.into()),
                    }
                }
            };

        let tasks = plan_tasks(groups);
        let progress = Progress::begin(started_at, tasks.len() as u64, &interfaces);
        (self.on_progress)(progress.clone());

        if tasks.is_empty() {
            return RunOutcome {
                stats: RunStats {
                    progress,
                    sets: CacheSnapshot::new(),
                },
                error: None,
            };
        }

        let (tx, rx) = flume::bounded(tasks.len());
        let task_count = tasks.len();
        for task in tasks {
            // Capacity equals the task count, so this never blocks.
            let _ = tx.send(task);
        }
        drop(tx);

        let ctx = RunCtx {
            interfaces,
            cancel,
            accum: Mutex::new(Accum {
                progress,
                sets: BTreeMap::new(),
            }),
            fatal: Mutex::new(None),
        };

        let workers = self.parallelism.min(task_count);
        log::debug!("prewarm run: {} tasks across {} workers", task_count, workers);
        join_all((0..workers).map(|_| self.worker_loop(&ctx, &rx))).await;

        let accum = ctx.accum.lock().unwrap();
        let stats = RunStats {
            progress: accum.progress.clone(),
            sets: accum
                .sets
                .iter()
                .map(|(name, set)| {
                    (
                        name.clone(),
                        SetAddrs {
                            v4: set.v4.iter().copied().collect(),
                            v6: set.v6.iter().copied().collect(),
                        },
                    )
                })
                .collect(),
        };
        drop(accum);

        let fatal = ctx.fatal.lock().unwrap().take();
        let error = match fatal {
            Some(error) => Some(error),
            None if ctx.cancel.is_cancelled() => Some(RunError::Canceled),
            None => None,
        };
        RunOutcome { stats, error }
    }

    async fn worker_loop(&self, ctx: &RunCtx, rx: &flume::Receiver<PrewarmTask>) {
        loop {
            let task = tokio::select! {
                _ = ctx.cancel.cancelled() => break,
                task = rx.recv_async() => match task {
                    Ok(task) => task,
                    // Producer closed the channel: all tasks drained.
                    Err(_) => break,
                },
            };

            match self.process_task(ctx, task).await {
                Ok(outcome) => {
                    let snapshot = {
                        let mut accum = ctx.accum.lock().unwrap();
                        fold(&mut accum, &outcome);
                        accum.progress.clone()
                    };
                    // Callbacks run outside the lock.
                    (self.on_progress)(snapshot);
                }
                Err(RunError::Canceled) => break,
                Err(error) => {
                    let mut fatal = ctx.fatal.lock().unwrap();
                    *fatal = Some(match fatal.take() {
                        // Single-shot latch; later errors are joined on.
                        Some(first) => first.join(error),
                        None => error,
                    });
                    drop(fatal);
                    ctx.cancel.cancel();
                    break;
                }
            }
        }
    }

    async fn process_task(&self, ctx: &RunCtx, task: PrewarmTask) -> Result<TaskOutcome, RunError> {
        let mut targets: BTreeSet<String> = BTreeSet::new();
        targets.insert(task.domain.clone());

        let mut per_iface: BTreeMap<String, IfaceTally> = ctx
            .interfaces
            .iter()
            .map(|name| (name.clone(), IfaceTally::default()))
            .collect();

        if task.wildcard {
            let expanded = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(RunError::Canceled),
                result = self.wildcard.subdomains(&task.domain) => result,
            };
            match expanded {
                Ok(subdomains) => {
                    for subdomain in subdomains {
                        let normalized = normalize_domain(&subdomain);
                        if !normalized.is_empty() {
                            targets.insert(normalized);
                        }
                    }
                }
                Err(e) => {
                    for tally in per_iface.values_mut() {
                        tally.errors += 1;
                    }
                    self.report(
                        QueryStage::WildcardDiscovery,
                        &task.domain,
                        "",
                        "discovery",
                        &e.to_string(),
                    );
                }
            }
        }

        // CNAME chase on the base domain widens the target set.
        for interface in &ctx.interfaces {
            for resolver in &self.resolvers {
                match guarded(&ctx.cancel, resolver.query_cname(&task.domain, interface)).await {
                    Ok(chain) => {
                        for target in chain {
                            if !target.is_empty() {
                                targets.insert(target);
                            }
                        }
                    }
                    Err(e) if e.is_canceled() => return Err(RunError::Canceled),
                    Err(e) => {
                        per_iface.get_mut(interface).unwrap().errors += 1;
                        self.report(
                            QueryStage::Cname,
                            &task.domain,
                            interface,
                            resolver.label(),
                            &e.to_string(),
                        );
                    }
                }
            }
        }

        let mut all_v4: BTreeSet<Ipv4Addr> = BTreeSet::new();
        let mut all_v6: BTreeSet<Ipv6Addr> = BTreeSet::new();
        let mut iface_v4: BTreeMap<String, BTreeSet<Ipv4Addr>> = BTreeMap::new();
        let mut iface_v6: BTreeMap<String, BTreeSet<Ipv6Addr>> = BTreeMap::new();

        // Targets iterate in sorted order to keep runs deterministic.
        for target in &targets {
            for interface in &ctx.interfaces {
                for resolver in &self.resolvers {
                    if ctx.cancel.is_cancelled() {
                        return Err(RunError::Canceled);
                    }
                    match guarded(&ctx.cancel, resolver.query_a(target, interface)).await {
                        Ok(addrs) => {
                            iface_v4
                                .entry(interface.clone())
                                .or_default()
                                .extend(addrs.iter().copied());
                            all_v4.extend(addrs);
                        }
                        Err(e) if e.is_canceled() => return Err(RunError::Canceled),
                        Err(e) => {
                            per_iface.get_mut(interface).unwrap().errors += 1;
                            self.report(
                                QueryStage::A,
                                target,
                                interface,
                                resolver.label(),
                                &e.to_string(),
                            );
                        }
                    }
                    match guarded(&ctx.cancel, resolver.query_aaaa(target, interface)).await {
                        Ok(addrs) => {
                            iface_v6
                                .entry(interface.clone())
                                .or_default()
                                .extend(addrs.iter().copied());
                            all_v6.extend(addrs);
                        }
                        Err(e) if e.is_canceled() => return Err(RunError::Canceled),
                        Err(e) => {
                            per_iface.get_mut(interface).unwrap().errors += 1;
                            self.report(
                                QueryStage::Aaaa,
                                target,
                                interface,
                                resolver.label(),
                                &e.to_string(),
                            );
                        }
                    }
                }
            }
        }

        for addr in &all_v4 {
            self.ipset
                .add(&task.set_v4, IpAddr::V4(*addr), IPSET_ENTRY_EXPIRY)
                .await?;
        }
        for addr in &all_v6 {
            self.ipset
                .add(&task.set_v6, IpAddr::V6(*addr), IPSET_ENTRY_EXPIRY)
                .await?;
        }

        for (interface, tally) in per_iface.iter_mut() {
            tally.ips = iface_v4.get(interface).map_or(0, |s| s.len() as u64)
                + iface_v6.get(interface).map_or(0, |s| s.len() as u64);
        }

        Ok(TaskOutcome {
            task,
            v4: all_v4,
            v6: all_v6,
            per_iface,
        })
    }

    fn report(&self, stage: QueryStage, domain: &str, interface: &str, resolver: &str, error: &str) {
        log::debug!(
            "query failed: stage={} domain={} interface={} resolver={}: {}",
            stage,
            domain,
            interface,
            resolver,
            error
        );
        (self.on_error)(&QueryFailure {
            stage,
            domain: domain.to_string(),
            interface: interface.to_string(),
            resolver: resolver.to_string(),
            error: error.to_string(),
        });
    }
}

fn fold(accum: &mut Accum, outcome: &TaskOutcome) {
    let inserted = (outcome.v4.len() + outcome.v6.len()) as u64;
    accum.progress.processed_domains += 1;
    accum.progress.total_ips += inserted;
    for (interface, tally) in &outcome.per_iface {
        if let Some(entry) = accum.progress.interfaces.get_mut(interface) {
            entry.domains_processed += 1;
            entry.ips_inserted += tally.ips;
            entry.errors += tally.errors;
        }
    }
    accum
        .sets
        .entry(outcome.task.set_v4.clone())
        .or_default()
        .v4
        .extend(outcome.v4.iter().copied());
    accum
        .sets
        .entry(outcome.task.set_v6.clone())
        .or_default()
        .v6
        .extend(outcome.v6.iter().copied());
}
