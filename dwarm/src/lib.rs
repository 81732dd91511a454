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

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! This is the core library for dprewarm. It periodically resolves the
//! configured domains across every active VPN egress interface, merges
//! the discovered addresses, and feeds them into per-interface kernel
//! IP-sets so split-tunnel policies have fresh destinations before live
//! traffic needs them.

/// Cache snapshot sink and the in-memory implementation.
pub mod cache;
/// Universal error type.
pub mod error;
/// Egress interface selection.
pub mod ifaces;
/// Kernel IP-set operator seam.
pub mod ipset;
#[doc(hidden)]
pub mod mock;
/// Routing-config flattening into canonical tasks.
pub mod plan;
/// Resolver clients (DoH-JSON and UDP/53).
pub mod resolver;
/// Single-flight periodic run driver.
pub mod scheduler;
/// Settings parsing, validation, and clamping.
pub mod settings;
/// Run-history persistence.
pub mod store;
/// Wildcard-domain expansion.
pub mod wildcard;
/// The bounded-parallel run executor.
pub mod worker;

pub use self::{
    cache::{CacheSink, CacheSnapshot, MemoryCache, SetAddrs},
    plan::{DomainGroup, PrewarmTask, RouteRule},
    scheduler::{ConfigSource, ScheduleError, Scheduler, SchedulerStatus},
    settings::{QuerySettings, RawSettings},
    store::{RunRecord, RunStore},
    worker::{Progress, PrewarmWorker, RunOutcome, RunStats},
};
