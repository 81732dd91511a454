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

use std::collections::BTreeMap;

/// Per-interface progress counters. Monotone within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceProgress {
    /// Tasks planned for this interface (equals the run's task count).
    pub total_domains: u64,
    /// Tasks completed so far.
    pub domains_processed: u64,
    /// Unique addresses this interface contributed.
    pub ips_inserted: u64,
    /// Resolver failures observed on this interface.
    pub errors: u64,
}

/// Snapshot of a run's progress. Every emission is a deep copy; consumers
/// may retain it without synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Progress {
    /// Run start, epoch seconds.
    pub started_at: i64,
    /// Planned task count.
    pub total_domains: u64,
    /// Completed task count. Monotone, bounded by `total_domains`.
    pub processed_domains: u64,
    /// Unique addresses inserted so far, across all sets.
    pub total_ips: u64,
    /// Per-interface breakdown.
    pub interfaces: BTreeMap<String, InterfaceProgress>,
}

impl Progress {
    /// Fresh snapshot for a run over `interfaces` with `total` tasks.
    pub fn begin(started_at: i64, total: u64, interfaces: &[String]) -> Self {
        Self {
            started_at,
            total_domains: total,
            processed_domains: 0,
            total_ips: 0,
            interfaces: interfaces
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        InterfaceProgress {
                            total_domains: total,
                            ..InterfaceProgress::default()
                        },
                    )
                })
                .collect(),
        }
    }
}
