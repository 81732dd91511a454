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

//! Operator interface to kernel IP-sets.
//!
//! The engine only consumes this narrow seam; the concrete `ipset(8)`
//! wrapper lives with the daemon binary. Insertion failures are fatal to a
//! run: stale firewall state is worse than an aborted refresh.

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

/// Failure while mutating a kernel IP-set.
#[derive(Debug, Error)]
#[error("ipset {set}: {reason}")]
pub struct IpsetError {
    /// Set that was being mutated.
    pub set: String,
    /// Operator-provided failure text.
    pub reason: String,
}

impl IpsetError {
    /// Convenience constructor.
    pub fn new(set: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            set: set.into(),
            reason: reason.into(),
        }
    }
}

/// Mutating operations on kernel IP-sets.
#[async_trait]
pub trait IpsetOps: Send + Sync {
    /// Insert `addr` into `set` with the given entry expiry in seconds.
    /// Inserting an existing entry refreshes its expiry.
    async fn add(&self, set: &str, addr: IpAddr, expiry_secs: u32) -> Result<(), IpsetError>;
}
