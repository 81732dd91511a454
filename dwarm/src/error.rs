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

//! This module provides the universal error type used in the library.
//! The error type uses `thiserror`.

pub use crate::{
    cache::CacheError, ifaces::IfaceError, ipset::IpsetError, resolver::ResolveError,
    scheduler::ScheduleError, settings::SettingsError, store::StoreError,
    wildcard::WildcardError, worker::RunError,
};
use thiserror::Error;

/// DwarmError enumerates all possible errors returned by this library.
#[derive(Debug, Error)]
pub enum DwarmError {
    /// Error from a resolver client.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// Error from wildcard discovery.
    #[error(transparent)]
    Wildcard(#[from] WildcardError),

    /// Error from settings validation.
    #[error(transparent)]
    Settings(#[from] SettingsError),

    /// Error from the run store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid scheduler transition.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Fatal run outcome.
    #[error(transparent)]
    Run(#[from] RunError),

    /// Interface selection failure.
    #[error(transparent)]
    Iface(#[from] IfaceError),

    /// IP-set operator failure.
    #[error(transparent)]
    Ipset(#[from] IpsetError),

    /// Cache sink failure.
    #[error(transparent)]
    Cache(#[from] CacheError),
}
