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
//! VPN profile management for dprewarm: allocation of policy-routing
//! identifiers (route tables and firewall marks) that never collide with
//! live kernel state, and atomic persistence of per-profile metadata.

/// Route-table and fwmark allocation.
pub mod alloc;
/// `vpn.conf` parsing and rendering.
pub mod conf;
/// Profile persistence and WireGuard config sanitization.
pub mod profile;

pub use self::{
    alloc::{AllocError, IdAllocator, IdKind, KernelState, SystemKernelState},
    conf::{ConfError, VpnConf, VpnProvider},
    profile::{NewProfile, ProfileError, ProfileManager},
};
