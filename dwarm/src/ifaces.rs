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

//! Egress interface selection.
//!
//! Interfaces named by the configured VPN profiles are preferred; when none
//! of them is up, the selector falls back to enumerating system interfaces
//! that follow the managed naming convention.

use std::{collections::BTreeSet, fs, io, path::Path};
use thiserror::Error;

/// Naming convention for interfaces managed by this daemon's fallback path.
pub const MANAGED_PREFIX: &str = "wg-sv-";

const SYS_CLASS_NET: &str = "/sys/class/net";

// IFF_UP from if.h.
const IFF_UP: u32 = 0x1;

/// Interface selection errors.
#[derive(Debug, Error)]
pub enum IfaceError {
    /// Neither the profile interfaces nor the managed fallback produced an
    /// active egress path.
    #[error("no active vpn interfaces found")]
    NoneActive,

    /// Enumerating system interfaces failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Answers whether a named interface is administratively up.
pub trait InterfaceProbe: Send + Sync {
    /// True when `name` exists and is up.
    fn is_up(&self, name: &str) -> bool;
}

/// Enumerates system network interfaces.
pub trait InterfaceList: Send + Sync {
    /// All interface names currently known to the system.
    fn list(&self) -> io::Result<Vec<String>>;
}

/// Probe backed by `/sys/class/net/<name>/flags`.
pub struct SysfsProbe;

impl InterfaceProbe for SysfsProbe {
    fn is_up(&self, name: &str) -> bool {
        if name.is_empty() || name.contains('/') {
            return false;
        }
        let path = Path::new(SYS_CLASS_NET).join(name).join("flags");
        match fs::read_to_string(path) {
            Ok(raw) => parse_flags(&raw).map(|f| f & IFF_UP != 0).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// Lister backed by `/sys/class/net`.
pub struct SysfsList;

impl InterfaceList for SysfsList {
    fn list(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(SYS_CLASS_NET)? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }
}

fn parse_flags(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    u32::from_str_radix(raw, 16).ok()
}

/// Select the active egress interfaces for a run.
///
/// Profile interfaces that are up win; otherwise system interfaces with
/// the [`MANAGED_PREFIX`] that are up. The result is deduplicated and
/// sorted. An empty result fails the run.
pub fn active_interfaces(
    profiles: &[String],
    probe: &dyn InterfaceProbe,
    lister: &dyn InterfaceList,
) -> Result<Vec<String>, IfaceError> {
    let mut active: BTreeSet<String> = profiles
        .iter()
        .filter(|name| !name.is_empty() && probe.is_up(name))
        .cloned()
        .collect();

    if active.is_empty() {
        active = lister
            .list()?
            .into_iter()
            .filter(|name| name.starts_with(MANAGED_PREFIX) && probe.is_up(name))
            .collect();
    }

    if active.is_empty() {
        return Err(IfaceError::NoneActive);
    }
    Ok(active.into_iter().collect())
}
