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

//! Allocation of route-table ids and firewall marks.
//!
//! Values already present in the kernel (rt_tables, `ip rule`, `ip route`)
//! or claimed by profiles under external roots are *sticky*: they were
//! never ours, so `release` leaves them in place. Values persisted under
//! the managed root and values handed out in-process are owned and can be
//! released.

use crate::conf::VpnConf;
use std::{
    collections::HashSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    process::Command,
};
use thiserror::Error;

/// Lower bound for both allocation ranges. Everything below is reserved
/// for the system.
pub const ID_MIN: u32 = 200;
/// Upper bound for route-table ids.
pub const TABLE_MAX: u32 = 65_535;
/// Upper bound for firewall marks.
pub const MARK_MAX: u32 = 0x7fff_ffff;

const VPN_CONF: &str = "vpn.conf";

/// Which identifier space an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    /// Policy-routing table id.
    Table,
    /// Netfilter firewall mark.
    Mark,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Table => "route table",
            Self::Mark => "fwmark",
        })
    }
}

/// Allocation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The requested value is already claimed somewhere.
    #[error("{kind} {value} is already in use")]
    Conflict {
        /// Identifier space.
        kind: IdKind,
        /// The contested value.
        value: u32,
    },

    /// The requested value lies outside the allocatable range.
    #[error("{kind} {value} is out of range")]
    OutOfRange {
        /// Identifier space.
        kind: IdKind,
        /// The rejected value.
        value: u32,
    },

    /// Every value in the range is taken.
    #[error("no free {0} available")]
    Exhausted(IdKind),
}

/// Read access to live kernel policy-routing state. Injected so tests can
/// stub the `ip` tool and rt_tables.
pub trait KernelState: Send + Sync {
    /// Contents of `/etc/iproute2/rt_tables`.
    fn rt_tables(&self) -> io::Result<String>;

    /// Stdout of `ip {args}`.
    fn ip_output(&self, args: &[&str]) -> io::Result<String>;
}

/// Kernel state read from the real system.
pub struct SystemKernelState;

impl KernelState for SystemKernelState {
    fn rt_tables(&self) -> io::Result<String> {
        fs::read_to_string("/etc/iproute2/rt_tables")
    }

    fn ip_output(&self, args: &[&str]) -> io::Result<String> {
        let output = Command::new("ip").args(args).output()?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Allocator for route-table ids and firewall marks.
pub struct IdAllocator {
    kernel: Box<dyn KernelState>,
    managed_root: PathBuf,
    external_roots: Vec<PathBuf>,
    sticky_tables: HashSet<u32>,
    sticky_marks: HashSet<u32>,
    owned_tables: HashSet<u32>,
    owned_marks: HashSet<u32>,
}

impl IdAllocator {
    /// Create an allocator seeded from the kernel, the managed profile
    /// root, and any external roots.
    pub fn new(
        kernel: Box<dyn KernelState>,
        managed_root: impl Into<PathBuf>,
        external_roots: Vec<PathBuf>,
    ) -> Self {
        let mut allocator = Self {
            kernel,
            managed_root: managed_root.into(),
            external_roots,
            sticky_tables: HashSet::new(),
            sticky_marks: HashSet::new(),
            owned_tables: HashSet::new(),
            owned_marks: HashSet::new(),
        };
        allocator.refresh();
        allocator
    }

    /// Re-seed the used sets from every source. Called on construction
    /// and before each allocation so concurrent system changes are seen.
    pub fn refresh(&mut self) {
        self.sticky_tables.clear();
        self.sticky_marks.clear();

        match self.kernel.rt_tables() {
            Ok(raw) => self.sticky_tables.extend(parse_rt_tables(&raw)),
            Err(e) => log::debug!("rt_tables unreadable: {}", e),
        }

        for family in [&["rule", "show"][..], &["-6", "rule", "show"][..]] {
            match self.kernel.ip_output(family) {
                Ok(raw) => {
                    self.sticky_marks.extend(parse_ip_values(&raw, "fwmark"));
                    self.sticky_tables.extend(parse_ip_values(&raw, "lookup"));
                    self.sticky_tables.extend(parse_ip_values(&raw, "table"));
                }
                Err(e) => log::debug!("ip {:?} failed: {}", family, e),
            }
        }

        for family in [
            &["route", "show", "table", "all"][..],
            &["-6", "route", "show", "table", "all"][..],
        ] {
            match self.kernel.ip_output(family) {
                Ok(raw) => self.sticky_tables.extend(parse_ip_values(&raw, "table")),
                Err(e) => log::debug!("ip {:?} failed: {}", family, e),
            }
        }

        // Our own profiles are releasable; external roots are not.
        let (tables, marks) = scan_profile_root(&self.managed_root);
        self.owned_tables.extend(tables);
        self.owned_marks.extend(marks);
        for root in &self.external_roots {
            let (tables, marks) = scan_profile_root(root);
            self.sticky_tables.extend(tables);
            self.sticky_marks.extend(marks);
        }
    }

    fn used_tables(&self) -> impl Iterator<Item = &u32> {
        self.sticky_tables.iter().chain(self.owned_tables.iter())
    }

    fn used_marks(&self) -> impl Iterator<Item = &u32> {
        self.sticky_marks.iter().chain(self.owned_marks.iter())
    }

    /// Allocate the lowest free route-table id.
    pub fn allocate_table(&mut self) -> Result<u32, AllocError> {
        self.refresh();
        let used: HashSet<u32> = self.used_tables().copied().collect();
        let value = lowest_free(&used, TABLE_MAX).ok_or(AllocError::Exhausted(IdKind::Table))?;
        self.owned_tables.insert(value);
        Ok(value)
    }

    /// Allocate the lowest free firewall mark.
    pub fn allocate_mark(&mut self) -> Result<u32, AllocError> {
        self.refresh();
        let used: HashSet<u32> = self.used_marks().copied().collect();
        let value = lowest_free(&used, MARK_MAX).ok_or(AllocError::Exhausted(IdKind::Mark))?;
        self.owned_marks.insert(value);
        Ok(value)
    }

    /// Claim a specific route-table id; fails when it is taken.
    pub fn reserve_table(&mut self, value: u32) -> Result<(), AllocError> {
        self.refresh();
        if !(ID_MIN..=TABLE_MAX).contains(&value) {
            return Err(AllocError::OutOfRange {
                kind: IdKind::Table,
                value,
            });
        }
        if self.used_tables().any(|used| *used == value) {
            return Err(AllocError::Conflict {
                kind: IdKind::Table,
                value,
            });
        }
        self.owned_tables.insert(value);
        Ok(())
    }

    /// Claim a specific firewall mark; fails when it is taken.
    pub fn reserve_mark(&mut self, value: u32) -> Result<(), AllocError> {
        self.refresh();
        if !(ID_MIN..=MARK_MAX).contains(&value) {
            return Err(AllocError::OutOfRange {
                kind: IdKind::Mark,
                value,
            });
        }
        if self.used_marks().any(|used| *used == value) {
            return Err(AllocError::Conflict {
                kind: IdKind::Mark,
                value,
            });
        }
        self.owned_marks.insert(value);
        Ok(())
    }

    /// Return an owned route-table id. Sticky values stay claimed.
    pub fn release_table(&mut self, value: u32) {
        self.owned_tables.remove(&value);
    }

    /// Return an owned firewall mark. Sticky values stay claimed.
    pub fn release_mark(&mut self, value: u32) {
        self.owned_marks.remove(&value);
    }
}

fn lowest_free(used: &HashSet<u32>, max: u32) -> Option<u32> {
    (ID_MIN..=max).find(|candidate| !used.contains(candidate))
}

// First whitespace-separated field, numeric, >= 200. Comment and malformed
// lines are skipped.
fn parse_rt_tables(raw: &str) -> HashSet<u32> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|field| field.parse::<u32>().ok())
        .filter(|value| *value >= ID_MIN)
        .collect()
}

// Values following `key` in `ip` output. Handles decimal, 0x-hex, and
// mask suffixes like `0xc8/0xffffffff`; named tables (main, local) are
// skipped.
fn parse_ip_values(raw: &str, key: &str) -> HashSet<u32> {
    let mut values = HashSet::new();
    for line in raw.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        for window in tokens.windows(2) {
            if window[0] == key {
                if let Some(value) = parse_id(window[1]) {
                    values.insert(value);
                }
            }
        }
    }
    values
}

fn parse_id(token: &str) -> Option<u32> {
    let token = token.split('/').next()?;
    if let Some(hex) = token.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        token.parse().ok()
    }
}

// Walk `{root}/{name}/vpn.conf` files; unparsable ones are skipped.
fn scan_profile_root(root: &Path) -> (HashSet<u32>, HashSet<u32>) {
    let mut tables = HashSet::new();
    let mut marks = HashSet::new();
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return (tables, marks),
    };
    for entry in entries.flatten() {
        let conf_path = entry.path().join(VPN_CONF);
        let raw = match fs::read_to_string(&conf_path) {
            Ok(raw) => raw,
            Err(_) => continue,
        };
        match VpnConf::parse(&raw) {
            Ok(conf) => {
                tables.insert(conf.route_table);
                marks.insert(conf.mark);
            }
            Err(e) => log::debug!("skipping {}: {}", conf_path.display(), e),
        }
    }
    (tables, marks)
}
