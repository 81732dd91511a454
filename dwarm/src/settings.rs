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

//! Pre-warm settings: raw configuration values, their multi-line parsers,
//! and the clamping rules. Validation happens at trigger time so that a
//! malformed setting fails the trigger instead of a half-started run.

use ipnet::IpNet;
use serde::Deserialize;
use std::{net::IpAddr, time::Duration};
use thiserror::Error;

/// Default run interval, seconds.
pub const DEFAULT_INTERVAL_SECS: i64 = 7_200;
/// Hard ceiling for the run interval: seven days.
pub const MAX_INTERVAL_SECS: i64 = 604_800;
/// Default per-resolver attempt timeout, seconds.
pub const DEFAULT_TIMEOUT_SECS: i64 = 10;
/// Timeout ceiling, seconds.
pub const MAX_TIMEOUT_SECS: i64 = 60;
/// Default worker parallelism.
pub const DEFAULT_PARALLELISM: i64 = 4;
/// Parallelism hard cap.
pub const MAX_PARALLELISM: i64 = 64;
/// Maximum extra nameserver lines.
pub const MAX_NAMESERVERS: usize = 16;
/// Maximum ECS profile lines.
pub const MAX_ECS_PROFILES: usize = 16;
/// Default DoH endpoint (JSON mode).
pub const DEFAULT_DOH_URL: &str = "https://1.1.1.1/dns-query";

/// Raw settings as stored by the configuration layer. String fields carry
/// the multi-line formats; numeric fields are unclamped.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    /// `prewarm_interval_seconds`.
    pub interval_secs: i64,
    /// `prewarm_doh_timeout_seconds`.
    pub doh_timeout_secs: i64,
    /// `prewarm_parallelism`.
    pub parallelism: i64,
    /// `prewarm_extra_nameservers`: newline-separated IP literals.
    pub extra_nameservers: String,
    /// `prewarm_ecs_profiles`: newline-separated `[name=]cidr`.
    pub ecs_profiles: String,
    /// Primary DoH endpoint.
    pub doh_url: String,
    /// Additional DoH endpoints, queried after the primary.
    pub additional_doh: Vec<String>,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            doh_timeout_secs: DEFAULT_TIMEOUT_SECS,
            parallelism: DEFAULT_PARALLELISM,
            extra_nameservers: String::new(),
            ecs_profiles: String::new(),
            doh_url: DEFAULT_DOH_URL.to_string(),
            additional_doh: Vec::new(),
        }
    }
}

/// One EDNS Client Subnet profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsProfile {
    /// Display name; defaults to the canonical subnet text.
    pub name: String,
    /// Canonicalized subnet (host bits zeroed).
    pub subnet: IpNet,
}

/// Validated, clamped settings a run executes with.
#[derive(Debug, Clone)]
pub struct QuerySettings {
    /// Run interval.
    pub interval: Duration,
    /// Per-resolver attempt timeout.
    pub timeout: Duration,
    /// Worker parallelism.
    pub parallelism: usize,
    /// Extra UDP/53 nameservers, order-preserving and deduplicated.
    pub extra_nameservers: Vec<IpAddr>,
    /// ECS profiles, order-preserving and deduplicated by subnet.
    pub ecs_profiles: Vec<EcsProfile>,
    /// Primary DoH endpoint.
    pub doh_url: String,
    /// Additional DoH endpoints.
    pub additional_doh: Vec<String>,
}

/// Validation failures. These never start a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// A nameserver line did not parse as an IP literal.
    #[error("invalid nameserver line '{0}'")]
    InvalidNameserver(String),

    /// An ECS line did not parse as `[name=]cidr`.
    #[error("invalid ecs profile line '{0}'")]
    InvalidEcsProfile(String),

    /// `/0` subnets would geolocate nothing and are rejected.
    #[error("ecs subnet '{0}' is too broad")]
    BroadEcsSubnet(String),

    /// Too many lines for a bounded list setting.
    #[error("too many {what} entries (limit {max})")]
    TooMany {
        /// Which setting overflowed.
        what: &'static str,
        /// The limit.
        max: usize,
    },
}

/// Split a multi-line setting into payload lines: CRLF normalized, blank
/// and `#`-comment lines removed, inline `# …` comments stripped.
pub fn split_lines(raw: &str) -> Vec<String> {
    raw.replace("\r\n", "\n")
        .split('\n')
        .map(|line| {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            line.trim().to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

/// Parse the `prewarm_extra_nameservers` format. Duplicates collapse,
/// first occurrence wins the ordering.
pub fn parse_nameserver_lines(raw: &str) -> Result<Vec<IpAddr>, SettingsError> {
    let mut out: Vec<IpAddr> = Vec::new();
    for line in split_lines(raw) {
        let ip: IpAddr = line
            .parse()
            .map_err(|_| SettingsError::InvalidNameserver(line.clone()))?;
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    if out.len() > MAX_NAMESERVERS {
        return Err(SettingsError::TooMany {
            what: "nameserver",
            max: MAX_NAMESERVERS,
        });
    }
    Ok(out)
}

/// Parse the `prewarm_ecs_profiles` format (`[name=]cidr` per line).
/// Subnets are canonicalized; duplicates (after canonicalization)
/// collapse, first occurrence wins.
pub fn parse_ecs_lines(raw: &str) -> Result<Vec<EcsProfile>, SettingsError> {
    let mut out: Vec<EcsProfile> = Vec::new();
    for line in split_lines(raw) {
        let (name, cidr) = match line.split_once('=') {
            Some((name, cidr)) => (name.trim().to_string(), cidr.trim()),
            None => (String::new(), line.as_str()),
        };
        let subnet: IpNet = cidr
            .parse()
            .map_err(|_| SettingsError::InvalidEcsProfile(line.clone()))?;
        if subnet.prefix_len() == 0 {
            return Err(SettingsError::BroadEcsSubnet(line.clone()));
        }
        let subnet = subnet.trunc();
        if out.iter().any(|p| p.subnet == subnet) {
            continue;
        }
        let name = if name.is_empty() {
            subnet.to_string()
        } else {
            name
        };
        out.push(EcsProfile { name, subnet });
    }
    if out.len() > MAX_ECS_PROFILES {
        return Err(SettingsError::TooMany {
            what: "ecs profile",
            max: MAX_ECS_PROFILES,
        });
    }
    Ok(out)
}

/// Substitute the default when out of range below, clamp above.
fn clamp(value: i64, default: i64, max: i64) -> i64 {
    if value <= 0 {
        default
    } else if value > max {
        max
    } else {
        value
    }
}

impl RawSettings {
    /// Validate the multi-line fields and clamp the numeric ones.
    pub fn validate(&self) -> Result<QuerySettings, SettingsError> {
        let extra_nameservers = parse_nameserver_lines(&self.extra_nameservers)?;
        let ecs_profiles = parse_ecs_lines(&self.ecs_profiles)?;
        Ok(QuerySettings {
            interval: Duration::from_secs(clamp(
                self.interval_secs,
                DEFAULT_INTERVAL_SECS,
                MAX_INTERVAL_SECS,
            ) as u64),
            timeout: Duration::from_secs(clamp(
                self.doh_timeout_secs,
                DEFAULT_TIMEOUT_SECS,
                MAX_TIMEOUT_SECS,
            ) as u64),
            parallelism: clamp(self.parallelism, DEFAULT_PARALLELISM, MAX_PARALLELISM) as usize,
            extra_nameservers,
            ecs_profiles,
            doh_url: if self.doh_url.is_empty() {
                DEFAULT_DOH_URL.to_string()
            } else {
                self.doh_url.clone()
            },
            additional_doh: self.additional_doh.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_splitting_strips_comments_and_blanks() {
        let lines = split_lines("1.1.1.1\r\n\n# all of it\n8.8.8.8 # google\n   \n");
        assert_eq!(lines, vec!["1.1.1.1", "8.8.8.8"]);
        for line in &lines {
            assert!(!line.contains('#'));
            assert!(!line.is_empty());
        }
    }

    #[test]
    fn nameserver_round_trip() {
        let ips = vec!["1.1.1.1".parse::<IpAddr>().unwrap(), "2606:4700:4700::1111".parse().unwrap()];
        let rendered = ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(parse_nameserver_lines(&rendered).unwrap(), ips);
    }

    #[test]
    fn nameserver_duplicates_collapse() {
        let got = parse_nameserver_lines("8.8.8.8\n1.1.1.1\n8.8.8.8").unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0], "8.8.8.8".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn nameserver_rejects_non_ip() {
        assert_eq!(
            parse_nameserver_lines("dns.google"),
            Err(SettingsError::InvalidNameserver("dns.google".into()))
        );
    }

    #[test]
    fn nameserver_limit() {
        let many = (0..17).map(|i| format!("10.0.0.{}", i)).collect::<Vec<_>>().join("\n");
        assert!(matches!(
            parse_nameserver_lines(&many),
            Err(SettingsError::TooMany { what: "nameserver", .. })
        ));
    }

    #[test]
    fn ecs_canonicalizes_and_dedupes() {
        let got = parse_ecs_lines("eu=31.13.64.0/18\n31.13.68.7/18").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].name, "eu");
        assert_eq!(got[0].subnet.to_string(), "31.13.64.0/18");
    }

    #[test]
    fn ecs_rejects_slash_zero() {
        assert_eq!(
            parse_ecs_lines("eu=0.0.0.0/0"),
            Err(SettingsError::BroadEcsSubnet("eu=0.0.0.0/0".into()))
        );
    }

    #[test]
    fn ecs_unnamed_profile_uses_subnet_text() {
        let got = parse_ecs_lines("198.51.100.0/24").unwrap();
        assert_eq!(got[0].name, "198.51.100.0/24");
    }

    #[test]
    fn numeric_clamps() {
        let raw = RawSettings {
            interval_secs: -5,
            doh_timeout_secs: 100,
            parallelism: 1000,
            ..RawSettings::default()
        };
        let settings = raw.validate().unwrap();
        assert_eq!(settings.interval, Duration::from_secs(7_200));
        assert_eq!(settings.timeout, Duration::from_secs(60));
        assert_eq!(settings.parallelism, 64);

        let raw = RawSettings {
            parallelism: 0,
            doh_timeout_secs: 0,
            interval_secs: MAX_INTERVAL_SECS + 1,
            ..RawSettings::default()
        };
        let settings = raw.validate().unwrap();
        assert_eq!(settings.parallelism, 4);
        assert_eq!(settings.timeout, Duration::from_secs(10));
        assert_eq!(settings.interval, Duration::from_secs(MAX_INTERVAL_SECS as u64));
    }
}
