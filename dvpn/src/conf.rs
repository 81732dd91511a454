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

//! The `vpn.conf` metadata format.
//!
//! ASCII `KEY="value"` lines for strings, bare values for `ROUTE_TABLE`
//! (decimal) and `MARK` (hex `0x…`). Both identifiers are 200 or above;
//! at most one endpoint family may be set.

use crate::alloc::ID_MIN;
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};
use thiserror::Error;

/// Tunnel flavor of a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnProvider {
    /// WireGuard, driven by external tooling.
    External,
    /// OpenVPN.
    Openvpn,
}

impl fmt::Display for VpnProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::External => "external",
            Self::Openvpn => "openvpn",
        })
    }
}

impl FromStr for VpnProvider {
    type Err = ConfError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "external" => Ok(Self::External),
            "openvpn" => Ok(Self::Openvpn),
            other => Err(ConfError::InvalidValue {
                key: "VPN_PROVIDER",
                value: other.to_string(),
            }),
        }
    }
}

/// `vpn.conf` failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfError {
    /// A required key is absent.
    #[error("missing key {0}")]
    MissingKey(&'static str),

    /// A value failed to parse or is out of range.
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue {
        /// Offending key.
        key: &'static str,
        /// Offending raw value.
        value: String,
    },

    /// Both endpoint families were set; at most one is allowed.
    #[error("at most one of VPN_ENDPOINT_IPV4 and VPN_ENDPOINT_IPV6 may be set")]
    BothEndpoints,
}

/// Parsed profile metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpnConf {
    /// Tunnel flavor.
    pub provider: VpnProvider,
    /// Interface name.
    pub dev: String,
    /// Policy-routing table id, >= 200.
    pub route_table: u32,
    /// Firewall mark, >= 200.
    pub mark: u32,
    /// IP-set names forced onto this tunnel, as stored.
    pub forced_ipsets: String,
    /// IPv4 tunnel endpoint, mutually exclusive with the IPv6 one.
    pub endpoint_v4: Option<Ipv4Addr>,
    /// IPv6 tunnel endpoint.
    pub endpoint_v6: Option<Ipv6Addr>,
    /// Underlying interface the tunnel is bound to.
    pub bound_iface: String,
    /// File name of the tunnel config next to `vpn.conf`.
    pub config_file: String,
}

fn unquote(raw: &str) -> &str {
    let raw = raw.trim();
    raw.strip_prefix('"')
        .and_then(|r| r.strip_suffix('"'))
        .unwrap_or(raw)
}

impl VpnConf {
    /// Parse the key=value line format.
    pub fn parse(raw: &str) -> Result<Self, ConfError> {
        let mut provider = None;
        let mut dev = None;
        let mut route_table = None;
        let mut mark = None;
        let mut forced_ipsets = String::new();
        let mut endpoint_v4 = None;
        let mut endpoint_v6 = None;
        let mut bound_iface = String::new();
        let mut config_file = String::new();

        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some(split) => split,
                None => continue,
            };
            let value = unquote(value);
            match key.trim() {
                "VPN_PROVIDER" => provider = Some(value.parse()?),
                "DEV" => dev = Some(value.to_string()),
                "ROUTE_TABLE" => {
                    route_table =
                        Some(value.parse::<u32>().map_err(|_| ConfError::InvalidValue {
                            key: "ROUTE_TABLE",
                            value: value.to_string(),
                        })?)
                }
                "MARK" => {
                    let parsed = match value.strip_prefix("0x") {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => value.parse().ok(),
                    };
                    mark = Some(parsed.ok_or_else(|| ConfError::InvalidValue {
                        key: "MARK",
                        value: value.to_string(),
                    })?);
                }
                "FORCED_IPSETS" => forced_ipsets = value.to_string(),
                "VPN_ENDPOINT_IPV4" => {
                    endpoint_v4 =
                        Some(value.parse().map_err(|_| ConfError::InvalidValue {
                            key: "VPN_ENDPOINT_IPV4",
                            value: value.to_string(),
                        })?)
                }
                "VPN_ENDPOINT_IPV6" => {
                    endpoint_v6 =
                        Some(value.parse().map_err(|_| ConfError::InvalidValue {
                            key: "VPN_ENDPOINT_IPV6",
                            value: value.to_string(),
                        })?)
                }
                "VPN_BOUND_IFACE" => bound_iface = value.to_string(),
                "CONFIG_FILE" => config_file = value.to_string(),
                // Unknown keys are preserved by writers, ignored here.
                _ => {}
            }
        }

        let route_table = route_table.ok_or(ConfError::MissingKey("ROUTE_TABLE"))?;
        let mark = mark.ok_or(ConfError::MissingKey("MARK"))?;
        if route_table < ID_MIN {
            return Err(ConfError::InvalidValue {
                key: "ROUTE_TABLE",
                value: route_table.to_string(),
            });
        }
        if mark < ID_MIN {
            return Err(ConfError::InvalidValue {
                key: "MARK",
                value: format!("0x{:x}", mark),
            });
        }
        if endpoint_v4.is_some() && endpoint_v6.is_some() {
            return Err(ConfError::BothEndpoints);
        }

        Ok(Self {
            provider: provider.ok_or(ConfError::MissingKey("VPN_PROVIDER"))?,
            dev: dev.ok_or(ConfError::MissingKey("DEV"))?,
            route_table,
            mark,
            forced_ipsets,
            endpoint_v4,
            endpoint_v6,
            bound_iface,
            config_file,
        })
    }

    /// Render back to the line format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("VPN_PROVIDER=\"{}\"\n", self.provider));
        out.push_str(&format!("DEV=\"{}\"\n", self.dev));
        out.push_str(&format!("ROUTE_TABLE={}\n", self.route_table));
        out.push_str(&format!("MARK=0x{:x}\n", self.mark));
        if !self.forced_ipsets.is_empty() {
            out.push_str(&format!("FORCED_IPSETS=\"{}\"\n", self.forced_ipsets));
        }
        if let Some(endpoint) = self.endpoint_v4 {
            out.push_str(&format!("VPN_ENDPOINT_IPV4=\"{}\"\n", endpoint));
        }
        if let Some(endpoint) = self.endpoint_v6 {
            out.push_str(&format!("VPN_ENDPOINT_IPV6=\"{}\"\n", endpoint));
        }
        if !self.bound_iface.is_empty() {
            out.push_str(&format!("VPN_BOUND_IFACE=\"{}\"\n", self.bound_iface));
        }
        if !self.config_file.is_empty() {
            out.push_str(&format!("CONFIG_FILE=\"{}\"\n", self.config_file));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VpnConf {
        VpnConf {
            provider: VpnProvider::External,
            dev: "wg-sv-nl1".into(),
            route_table: 201,
            mark: 0xc9,
            forced_ipsets: "media-v4,media-v6".into(),
            endpoint_v4: Some("198.51.100.7".parse().unwrap()),
            endpoint_v6: None,
            bound_iface: "eth0".into(),
            config_file: "tunnel.conf".into(),
        }
    }

    #[test]
    fn render_parse_round_trip() {
        let conf = sample();
        assert_eq!(VpnConf::parse(&conf.render()).unwrap(), conf);
    }

    #[test]
    fn mark_renders_as_hex() {
        let rendered = sample().render();
        assert!(rendered.contains("MARK=0xc9\n"));
        assert!(rendered.contains("ROUTE_TABLE=201\n"));
    }

    #[test]
    fn rejects_both_endpoints() {
        let raw = "VPN_PROVIDER=\"openvpn\"\nDEV=\"tun0\"\nROUTE_TABLE=200\nMARK=0xc8\nVPN_ENDPOINT_IPV4=\"1.2.3.4\"\nVPN_ENDPOINT_IPV6=\"2001:db8::1\"\n";
        assert_eq!(VpnConf::parse(raw), Err(ConfError::BothEndpoints));
    }

    #[test]
    fn rejects_low_identifiers() {
        let raw = "VPN_PROVIDER=\"external\"\nDEV=\"wg0\"\nROUTE_TABLE=100\nMARK=0xc8\n";
        assert!(matches!(
            VpnConf::parse(raw),
            Err(ConfError::InvalidValue { key: "ROUTE_TABLE", .. })
        ));
    }

    #[test]
    fn missing_required_keys_are_reported() {
        assert_eq!(
            VpnConf::parse("DEV=\"wg0\"\nROUTE_TABLE=200\nMARK=0xc8\n"),
            Err(ConfError::MissingKey("VPN_PROVIDER"))
        );
    }

    #[test]
    fn ignores_comments_and_unknown_keys() {
        let raw = "# managed by dprewarm\nVPN_PROVIDER=\"external\"\nDEV=\"wg0\"\nROUTE_TABLE=200\nMARK=0xc8\nSOMEDAY=\"maybe\"\n";
        let conf = VpnConf::parse(raw).unwrap();
        assert_eq!(conf.dev, "wg0");
        assert_eq!(conf.mark, 0xc8);
    }
}
