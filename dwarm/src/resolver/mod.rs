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

//! Resolver clients used by the pre-warm worker.
//!
//! Two concrete client shapes share the [`Resolve`] capability: a
//! DNS-over-HTTPS client speaking the `application/dns-json` dialect
//! ([`doh::DohClient`]) and a plain UDP/53 client pinned to a single
//! recursive nameserver ([`udp::NsClient`]). Both return deduplicated,
//! sorted answer lists and treat NXDOMAIN as an empty answer set.

/// DNS-over-HTTPS (JSON mode) client.
pub mod doh;
/// Plain UDP/53 client bound to one recursive nameserver.
pub mod udp;

pub use doh::DohClient;
pub use udp::NsClient;

use async_trait::async_trait;
use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    time::Duration,
};
use thiserror::Error;

/// Shorthand for resolver call results.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errors surfaced by resolver clients.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Transport-level HTTP failure from the DoH path.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The DoH endpoint answered with a non-200 HTTP status.
    #[error("unsuccessful HTTP code {code}: {body}")]
    FailedHttp {
        /// HTTP status code.
        code: u16,
        /// At most 256 bytes of the response body.
        body: String,
    },

    /// The DoH endpoint reported a DNS status other than NOERROR/NXDOMAIN.
    #[error("upstream reported DNS status {0}")]
    BadDnsStatus(u16),

    /// The nameserver answered with a non-NOERROR/NXDOMAIN response code.
    #[error("nameserver answered {0}")]
    BadRcode(String),

    /// DNS wire-format error.
    #[error(transparent)]
    Proto(#[from] hickory_proto::ProtoError),

    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The query exceeded the configured per-attempt timeout.
    #[error("query timed out after {0:?}")]
    TimedOut(Duration),

    /// The base URL is not a valid HTTP(S) URL.
    #[error("the URL '{0}' is invalid")]
    InvalidUri(String),

    /// The surrounding run was canceled while the query was in flight.
    /// Never reported through the error callback.
    #[error("query canceled")]
    Canceled,
}

impl ResolveError {
    /// Whether this error is a cancellation rather than a real failure.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Pipeline stage a resolver failure was observed in. Attached to error
/// reports alongside domain, interface, and resolver label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    /// CNAME chasing for the task's base domain.
    Cname,
    /// IPv4 address lookup.
    A,
    /// IPv6 address lookup.
    Aaaa,
    /// Wildcard subdomain discovery.
    WildcardDiscovery,
}

impl fmt::Display for QueryStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cname => "cname",
            Self::A => "a",
            Self::Aaaa => "aaaa",
            Self::WildcardDiscovery => "wildcard-discovery",
        })
    }
}

/// Record types the engine queries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// IPv4 host address.
    A,
    /// IPv6 host address.
    Aaaa,
    /// Canonical name.
    Cname,
}

impl QueryKind {
    /// Numeric record-type code on the wire and in DoH-JSON answers.
    pub fn code(self) -> u16 {
        match self {
            Self::A => 1,
            Self::Cname => 5,
            Self::Aaaa => 28,
        }
    }

    /// Textual form used in DoH query strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
        }
    }
}

/// The three-query capability the worker drives.
///
/// `interface` selects the egress path: on Linux the underlying socket is
/// bound to it with `SO_BINDTODEVICE`. On other platforms the argument is
/// advisory and may be ignored. An empty string disables binding.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Look up IPv4 addresses. NXDOMAIN yields an empty list.
    async fn query_a(&self, domain: &str, interface: &str) -> Result<Vec<Ipv4Addr>>;

    /// Look up IPv6 addresses. NXDOMAIN yields an empty list.
    async fn query_aaaa(&self, domain: &str, interface: &str) -> Result<Vec<Ipv6Addr>>;

    /// Look up CNAME targets, normalized; empty and self-referential
    /// targets are dropped.
    async fn query_cname(&self, domain: &str, interface: &str) -> Result<Vec<String>>;

    /// Human-readable label for error reports, built at construction.
    fn label(&self) -> &str;
}

/// Canonicalize a domain for querying: lowercase, no `*.` prefix, no
/// trailing dot.
pub fn normalize_domain(raw: &str) -> String {
    let d = raw.trim().to_ascii_lowercase();
    let d = d.strip_prefix("*.").unwrap_or(&d);
    d.strip_suffix('.').unwrap_or(d).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_domains() {
        assert_eq!(normalize_domain("Example.COM."), "example.com");
        assert_eq!(normalize_domain("*.Example.com"), "example.com");
        assert_eq!(normalize_domain("  edge.example.com.  "), "edge.example.com");
        assert_eq!(normalize_domain(""), "");
    }

    #[test]
    fn stage_labels() {
        assert_eq!(QueryStage::Cname.to_string(), "cname");
        assert_eq!(QueryStage::WildcardDiscovery.to_string(), "wildcard-discovery");
    }

    #[test]
    fn kind_codes() {
        assert_eq!(QueryKind::A.code(), 1);
        assert_eq!(QueryKind::Cname.code(), 5);
        assert_eq!(QueryKind::Aaaa.code(), 28);
    }
}
