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

//! Wildcard-domain expansion.
//!
//! `*.base` patterns are expanded into a best-effort list of known
//! hostnames under `base` before resolution. The default backend queries
//! the crt.sh certificate-transparency search service; any source that
//! returns a (possibly empty) subdomain list can stand in through
//! [`WildcardExpand`].

use crate::resolver::normalize_domain;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::{collections::BTreeSet, time::Duration};
use thiserror::Error;

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const DEFAULT_ENDPOINT: &str = "https://crt.sh/";

/// Errors from subdomain discovery. Reported through the worker's error
/// callback with the `wildcard-discovery` stage; the task then proceeds
/// with the literal base only.
#[derive(Debug, Error)]
pub enum WildcardError {
    /// Transport-level HTTP failure.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The discovery endpoint answered with a non-200 status.
    #[error("unsuccessful HTTP code {0}")]
    FailedHttp(u16),

    /// The endpoint base URL is invalid.
    #[error("the URL '{0}' is invalid")]
    InvalidUri(String),
}

/// Best-effort subdomain discovery for `*.base` patterns.
#[async_trait]
pub trait WildcardExpand: Send + Sync {
    /// Return known hostnames under `base`, normalized and deduplicated.
    async fn subdomains(&self, base: &str) -> Result<Vec<String>, WildcardError>;
}

/// Subdomain discovery backed by the crt.sh certificate-transparency
/// search service (`?q=%.{base}&output=json`).
pub struct CrtShClient {
    endpoint: Url,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct CrtShEntry {
    #[serde(default)]
    name_value: String,
}

impl CrtShClient {
    /// Create a client against the public crt.sh endpoint.
    pub fn new(timeout: Duration) -> Result<Self, WildcardError> {
        Self::with_endpoint(DEFAULT_ENDPOINT, timeout)
    }

    /// Create a client against a custom endpoint (used by tests and
    /// self-hosted mirrors).
    pub fn with_endpoint(endpoint: &str, timeout: Duration) -> Result<Self, WildcardError> {
        let endpoint =
            Url::parse(endpoint).map_err(|_| WildcardError::InvalidUri(endpoint.to_string()))?;
        let client = Client::builder()
            .user_agent(APP_USER_AGENT)
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { endpoint, client })
    }
}

#[async_trait]
impl WildcardExpand for CrtShClient {
    async fn subdomains(&self, base: &str) -> Result<Vec<String>, WildcardError> {
        let base = normalize_domain(base);
        let response = self
            .client
            .get(self.endpoint.clone())
            .query(&[("q", format!("%.{}", base).as_str()), ("output", "json")])
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(WildcardError::FailedHttp(response.status().as_u16()));
        }
        let entries: Vec<CrtShEntry> = response.json().await?;
        Ok(hosts_under(&base, &entries))
    }
}

// Certificate subjects come back as newline-separated blocks and may name
// hosts outside the queried zone; keep only proper subdomains of `base`.
fn hosts_under(base: &str, entries: &[CrtShEntry]) -> Vec<String> {
    let suffix = format!(".{}", base);
    let set: BTreeSet<String> = entries
        .iter()
        .flat_map(|entry| entry.name_value.lines())
        .map(normalize_domain)
        .filter(|host| !host.is_empty() && host.ends_with(&suffix))
        .collect();
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name_value: &str) -> CrtShEntry {
        CrtShEntry {
            name_value: name_value.to_string(),
        }
    }

    #[test]
    fn splits_blocks_and_normalizes() {
        let entries = vec![
            entry("Maps.Google.com\n*.google.com"),
            entry("mail.google.com."),
            entry("ipv6.google.com"),
        ];
        assert_eq!(
            hosts_under("google.com", &entries),
            vec!["ipv6.google.com", "mail.google.com", "maps.google.com"]
        );
    }

    #[test]
    fn drops_hosts_outside_the_zone() {
        let entries = vec![entry("evil.example.org\nwww.google.com\ngoogle.com")];
        assert_eq!(hosts_under("google.com", &entries), vec!["www.google.com"]);
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(hosts_under("google.com", &[]).is_empty());
    }
}
