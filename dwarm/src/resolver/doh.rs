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

use super::{normalize_domain, QueryKind, Resolve, ResolveError, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::{
    collections::{BTreeSet, HashMap},
    net::{Ipv4Addr, Ipv6Addr},
    sync::Mutex,
    time::Duration,
};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

const MAX_ERROR_BODY: usize = 256;

// NOERROR and NXDOMAIN per RFC 1035; everything else is a transport error.
const STATUS_NOERROR: u16 = 0;
const STATUS_NXDOMAIN: u16 = 3;

/// DNS-over-HTTPS client speaking the `application/dns-json` dialect,
/// optionally attaching an EDNS Client Subnet hint to every query.
pub struct DohClient {
    url: Url,
    timeout: Duration,
    ecs: Option<String>,
    label: String,
    // One client per interface. Clients cannot be shared across interfaces
    // because the binding is set at client-build time, and pooling is off
    // since connections must not outlive a flapping tunnel.
    clients: Mutex<HashMap<String, Client>>,
}

#[derive(Debug, Deserialize)]
struct DnsJson {
    #[serde(rename = "Status")]
    status: u16,
    #[serde(rename = "Answer", default)]
    answer: Vec<DnsJsonAnswer>,
}

#[derive(Debug, Deserialize)]
struct DnsJsonAnswer {
    #[serde(rename = "type", default)]
    rtype: u16,
    #[serde(default)]
    data: String,
}

impl DohClient {
    /// Create a client for the given endpoint. The URL is validated here so
    /// that a bad endpoint fails worker construction, not the run.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = Url::parse(url).map_err(|_| ResolveError::InvalidUri(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ResolveError::InvalidUri(url.to_string()))?;
        let label = format!("doh:{}", host);
        Ok(Self {
            url: parsed,
            timeout,
            ecs: None,
            label,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Create a client that sends `edns_client_subnet={subnet}` with every
    /// query. `name` only affects the resolver label.
    pub fn with_ecs(url: &str, timeout: Duration, name: &str, subnet: IpNet) -> Result<Self> {
        let mut client = Self::new(url, timeout)?;
        client.label = if name.is_empty() {
            format!("doh-ecs:{}", subnet)
        } else {
            format!("doh-ecs:{}", name)
        };
        client.ecs = Some(subnet.to_string());
        Ok(client)
    }

    fn client_for(&self, interface: &str) -> Result<Client> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(interface) {
            return Ok(client.clone());
        }

        // Connect, TLS, response-header, and overall phases are all bounded
        // by the configured timeout.
        let builder = Client::builder()
            .user_agent(APP_USER_AGENT)
            .connect_timeout(self.timeout)
            .timeout(self.timeout)
            .pool_max_idle_per_host(0);

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        let builder = if interface.is_empty() {
            builder
        } else {
            builder.interface(interface)
        };

        let client = builder.build()?;
        clients.insert(interface.to_string(), client.clone());
        Ok(client)
    }

    async fn query_json(&self, domain: &str, kind: QueryKind, interface: &str) -> Result<DnsJson> {
        let client = self.client_for(interface)?;
        let mut request = client
            .get(self.url.clone())
            .query(&[("name", domain), ("type", kind.as_str())]);
        if let Some(ecs) = &self.ecs {
            request = request.query(&[("edns_client_subnet", ecs.as_str())]);
        }

        let response = request.header("accept", "application/dns-json").send().await?;
        if response.status() != StatusCode::OK {
            let code = response.status().as_u16();
            let body = response.bytes().await.unwrap_or_default();
            let body = String::from_utf8_lossy(&body[..body.len().min(MAX_ERROR_BODY)]).into_owned();
            return Err(ResolveError::FailedHttp { code, body });
        }

        let parsed: DnsJson = response.json().await?;
        if parsed.status != STATUS_NOERROR && parsed.status != STATUS_NXDOMAIN {
            return Err(ResolveError::BadDnsStatus(parsed.status));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl Resolve for DohClient {
    async fn query_a(&self, domain: &str, interface: &str) -> Result<Vec<Ipv4Addr>> {
        let domain = normalize_domain(domain);
        let parsed = self.query_json(&domain, QueryKind::A, interface).await?;
        Ok(filter_a(&parsed))
    }

    async fn query_aaaa(&self, domain: &str, interface: &str) -> Result<Vec<Ipv6Addr>> {
        let domain = normalize_domain(domain);
        let parsed = self.query_json(&domain, QueryKind::Aaaa, interface).await?;
        Ok(filter_aaaa(&parsed))
    }

    async fn query_cname(&self, domain: &str, interface: &str) -> Result<Vec<String>> {
        let domain = normalize_domain(domain);
        let parsed = self.query_json(&domain, QueryKind::Cname, interface).await?;
        Ok(filter_cname(&parsed, &domain))
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// Answers of the wrong type or with an unparsable payload are dropped.
fn filter_a(parsed: &DnsJson) -> Vec<Ipv4Addr> {
    let set: BTreeSet<Ipv4Addr> = parsed
        .answer
        .iter()
        .filter(|a| a.rtype == QueryKind::A.code())
        .filter_map(|a| a.data.parse().ok())
        .collect();
    set.into_iter().collect()
}

fn filter_aaaa(parsed: &DnsJson) -> Vec<Ipv6Addr> {
    let set: BTreeSet<Ipv6Addr> = parsed
        .answer
        .iter()
        .filter(|a| a.rtype == QueryKind::Aaaa.code())
        .filter_map(|a| a.data.parse().ok())
        .collect();
    set.into_iter().collect()
}

fn filter_cname(parsed: &DnsJson, origin: &str) -> Vec<String> {
    let set: BTreeSet<String> = parsed
        .answer
        .iter()
        .filter(|a| a.rtype == QueryKind::Cname.code())
        .map(|a| normalize_domain(&a.data))
        .filter(|t| !t.is_empty() && t != origin)
        .collect();
    set.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(status: u16, answers: &[(u16, &str)]) -> DnsJson {
        DnsJson {
            status,
            answer: answers
                .iter()
                .map(|(rtype, data)| DnsJsonAnswer {
                    rtype: *rtype,
                    data: data.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn filters_by_record_type() {
        let resp = parsed(
            0,
            &[
                (1, "1.1.1.2"),
                (1, "1.1.1.1"),
                (5, "edge.example.com."),
                (28, "2001:db8::1"),
                (1, "not-an-ip"),
            ],
        );
        assert_eq!(
            filter_a(&resp),
            vec!["1.1.1.1".parse::<Ipv4Addr>().unwrap(), "1.1.1.2".parse().unwrap()]
        );
        assert_eq!(filter_aaaa(&resp), vec!["2001:db8::1".parse::<Ipv6Addr>().unwrap()]);
    }

    #[test]
    fn dedupes_answers() {
        let resp = parsed(0, &[(1, "1.1.1.1"), (1, "1.1.1.1")]);
        assert_eq!(filter_a(&resp).len(), 1);
    }

    #[test]
    fn drops_self_referential_cname() {
        let resp = parsed(0, &[(5, "Example.COM."), (5, ""), (5, "edge.example.com")]);
        assert_eq!(filter_cname(&resp, "example.com"), vec!["edge.example.com"]);
    }

    #[test]
    fn json_shape_tolerates_missing_answer() {
        let parsed: DnsJson = serde_json::from_str(r#"{"Status":3}"#).unwrap();
        assert_eq!(parsed.status, 3);
        assert!(parsed.answer.is_empty());
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(DohClient::new("not a url", Duration::from_secs(1)).is_err());
        assert!(DohClient::new("https://1.1.1.1/dns-query", Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn ecs_label_prefers_name() {
        let subnet: IpNet = "31.13.64.0/18".parse().unwrap();
        let c = DohClient::with_ecs("https://1.1.1.1/dns-query", Duration::from_secs(1), "eu", subnet)
            .unwrap();
        assert_eq!(c.label(), "doh-ecs:eu");
    }
}
