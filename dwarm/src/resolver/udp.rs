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

use super::{normalize_domain, Resolve, ResolveError, Result};
use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, Query, ResponseCode},
    rr::{Name, RData, RecordType},
};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    collections::BTreeSet,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};
use tokio::net::UdpSocket;

const DNS_PORT: u16 = 53;
const RECV_BUF: usize = 4096;

/// UDP/53 client resolving against exactly one recursive nameserver,
/// bypassing the OS resolver chain entirely.
pub struct NsClient {
    server: SocketAddr,
    timeout: Duration,
    label: String,
}

impl NsClient {
    /// Create a client for the given recursive server address.
    pub fn new(addr: IpAddr, timeout: Duration) -> Self {
        Self {
            server: SocketAddr::new(addr, DNS_PORT),
            timeout,
            label: format!("ns:{}", addr),
        }
    }

    /// Bind a fresh socket for one exchange, optionally pinned to an
    /// interface. A fresh socket per query gives a fresh source port.
    fn bind_socket(&self, interface: &str) -> std::io::Result<Socket> {
        let domain = if self.server.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        if !interface.is_empty() {
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            socket.bind_device(Some(interface.as_bytes()))?;
        }
        let local: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        socket.bind(&local.into())?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    async fn exchange(
        &self,
        domain: &str,
        rtype: RecordType,
        interface: &str,
    ) -> Result<Message> {
        let mut name = Name::from_ascii(domain)?;
        name.set_fqdn(true);

        let id: u16 = rand::random();
        let mut query = Message::new();
        query.set_id(id);
        query.set_recursion_desired(true);
        query.add_query(Query::query(name, rtype));
        let wire = query.to_vec()?;

        let socket = UdpSocket::from_std(self.bind_socket(interface)?.into())?;
        socket.connect(self.server).await?;

        let exchange = async {
            socket.send(&wire).await?;
            // Ignore garbage and unrelated datagrams until the timer fires.
            loop {
                let mut buf = vec![0u8; RECV_BUF];
                let len = socket.recv(&mut buf).await?;
                buf.truncate(len);
                let answer = match Message::from_vec(&buf) {
                    Ok(answer) => answer,
                    Err(_) => continue,
                };
                if answer.id() != id || answer.message_type() != MessageType::Response {
                    continue;
                }
                return Ok(answer);
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(answer) => answer,
            Err(_) => Err(ResolveError::TimedOut(self.timeout)),
        }
    }

    /// Run one query and hand the answer section to `collect` unless the
    /// server reported NXDOMAIN, which yields an empty list.
    async fn lookup<T: Ord>(
        &self,
        domain: &str,
        rtype: RecordType,
        interface: &str,
        collect: impl Fn(&Message) -> BTreeSet<T>,
    ) -> Result<Vec<T>> {
        let domain = normalize_domain(domain);
        let answer = self.exchange(&domain, rtype, interface).await?;
        match answer.response_code() {
            ResponseCode::NoError => Ok(collect(&answer).into_iter().collect()),
            ResponseCode::NXDomain => Ok(Vec::new()),
            rcode => Err(ResolveError::BadRcode(rcode.to_string())),
        }
    }
}

#[async_trait]
impl Resolve for NsClient {
    async fn query_a(&self, domain: &str, interface: &str) -> Result<Vec<Ipv4Addr>> {
        self.lookup(domain, RecordType::A, interface, |answer| {
            // Mixed-family and non-address records are filtered out.
            answer
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    RData::A(a) => Some(**a),
                    _ => None,
                })
                .collect()
        })
        .await
    }

    async fn query_aaaa(&self, domain: &str, interface: &str) -> Result<Vec<Ipv6Addr>> {
        self.lookup(domain, RecordType::AAAA, interface, |answer| {
            answer
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    RData::AAAA(quad) => Some(**quad),
                    _ => None,
                })
                .collect()
        })
        .await
    }

    async fn query_cname(&self, domain: &str, interface: &str) -> Result<Vec<String>> {
        let origin = normalize_domain(domain);
        let targets = self
            .lookup(domain, RecordType::CNAME, interface, |answer| {
                answer
                    .answers()
                    .iter()
                    .filter_map(|record| match record.data() {
                        RData::CNAME(target) => Some(normalize_domain(&target.0.to_utf8())),
                        _ => None,
                    })
                    .collect()
            })
            .await?;
        Ok(targets
            .into_iter()
            .filter(|t| !t.is_empty() && *t != origin)
            .collect())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::DnsEchoServer;
    use hickory_proto::rr::rdata;

    fn record(name: &str, data: RData) -> hickory_proto::rr::Record {
        hickory_proto::rr::Record::from_rdata(Name::from_ascii(name).unwrap(), 60, data)
    }

    #[tokio::test]
    async fn returns_sorted_v4_answers_and_filters_family() {
        let server = DnsEchoServer::spawn(
            ResponseCode::NoError,
            vec![
                record("max.com.", RData::A(rdata::A("1.1.1.2".parse().unwrap()))),
                record("max.com.", RData::A(rdata::A("1.1.1.1".parse().unwrap()))),
                record("max.com.", RData::AAAA(rdata::AAAA("2001:db8::1".parse().unwrap()))),
            ],
        )
        .await;

        let client = NsClient::new(server.addr().ip(), Duration::from_secs(2));
        // Port rewrite for the test server.
        let client = NsClient {
            server: server.addr(),
            ..client
        };
        let got = client.query_a("Max.COM.", "").await.unwrap();
        assert_eq!(
            got,
            vec!["1.1.1.1".parse::<Ipv4Addr>().unwrap(), "1.1.1.2".parse().unwrap()]
        );
    }

    #[tokio::test]
    async fn nxdomain_is_empty_not_error() {
        let server = DnsEchoServer::spawn(ResponseCode::NXDomain, vec![]).await;
        let client = NsClient {
            server: server.addr(),
            timeout: Duration::from_secs(2),
            label: "ns:test".into(),
        };
        assert!(client.query_a("absent.example.com", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn servfail_is_an_error() {
        let server = DnsEchoServer::spawn(ResponseCode::ServFail, vec![]).await;
        let client = NsClient {
            server: server.addr(),
            timeout: Duration::from_secs(2),
            label: "ns:test".into(),
        };
        assert!(matches!(
            client.query_a("max.com", "").await,
            Err(ResolveError::BadRcode(_))
        ));
    }

    #[tokio::test]
    async fn cname_drops_self_reference() {
        let server = DnsEchoServer::spawn(
            ResponseCode::NoError,
            vec![
                record(
                    "max.com.",
                    RData::CNAME(rdata::CNAME(Name::from_ascii("max.com.").unwrap())),
                ),
                record(
                    "max.com.",
                    RData::CNAME(rdata::CNAME(Name::from_ascii("edge.max.com.").unwrap())),
                ),
            ],
        )
        .await;
        let client = NsClient {
            server: server.addr(),
            timeout: Duration::from_secs(2),
            label: "ns:test".into(),
        };
        assert_eq!(client.query_cname("max.com", "").await.unwrap(), vec!["edge.max.com"]);
    }
}
