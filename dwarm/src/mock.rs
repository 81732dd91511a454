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

//! This module is NOT intended to be used by regular users. It is used
//! for mocking purpose only.

use crate::{
    cache::{CacheError, CacheSink, CacheSnapshot},
    ifaces::{InterfaceList, InterfaceProbe},
    ipset::{IpsetError, IpsetOps},
    resolver::{Resolve, ResolveError, Result},
    wildcard::{WildcardError, WildcardExpand},
};
use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Record;
use std::{
    collections::{HashMap, HashSet},
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Mutex,
    time::Duration,
};
use tokio::{net::UdpSocket, task::JoinHandle};

/// Interface probe answering from a fixed set of up interfaces.
pub struct StaticProbe {
    up: HashSet<String>,
}

impl StaticProbe {
    /// Probe reporting exactly `names` as up.
    pub fn up(names: &[&str]) -> Self {
        Self {
            up: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl InterfaceProbe for StaticProbe {
    fn is_up(&self, name: &str) -> bool {
        self.up.contains(name)
    }
}

/// Interface lister answering a fixed name list.
pub struct StaticLister {
    names: Vec<String>,
}

impl StaticLister {
    /// Lister reporting exactly `names`.
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl InterfaceList for StaticLister {
    fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.names.clone())
    }
}

/// Resolver answering from scripted `(domain, interface)` tables.
/// Unscripted queries answer empty, like NXDOMAIN.
#[derive(Default)]
pub struct ScriptedResolver {
    label: String,
    a: HashMap<(String, String), Vec<Ipv4Addr>>,
    aaaa: HashMap<(String, String), Vec<Ipv6Addr>>,
    cname: HashMap<(String, String), Vec<String>>,
    fail: HashSet<(String, String)>,
    delay: Option<Duration>,
}

impl ScriptedResolver {
    /// Empty script with the given label.
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            ..Self::default()
        }
    }

    /// Script A answers for `(domain, interface)`.
    pub fn a(mut self, domain: &str, interface: &str, addrs: &[&str]) -> Self {
        self.a.insert(
            (domain.to_string(), interface.to_string()),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }

    /// Script AAAA answers.
    pub fn aaaa(mut self, domain: &str, interface: &str, addrs: &[&str]) -> Self {
        self.aaaa.insert(
            (domain.to_string(), interface.to_string()),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }

    /// Script CNAME answers.
    pub fn cname(mut self, domain: &str, interface: &str, targets: &[&str]) -> Self {
        self.cname.insert(
            (domain.to_string(), interface.to_string()),
            targets.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    /// Make every query for `(domain, interface)` fail.
    pub fn fail(mut self, domain: &str, interface: &str) -> Self {
        self.fail.insert((domain.to_string(), interface.to_string()));
        self
    }

    /// Sleep before answering each query. Used by cancellation tests.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn gate(&self, domain: &str, interface: &str) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.contains(&(domain.to_string(), interface.to_string())) {
            return Err(ResolveError::BadRcode("scripted failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Resolve for ScriptedResolver {
    async fn query_a(&self, domain: &str, interface: &str) -> Result<Vec<Ipv4Addr>> {
        self.gate(domain, interface).await?;
        let mut addrs = self
            .a
            .get(&(domain.to_string(), interface.to_string()))
            .cloned()
            .unwrap_or_default();
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }

    async fn query_aaaa(&self, domain: &str, interface: &str) -> Result<Vec<Ipv6Addr>> {
        self.gate(domain, interface).await?;
        let mut addrs = self
            .aaaa
            .get(&(domain.to_string(), interface.to_string()))
            .cloned()
            .unwrap_or_default();
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }

    async fn query_cname(&self, domain: &str, interface: &str) -> Result<Vec<String>> {
        self.gate(domain, interface).await?;
        Ok(self
            .cname
            .get(&(domain.to_string(), interface.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Wildcard source answering from a scripted table.
#[derive(Default)]
pub struct StaticWildcard {
    subdomains: HashMap<String, Vec<String>>,
    fail: HashSet<String>,
}

impl StaticWildcard {
    /// Empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script subdomains for `base`.
    pub fn base(mut self, base: &str, subdomains: &[&str]) -> Self {
        self.subdomains.insert(
            base.to_string(),
            subdomains.iter().map(|s| s.to_string()).collect(),
        );
        self
    }

    /// Make discovery for `base` fail.
    pub fn fail(mut self, base: &str) -> Self {
        self.fail.insert(base.to_string());
        self
    }
}

#[async_trait]
impl WildcardExpand for StaticWildcard {
    async fn subdomains(&self, base: &str) -> std::result::Result<Vec<String>, WildcardError> {
        if self.fail.contains(base) {
            return Err(WildcardError::FailedHttp(503));
        }
        Ok(self.subdomains.get(base).cloned().unwrap_or_default())
    }
}

/// IP-set operator recording every insertion, optionally failing on one
/// set name.
#[derive(Default)]
pub struct RecordingIpset {
    entries: Mutex<Vec<(String, IpAddr, u32)>>,
    fail_set: Option<String>,
}

impl RecordingIpset {
    /// Operator that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operator that fails any insertion into `set`.
    pub fn failing_on(set: &str) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            fail_set: Some(set.to_string()),
        }
    }

    /// All recorded insertions, in order.
    pub fn entries(&self) -> Vec<(String, IpAddr, u32)> {
        self.entries.lock().unwrap().clone()
    }

    /// Recorded addresses for one set.
    pub fn addrs_in(&self, set: &str) -> Vec<IpAddr> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == set)
            .map(|(_, addr, _)| *addr)
            .collect()
    }
}

#[async_trait]
impl IpsetOps for RecordingIpset {
    async fn add(&self, set: &str, addr: IpAddr, expiry_secs: u32) -> std::result::Result<(), IpsetError> {
        if self.fail_set.as_deref() == Some(set) {
            return Err(IpsetError::new(set, "scripted ipset failure"));
        }
        self.entries
            .lock()
            .unwrap()
            .push((set.to_string(), addr, expiry_secs));
        Ok(())
    }
}

/// Cache sink that fails every call.
pub struct FailingSink;

impl CacheSink for FailingSink {
    fn replace(&self, _snapshot: &CacheSnapshot) -> std::result::Result<(), CacheError> {
        Err(CacheError("scripted sink failure".into()))
    }

    fn clear(&self) -> std::result::Result<(), CacheError> {
        Err(CacheError("scripted sink failure".into()))
    }
}

/// Mock UDP nameserver answering every query with a canned response code
/// and answer section.
pub struct DnsEchoServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl DnsEchoServer {
    /// Bind on a random local port and start answering.
    pub async fn spawn(rcode: ResponseCode, answers: Vec<Record>) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                let (len, peer) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => break,
                };
                let query = match Message::from_vec(&buf[..len]) {
                    Ok(query) => query,
                    Err(_) => continue,
                };
                let mut response = Message::new();
                response.set_id(query.id());
                response.set_message_type(MessageType::Response);
                response.set_response_code(rcode);
                if let Some(question) = query.queries().first() {
                    response.add_query(question.clone());
                }
                for answer in &answers {
                    response.add_answer(answer.clone());
                }
                if let Ok(wire) = response.to_vec() {
                    let _ = socket.send_to(&wire, peer).await;
                }
            }
        });
        Self { addr, handle }
    }

    /// The server's bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for DnsEchoServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Minimal HTTP/1.1 responder returning one canned JSON body to every
/// request. Enough for exercising the DoH client against localhost.
pub struct HttpJsonServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl HttpJsonServer {
    /// Bind on a random local port and serve `body` forever.
    pub async fn spawn(body: String) -> Self {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let body = body.clone();
                tokio::spawn(async move {
                    // Read until the end of the request head; the clients
                    // under test never send bodies.
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0;
                    loop {
                        match stream.read(&mut buf[read..]).await {
                            Ok(0) => return,
                            Ok(n) => read += n,
                            Err(_) => return,
                        }
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if read == buf.len() {
                            return;
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/dns-json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        Self { addr, handle }
    }

    /// Base URL for a [`crate::resolver::DohClient`] against this server.
    pub fn url(&self) -> String {
        format!("http://{}/dns-query", self.addr)
    }
}

impl Drop for HttpJsonServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
