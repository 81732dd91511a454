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

use dwarm::{
    mock::HttpJsonServer,
    resolver::{DohClient, Resolve, ResolveError},
};
use std::time::Duration;

#[tokio::test]
async fn doh_parses_answers_over_the_wire() {
    let body = r#"{"Status":0,"Answer":[
        {"name":"max.com.","type":1,"TTL":60,"data":"1.1.1.2"},
        {"name":"max.com.","type":1,"TTL":60,"data":"1.1.1.1"},
        {"name":"max.com.","type":5,"TTL":60,"data":"edge.max.com."}
    ]}"#;
    let server = HttpJsonServer::spawn(body.to_string()).await;
    let client = DohClient::new(&server.url(), Duration::from_secs(2)).unwrap();

    let addrs = client.query_a("Max.COM.", "").await.unwrap();
    assert_eq!(
        addrs.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
        vec!["1.1.1.1", "1.1.1.2"]
    );

    let cnames = client.query_cname("max.com", "").await.unwrap();
    assert_eq!(cnames, vec!["edge.max.com"]);
}

#[tokio::test]
async fn doh_nxdomain_is_an_empty_list() {
    let server = HttpJsonServer::spawn(r#"{"Status":3,"Answer":[]}"#.to_string()).await;
    let client = DohClient::new(&server.url(), Duration::from_secs(2)).unwrap();
    assert!(client.query_a("absent.example.com", "").await.unwrap().is_empty());
    assert!(client.query_aaaa("absent.example.com", "").await.unwrap().is_empty());
}

#[tokio::test]
async fn doh_unexpected_status_is_an_error() {
    let server = HttpJsonServer::spawn(r#"{"Status":2,"Answer":[]}"#.to_string()).await;
    let client = DohClient::new(&server.url(), Duration::from_secs(2)).unwrap();
    assert!(matches!(
        client.query_a("max.com", "").await,
        Err(ResolveError::BadDnsStatus(2))
    ));
}
