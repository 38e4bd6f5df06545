//! End-to-end scenarios against scripted nameservers bound to
//! loopback addresses.  Each scripted nameserver answers the queries
//! it receives, in order, with a canned response built against the
//! incoming id and question.
//!
//! Multi-hop scenarios put each hop on its own 127.0.0.x address,
//! sharing one port, since the engine always queries the configured
//! upstream port.

use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use dns_recursor::config::{CacheConfig, Config};
use dns_recursor::Resolver;
use dns_wire::types::test_util::*;
use dns_wire::types::*;

/// What to send back for the next query received.
enum Script {
    Answer(Vec<ResourceRecord>),
    Referral {
        authority: Vec<ResourceRecord>,
        additional: Vec<ResourceRecord>,
    },
    Nxdomain,
}

/// Bind a scripted nameserver.  Port 0 picks an ephemeral port;
/// multi-hop scenarios re-use that port on other loopback addresses.
async fn scripted_nameserver(ip: Ipv4Addr, port: u16, script: Vec<Script>) -> u16 {
    let socket = UdpSocket::bind((ip, port)).await.unwrap();
    let port = socket.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 512];
        for step in script {
            let (size, peer) = socket.recv_from(&mut buf).await.unwrap();
            let query = Message::from_octets(&buf[..size]).unwrap();

            let mut response = query.make_response();
            response.header.recursion_available = false;
            match step {
                Script::Answer(rrs) => {
                    response.header.is_authoritative = true;
                    response.answers = rrs;
                }
                Script::Referral {
                    authority,
                    additional,
                } => {
                    response.authority = authority;
                    response.additional = additional;
                }
                Script::Nxdomain => {
                    response.header.is_authoritative = true;
                    response.header.rcode = Rcode::NameError;
                }
            }

            let octets = response.into_udp_octets().unwrap();
            socket.send_to(&octets, peer).await.unwrap();
        }
    });

    port
}

fn config_for(port: u16) -> Config {
    Config {
        root_servers: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        upstream_port: port,
        timeout: Duration::from_millis(500),
        max_depth: 8,
        cache: CacheConfig::default(),
    }
}

fn request(id: u16, name: &str, qtype: QueryType) -> Message {
    let mut message = Message::from_question(id, question(name, qtype));
    message.header.recursion_desired = true;
    message
}

fn with_ttl(mut rr: ResourceRecord, ttl: u32) -> ResourceRecord {
    rr.ttl = ttl;
    rr
}

#[tokio::test]
async fn direct_answer() {
    let answer = with_ttl(
        a_record("example.com", Ipv4Addr::new(93, 184, 216, 34)),
        86400,
    );
    let port = scripted_nameserver(
        Ipv4Addr::LOCALHOST,
        0,
        vec![Script::Answer(vec![answer.clone()])],
    )
    .await;

    let resolver = Resolver::new(config_for(port));
    let (metrics, response) = resolver
        .resolve(&request(0x1234, "example.com", QueryType::Record(RecordType::A)))
        .await;

    assert_eq!(0x1234, response.header.id);
    assert!(response.header.is_response);
    assert!(response.header.recursion_available);
    assert!(response.header.recursion_desired);
    assert_eq!(Rcode::NoError, response.header.rcode);
    assert_eq!(vec![answer], response.answers);

    assert!(!metrics.cache_hit);
    assert_eq!(1, metrics.queries_made);
}

#[tokio::test]
async fn referral_chain_with_glue() {
    // root -> TLD -> authoritative, each on its own loopback address
    let tld_ip = Ipv4Addr::new(127, 0, 0, 2);
    let auth_ip = Ipv4Addr::new(127, 0, 0, 3);

    let port = scripted_nameserver(
        Ipv4Addr::LOCALHOST,
        0,
        vec![Script::Referral {
            authority: vec![ns_record("example", "a.example-tld")],
            additional: vec![a_record("a.example-tld", tld_ip)],
        }],
    )
    .await;
    scripted_nameserver(
        tld_ip,
        port,
        vec![Script::Referral {
            authority: vec![ns_record("test.example", "ns1.test.example")],
            additional: vec![a_record("ns1.test.example", auth_ip)],
        }],
    )
    .await;
    scripted_nameserver(
        auth_ip,
        port,
        vec![Script::Answer(vec![a_record(
            "www.test.example",
            Ipv4Addr::new(10, 1, 2, 3),
        )])],
    )
    .await;

    let resolver = Resolver::new(config_for(port));
    let (metrics, response) = resolver
        .resolve(&request(1, "www.test.example", QueryType::Record(RecordType::A)))
        .await;

    assert_eq!(Rcode::NoError, response.header.rcode);
    assert_eq!(
        vec![a_record("www.test.example", Ipv4Addr::new(10, 1, 2, 3))],
        response.answers
    );

    assert_eq!(3, metrics.queries_made);
    assert!(metrics.max_depth_reached >= 2);
}

#[tokio::test]
async fn referral_without_glue_resolves_the_nameserver_name() {
    // the root first refers without glue, then answers the A query
    // for the nameserver's own name; the nameserver answers the
    // original question from its own address
    let auth_ip = Ipv4Addr::new(127, 0, 0, 4);

    let port = scripted_nameserver(
        Ipv4Addr::LOCALHOST,
        0,
        vec![
            Script::Referral {
                authority: vec![ns_record("example", "ns1.example-tld")],
                additional: vec![],
            },
            Script::Answer(vec![a_record("ns1.example-tld", auth_ip)]),
        ],
    )
    .await;
    scripted_nameserver(
        auth_ip,
        port,
        vec![Script::Answer(vec![a_record(
            "www.example",
            Ipv4Addr::new(10, 9, 8, 7),
        )])],
    )
    .await;

    let resolver = Resolver::new(config_for(port));
    let (metrics, response) = resolver
        .resolve(&request(2, "www.example", QueryType::Record(RecordType::A)))
        .await;

    assert_eq!(Rcode::NoError, response.header.rcode);
    assert_eq!(
        vec![a_record("www.example", Ipv4Addr::new(10, 9, 8, 7))],
        response.answers
    );
    assert_eq!(3, metrics.queries_made);
}

#[tokio::test]
async fn cname_follow() {
    // the alias and its target resolve through the same root, with
    // separate walks
    let cname = with_ttl(cname_record("www.example.com", "host.example.net"), 3600);
    let target = a_record("host.example.net", Ipv4Addr::new(198, 51, 100, 7));

    let port = scripted_nameserver(
        Ipv4Addr::LOCALHOST,
        0,
        vec![
            Script::Answer(vec![cname.clone()]),
            Script::Answer(vec![target.clone()]),
        ],
    )
    .await;

    let resolver = Resolver::new(config_for(port));
    let (metrics, response) = resolver
        .resolve(&request(3, "www.example.com", QueryType::Record(RecordType::A)))
        .await;

    assert_eq!(Rcode::NoError, response.header.rcode);
    // the alias comes first, then what it resolved to
    assert_eq!(vec![cname, target], response.answers);
    assert_eq!(2, metrics.queries_made);
    assert!(metrics.max_depth_reached >= 1);
}

#[tokio::test]
async fn cache_hit_on_repeat() {
    let answer = with_ttl(
        a_record("example.com", Ipv4Addr::new(93, 184, 216, 34)),
        86400,
    );
    let port = scripted_nameserver(
        Ipv4Addr::LOCALHOST,
        0,
        vec![Script::Answer(vec![answer.clone()])],
    )
    .await;

    let resolver = Resolver::new(config_for(port));
    let query = request(4, "example.com", QueryType::Record(RecordType::A));

    let (first_metrics, first_response) = resolver.resolve(&query).await;
    assert!(!first_metrics.cache_hit);
    assert_eq!(1, first_metrics.queries_made);

    let (second_metrics, second_response) = resolver.resolve(&query).await;
    assert!(second_metrics.cache_hit);
    assert_eq!(0, second_metrics.queries_made);

    assert_eq!(1, second_response.answers.len());
    let cached = &second_response.answers[0];
    let original = &first_response.answers[0];
    assert_eq!(original.name, cached.name);
    assert_eq!(original.data, cached.data);
    assert!(cached.ttl <= original.ttl);
}

#[tokio::test]
async fn nxdomain_propagates_and_is_not_cached() {
    let port = scripted_nameserver(
        Ipv4Addr::LOCALHOST,
        0,
        vec![Script::Nxdomain, Script::Nxdomain],
    )
    .await;

    let resolver = Resolver::new(config_for(port));
    let query = request(5, "no-such.example.com", QueryType::Record(RecordType::A));

    let (first_metrics, response) = resolver.resolve(&query).await;
    assert_eq!(Rcode::NameError, response.header.rcode);
    assert!(response.answers.is_empty());
    assert_eq!(1, first_metrics.queries_made);

    // a second resolution goes upstream again
    let (second_metrics, response) = resolver.resolve(&query).await;
    assert_eq!(Rcode::NameError, response.header.rcode);
    assert!(!second_metrics.cache_hit);
    assert_eq!(1, second_metrics.queries_made);
}

#[tokio::test]
async fn all_upstreams_down_is_servfail() {
    // bound, but never answers
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = silent.local_addr().unwrap().port();

    let config = Config {
        timeout: Duration::from_millis(100),
        max_depth: 4,
        ..config_for(port)
    };
    let resolver = Resolver::new(config.clone());

    let started = Instant::now();
    let (metrics, response) = resolver
        .resolve(&request(6, "example.com", QueryType::Record(RecordType::A)))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(Rcode::ServerFailure, response.header.rcode);
    assert!(response.answers.is_empty());
    assert!(metrics.queries_made > 0);

    // bounded by max_depth * timeout, with generous slack for CI
    assert!(elapsed < config.overall_deadline() + Duration::from_secs(1));

    drop(silent);
}

#[tokio::test]
async fn runaway_alias_chain_is_servfail() {
    // every query is answered with yet another alias
    let script = (0..10)
        .map(|i| {
            Script::Answer(vec![cname_record(
                &format!("host{i}.example.com"),
                &format!("host{}.example.com", i + 1),
            )])
        })
        .collect();
    let port = scripted_nameserver(Ipv4Addr::LOCALHOST, 0, script).await;

    let config = Config {
        max_depth: 4,
        ..config_for(port)
    };
    let resolver = Resolver::new(config);

    let (metrics, response) = resolver
        .resolve(&request(7, "host0.example.com", QueryType::Record(RecordType::A)))
        .await;

    assert_eq!(Rcode::ServerFailure, response.header.rcode);
    assert!(response.answers.is_empty());
    assert!(metrics.max_depth_reached >= 4);
}

#[tokio::test]
async fn handle_answers_raw_octets() {
    let answer = with_ttl(
        a_record("example.com", Ipv4Addr::new(93, 184, 216, 34)),
        86400,
    );
    let port = scripted_nameserver(
        Ipv4Addr::LOCALHOST,
        0,
        vec![Script::Answer(vec![answer.clone()])],
    )
    .await;

    let resolver = Resolver::new(config_for(port));
    let query = request(0x4242, "example.com", QueryType::Record(RecordType::A));

    let response_octets = resolver
        .handle(&query.into_octets().unwrap())
        .await
        .unwrap();
    let response = Message::from_octets(&response_octets).unwrap();

    assert_eq!(0x4242, response.header.id);
    assert_eq!(Rcode::NoError, response.header.rcode);
    assert_eq!(vec![answer], response.answers);
}

#[tokio::test]
async fn handle_rejects_questionless_requests() {
    let resolver = Resolver::new(config_for(1));

    let query = Message::from_question(9, question("example.com", QueryType::Record(RecordType::A)));
    let mut questionless = query;
    questionless.questions.clear();

    let response_octets = resolver
        .handle(&questionless.into_octets().unwrap())
        .await
        .unwrap();
    let response = Message::from_octets(&response_octets).unwrap();

    assert_eq!(Rcode::FormatError, response.header.rcode);
    assert_eq!(9, response.header.id);
}

#[tokio::test]
async fn handle_drops_unreadable_datagrams() {
    let resolver = Resolver::new(config_for(1));

    assert_eq!(None, resolver.handle(&[0x12]).await);
}
