//! DNS resolver/proxy integration tests
//!
//! Upstream resolvers are plain UDP sockets owned by the test, so every
//! packet the proxy forwards can be observed and answered by hand.

mod common;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::time::timeout;

use et_core::config::PersistedState;

use common::{hostname_service, identity_record, FakeNetwork, HarnessBuilder};

const QUIET: Duration = Duration::from_millis(300);

fn query(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
    message.to_vec().unwrap()
}

fn answer(request: &[u8], ip: Ipv4Addr) -> Vec<u8> {
    let request = Message::from_vec(request).unwrap();
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_available(true);
    let question = request.queries()[0].clone();
    reply.add_answer(Record::from_rdata(question.name().clone(), 300, RData::A(A(ip))));
    reply.add_query(question);
    reply.to_vec().unwrap()
}

async fn upstream() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 4096];
    let (len, peer) = timeout(common::READ_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("timed out waiting for a packet")
        .unwrap();
    buf.truncate(len);
    (buf, peer)
}

async fn nothing_arrives(socket: &UdpSocket) -> bool {
    let mut buf = vec![0u8; 4096];
    timeout(QUIET, socket.recv_from(&mut buf)).await.is_err()
}

fn intercepting_state() -> PersistedState {
    PersistedState {
        identities: vec![identity_record("laptop", "f1", true)],
        ..PersistedState::default()
    }
}

#[tokio::test]
async fn test_intercepted_name_answered_locally() {
    let (upstream, upstream_addr) = upstream().await;
    let harness = HarnessBuilder::new()
        .state(intercepting_state())
        .services("f1", vec![hostname_service("s1", "wiki.corp.test", "100.64.0.2")])
        .upstreams(vec![upstream_addr])
        .start()
        .await;
    let dns = harness.service.dns_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client.send_to(&query(7, "wiki.corp.test.", RecordType::A), dns).await.unwrap();
    let (reply, _) = recv(&client).await;
    let reply = Message::from_vec(&reply).unwrap();

    assert_eq!(reply.id(), 7);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(reply.authoritative());
    assert_eq!(reply.answers().len(), 1);
    assert_eq!(reply.answers()[0].ttl(), 60);
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::new(100, 64, 0, 2))))
    );

    // intercepted names are refused rather than proxied for other types
    client.send_to(&query(8, "wiki.corp.test.", RecordType::MX), dns).await.unwrap();
    let (reply, _) = recv(&client).await;
    let reply = Message::from_vec(&reply).unwrap();
    assert_eq!(reply.response_code(), ResponseCode::Refused);
    assert!(reply.answers().is_empty());

    assert!(nothing_arrives(&upstream).await);

    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_connection_suffix_is_stripped() {
    let harness = HarnessBuilder::new()
        .state(intercepting_state())
        .services("f1", vec![hostname_service("s1", "wiki", "100.64.0.3")])
        .network(FakeNetwork::with_domains(&["corp.example"]))
        .start()
        .await;
    let dns = harness.service.dns_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    client.send_to(&query(9, "wiki.corp.example.", RecordType::A), dns).await.unwrap();
    let (reply, _) = recv(&client).await;
    let reply = Message::from_vec(&reply).unwrap();
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A(Ipv4Addr::new(100, 64, 0, 3))))
    );

    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_other_names_proxied_to_every_upstream() {
    let (first, first_addr) = upstream().await;
    let (second, second_addr) = upstream().await;
    let harness = HarnessBuilder::new()
        .upstreams(vec![first_addr, second_addr])
        .start()
        .await;
    let dns = harness.service.dns_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let request = query(0x2a, "example.org.", RecordType::A);
    client.send_to(&request, dns).await.unwrap();

    let (at_first, first_peer) = recv(&first).await;
    let (at_second, second_peer) = recv(&second).await;
    assert_eq!(at_first, request);
    assert_eq!(at_second, request);

    let response = answer(&request, Ipv4Addr::new(93, 184, 216, 34));
    first.send_to(&response, first_peer).await.unwrap();
    let (relayed, _) = recv(&client).await;
    assert_eq!(relayed, response);

    // a duplicate from the slower upstream finds no pending entry
    second.send_to(&response, second_peer).await.unwrap();
    assert!(nothing_arrives(&client).await);

    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_expired_query_is_never_relayed() {
    let (upstream, upstream_addr) = upstream().await;
    let harness = HarnessBuilder::new()
        .config(|config| {
            config.proxy_timeout = Duration::from_millis(50);
            config.sweep_interval = Duration::from_millis(50);
        })
        .upstreams(vec![upstream_addr])
        .start()
        .await;
    let dns = harness.service.dns_addrs()[0];
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let request = query(0x51, "late.example.org.", RecordType::A);
    client.send_to(&request, dns).await.unwrap();
    let (forwarded, peer) = recv(&upstream).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    upstream
        .send_to(&answer(&forwarded, Ipv4Addr::new(10, 1, 1, 1)), peer)
        .await
        .unwrap();
    assert!(nothing_arrives(&client).await);

    harness.service.shutdown().await;
}

#[tokio::test]
async fn test_resolvers_installed_and_reset() {
    let harness = HarnessBuilder::new().start().await;
    let network = std::sync::Arc::clone(&harness.network);
    assert_eq!(network.calls(), vec!["set [127.0.0.1]".to_string()]);

    harness.service.shutdown().await;
    assert_eq!(
        network.calls(),
        vec!["set [127.0.0.1]".to_string(), "reset".to_string()]
    );
}
