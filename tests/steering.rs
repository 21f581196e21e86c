//! End-to-end steering flow
//!
//! Drives a real UDP MITM listener against an in-process upstream stub
//! and checks that observed answers end up as IP-set membership through
//! the group engine, with the recording command runner standing in for
//! the kernel control planes.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use magitrickle::config::{GroupConfig, GroupId, RuleConfig, RuleId, RuleType};
use magitrickle::dns::{listen_udp, DnsMitmProxy, UpstreamResolver};
use magitrickle::{fake_ptr_hook, Engine, Group, NetfilterHelper, Records, RecordingRunner};

fn steering_group(pattern: &str) -> GroupConfig {
    GroupConfig {
        id: GroupId(0x2a),
        name: "steering".into(),
        interface: "wg0".into(),
        fix_protect: false,
        rules: vec![RuleConfig {
            id: RuleId(1),
            name: "match".into(),
            rule_type: RuleType::Suffix,
            pattern: pattern.into(),
            enable: true,
        }],
    }
}

/// Upstream stub answering every A query with a fixed address
async fn spawn_upstream(address: [u8; 4], ttl: u32) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Ok(request) = Message::from_bytes(&buf[..len]) else {
                continue;
            };
            let mut response = Message::new();
            response.set_id(request.id());
            response.set_message_type(MessageType::Response);
            response.add_queries(request.queries().to_vec());
            if let Some(query) = request.queries().first() {
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    ttl,
                    RData::A(A::from(std::net::Ipv4Addr::from(address))),
                ));
            }
            let _ = socket
                .send_to(&response.to_vec().unwrap(), from)
                .await;
        }
    });

    addr
}

async fn free_udp_addr() -> SocketAddr {
    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap()
}

/// Wait until the runner recorded a call with the given prefix
async fn wait_for_call(runner: &RecordingRunner, prefix: &str) -> Option<String> {
    for _ in 0..100 {
        if let Some(call) = runner.calls_matching(prefix).into_iter().next() {
            return Some(call);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}

#[tokio::test]
async fn test_observed_answer_lands_in_ipset() {
    let runner = Arc::new(RecordingRunner::new());
    let helper = Arc::new(NetfilterHelper::new(
        Arc::clone(&runner) as Arc<dyn magitrickle::CommandRunner>,
        "MT_",
    ));

    let records = Arc::new(Records::new());
    let engine = Arc::new(Engine::new(Arc::clone(&records), 3600));
    let group = Group::new(steering_group("example.com"), helper, "mt_")
        .await
        .unwrap();
    engine.insert_group(Arc::new(group));

    // Proxy wired like the app does it: answers dispatched to the engine.
    let upstream = spawn_upstream([1, 2, 3, 4], 60).await;
    let hook_engine = Arc::clone(&engine);
    let proxy = Arc::new(
        DnsMitmProxy::new(UpstreamResolver::new(upstream)).with_response_hook(Arc::new(
            move |_client, _request, response, _transport| {
                let engine = Arc::clone(&hook_engine);
                let response = response.clone();
                tokio::spawn(async move { engine.handle_message(response).await });
                None
            },
        )),
    );

    let listen = free_udp_addr().await;
    let cancel = CancellationToken::new();
    let server = tokio::spawn(listen_udp(proxy, listen, cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A client resolves a matching name through the proxy.
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut query = Message::new();
    query.set_id(0x5151);
    query.add_query(Query::query(
        Name::from_str("www.example.com.").unwrap(),
        RecordType::A,
    ));
    client
        .send_to(&query.to_vec().unwrap(), listen)
        .await
        .unwrap();

    // The client sees the upstream answer unmodified.
    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Message::from_bytes(&buf[..len]).unwrap();
    assert_eq!(response.id(), 0x5151);
    assert_eq!(response.answers().len(), 1);

    // The engine pushed the address into the group's set with the
    // learned TTL plus the additional TTL.
    let call = wait_for_call(&runner, "ipset -exist add mt_0000002a 1.2.3.4")
        .await
        .expect("address should be added to the group set");
    assert_eq!(call, "ipset -exist add mt_0000002a 1.2.3.4 timeout 3660");

    // The record store learned the answer too.
    assert_eq!(records.get_a("www.example.com").len(), 1);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}

#[tokio::test]
async fn test_ptr_suppression_never_reaches_upstream() {
    // Upstream that records whether it was contacted.
    let upstream_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_socket.local_addr().unwrap();
    let contacted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    {
        let contacted = Arc::clone(&contacted);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            if upstream_socket.recv_from(&mut buf).await.is_ok() {
                contacted.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });
    }

    let proxy = Arc::new(
        DnsMitmProxy::new(UpstreamResolver::new(upstream_addr))
            .with_request_hook(fake_ptr_hook()),
    );

    let listen = free_udp_addr().await;
    let cancel = CancellationToken::new();
    let server = tokio::spawn(listen_udp(proxy, listen, cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut query = Message::new();
    query.set_id(0x0bad);
    query.add_query(Query::query(
        Name::from_str("4.3.2.1.in-addr.arpa.").unwrap(),
        RecordType::PTR,
    ));
    client
        .send_to(&query.to_vec().unwrap(), listen)
        .await
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Message::from_bytes(&buf[..len]).unwrap();
    assert_eq!(response.id(), 0x0bad);
    assert_eq!(response.response_code(), ResponseCode::NXDomain);

    // Give a stray forward a moment to show up, then check none did.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!contacted.load(std::sync::atomic::Ordering::SeqCst));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), server).await;
}
