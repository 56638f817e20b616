//! tests/integration/network.rs
//!
//! End-to-end tests for the happy path: two nodes join, a user event fired
//! on one is observed by the other's `stream` subscription, and a graceful
//! `leave` is reflected in membership on the remaining node.

use crate::common::harness::TestNode;
use serfkit::rpc::commands as cmd;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn user_event_propagates_to_a_stream_subscriber() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("a", vec![]).await.unwrap();
        let node_b = TestNode::spawn("b", vec![node_a.gossip_addr]).await.unwrap();

        wait_for_members(&node_b, 2).await;

        let mut sub = node_b.rpc().await.unwrap();
        let seq = sub
            .request_raw(cmd::STREAM, &cmd::StreamRequest { event_types: vec!["user".into()] })
            .await
            .unwrap();
        let _ack: () = sub.read_response(seq).await.unwrap();

        let mut caller = node_a.rpc().await.unwrap();
        let _ok: () = caller
            .request(cmd::EVENT, &cmd::EventRequest { name: "deploy".into(), payload: b"v2".to_vec(), coalesce: false })
            .await
            .unwrap();

        let record: cmd::StreamRecord = sub.read_record().await.unwrap();
        assert_eq!(record.event, "user:deploy");
        assert_eq!(record.payload, b"v2");

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;
    result.expect("timed out waiting for the user event to propagate");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn graceful_leave_is_reflected_in_peer_membership() {
    let test_timeout = Duration::from_secs(15);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("a", vec![]).await.unwrap();
        let node_b = TestNode::spawn("b", vec![node_a.gossip_addr]).await.unwrap();

        wait_for_members(&node_a, 2).await;

        let mut rpc_b = node_b.rpc().await.unwrap();
        let _ok: () = rpc_b.request(cmd::LEAVE, &()).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let mut rpc_a = node_a.rpc().await.unwrap();
            let resp: cmd::MembersResponse = rpc_a.request(cmd::MEMBERS, &()).await.unwrap();
            let b = resp.members.iter().find(|m| m.name == "b").unwrap();
            if b.status == serfkit::domain::MemberStatus::Left {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("node b never transitioned to Left, last status: {:?}", b.status);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;
    result.expect("timed out waiting for the leave to propagate");
}

async fn wait_for_members(node: &TestNode, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut rpc = node.rpc().await.unwrap();
        let resp: cmd::MembersResponse = rpc.request(cmd::MEMBERS, &()).await.unwrap();
        if resp.members.len() >= expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("node {} only saw {} members, expected {expected}", node.config.node_name, resp.members.len());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
