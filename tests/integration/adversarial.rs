//! tests/integration/adversarial.rs
//!
//! Tests for failure detection and the query/response engine under less
//! cooperative conditions: a node disappearing without a graceful `leave`,
//! and a query answered by the responder rather than discovered locally.

use crate::common::harness::TestNode;
use serfkit::rpc::commands as cmd;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn an_ungracefully_killed_node_is_eventually_marked_failed() {
    let test_timeout = Duration::from_secs(25);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("a", vec![]).await.unwrap();
        let node_b = TestNode::spawn("b", vec![node_a.gossip_addr]).await.unwrap();

        wait_for_members(&node_a, 2).await;

        // Simulate a crash: no LEAVE message, just the process vanishing.
        node_b.shutdown();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
        loop {
            let mut rpc_a = node_a.rpc().await.unwrap();
            let resp: cmd::MembersResponse = rpc_a.request(cmd::MEMBERS, &()).await.unwrap();
            let b = resp.members.iter().find(|m| m.name == "b").unwrap();
            if b.status == serfkit::domain::MemberStatus::Failed {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("node b never transitioned to Failed, last status: {:?}", b.status);
            }
            tokio::time::sleep(Duration::from_millis(300)).await;
        }

        node_a.shutdown();
    })
    .await;
    result.expect("timed out waiting for failure detection to converge");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn query_response_round_trips_through_the_remote_node() {
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("a", vec![]).await.unwrap();
        let node_b = TestNode::spawn("b", vec![node_a.gossip_addr]).await.unwrap();

        wait_for_members(&node_a, 2).await;
        wait_for_members(&node_b, 2).await;

        // Node b subscribes to queries named "ping" so it can answer them.
        let mut responder = node_b.rpc().await.unwrap();
        let sub_seq = responder
            .request_raw(cmd::STREAM, &cmd::StreamRequest { event_types: vec!["query".into()] })
            .await
            .unwrap();
        let _ack: () = responder.read_response(sub_seq).await.unwrap();

        let mut caller = node_a.rpc().await.unwrap();
        let query_seq = caller
            .request_raw(
                cmd::QUERY,
                &cmd::QueryRequest { name: "ping".into(), payload: b"hello".to_vec(), timeout_ms: 5_000, ..Default::default() },
            )
            .await
            .unwrap();
        let _ok: () = caller.read_response(query_seq).await.unwrap();

        let record: cmd::StreamRecord = responder.read_record().await.unwrap();
        assert_eq!(record.event, "query:ping");

        let forwarded: cmd::StreamQueryPayload = bincode::deserialize(&record.payload).unwrap();
        assert_eq!(forwarded.name, "ping");
        assert_eq!(forwarded.payload, b"hello");

        let _ok: () = responder
            .request(cmd::RESPOND, &cmd::RespondRequest { query_id: forwarded.query_id, payload: b"pong".to_vec() })
            .await
            .unwrap();

        loop {
            let rec: cmd::QueryRecord = caller.read_record().await.unwrap();
            match rec {
                cmd::QueryRecord::Response { from, payload } => {
                    assert_eq!(from, "b");
                    assert_eq!(payload, b"pong");
                    break;
                }
                cmd::QueryRecord::Ack { .. } => continue,
                cmd::QueryRecord::Done => panic!("query finished with no response"),
            }
        }

        node_a.shutdown();
        node_b.shutdown();
    })
    .await;
    result.expect("timed out waiting for the query round trip");
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
