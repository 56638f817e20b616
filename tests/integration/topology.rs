//! tests/integration/topology.rs
//!
//! End-to-end tests for membership convergence across a small cluster.

use crate::common::harness::TestNode;
use serfkit::rpc::commands as cmd;
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn three_node_chain_converges_to_full_membership() {
    let test_timeout = Duration::from_secs(20);
    let result = tokio::time::timeout(test_timeout, async {
        let node_a = TestNode::spawn("a", vec![]).await.unwrap();
        let node_b = TestNode::spawn("b", vec![node_a.gossip_addr]).await.unwrap();
        let node_c = TestNode::spawn("c", vec![node_b.gossip_addr]).await.unwrap();

        for node in [&node_a, &node_b, &node_c] {
            wait_for_member_count(node, 3).await;
        }

        node_a.shutdown();
        node_b.shutdown();
        node_c.shutdown();
    })
    .await;
    result.expect("timed out waiting for membership to converge");
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn joining_an_empty_list_is_rejected_over_rpc() {
    let node = TestNode::spawn("solo", vec![]).await.unwrap();
    let mut rpc = node.rpc().await.unwrap();
    let err = rpc
        .request::<_, cmd::JoinResponse>(cmd::JOIN, &cmd::JoinRequest { existing: vec![], replay: false })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rpc error"));
    node.shutdown();
}

async fn wait_for_member_count(node: &TestNode, expected: usize) {
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
