// End-to-end convergence tests over real loopback sockets

use rusty_mesh::{Member, MeshConfig, Membership};
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn fast_config(name: &str) -> MeshConfig {
    let mut config = MeshConfig::local(name);
    config.probe_interval = Duration::from_millis(50);
    config.probe_timeout = Duration::from_millis(20);
    config.suspicion_mult = 3;
    config.push_pull_interval = Duration::from_millis(200);
    config
}

async fn wait_for<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return;
        }
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(20)).await;
    }
}

fn names(members: &[Member]) -> Vec<String> {
    let mut names: Vec<String> = members.iter().map(|m| m.name.clone()).collect();
    names.sort();
    names
}

#[tokio::test]
async fn two_nodes_converge_after_join() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let alpha = Membership::new(fast_config("alpha")).await.unwrap();
    let beta = Membership::new(fast_config("beta")).await.unwrap();
    let mut alpha_joins = alpha.subscribe_join();

    let contacted = beta.join(&[alpha.local_member().addr]).await.unwrap();
    assert_eq!(contacted, 1);

    wait_for("both nodes to see two members", || {
        alpha.members().len() == 2 && beta.members().len() == 2
    })
    .await;
    assert_eq!(names(&alpha.members()), vec!["alpha", "beta"]);
    assert_eq!(names(&beta.members()), vec!["alpha", "beta"]);

    wait_for("join notification for beta", || {
        matches!(alpha_joins.try_recv(), Ok(m) if m.name == "beta")
    })
    .await;

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}

#[tokio::test]
async fn unresponsive_node_is_declared_dead() {
    let alpha = Membership::new(fast_config("alpha")).await.unwrap();
    let beta = Membership::new(fast_config("beta")).await.unwrap();
    beta.join(&[alpha.local_member().addr]).await.unwrap();
    wait_for("cluster formation", || alpha.members().len() == 2).await;

    let mut alpha_leaves = alpha.subscribe_leave();

    // kill beta without a goodbye; alpha must detect the failure
    beta.shutdown().await.unwrap();

    wait_for("beta to be declared dead", || alpha.members().len() == 1).await;
    assert_eq!(names(&alpha.members()), vec!["alpha"]);

    wait_for("leave notification for beta", || {
        matches!(alpha_leaves.try_recv(), Ok(m) if m.name == "beta")
    })
    .await;

    alpha.shutdown().await.unwrap();
}

#[tokio::test]
async fn graceful_leave_is_disseminated() {
    let alpha = Membership::new(fast_config("alpha")).await.unwrap();
    let beta = Membership::new(fast_config("beta")).await.unwrap();
    beta.join(&[alpha.local_member().addr]).await.unwrap();
    wait_for("cluster formation", || {
        alpha.members().len() == 2 && beta.members().len() == 2
    })
    .await;

    beta.leave(Duration::from_secs(2)).await.unwrap();

    wait_for("alpha to drop beta", || alpha.members().len() == 1).await;
    beta.shutdown().await.unwrap();
    alpha.shutdown().await.unwrap();
}

#[tokio::test]
async fn third_node_spreads_through_gossip() {
    let alpha = Membership::new(fast_config("alpha")).await.unwrap();
    let beta = Membership::new(fast_config("beta")).await.unwrap();
    let gamma = Membership::new(fast_config("gamma")).await.unwrap();

    beta.join(&[alpha.local_member().addr]).await.unwrap();
    gamma.join(&[alpha.local_member().addr]).await.unwrap();

    // beta never contacted gamma directly; gossip and anti-entropy close
    // the gap
    wait_for("full three-node convergence", || {
        alpha.members().len() == 3 && beta.members().len() == 3 && gamma.members().len() == 3
    })
    .await;
    for node in [&alpha, &beta, &gamma] {
        assert_eq!(names(&node.members()), vec!["alpha", "beta", "gamma"]);
    }

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
    gamma.shutdown().await.unwrap();
}

#[tokio::test]
async fn incarnations_never_regress() {
    let alpha = Membership::new(fast_config("alpha")).await.unwrap();
    let beta = Membership::new(fast_config("beta")).await.unwrap();
    beta.join(&[alpha.local_member().addr]).await.unwrap();
    wait_for("cluster formation", || alpha.members().len() == 2).await;

    let observed: Vec<(String, u64)> = alpha
        .members()
        .iter()
        .map(|m| (m.name.clone(), m.incarnation))
        .collect();

    // let a few probe and push/pull rounds pass
    sleep(Duration::from_millis(500)).await;

    for (name, earlier) in observed {
        let now = alpha
            .members()
            .into_iter()
            .find(|m| m.name == name)
            .expect("member still present");
        assert!(now.incarnation >= earlier, "incarnation of {} regressed", name);
    }

    alpha.shutdown().await.unwrap();
    beta.shutdown().await.unwrap();
}
