//! End-to-end coverage of SPEC_FULL §8 scenario S4: a job submitted on a box
//! with no local pool for it is routed, over real TCP gossip, to the one
//! peer that carries the pool, and its terminal state becomes observable
//! back on the submitting box through the same link.
//!
//! Runs two full boxes (`State` + `BoxNode` + listener, one with a `Pool`)
//! against each other over loopback TCP, driven entirely by their own
//! background loops rather than hand-stepped ticks.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use meeseeks_core::{Config, JobState, JobSubmission};
use meeseeks_engine::router::serve;
use meeseeks_engine::{
    BoxNode, PeerConfig, PeerLink, Pool, PoolConfig, RequestHandler, RouterConfig, State,
    StateConfig,
};

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

#[tokio::test(flavor = "multi_thread")]
async fn unrouted_job_is_routed_to_the_peer_carrying_its_pool_and_runs_there() {
    let state_a = State::new(Some("A".to_string()), StateConfig::default()).unwrap();
    let state_b = State::new(Some("B".to_string()), StateConfig::default()).unwrap();

    let router_a = Arc::new(BoxNode::new(
        "A".to_string(),
        state_a.clone(),
        RouterConfig::default(),
        Config::new(),
    ));
    let router_b = Arc::new(BoxNode::new(
        "B".to_string(),
        state_b.clone(),
        RouterConfig::default(),
        Config::new(),
    ));
    // only B serves the "p" pool; A must route there instead of claiming it.
    router_b.set_local_pools(vec!["p".to_string()]);

    let port_a = free_port();
    let port_b = free_port();
    let addr_a: SocketAddr = format!("127.0.0.1:{port_a}").parse().unwrap();
    let addr_b: SocketAddr = format!("127.0.0.1:{port_b}").parse().unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();

    let handler_a = RequestHandler::new(state_a.clone(), router_a.clone());
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(
        async move { serve(addr_a, None, handler_a, rx).await },
    ));

    let handler_b = RequestHandler::new(state_b.clone(), router_b.clone());
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(
        async move { serve(addr_b, None, handler_b, rx).await },
    ));

    let rx = shutdown_rx.clone();
    let ra = router_a.clone();
    tasks.push(tokio::spawn(async move { ra.run(rx).await }));
    let rx = shutdown_rx.clone();
    let rb = router_b.clone();
    tasks.push(tokio::spawn(async move { rb.run(rx).await }));

    let pool_config = Arc::new(RwLock::new(PoolConfig::new(1, None, None, false, false)));
    let mut pool_b = Pool::new("B".to_string(), "p".to_string(), state_b.clone(), pool_config);
    let rx = shutdown_rx.clone();
    tasks.push(tokio::spawn(async move { pool_b.run(rx).await }));

    let link_a_to_b = Arc::new(PeerLink::new(
        "B".to_string(),
        state_a.clone(),
        PeerConfig {
            address: "127.0.0.1".to_string(),
            port: port_b,
            refresh: 1,
            poll: 1,
            tls: None,
        },
    ));
    let rx = shutdown_rx.clone();
    let l = link_a_to_b.clone();
    tasks.push(tokio::spawn(async move { l.run(rx).await }));

    let link_b_to_a = Arc::new(PeerLink::new(
        "A".to_string(),
        state_b.clone(),
        PeerConfig {
            address: "127.0.0.1".to_string(),
            port: port_a,
            refresh: 1,
            poll: 1,
            tls: None,
        },
    ));
    let rx = shutdown_rx.clone();
    let l = link_b_to_a.clone();
    tasks.push(tokio::spawn(async move { l.run(rx).await }));

    // let both listeners actually bind before anything tries to connect.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sub = JobSubmission {
        pool: Some("p".to_string()),
        args: Some(vec!["/bin/true".to_string()]),
        ..Default::default()
    };
    let (jid, _) = state_a.submit(sub).into_iter().next().unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    let mut final_job = None;
    while tokio::time::Instant::now() < deadline {
        if let Some(job) = state_a.get_job(&jid) {
            if job.state.is_terminal() {
                final_job = Some(job);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = shutdown_tx.send(true);
    for t in tasks {
        let _ = tokio::time::timeout(Duration::from_secs(2), t).await;
    }

    let job = final_job.expect("job should reach a terminal state via gossip+routing in time");
    assert_eq!(job.state, JobState::Done);
    assert_eq!(job.node.as_deref(), Some("B"));
    assert_eq!(job.rc, Some(0));
}
