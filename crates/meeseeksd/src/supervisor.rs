//! Owns the lifetime of this box's Pools and PeerLinks: spawns them at
//! startup and reconciles them against a freshly-reloaded [`DaemonConfig`]
//! when [`BoxNode::reload_notifier`] fires, per SPEC_FULL §4.5's "Config
//! reload" note: stop removed components, reconfigure survivors in place,
//! start new ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use meeseeks_engine::{BoxNode, PeerConfig, PeerLink, Pool, PoolConfig, State};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DaemonConfig;

struct PoolHandle {
    config: Arc<RwLock<PoolConfig>>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct PeerHandle {
    link: Arc<PeerLink>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    state: State,
    router: Arc<BoxNode>,
    pools: Mutex<HashMap<String, PoolHandle>>,
    peers: Mutex<HashMap<String, PeerHandle>>,
}

impl Supervisor {
    pub fn new(state: State, router: Arc<BoxNode>) -> Self {
        Supervisor {
            state,
            router,
            pools: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Reconciles running Pools/PeerLinks against `daemon_cfg`.
    pub fn apply(&self, node_name: &str, daemon_cfg: &DaemonConfig) {
        self.apply_pools(node_name, &daemon_cfg.pools);
        self.apply_peers(&daemon_cfg.nodes);
    }

    fn apply_pools(&self, node_name: &str, wanted: &HashMap<String, PoolConfig>) {
        let mut pools = self.pools.lock().unwrap();

        let gone: Vec<String> = pools
            .keys()
            .filter(|name| !wanted.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(handle) = pools.remove(&name) {
                tracing::info!(pool = %name, "stopping removed pool");
                let _ = handle.shutdown_tx.send(true);
            }
        }

        for (pool_name, cfg) in wanted {
            match pools.get(pool_name) {
                Some(handle) => {
                    *handle.config.write().unwrap() = *cfg;
                }
                None => {
                    let config = Arc::new(RwLock::new(*cfg));
                    let (tx, rx) = watch::channel(false);
                    let mut pool = Pool::new(
                        node_name.to_string(),
                        pool_name.clone(),
                        self.state.clone(),
                        config.clone(),
                    );
                    let task = tokio::spawn(async move { pool.run(rx).await });
                    tracing::info!(pool = %pool_name, "started pool");
                    pools.insert(
                        pool_name.clone(),
                        PoolHandle {
                            config,
                            shutdown_tx: tx,
                            task,
                        },
                    );
                }
            }
        }

        self.router.set_local_pools(wanted.keys().cloned().collect());
    }

    fn apply_peers(&self, wanted: &HashMap<String, PeerConfig>) {
        let mut peers = self.peers.lock().unwrap();

        let gone: Vec<String> = peers
            .keys()
            .filter(|name| !wanted.contains_key(*name))
            .cloned()
            .collect();
        for name in gone {
            if let Some(handle) = peers.remove(&name) {
                tracing::info!(peer = %name, "stopping removed peer link");
                let _ = handle.shutdown_tx.send(true);
            }
        }

        for (peer_name, cfg) in wanted {
            match peers.get(peer_name) {
                Some(handle) => {
                    *handle.link.config_handle().write().unwrap() = cfg.clone();
                }
                None => {
                    let (tx, rx) = watch::channel(false);
                    let link = Arc::new(PeerLink::new(peer_name.clone(), self.state.clone(), cfg.clone()));
                    let link_bg = link.clone();
                    let task = tokio::spawn(async move { link_bg.run(rx).await });
                    tracing::info!(peer = %peer_name, "started peer link");
                    peers.insert(
                        peer_name.clone(),
                        PeerHandle {
                            link,
                            shutdown_tx: tx,
                            task,
                        },
                    );
                }
            }
        }
    }

    /// Watches the router's reload notifications and re-applies the freshly
    /// merged config tree until `shutdown` fires.
    pub async fn watch_reload(&self, node_name: String, mut shutdown: watch::Receiver<bool>) {
        let notify = self.router.reload_notifier();
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    let value = self.router.current_config();
                    let cfg = meeseeks_core::Config::from_value(value);
                    match DaemonConfig::from_config(&cfg, Some(node_name.clone()), None, None) {
                        Ok(daemon_cfg) => {
                            tracing::info!("applying reloaded config");
                            self.apply(&node_name, &daemon_cfg);
                        }
                        Err(err) => tracing::warn!(error = %err, "reloaded config rejected, keeping prior components"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Stops every running Pool/PeerLink and waits for them to drain.
    pub async fn shutdown(&self) {
        let pool_handles: Vec<PoolHandle> = self.pools.lock().unwrap().drain().map(|(_, v)| v).collect();
        for handle in pool_handles {
            let _ = handle.shutdown_tx.send(true);
            let _ = handle.task.await;
        }
        let peer_handles: Vec<PeerHandle> = self.peers.lock().unwrap().drain().map(|(_, v)| v).collect();
        for handle in peer_handles {
            let _ = handle.shutdown_tx.send(true);
            let _ = handle.task.await;
        }
    }
}
