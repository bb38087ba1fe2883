//! One peer connection: periodic bidirectional sync plus an occasional
//! status poll, reconnecting unconditionally every tick on failure. See
//! SPEC_FULL §4.4; grounded on the sync protocol described there and the
//! `Node` counterpart referenced by `examples/original_source/meeseeks/box.py`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use meeseeks_core::envelope::{Query, RequestEnvelope, ResponseEnvelope};
use meeseeks_core::error::PeerError;
use tokio::sync::Mutex;

use crate::state::State;
use crate::tls::TlsConfig;
use crate::transport::Link;

/// Static (per-run) configuration of one peer link, from the box's config
/// tree under `nodes.<name>`.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub address: String,
    pub port: u16,
    pub refresh: u64,
    pub poll: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            address: "localhost".to_string(),
            port: meeseeks_core::DEFAULT_PORT,
            refresh: 1,
            poll: 1,
            tls: None,
        }
    }
}

impl PeerConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

struct LinkState {
    link: Option<Link>,
    local_seq: u64,
    remote_seq: u64,
    poll_counter: u64,
}

/// Maintains an eventually-consistent view of a single peer (or, in client
/// mode, of the one box a [`crate::client::Client`] talks to).
pub struct PeerLink {
    name: String,
    state: State,
    config: Arc<RwLock<PeerConfig>>,
    conn: Mutex<LinkState>,
    connected: AtomicBool,
}

impl PeerLink {
    pub fn new(name: String, state: State, config: PeerConfig) -> Self {
        PeerLink {
            name,
            state,
            config: Arc::new(RwLock::new(config)),
            conn: Mutex::new(LinkState {
                link: None,
                local_seq: 0,
                remote_seq: 0,
                poll_counter: 0,
            }),
            connected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle a supervisor can use to apply a config reload in place.
    pub fn config_handle(&self) -> Arc<RwLock<PeerConfig>> {
        self.config.clone()
    }

    fn config(&self) -> PeerConfig {
        self.config.read().unwrap().clone()
    }

    /// Runs the periodic sync loop until `shutdown` fires, then closes the
    /// socket.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let refresh = Duration::from_secs(self.config().refresh.max(1));
            tokio::select! {
                _ = tokio::time::sleep(refresh) => {
                    if let Err(err) = self.tick().await {
                        self.note_disconnect(&err).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.conn.lock().await.link = None;
    }

    async fn tick(&self) -> Result<(), PeerError> {
        let cfg = self.config();
        let mut conn = self.conn.lock().await;

        if conn.link.is_none() {
            conn.link = Some(Link::connect(&cfg.addr(), cfg.tls.as_ref()).await?);
            // a fresh connection always full-syncs, per the disconnect contract below.
            conn.local_seq = 0;
            conn.remote_seq = 0;
            conn.poll_counter = 0;
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::info!(peer = %self.name, "connected");
        }

        let mut outbound_query = Query::default();
        outbound_query.seq = Some(conn.local_seq);
        let mut jobs = self.state.get(&outbound_query);
        if self.state.name().is_some() {
            match self.state.get_nodes().get(&self.name) {
                Some(peer_status) => {
                    let routing = peer_status.routing.clone();
                    jobs.retain(|_, job| {
                        job.node
                            .as_deref()
                            .map(|n| routing.iter().any(|r| r == n))
                            .unwrap_or(false)
                    });
                }
                None => jobs.clear(),
            }
        }
        if let Some(max_sent) = jobs.values().map(|j| j.seq).max() {
            conn.local_seq = conn.local_seq.max(max_sent);
        }

        let poll_period = cfg.poll.max(1);
        let want_nodes = conn.poll_counter == 0;
        conn.poll_counter = (conn.poll_counter + 1) % poll_period;

        let envelope = RequestEnvelope {
            sync: Some(jobs),
            get: Some(Query {
                seq: Some(conn.remote_seq),
                ..Default::default()
            }),
            nodes: want_nodes.then(|| serde_json::Value::Object(serde_json::Map::new())),
            ..Default::default()
        };

        let timeout = Duration::from_secs(cfg.refresh.max(1) * 3);
        let round_trip: Result<ResponseEnvelope, PeerError> = async {
            let link = conn.link.as_mut().expect("connected above");
            link.write_line(&vec![envelope]).await?;
            let responses: Vec<ResponseEnvelope> = link.read_line_timeout(timeout).await?;
            responses.into_iter().next().ok_or_else(|| {
                PeerError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "empty response batch",
                ))
            })
        }
        .await;

        let response = match round_trip {
            Ok(r) => r,
            Err(err) => {
                conn.link = None;
                return Err(err);
            }
        };

        let jobs_in = response.get.unwrap_or_default();
        let status_in = response.nodes.unwrap_or_default();
        if let Some(max_recv) = jobs_in.values().map(|j| j.seq).max() {
            conn.remote_seq = conn.remote_seq.max(max_recv);
        }
        let updated = self.state.sync(jobs_in, status_in);
        tracing::debug!(peer = %self.name, received = updated.len(), "peer sync round trip");
        Ok(())
    }

    async fn note_disconnect(&self, err: &PeerError) {
        let mut conn = self.conn.lock().await;
        conn.link = None;
        conn.local_seq = 0;
        conn.remote_seq = 0;
        conn.poll_counter = 0;
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::warn!(peer = %self.name, error = %err, "disconnected");
        }
    }

    /// Sends an arbitrary request batch and returns the response batch,
    /// sharing the same connection mutex as the background tick so requests
    /// are never interleaved with gossip framing.
    pub async fn request(
        &self,
        envelopes: Vec<RequestEnvelope>,
    ) -> Result<Vec<ResponseEnvelope>, PeerError> {
        let cfg = self.config();
        let mut conn = self.conn.lock().await;
        if conn.link.is_none() {
            conn.link = Some(Link::connect(&cfg.addr(), cfg.tls.as_ref()).await?);
        }
        let timeout = Duration::from_secs(cfg.refresh.max(1) * 3);
        let result: Result<Vec<ResponseEnvelope>, PeerError> = async {
            let link = conn.link.as_mut().unwrap();
            link.write_line(&envelopes).await?;
            link.read_line_timeout(timeout).await
        }
        .await;
        if result.is_err() {
            conn.link = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateConfig;
    use meeseeks_core::JobSubmission;
    use tokio::net::TcpListener;

    fn local_state() -> State {
        State::new(Some("local".to_string()), StateConfig::default()).unwrap()
    }

    async fn bound_config(listener: &TcpListener) -> PeerConfig {
        let port = listener.local_addr().unwrap().port();
        PeerConfig {
            address: "127.0.0.1".to_string(),
            port,
            refresh: 1,
            poll: 1,
            tls: None,
        }
    }

    #[tokio::test]
    async fn tick_accepts_a_sync_response_and_advances_remote_seq() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = bound_config(&listener).await;
        let remote_state = local_state();
        let sub = JobSubmission {
            pool: Some("default".to_string()),
            args: Some(vec!["/bin/true".to_string()]),
            ..Default::default()
        };
        let (_, job) = remote_state.submit(sub).into_iter().next().unwrap();
        let job = job.unwrap();
        let job_seq = job.seq;

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut link = Link::accept(tcp, None).await.unwrap();
            let _req: Vec<RequestEnvelope> = link.read_line().await.unwrap().unwrap();
            let mut jobs = std::collections::HashMap::new();
            jobs.insert(job.id.clone(), job);
            let resp = ResponseEnvelope {
                get: Some(jobs),
                ..Default::default()
            };
            link.write_line(&vec![resp]).await.unwrap();
        });

        let peer = PeerLink::new("peer-a".to_string(), local_state(), cfg);
        peer.tick().await.unwrap();
        server.await.unwrap();

        assert_eq!(peer.conn.lock().await.remote_seq, job_seq);
        assert!(peer.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tick_against_a_closed_port_fails_and_leaves_the_peer_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = bound_config(&listener).await;
        drop(listener);

        let peer = PeerLink::new("peer-b".to_string(), local_state(), cfg);
        let err = peer.tick().await;
        assert!(err.is_err());
        assert!(!peer.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn note_disconnect_resets_sequence_bookkeeping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cfg = bound_config(&listener).await;
        let peer = PeerLink::new("peer-c".to_string(), local_state(), cfg);
        {
            let mut conn = peer.conn.lock().await;
            conn.local_seq = 9;
            conn.remote_seq = 4;
            conn.poll_counter = 2;
        }
        peer.connected.store(true, Ordering::SeqCst);
        peer.note_disconnect(&PeerError::Timeout).await;
        let conn = peer.conn.lock().await;
        assert_eq!(conn.local_seq, 0);
        assert_eq!(conn.remote_seq, 0);
        assert_eq!(conn.poll_counter, 0);
        assert!(!peer.connected.load(Ordering::SeqCst));
    }
}
