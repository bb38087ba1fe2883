//! Typed projection of the box's config tree onto the concrete types
//! `meeseeks-engine` components take, per SPEC_FULL §6.4. Parses a plain
//! `serde_json::Value` tree rather than deriving `Deserialize` directly, so
//! the live `config`/`__config` reload path (which only ever has a raw
//! `Value` delta to merge) and the on-disk load path share one reader.

use std::collections::HashMap;
use std::path::PathBuf;

use meeseeks_core::Config;
use meeseeks_engine::{PeerConfig, PoolConfig, RouterConfig, StateConfig, TlsConfig};
use serde_json::Value;

pub struct ListenConfig {
    pub address: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
}

pub struct DaemonConfig {
    pub name: String,
    pub listen: ListenConfig,
    pub state: StateConfig,
    pub pools: HashMap<String, PoolConfig>,
    pub nodes: HashMap<String, PeerConfig>,
    pub router: RouterConfig,
}

impl DaemonConfig {
    pub fn from_config(
        cfg: &Config,
        name_override: Option<String>,
        listen_address_override: Option<String>,
        listen_port_override: Option<u16>,
    ) -> anyhow::Result<Self> {
        let name = name_override
            .or_else(|| cfg.get("name").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| anyhow::anyhow!("config is missing `name` and no --name override was given"))?;

        let mut listen = parse_listen(cfg.get("listen"));
        if let Some(addr) = listen_address_override {
            listen.address = addr;
        }
        if let Some(port) = listen_port_override {
            listen.port = port;
        }

        let state = parse_state(cfg);
        let pools = parse_pools(cfg.get("pools"));
        let nodes = parse_nodes(cfg.get("nodes"));
        let router = parse_router(cfg.get("defaults"));

        Ok(DaemonConfig {
            name,
            listen,
            state,
            pools,
            nodes,
            router,
        })
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64()
}

fn as_path(v: &Value) -> Option<PathBuf> {
    v.as_str().map(PathBuf::from)
}

fn parse_tls(v: Option<&Value>) -> Option<TlsConfig> {
    let obj = v?.as_object()?;
    Some(TlsConfig {
        cafile: obj.get("cafile").and_then(Value::as_str).map(str::to_string),
        cert: obj.get("cert").and_then(Value::as_str).map(str::to_string),
        key: obj.get("key").and_then(Value::as_str).map(str::to_string),
        pass: obj.get("pass").and_then(Value::as_str).map(str::to_string),
        verify: obj.get("verify").and_then(Value::as_bool).unwrap_or(true),
    })
}

/// `listen.prefix` (an interface-address prefix, per §6.4) is recorded as a
/// nicety for bind-address selection but not resolved against live network
/// interfaces here — see DESIGN.md.
fn parse_listen(v: Option<&Value>) -> ListenConfig {
    let obj = v.and_then(Value::as_object);
    ListenConfig {
        address: obj
            .and_then(|o| o.get("address"))
            .and_then(Value::as_str)
            .unwrap_or("0.0.0.0")
            .to_string(),
        port: obj
            .and_then(|o| o.get("port"))
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or(meeseeks_core::DEFAULT_PORT),
        tls: parse_tls(obj.and_then(|o| o.get("ssl"))),
    }
}

fn parse_state(cfg: &Config) -> StateConfig {
    let mut state = StateConfig::default();
    if let Some(v) = cfg.get("expire").and_then(as_u64) {
        state.expire = v;
    }
    if let Some(v) = cfg.get("expire_active_jobs").and_then(Value::as_bool) {
        state.expire_active_jobs = v;
    }
    if let Some(v) = cfg.get("timeout").and_then(as_u64) {
        state.timeout = v;
    }
    if let Some(v) = cfg.get("checkpoint").and_then(as_u64) {
        state.checkpoint = Some(v);
    }
    if let Some(v) = cfg.get("file").and_then(as_path) {
        state.file = Some(v);
    }
    if let Some(v) = cfg.get("history").and_then(as_path) {
        state.history = Some(v);
    }
    state
}

fn parse_pools(v: Option<&Value>) -> HashMap<String, PoolConfig> {
    let Some(obj) = v.and_then(Value::as_object) else {
        return HashMap::new();
    };
    obj.iter()
        .map(|(name, spec)| {
            let spec = spec.as_object();
            let slots = spec
                .and_then(|o| o.get("slots"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let update = spec.and_then(|o| o.get("update")).and_then(Value::as_u64);
            let runtime = spec.and_then(|o| o.get("runtime")).and_then(Value::as_u64);
            let drain = spec
                .and_then(|o| o.get("drain"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let hold = spec
                .and_then(|o| o.get("hold"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            (name.clone(), PoolConfig::new(slots, update, runtime, drain, hold))
        })
        .collect()
}

fn parse_nodes(v: Option<&Value>) -> HashMap<String, PeerConfig> {
    let Some(obj) = v.and_then(Value::as_object) else {
        return HashMap::new();
    };
    obj.iter()
        .map(|(name, spec)| {
            let spec_obj = spec.as_object();
            let mut peer = PeerConfig::default();
            if let Some(address) = spec_obj.and_then(|o| o.get("address")).and_then(Value::as_str) {
                peer.address = address.to_string();
            } else {
                peer.address = name.clone();
            }
            if let Some(port) = spec_obj.and_then(|o| o.get("port")).and_then(Value::as_u64) {
                peer.port = port as u16;
            }
            if let Some(refresh) = spec_obj.and_then(|o| o.get("refresh")).and_then(Value::as_u64) {
                peer.refresh = refresh;
            }
            if let Some(poll) = spec_obj.and_then(|o| o.get("poll")).and_then(Value::as_u64) {
                peer.poll = poll;
            }
            peer.tls = parse_tls(spec_obj.and_then(|o| o.get("ssl")));
            (name.clone(), peer)
        })
        .collect()
}

fn parse_router(v: Option<&Value>) -> RouterConfig {
    let obj = v.and_then(Value::as_object);
    RouterConfig {
        use_loadavg: obj
            .and_then(|o| o.get("use_loadavg"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
        wait_in_pool: obj
            .and_then(|o| o.get("wait_in_pool"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}
