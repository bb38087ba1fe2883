use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Job`]. See the cluster state invariants: a job moves
/// `new -> running -> {done, failed, killed}`, with restart/retry/resubmit able to
/// send it back to `new` from a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    New,
    Running,
    Done,
    Failed,
    Killed,
}

impl JobState {
    /// Terminal states are `done`, `failed`, `killed`: a job in one of these is not
    /// owned by any pool (`active` must be false).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Killed)
    }
}

impl Default for JobState {
    fn default() -> Self {
        JobState::New
    }
}

/// A numeric id or a name to be resolved against the platform's user/group
/// database at task-start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdOrName {
    Id(u32),
    Name(String),
}

/// `node` (and the multi-submit forms of it) as accepted from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    One(String),
    Many(Vec<String>),
}

/// `tags` as accepted from a caller: a bare string is coerced to a one-element list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagsSpec {
    One(String),
    Many(Vec<String>),
}

impl From<TagsSpec> for Vec<String> {
    fn from(t: TagsSpec) -> Self {
        match t {
            TagsSpec::One(s) => vec![s],
            TagsSpec::Many(v) => v,
        }
    }
}

/// Caller-supplied fields for `submit`/`modify`. Only the fields named here are
/// ever accepted from the wire; there is no free-form passthrough map, which is
/// the Rust-native replacement for the original implementation's runtime key
/// allowlist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<IdOrName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<IdOrName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<JobState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resubmit: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<TagsSpec>,
}

/// A unit of work tracked by [`crate::state`]. Mirrors the full job entity of
/// the data model: caller-controlled spec fields plus server-controlled state
/// fields, all present on every stored job (no sparse/dynamic attribute bag).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    // --- spec (caller-controlled) ---
    pub pool: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<IdOrName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<IdOrName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub resubmit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<u64>,
    #[serde(default)]
    pub hold: bool,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,

    // --- state (server-controlled) ---
    pub state: JobState,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub ts: f64,
    pub seq: u64,
    pub submit_ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_ts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<f64>,
    #[serde(default)]
    pub start_count: u32,
    #[serde(default)]
    pub fail_count: u32,
}

impl Job {
    /// True while some pool owns this job, i.e. it has not (yet) reached a
    /// terminal state but has been claimed.
    pub fn is_active_terminal_consistent(&self) -> bool {
        !(self.active && self.state.is_terminal())
    }
}

/// One box's view of a peer or itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loadavg: Option<f64>,
    #[serde(default)]
    pub routing: Vec<String>,
    #[serde(default)]
    pub pools: HashMap<String, Slots>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<bool>,
}

/// Capacity of a pool: a finite slot count, or unlimited (`true` on the wire,
/// matching the original implementation's `slots is True` sentinel).
#[derive(Debug, Clone, Copy)]
pub enum Slots {
    Unlimited,
    Count(i64),
}

impl Slots {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Slots::Unlimited)
    }

    /// Free slot count after subtracting `running` in-flight jobs, or `None`
    /// if this pool is unlimited (no subtraction to report).
    pub fn free(&self, running: i64) -> Option<i64> {
        match self {
            Slots::Unlimited => None,
            Slots::Count(n) => Some(n - running),
        }
    }
}

impl Serialize for Slots {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            Slots::Unlimited => serializer.serialize_bool(true),
            Slots::Count(n) => serializer.serialize_i64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Slots {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Bool(_) => Ok(Slots::Unlimited),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Slots::Count)
                .ok_or_else(|| serde::de::Error::custom("slots value out of range")),
            other => Err(serde::de::Error::custom(format!(
                "invalid slots value: {other}"
            ))),
        }
    }
}

/// Derived view: for a pool, the map of node -> slots-free.
pub type PoolStatus = HashMap<String, HashMap<String, Slots>>;

/// A single terminal-transition record appended to the history file, shaped
/// as `{ id: job }` to match the original implementation's on-disk format.
#[derive(Debug, Clone, Serialize)]
pub struct JobHistoryRecord<'a> {
    #[serde(flatten)]
    pub entry: HashMap<String, &'a Job>,
}
