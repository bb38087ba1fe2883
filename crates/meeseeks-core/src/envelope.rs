use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobSubmission, NodeStatus, PoolStatus};

fn field_matches(value: &serde_json::Value, filter: &serde_json::Value) -> bool {
    if let (serde_json::Value::String(v), serde_json::Value::String(f)) = (value, filter) {
        if let Some(prefix) = f.strip_suffix('*') {
            return v.starts_with(prefix);
        }
    }
    value == filter
}

/// `ids` as accepted by a `get`/`ls` query: a single id or a list of ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdsSpec {
    One(String),
    Many(Vec<String>),
}

impl IdsSpec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            IdsSpec::One(s) => vec![s],
            IdsSpec::Many(v) => v,
        }
    }
}

/// Filter mapping used by `get`/`ls`/`kill`. Well-known filter keys are typed;
/// anything else is an equality (or prefix-match, for `*`-suffixed string
/// values) filter on an arbitrary job field, captured via `fields`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<IdsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

impl Query {
    /// True if `job` matches every extra filter field in this query (`ids`,
    /// `ts`, `seq` and `tag` are handled separately by the caller). A string
    /// filter value ending in `*` is a prefix match; anything else is an
    /// equality check against the job's JSON representation of that field.
    pub fn matches_fields(&self, job: &Job) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        let value = match serde_json::to_value(job) {
            Ok(v) => v,
            Err(_) => return false,
        };
        let obj = match value.as_object() {
            Some(o) => o,
            None => return false,
        };
        self.fields.iter().all(|(k, want)| {
            obj.get(k)
                .map(|have| field_matches(have, want))
                .unwrap_or(false)
        })
    }
}

/// `kill` accepts an id, a list of ids, or a filter mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KillArg {
    Id(String),
    Ids(Vec<String>),
    Filter(Query),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsSpec {
    #[serde(default)]
    pub pretty: bool,
}

/// One request batch element, per §6.1 of the wire protocol. Unknown/absent
/// keys are simply `None` and ignored; every recognized key is optional since
/// a caller may combine several operations in one envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<HashMap<String, Job>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit: Option<JobSubmission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify: Option<HashMap<String, JobSubmission>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<KillArg>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ls: Option<Query>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default, rename = "options.pretty", skip_serializing_if = "Option::is_none")]
    pub options_pretty: Option<bool>,
}

/// Response to one request envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub get: Option<HashMap<String, Job>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit: Option<HashMap<String, SubmitResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<Option<Job>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify: Option<HashMap<String, SubmitResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill: Option<HashMap<String, SubmitResult>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<HashMap<String, NodeStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pools: Option<PoolStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// `submit`/`modify`/`kill` return either the resulting job or `false` when the
/// operation was invalid (e.g. missing `pool`, or an unknown id for kill).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitResult {
    Job(Job),
    Rejected(bool),
}

impl From<Option<Job>> for SubmitResult {
    fn from(job: Option<Job>) -> Self {
        match job {
            Some(j) => SubmitResult::Job(j),
            None => SubmitResult::Rejected(false),
        }
    }
}
