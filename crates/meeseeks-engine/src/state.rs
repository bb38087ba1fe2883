//! Cluster state store: the per-box in-memory job/node/pool table, with a
//! monotonic sequence number, expiry, checkpointing, and history.
//!
//! All public operations are serialized by a single [`std::sync::Mutex`] on
//! the table; operations are plain map manipulation (no I/O under the lock
//! except the periodic checkpoint/history writes, which happen inside the
//! same background-loop tick that holds the lock, mirroring the original
//! implementation's single-threaded critical sections).

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use meeseeks_core::envelope::{IdsSpec, Query};
use meeseeks_core::job::{JobHistoryRecord, NodeSpec, Slots};
use meeseeks_core::{now_ts, Job, JobState, JobSubmission, NodeStatus};

use crate::patch::JobPatch;

/// Configuration accepted by [`State::new`] / reload.
#[derive(Debug, Clone)]
pub struct StateConfig {
    pub expire: u64,
    pub expire_active_jobs: bool,
    pub timeout: u64,
    pub history: Option<PathBuf>,
    pub file: Option<PathBuf>,
    pub checkpoint: Option<u64>,
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            expire: 300,
            expire_active_jobs: true,
            timeout: 60,
            history: None,
            file: None,
            checkpoint: None,
        }
    }
}

struct Inner {
    jobs: HashMap<String, Job>,
    nodes: HashMap<String, NodeStatus>,
    seq: u64,
    hist_seq: u64,
    hist_file: Option<File>,
    config: StateConfig,
}

/// The cluster state store for one box. Cheap to clone (an `Arc` handle);
/// clones share the same underlying table.
#[derive(Clone)]
pub struct State {
    /// This box's name, or `None` for a client-mode store (no routing
    /// concealment, see [`State::get`]).
    node: Option<String>,
    inner: Arc<Mutex<Inner>>,
}

impl State {
    pub fn new(node: Option<String>, config: StateConfig) -> anyhow::Result<Self> {
        let mut jobs = HashMap::new();
        if let Some(path) = &config.file {
            if path.exists() {
                let raw = std::fs::read_to_string(path)?;
                jobs = serde_json::from_str(&raw).unwrap_or_default();
                tracing::info!(path = %path.display(), count = jobs.len(), "loaded state");
            }
        }
        let hist_file = match &config.history {
            Some(path) => Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            ),
            None => None,
        };
        Ok(State {
            node,
            inner: Arc::new(Mutex::new(Inner {
                jobs,
                nodes: HashMap::new(),
                seq: 1,
                hist_seq: 0,
                hist_file,
                config,
            })),
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.node.as_deref()
    }

    // ---- job table operations ----

    /// `submit(spec) -> { id -> job | false }`. See §4.1.
    pub fn submit(&self, sub: JobSubmission) -> HashMap<String, Option<Job>> {
        let mut inner = self.inner.lock().unwrap();
        let mut results = HashMap::new();

        // Determine target node(s): explicit single, explicit list, glob
        // expansion over current pool membership, or "unrouted" (None).
        let nodes: Vec<Option<String>> = match &sub.node {
            None => vec![None],
            Some(NodeSpec::Many(list)) => list.iter().cloned().map(Some).collect(),
            Some(NodeSpec::One(n)) if n.ends_with('*') => {
                let prefix = &n[..n.len() - 1];
                let pool_name = sub.pool.clone().unwrap_or_default();
                let matches: Vec<String> = pool_members(&inner, &pool_name)
                    .into_iter()
                    .filter(|node| node.starts_with(prefix))
                    .collect();
                if matches.is_empty() {
                    vec![None]
                } else {
                    matches.into_iter().map(Some).collect()
                }
            }
            Some(NodeSpec::One(n)) => vec![Some(n.clone())],
        };

        let explicit_multi = nodes.len() > 1;

        for node in nodes {
            // Multi-submit always mints a fresh id per matched node: a
            // caller-supplied id only applies to the single-node case, since
            // reusing one id across several fan-out jobs would make them
            // overwrite each other in the table.
            let id = if explicit_multi {
                meeseeks_core::idgen::new_job_id()
            } else {
                sub.id
                    .clone()
                    .unwrap_or_else(meeseeks_core::idgen::new_job_id)
            };

            let existing = inner.jobs.get(&id).cloned();
            let job = match existing {
                Some(existing) => modify_job(&mut inner, existing, &sub, node.clone()),
                None => create_job(&mut inner, &id, &sub, node.clone()),
            };
            results.insert(id, job);
        }

        results
    }

    /// `get(ids?, ts?, seq?, tag?, **filters) -> { id -> job }`. See §4.1.
    pub fn get(&self, query: &Query) -> HashMap<String, Job> {
        let inner = self.inner.lock().unwrap();
        self.get_locked(&inner, query)
    }

    fn get_locked(&self, inner: &Inner, query: &Query) -> HashMap<String, Job> {
        if let Some(ids) = &query.ids {
            return ids
                .iter()
                .filter_map(|id| inner.jobs.get(id).cloned().map(|j| (id.clone(), j)))
                .collect();
        }

        let explicit_by_node_ts_seq =
            query.fields.contains_key("node") || query.ts.is_some() || query.seq.is_some();

        inner
            .jobs
            .iter()
            .filter(|(_, job)| {
                if let Some(ts) = query.ts {
                    if !(job.ts > ts) {
                        return false;
                    }
                }
                if let Some(seq) = query.seq {
                    if !(job.seq > seq) {
                        return false;
                    }
                }
                if let Some(tag) = &query.tag {
                    if !job.tags.iter().any(|t| t == tag) {
                        return false;
                    }
                }
                if self.node.is_some() && job.node.is_none() && !explicit_by_node_ts_seq {
                    return false;
                }
                true
            })
            .filter(|(_, job)| query.matches_fields(job))
            .map(|(id, job)| (id.clone(), job.clone()))
            .collect()
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        let inner = self.inner.lock().unwrap();
        inner.jobs.get(id).cloned()
    }

    /// `update(id, **fields)`. Always replaces `seq` with the next monotonic
    /// value; preserves caller-supplied `ts` or sets current wall-clock.
    pub fn update_job(&self, id: &str, patch: JobPatch) -> Option<Job> {
        let mut inner = self.inner.lock().unwrap();
        apply_patch(&mut inner, id, patch)
    }

    /// `kill(arg)`: sets `state = killed` on every matched job.
    pub fn kill(&self, query: &Query) -> HashMap<String, Option<Job>> {
        let ids = {
            let inner = self.inner.lock().unwrap();
            self.get_locked(&inner, query).into_keys().collect::<Vec<_>>()
        };
        let mut out = HashMap::new();
        for id in ids {
            let job = self.update_job(&id, JobPatch::new().state(JobState::Killed));
            out.insert(id, job);
        }
        out
    }

    pub fn list(&self, query: &Query) -> Vec<String> {
        self.get(query).into_keys().collect()
    }

    // ---- node/pool status ----

    pub fn get_nodes(&self) -> HashMap<String, NodeStatus> {
        self.inner.lock().unwrap().nodes.clone()
    }

    pub fn update_node(&self, node: &str, status: NodeStatus) {
        let mut inner = self.inner.lock().unwrap();
        let online = status.online;
        let entry = inner.nodes.entry(node.to_string()).or_default();
        *entry = status;
        if !online {
            entry.pools.clear();
        }
    }

    pub fn update_pool(&self, pool: &str, node: &str, slots: Option<Slots>) {
        let mut inner = self.inner.lock().unwrap();
        match slots {
            Some(s) => {
                inner
                    .nodes
                    .entry(node.to_string())
                    .or_default()
                    .pools
                    .insert(pool.to_string(), s);
            }
            None => {
                if let Some(n) = inner.nodes.get_mut(node) {
                    n.pools.remove(pool);
                }
            }
        }
    }

    /// Derived view: for each pool, node -> slots-free, subtracting this
    /// box's non-inactive jobs assigned to that (node,pool) when a numeric
    /// capacity was published.
    pub fn get_pools(&self) -> HashMap<String, HashMap<String, Slots>> {
        let inner = self.inner.lock().unwrap();
        pool_status(&inner)
    }

    /// Merges incoming jobs/status from a peer. See §4.4.
    pub fn sync(
        &self,
        jobs: HashMap<String, Job>,
        status: HashMap<String, NodeStatus>,
    ) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let mut updated = Vec::new();
        for (id, incoming) in jobs {
            let accept = match inner.jobs.get(&id) {
                None => true,
                Some(local) => incoming.ts > local.ts,
            };
            if accept {
                inner.jobs.insert(id.clone(), incoming);
                updated.push(id);
            }
        }
        for (node, ns) in status {
            inner.nodes.insert(node, ns);
        }
        updated
    }

    // ---- background loop, see §4.1 "Background loop" ----

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        let mut checkpoint_count: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut inner = self.inner.lock().unwrap();
                    self.tick(&mut inner, &mut checkpoint_count);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(path) = inner.config.file.clone() {
            save_snapshot(&mut inner, &path);
        }
    }

    fn tick(&self, inner: &mut Inner, checkpoint_count: &mut u64) {
        let now = now_ts();

        // 1. history for newly-terminal jobs.
        let hist_seq = inner.hist_seq;
        let terminal_ids: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, j)| j.seq > hist_seq && j.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &terminal_ids {
            write_history(inner, id);
        }
        inner.hist_seq = inner.seq;

        // 2. expiry.
        let expire = inner.config.expire as f64;
        let expire_active = inner.config.expire_active_jobs;
        let nodes_snapshot = inner.nodes.clone();
        let expired_ids: Vec<String> = inner
            .jobs
            .iter()
            .filter(|(_, j)| now - j.ts > expire)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired_ids {
            let Some(job) = inner.jobs.get(&id).cloned() else {
                continue;
            };
            if job.state.is_terminal() {
                inner.jobs.remove(&id);
            } else if expire_active
                && !nodes_snapshot
                    .get(job.node.as_deref().unwrap_or(""))
                    .map(|n| n.online)
                    .unwrap_or(false)
            {
                tracing::warn!(job = %id, node = ?job.node, "expiring active job on offline node");
                apply_patch(
                    inner,
                    &id,
                    JobPatch::new()
                        .state(JobState::Failed)
                        .active(false)
                        .error(Some("expired".to_string()))
                        .fail_count(job.fail_count + 1),
                );
            } else {
                apply_patch(inner, &id, JobPatch::new());
            }
        }

        // 3. restart/retry/resubmit sweep.
        let candidates: Vec<(String, Job)> = inner
            .jobs
            .iter()
            .map(|(id, j)| (id.clone(), j.clone()))
            .collect();
        for (id, job) in candidates {
            let this_node = self.node.as_deref().is_some_and(|n| job.node.as_deref() == Some(n))
                && !job.resubmit;
            let resubmittable = job.resubmit
                && !job.active
                && !matches!(job.state, JobState::New | JobState::Killed)
                && self
                    .node
                    .as_deref()
                    .is_some_and(|n| job.submit_node.as_deref() == Some(n));

            if !(this_node || resubmittable) {
                continue;
            }
            let mut restart = false;
            if job.restart && matches!(job.state, JobState::Done) {
                restart = true;
            } else if matches!(job.state, JobState::Failed) && job.fail_count <= job.retries {
                tracing::info!(job = %id, fail_count = job.fail_count, retries = job.retries, "retrying job");
                restart = true;
            }
            if restart {
                if resubmittable {
                    tracing::info!(job = %id, "resubmitting job to submit node");
                    apply_patch(
                        inner,
                        &id,
                        JobPatch::new()
                            .state(JobState::New)
                            .active(false)
                            .submit_ts(now)
                            .node(self.node.clone()),
                    );
                } else {
                    tracing::info!(job = %id, "restarting job");
                    apply_patch(inner, &id, JobPatch::new().state(JobState::New).active(false));
                }
            }
        }

        // 4. node timeout sweep.
        let timeout = inner.config.timeout as f64;
        let stale: Vec<(String, bool)> = inner
            .nodes
            .iter()
            .filter(|(_, ns)| now - ns.ts > timeout)
            .map(|(name, ns)| (name.clone(), ns.remove.unwrap_or(false)))
            .collect();
        for (name, remove) in stale {
            if remove {
                tracing::info!(node = %name, "removing node");
                inner.nodes.remove(&name);
            } else if let Some(ns) = inner.nodes.get_mut(&name) {
                if ns.online {
                    tracing::warn!(node = %name, timeout, "node not updated within timeout, marking offline");
                    ns.online = false;
                    ns.pools.clear();
                }
            }
        }

        // 5. periodic checkpoint.
        if let Some(every) = inner.config.checkpoint {
            if every > 0 {
                *checkpoint_count = (*checkpoint_count + 1) % every;
                if *checkpoint_count == 0 {
                    if let Some(path) = inner.config.file.clone() {
                        save_snapshot(inner, &path);
                    }
                }
            }
        }
    }
}

fn pool_members(inner: &Inner, pool: &str) -> Vec<String> {
    pool_status(inner)
        .get(pool)
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

fn pool_status(inner: &Inner) -> HashMap<String, HashMap<String, Slots>> {
    let mut out: HashMap<String, HashMap<String, Slots>> = HashMap::new();
    for (node, status) in &inner.nodes {
        for (pool, slots) in &status.pools {
            let free = match slots {
                Slots::Unlimited => Slots::Unlimited,
                Slots::Count(n) => {
                    let running = inner
                        .jobs
                        .values()
                        .filter(|j| {
                            j.node.as_deref() == Some(node.as_str())
                                && j.pool == *pool
                                && !j.state.is_terminal()
                        })
                        .count() as i64;
                    Slots::Count(*n - running)
                }
            };
            out.entry(pool.clone()).or_default().insert(node.clone(), free);
        }
    }
    out
}

fn write_history(inner: &mut Inner, id: &str) {
    let Some(job) = inner.jobs.get(id) else {
        return;
    };
    if let Some(file) = &mut inner.hist_file {
        let mut entry = HashMap::new();
        entry.insert(id.to_string(), job);
        let record = JobHistoryRecord { entry };
        if let Err(err) = meeseeks_core::persist::append_json_line(file, &record) {
            tracing::warn!(error = %err, "failed to write history record");
        }
    }
}

fn save_snapshot(inner: &mut Inner, path: &std::path::Path) {
    if let Err(err) = meeseeks_core::persist::atomic_write_json(path, &inner.jobs) {
        tracing::warn!(path = %path.display(), error = %err, "failed to save state snapshot");
    } else {
        tracing::info!(path = %path.display(), "saved state snapshot");
    }
}

fn apply_patch(inner: &mut Inner, id: &str, patch: JobPatch) -> Option<Job> {
    let ts = patch.ts_or_now();
    let job = inner.jobs.get_mut(id)?;
    patch.apply(job);
    job.ts = ts;
    inner.seq += 1;
    job.seq = inner.seq;
    Some(job.clone())
}

/// Builds a brand-new job from a submission. Requires `pool`; returns `None`
/// (caller reports `{id: false}`) if missing.
fn create_job(
    inner: &mut Inner,
    id: &str,
    sub: &JobSubmission,
    node: Option<String>,
) -> Option<Job> {
    let pool = sub.pool.clone()?;
    let now = now_ts();
    let tags: Vec<String> = sub
        .tags
        .clone()
        .map(Into::<Vec<String>>::into)
        .unwrap_or_default();

    let job = Job {
        id: id.to_string(),
        pool,
        args: sub.args.clone().unwrap_or_default(),
        env: sub.env.clone().unwrap_or_default(),
        uid: sub.uid.clone(),
        gid: sub.gid.clone(),
        stdin: sub.stdin.clone(),
        stdout: sub.stdout.clone(),
        stderr: sub.stderr.clone(),
        node: node.clone(),
        filter: sub.filter.clone(),
        restart: sub.restart.unwrap_or(false),
        retries: sub.retries.unwrap_or(0),
        resubmit: sub.resubmit.unwrap_or(false),
        runtime: sub.runtime,
        hold: sub.hold.unwrap_or(false),
        config: sub.config.clone().unwrap_or(serde_json::Value::Null),
        tags,
        state: JobState::New,
        active: false,
        submit_node: node,
        rc: None,
        error: None,
        stdout_data: None,
        stderr_data: None,
        pid: None,
        ts: now,
        seq: 0,
        submit_ts: now,
        start_ts: None,
        end_ts: None,
        start_count: 0,
        fail_count: 0,
    };
    inner.seq += 1;
    let mut job = job;
    job.seq = inner.seq;
    inner.jobs.insert(id.to_string(), job.clone());
    tracing::info!(job = %id, pool = %job.pool, "submitted job");
    Some(job)
}

/// Applies a modify-submission to an existing job per the rules of §4.1:
/// inactive jobs accept only `state=new` plus re-routing fields (plus any
/// other spec fields, merged and re-timestamped); active jobs accept only
/// `state=killed` and never a `node`/`pool` change.
fn modify_job(
    inner: &mut Inner,
    existing: Job,
    sub: &JobSubmission,
    node_override: Option<String>,
) -> Option<Job> {
    let id = existing.id.clone();
    let mut merge_fields = |job: &mut Job, allow_node_pool: bool| {
        if allow_node_pool {
            if let Some(pool) = &sub.pool {
                job.pool = pool.clone();
            }
        }
        if let Some(args) = &sub.args {
            job.args = args.clone();
        }
        if let Some(env) = &sub.env {
            job.env = env.clone();
        }
        if let Some(stdin) = &sub.stdin {
            job.stdin = Some(stdin.clone());
        }
        if let Some(stdout) = &sub.stdout {
            job.stdout = Some(stdout.clone());
        }
        if let Some(stderr) = &sub.stderr {
            job.stderr = Some(stderr.clone());
        }
        if let Some(filter) = &sub.filter {
            job.filter = Some(filter.clone());
        }
        if let Some(restart) = sub.restart {
            job.restart = restart;
        }
        if let Some(retries) = sub.retries {
            job.retries = retries;
        }
        if let Some(resubmit) = sub.resubmit {
            job.resubmit = resubmit;
        }
        if let Some(runtime) = sub.runtime {
            job.runtime = Some(runtime);
        }
        if let Some(hold) = sub.hold {
            job.hold = hold;
        }
        if let Some(config) = &sub.config {
            job.config = config.clone();
        }
        if let Some(tags) = sub.tags.clone() {
            job.tags = tags.into();
        }
    };

    if existing.state.is_terminal() {
        // inactive job: only `state = new` (plus re-routing) is honored.
        if !matches!(sub.state, Some(JobState::New)) {
            // other fields still merge and re-timestamp, per the documented
            // resolution of the terminal-job-submit ambiguity (§9).
            let mut job = existing;
            merge_fields(&mut job, false);
            inner.jobs.insert(id.clone(), job);
            return apply_patch(inner, &id, JobPatch::new());
        }
        let mut job = existing.clone();
        merge_fields(&mut job, true);
        let reset_node = node_override.clone().or_else(|| existing.submit_node.clone());
        job.node = reset_node.clone();
        if node_override.is_some() {
            job.submit_node = node_override;
        }
        job.active = false;
        job.error = None;
        job.start_count = 0;
        job.fail_count = 0;
        job.submit_ts = now_ts();
        job.state = JobState::New;
        inner.jobs.insert(id.clone(), job);
        apply_patch(inner, &id, JobPatch::new())
    } else {
        // active job: only killable; node/pool are immutable.
        let mut job = existing;
        merge_fields(&mut job, false);
        if matches!(sub.state, Some(JobState::Killed)) {
            job.state = JobState::Killed;
        }
        inner.jobs.insert(id.clone(), job);
        apply_patch(inner, &id, JobPatch::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> State {
        State::new(Some("box1".to_string()), StateConfig::default()).unwrap()
    }

    fn submission(pool: &str) -> JobSubmission {
        JobSubmission {
            pool: Some(pool.to_string()),
            node: Some(NodeSpec::One("box1".to_string())),
            ..Default::default()
        }
    }

    #[test]
    fn submit_without_pool_is_rejected() {
        let state = state();
        let sub = JobSubmission::default();
        let results = state.submit(sub);
        let (_, job) = results.into_iter().next().unwrap();
        assert!(job.is_none());
    }

    #[test]
    fn submit_creates_a_new_job_with_monotonic_seq() {
        let state = state();
        let results = state.submit(submission("work"));
        let (id, job) = results.into_iter().next().unwrap();
        let job = job.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.pool, "work");
        assert_eq!(job.state, JobState::New);
        assert!(!job.active);
        let first_seq = job.seq;

        let updated = state
            .update_job(&id, JobPatch::new().state(JobState::Running).active(true))
            .unwrap();
        assert!(updated.seq > first_seq);
    }

    #[test]
    fn multi_submit_mints_distinct_ids_even_with_a_caller_supplied_id() {
        let state = state();
        let sub = JobSubmission {
            id: Some("shared".to_string()),
            pool: Some("work".to_string()),
            node: Some(NodeSpec::Many(vec!["box1".to_string(), "box2".to_string()])),
            ..Default::default()
        };
        let results = state.submit(sub);
        assert_eq!(results.len(), 2);
        let ids: Vec<&String> = results.keys().collect();
        assert_ne!(ids[0], ids[1]);
        for job in results.values() {
            assert!(job.is_some());
        }
    }

    #[test]
    fn kill_on_a_terminal_job_does_not_touch_counts() {
        let state = state();
        let (id, _) = state.submit(submission("work")).into_iter().next().unwrap();
        state.update_job(
            &id,
            JobPatch::new()
                .state(JobState::Done)
                .active(false)
                .start_count(1)
                .fail_count(0),
        );

        let query = Query {
            ids: Some(IdsSpec::One(id.clone())),
            ..Default::default()
        };
        let killed = state.kill(&query);
        let job = killed.get(&id).unwrap().clone().unwrap();
        assert_eq!(job.state, JobState::Killed);
        assert_eq!(job.start_count, 1);
        assert_eq!(job.fail_count, 0);
    }

    #[test]
    fn active_job_rejects_node_and_pool_changes() {
        let state = state();
        let (id, _) = state.submit(submission("work")).into_iter().next().unwrap();
        state.update_job(&id, JobPatch::new().state(JobState::Running).active(true));

        let modify = JobSubmission {
            id: Some(id.clone()),
            pool: Some("other".to_string()),
            node: Some(NodeSpec::One("box2".to_string())),
            ..Default::default()
        };
        state.submit(modify);

        let job = state.get_job(&id).unwrap();
        assert_eq!(job.pool, "work");
        assert_eq!(job.node.as_deref(), Some("box1"));
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn terminal_job_resubmit_with_state_new_clears_error_and_counts() {
        let state = state();
        let (id, _) = state.submit(submission("work")).into_iter().next().unwrap();
        state.update_job(
            &id,
            JobPatch::new()
                .state(JobState::Failed)
                .active(false)
                .error(Some("boom".to_string()))
                .fail_count(2),
        );

        let modify = JobSubmission {
            id: Some(id.clone()),
            state: Some(JobState::New),
            ..Default::default()
        };
        state.submit(modify);

        let job = state.get_job(&id).unwrap();
        assert_eq!(job.state, JobState::New);
        assert_eq!(job.error, None);
        assert_eq!(job.fail_count, 0);
        assert!(!job.active);
    }

    #[test]
    fn sync_accepts_only_strictly_newer_timestamps() {
        let state = state();
        let mut incoming = HashMap::new();
        let mut job = Job {
            id: "remote1".to_string(),
            pool: "work".to_string(),
            args: vec![],
            env: Default::default(),
            uid: None,
            gid: None,
            stdin: None,
            stdout: None,
            stderr: None,
            node: Some("box2".to_string()),
            filter: None,
            restart: false,
            retries: 0,
            resubmit: false,
            runtime: None,
            hold: false,
            config: serde_json::Value::Null,
            tags: vec![],
            state: JobState::Running,
            active: true,
            submit_node: Some("box2".to_string()),
            rc: None,
            error: None,
            stdout_data: None,
            stderr_data: None,
            pid: None,
            ts: 100.0,
            seq: 5,
            submit_ts: 100.0,
            start_ts: Some(100.0),
            end_ts: None,
            start_count: 1,
            fail_count: 0,
        };
        incoming.insert("remote1".to_string(), job.clone());
        let updated = state.sync(incoming.clone(), HashMap::new());
        assert_eq!(updated, vec!["remote1".to_string()]);

        // stale update (older ts) must not overwrite the local copy.
        job.ts = 50.0;
        job.state = JobState::Done;
        incoming.insert("remote1".to_string(), job);
        let updated = state.sync(incoming, HashMap::new());
        assert!(updated.is_empty());
        assert_eq!(state.get_job("remote1").unwrap().state, JobState::Running);
    }
}
