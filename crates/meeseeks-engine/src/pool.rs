//! Per-(node, pool) job queue manager: claims jobs assigned to this pool,
//! starts/kills [`Task`]s, enforces slot/hold/drain and runtime caps, and
//! publishes free-slot status back to [`State`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use meeseeks_core::envelope::Query;
use meeseeks_core::job::Slots;
use meeseeks_core::{now_ts, Job, JobState};

use crate::patch::JobPatch;
use crate::state::State;
use crate::task::Task;

/// Static (per-run) configuration of a pool, set from the box's config tree
/// under `pools.<name>`.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub slots: Slots,
    pub update: Option<u64>,
    pub runtime: Option<u64>,
    pub hold: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            slots: Slots::Unlimited,
            update: None,
            runtime: None,
            hold: false,
        }
    }
}

impl PoolConfig {
    /// `slots == 0` means unlimited; `drain` forces the free-slot count to
    /// zero so no new job is started but running jobs finish normally.
    pub fn new(slots: i64, update: Option<u64>, runtime: Option<u64>, drain: bool, hold: bool) -> Self {
        let mut slots = if slots == 0 {
            Slots::Unlimited
        } else {
            Slots::Count(slots)
        };
        if drain {
            slots = Slots::Count(0);
        }
        PoolConfig {
            slots,
            update,
            runtime,
            hold,
        }
    }
}

/// One pool worker loop, running on a single node.
///
/// `config` is shared behind a lock so a config-reload (§4.5) can update
/// slots/update/runtime/hold in place without tearing down the running
/// pool or its in-flight tasks.
pub struct Pool {
    node: String,
    pool: String,
    state: State,
    config: Arc<RwLock<PoolConfig>>,
    tasks: HashMap<String, Task>,
}

impl Pool {
    pub fn new(node: String, pool: String, state: State, config: Arc<RwLock<PoolConfig>>) -> Self {
        Pool {
            node,
            pool,
            state,
            config,
            tasks: HashMap::new(),
        }
    }

    fn config(&self) -> PoolConfig {
        *self.config.read().unwrap()
    }

    /// Shared handle a supervisor can use to apply a config reload in place.
    pub fn config_handle(&self) -> Arc<RwLock<PoolConfig>> {
        self.config.clone()
    }

    fn pool_query(&self) -> Query {
        let mut q = Query::default();
        q.fields
            .insert("node".to_string(), serde_json::Value::String(self.node.clone()));
        q.fields
            .insert("pool".to_string(), serde_json::Value::String(self.pool.clone()));
        q
    }

    /// Mirrors the original pool's `update_job` hook: `active` tracks
    /// whether the (new) state is terminal, unless the caller set it
    /// explicitly (e.g. the hold-without-running claim).
    fn update_job(&self, jid: &str, mut patch: JobPatch, state_transition: Option<JobState>) -> Option<Job> {
        if let Some(s) = state_transition {
            patch = patch.active(!s.is_terminal());
        }
        let job = self.state.update_job(jid, patch);
        if let Some(job) = &job {
            debug_assert!(
                job.is_active_terminal_consistent(),
                "job {} is active but in a terminal state",
                job.id
            );
        }
        job
    }

    async fn start_job(&mut self, jid: &str, start_count: u32) {
        let Some(job) = self.state.get_job(jid) else {
            return;
        };
        match Task::spawn(&job).await {
            Ok(task) => {
                let info = task.info();
                self.tasks.insert(jid.to_string(), task);
                self.update_job(
                    jid,
                    JobPatch::new()
                        .state(JobState::Running)
                        .start_ts(Some(now_ts()))
                        .start_count(start_count + 1)
                        .pid(info.pid),
                    Some(JobState::Running),
                );
                tracing::info!(job = %jid, node = %self.node, pool = %self.pool, "job started");
            }
            Err(err) => {
                tracing::warn!(job = %jid, error = %err, "failed to start job");
                self.update_job(
                    jid,
                    JobPatch::new().state(JobState::Failed).error(Some(err.to_string())),
                    Some(JobState::Failed),
                );
            }
        }
    }

    async fn kill_job(&mut self, jid: &str, state: JobState) -> Option<Job> {
        let mut patch = JobPatch::new();
        if let Some(task) = self.tasks.remove(jid) {
            tracing::debug!(job = %jid, "killing task");
            task.kill(9).await;
            let info = task.info();
            patch = patch
                .pid(info.pid)
                .rc(info.rc)
                .stdout_data(info.stdout_data)
                .stderr_data(info.stderr_data);
        }
        self.update_job(jid, patch.state(state), Some(state))
    }

    pub async fn run(&mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown_drain().await;
    }

    async fn tick(&mut self) {
        let config = self.config();
        let pool_jobs = self.state.get(&self.pool_query());
        let mut sorted: Vec<(String, Job)> = pool_jobs.clone().into_iter().collect();
        sorted.sort_by(|a, b| a.1.submit_ts.partial_cmp(&b.1.submit_ts).unwrap());

        for (jid, mut job) in sorted {
            if self.tasks.contains_key(&jid) {
                let exit = self.tasks.get(&jid).unwrap().poll();
                if let Some(success) = exit {
                    let mut fail_count = job.fail_count;
                    let mut state = job.state;
                    if matches!(job.state, JobState::Running) {
                        if success {
                            state = JobState::Done;
                        } else {
                            fail_count += 1;
                            state = JobState::Failed;
                        }
                    }
                    if let Some(updated) = self.kill_finished_task(&jid, state, fail_count).await {
                        job = updated;
                    }
                    tracing::info!(job = %jid, state = ?state, "task exited");
                } else if let Some(runtime) = job.runtime {
                    if now_ts() - job.start_ts.unwrap_or(0.0) > runtime as f64 {
                        tracing::warn!(job = %jid, runtime, "job exceeded job runtime");
                        if let Some(u) = self.kill_job(&jid, JobState::Failed).await {
                            job = u;
                        }
                    } else {
                        self.reassert_running(&jid, &mut job).await;
                    }
                } else if let Some(max_runtime) = config.runtime {
                    if now_ts() - job.start_ts.unwrap_or(0.0) > max_runtime as f64 {
                        tracing::warn!(job = %jid, max_runtime, "job exceeded pool runtime");
                        if let Some(u) = self.kill_job(&jid, JobState::Failed).await {
                            job = u;
                        }
                    } else {
                        self.reassert_running(&jid, &mut job).await;
                    }
                } else {
                    self.reassert_running(&jid, &mut job).await;
                }
            } else if matches!(job.state, JobState::Running) {
                tracing::warn!(job = %jid, "job in state running but no task exists");
                if let Some(u) = self.update_job(
                    &jid,
                    JobPatch::new().state(JobState::Failed).error(Some("task".to_string())),
                    Some(JobState::Failed),
                ) {
                    job = u;
                }
            }

            if job.active {
                if matches!(job.state, JobState::Killed) {
                    if let Some(u) = self.kill_job(&jid, JobState::Killed).await {
                        job = u;
                    }
                } else if let Some(update_interval) = config.update {
                    if now_ts() - job.ts > update_interval as f64 {
                        self.update_job(&jid, JobPatch::new().state(job.state), Some(job.state));
                    }
                }
            }

            if matches!(job.state, JobState::New) {
                let has_slot = config
                    .slots
                    .free(self.tasks.len() as i64)
                    .map(|free| free > 0)
                    .unwrap_or(true);
                if !job.hold && !config.hold && has_slot {
                    self.start_job(&jid, job.start_count).await;
                } else {
                    self.update_job(&jid, JobPatch::new().active(true), None);
                }
            }
        }

        let orphans: Vec<String> = self
            .tasks
            .keys()
            .filter(|jid| !pool_jobs.contains_key(jid.as_str()))
            .cloned()
            .collect();
        for jid in orphans {
            tracing::warn!(job = %jid, "job not in state, killing orphaned task");
            self.kill_job(&jid, JobState::Failed).await;
        }

        self.state.update_pool(&self.pool, &self.node, Some(config.slots));
    }

    async fn kill_finished_task(&mut self, jid: &str, state: JobState, fail_count: u32) -> Option<Job> {
        let task = self.tasks.remove(jid)?;
        let info = task.info();
        self.update_job(
            jid,
            JobPatch::new()
                .state(state)
                .end_ts(Some(now_ts()))
                .fail_count(fail_count)
                .pid(info.pid)
                .rc(info.rc)
                .stdout_data(info.stdout_data)
                .stderr_data(info.stderr_data),
            Some(state),
        )
    }

    /// A job can get stuck in `new` if it is reset while running; put it
    /// back in `running` to match the task that is actually executing.
    async fn reassert_running(&mut self, jid: &str, job: &mut Job) {
        if matches!(job.state, JobState::New) {
            if let Some(u) = self.update_job(
                jid,
                JobPatch::new().state(JobState::Running),
                Some(JobState::Running),
            ) {
                *job = u;
            }
        }
    }

    async fn shutdown_drain(&mut self) {
        let jids: Vec<String> = self.tasks.keys().cloned().collect();
        for jid in jids {
            self.kill_job(&jid, JobState::Killed).await;
            self.update_job(
                &jid,
                JobPatch::new().state(JobState::Failed).error(Some("pool".to_string())),
                Some(JobState::Failed),
            );
        }
        self.state.update_pool(&self.pool, &self.node, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateConfig;
    use meeseeks_core::job::NodeSpec;
    use meeseeks_core::JobSubmission;

    fn test_pool(slots: i64) -> Pool {
        let state = State::new(Some("node1".to_string()), StateConfig::default()).unwrap();
        let config = Arc::new(RwLock::new(PoolConfig::new(slots, None, None, false, false)));
        Pool::new("node1".to_string(), "work".to_string(), state, config)
    }

    fn submit(pool: &Pool, args: Vec<&str>) -> String {
        let sub = JobSubmission {
            pool: Some("work".to_string()),
            node: Some(NodeSpec::One("node1".to_string())),
            args: Some(args.into_iter().map(String::from).collect()),
            ..Default::default()
        };
        pool.state.submit(sub).into_keys().next().unwrap()
    }

    async fn run_until<F: Fn(&Job) -> bool>(pool: &mut Pool, jid: &str, predicate: F) -> Job {
        for _ in 0..200 {
            pool.tick().await;
            if let Some(job) = pool.state.get_job(jid) {
                if predicate(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {jid} never reached expected state");
    }

    #[tokio::test]
    async fn a_new_job_starts_and_completes() {
        let mut pool = test_pool(0);
        let jid = submit(&pool, vec!["/bin/true"]);
        let job = run_until(&mut pool, &jid, |j| j.state == JobState::Done).await;
        assert_eq!(job.rc, Some(0));
        assert!(!job.active);
        assert_eq!(job.start_count, 1);
    }

    #[tokio::test]
    async fn a_failing_job_is_marked_failed_with_incremented_fail_count() {
        let mut pool = test_pool(0);
        let jid = submit(&pool, vec!["/bin/false"]);
        let job = run_until(&mut pool, &jid, |j| j.state == JobState::Failed).await;
        assert_eq!(job.fail_count, 1);
        assert!(!job.active);
    }

    #[tokio::test]
    async fn slot_limit_holds_a_second_job_until_the_first_finishes() {
        let mut pool = test_pool(1);
        let first = submit(&pool, vec!["/bin/sleep", "1"]);
        let second = submit(&pool, vec!["/bin/true"]);

        // first tick: only one slot, so the earlier-submitted job claims it
        // and the other is left in `new` with `active=true` (queued).
        pool.tick().await;
        let held = pool.state.get_job(&second).unwrap();
        assert_eq!(held.state, JobState::New);
        assert!(held.active);

        let finished_first = run_until(&mut pool, &first, |j| j.state == JobState::Done).await;
        assert_eq!(finished_first.rc, Some(0));
        let finished_second = run_until(&mut pool, &second, |j| j.state == JobState::Done).await;
        assert_eq!(finished_second.rc, Some(0));
    }

    #[tokio::test]
    async fn kill_while_running_terminates_the_task_and_marks_killed() {
        let mut pool = test_pool(0);
        let jid = submit(&pool, vec!["/bin/sleep", "30"]);
        run_until(&mut pool, &jid, |j| j.state == JobState::Running).await;

        pool.state.kill(&Query {
            ids: Some(meeseeks_core::envelope::IdsSpec::One(jid.clone())),
            ..Default::default()
        });

        let job = run_until(&mut pool, &jid, |j| !j.active).await;
        assert_eq!(job.state, JobState::Killed);
    }

    #[tokio::test]
    async fn shutdown_drain_fails_every_in_flight_task() {
        let mut pool = test_pool(0);
        let jid = submit(&pool, vec!["/bin/sleep", "30"]);
        run_until(&mut pool, &jid, |j| j.state == JobState::Running).await;

        pool.shutdown_drain().await;

        let job = pool.state.get_job(&jid).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("pool"));
    }
}
