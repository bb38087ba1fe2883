//! [`JobPatch`]: a typed, chainable builder standing in for the original
//! implementation's `update_job(jid, **data)` kwargs-style update. Only the
//! fields actually mutated by [`crate::state`], [`crate::pool`] and
//! [`crate::peer`] are represented; each is `Option<T>` (unset = "leave
//! alone") except fields that are themselves nullable, which are
//! `Option<Option<T>>` (unset = leave alone, `Some(None)` = clear it).

use meeseeks_core::{Job, JobState};

#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    ts: Option<f64>,
    state: Option<JobState>,
    active: Option<bool>,
    node: Option<Option<String>>,
    submit_node: Option<Option<String>>,
    rc: Option<Option<i32>>,
    error: Option<Option<String>>,
    stdout_data: Option<Option<String>>,
    stderr_data: Option<Option<String>>,
    pid: Option<Option<u32>>,
    start_ts: Option<Option<f64>>,
    end_ts: Option<Option<f64>>,
    start_count: Option<u32>,
    fail_count: Option<u32>,
    submit_ts: Option<f64>,
    args: Option<Vec<String>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ts(mut self, v: f64) -> Self {
        self.ts = Some(v);
        self
    }

    pub fn state(mut self, v: JobState) -> Self {
        self.state = Some(v);
        self
    }

    pub fn active(mut self, v: bool) -> Self {
        self.active = Some(v);
        self
    }

    pub fn node(mut self, v: Option<String>) -> Self {
        self.node = Some(v);
        self
    }

    pub fn submit_node(mut self, v: Option<String>) -> Self {
        self.submit_node = Some(v);
        self
    }

    pub fn rc(mut self, v: Option<i32>) -> Self {
        self.rc = Some(v);
        self
    }

    pub fn error(mut self, v: Option<String>) -> Self {
        self.error = Some(v);
        self
    }

    pub fn stdout_data(mut self, v: Option<String>) -> Self {
        self.stdout_data = Some(v);
        self
    }

    pub fn stderr_data(mut self, v: Option<String>) -> Self {
        self.stderr_data = Some(v);
        self
    }

    pub fn pid(mut self, v: Option<u32>) -> Self {
        self.pid = Some(v);
        self
    }

    pub fn start_ts(mut self, v: Option<f64>) -> Self {
        self.start_ts = Some(v);
        self
    }

    pub fn end_ts(mut self, v: Option<f64>) -> Self {
        self.end_ts = Some(v);
        self
    }

    pub fn start_count(mut self, v: u32) -> Self {
        self.start_count = Some(v);
        self
    }

    pub fn fail_count(mut self, v: u32) -> Self {
        self.fail_count = Some(v);
        self
    }

    pub fn submit_ts(mut self, v: f64) -> Self {
        self.submit_ts = Some(v);
        self
    }

    /// Only used by the `__config` job reply path (§4.5), which writes the
    /// current config tree back through the job's `args` rather than a
    /// dedicated response channel.
    pub fn args(mut self, v: Vec<String>) -> Self {
        self.args = Some(v);
        self
    }

    /// The timestamp this patch should be recorded with: the explicit `ts`
    /// if set, otherwise current wall-clock (matching `data.setdefault('ts',
    /// time.time())` in the original `update_job`).
    pub fn ts_or_now(&self) -> f64 {
        self.ts.unwrap_or_else(meeseeks_core::now_ts)
    }

    pub fn apply(self, job: &mut Job) {
        if let Some(v) = self.state {
            job.state = v;
        }
        if let Some(v) = self.active {
            job.active = v;
        }
        if let Some(v) = self.node {
            job.node = v;
        }
        if let Some(v) = self.submit_node {
            job.submit_node = v;
        }
        if let Some(v) = self.rc {
            job.rc = v;
        }
        if let Some(v) = self.error {
            job.error = v;
        }
        if let Some(v) = self.stdout_data {
            job.stdout_data = v;
        }
        if let Some(v) = self.stderr_data {
            job.stderr_data = v;
        }
        if let Some(v) = self.pid {
            job.pid = v;
        }
        if let Some(v) = self.start_ts {
            job.start_ts = v;
        }
        if let Some(v) = self.end_ts {
            job.end_ts = v;
        }
        if let Some(v) = self.start_count {
            job.start_count = v;
        }
        if let Some(v) = self.fail_count {
            job.fail_count = v;
        }
        if let Some(v) = self.submit_ts {
            job.submit_ts = v;
        }
        if let Some(v) = self.args {
            job.args = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job {
            id: "j1".to_string(),
            pool: "default".to_string(),
            args: vec![],
            env: Default::default(),
            uid: None,
            gid: None,
            stdin: None,
            stdout: None,
            stderr: None,
            node: Some("box1".to_string()),
            filter: None,
            restart: false,
            retries: 0,
            resubmit: false,
            runtime: None,
            hold: false,
            config: serde_json::Value::Null,
            tags: vec![],
            state: JobState::New,
            active: true,
            submit_node: None,
            rc: None,
            error: None,
            stdout_data: None,
            stderr_data: None,
            pid: None,
            ts: 0.0,
            seq: 0,
            submit_ts: 0.0,
            start_ts: None,
            end_ts: None,
            start_count: 0,
            fail_count: 0,
        }
    }

    #[test]
    fn unset_fields_leave_job_unchanged() {
        let mut job = sample_job();
        job.rc = Some(7);
        JobPatch::new().state(JobState::Running).apply(&mut job);
        assert_eq!(job.state, JobState::Running);
        // rc was never touched by the patch, so it survives untouched.
        assert_eq!(job.rc, Some(7));
    }

    #[test]
    fn some_none_clears_a_nullable_field() {
        let mut job = sample_job();
        job.error = Some("boom".to_string());
        JobPatch::new().error(None).apply(&mut job);
        assert_eq!(job.error, None);
    }

    #[test]
    fn ts_or_now_defaults_to_current_time_when_unset() {
        let before = meeseeks_core::now_ts();
        let now = JobPatch::new().ts_or_now();
        assert!(now >= before);
    }

    #[test]
    fn ts_or_now_honors_explicit_ts() {
        assert_eq!(JobPatch::new().ts(12.5).ts_or_now(), 12.5);
    }

    #[test]
    fn chained_builder_applies_every_field() {
        let mut job = sample_job();
        JobPatch::new()
            .state(JobState::Done)
            .active(false)
            .rc(Some(0))
            .pid(None)
            .start_count(3)
            .apply(&mut job);
        assert_eq!(job.state, JobState::Done);
        assert!(!job.active);
        assert_eq!(job.rc, Some(0));
        assert_eq!(job.pid, None);
        assert_eq!(job.start_count, 3);
    }
}
