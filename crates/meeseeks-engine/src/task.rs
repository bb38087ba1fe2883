//! Child process supervision. One [`Task`] per running job: spawns the job's
//! `args` as a child process, captures or redirects its stdio, and reports
//! completion without blocking the owning [`crate::pool`] loop.

use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use base64::Engine;
use meeseeks_core::privilege::{drop_privileges_in_child, primary_group_of, resolve_gid, resolve_uid};
use meeseeks_core::{Job, TaskError};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Fields a [`Task`] reports back so the owning pool can update the job
/// table. Mirrors the original implementation's `Task.info` dict.
#[derive(Debug, Clone, Default)]
pub struct TaskInfo {
    pub pid: Option<u32>,
    pub rc: Option<i32>,
    pub stdout_data: Option<String>,
    pub stderr_data: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Running,
    Success,
    Failure,
}

/// A supervised child process. Self-starting: construction spawns the
/// process and a background task that waits on it; [`Task::poll`] never
/// blocks.
pub struct Task {
    info: Arc<Mutex<TaskInfo>>,
    outcome: Arc<Mutex<Outcome>>,
    uid: Option<u32>,
    gid: Option<u32>,
}

fn redirect_output(path: &Option<String>) -> Result<Stdio, TaskError> {
    match path {
        Some(p) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .map_err(|source| TaskError::Io {
                    path: p.clone(),
                    source,
                })?;
            Ok(Stdio::from(file))
        }
        None => Ok(Stdio::piped()),
    }
}

impl Task {
    pub async fn spawn(job: &Job) -> Result<Task, TaskError> {
        let uid = match &job.uid {
            Some(spec) => Some(resolve_uid(spec)?),
            None => None,
        };
        let gid = match (&job.gid, uid) {
            (Some(spec), _) => Some(resolve_gid(spec)?),
            (None, Some(uid)) => primary_group_of(uid),
            (None, None) => None,
        };

        let program = job
            .args
            .first()
            .ok_or_else(|| TaskError::Spawn(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "job has no args to execute",
            )))?;

        let mut cmd = Command::new(program);
        cmd.args(&job.args[1..]);
        cmd.envs(&job.env);
        cmd.env("MEESEEKS_JOB_ID", &job.id);
        cmd.env("MEESEEKS_POOL", &job.pool);
        cmd.env("MEESEEKS_NODE", job.node.as_deref().unwrap_or_default());
        cmd.env(
            "MEESEEKS_SUBMIT_NODE",
            job.submit_node.as_deref().unwrap_or_default(),
        );
        cmd.env("MEESEEKS_TAGS", job.tags.join(","));

        match &job.stdin {
            Some(p) => {
                let file = std::fs::File::open(p).map_err(|source| TaskError::Io {
                    path: p.clone(),
                    source,
                })?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        let stdout_captured = job.stdout.is_none();
        let stderr_captured = job.stderr.is_none();
        cmd.stdout(redirect_output(&job.stdout)?);
        cmd.stderr(redirect_output(&job.stderr)?);

        if let (Some(uid), Some(gid)) = (uid, gid) {
            // SAFETY: only async-signal-safe libc calls happen between fork
            // and exec, as drop_privileges_in_child documents.
            unsafe {
                cmd.pre_exec(move || {
                    drop_privileges_in_child(uid, gid).map_err(std::io::Error::from)
                });
            }
        }

        let mut child = cmd.spawn().map_err(TaskError::Spawn)?;
        let pid = child.id();

        let info = Arc::new(Mutex::new(TaskInfo {
            pid,
            ..Default::default()
        }));
        let outcome = Arc::new(Mutex::new(Outcome::Running));

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let info_bg = info.clone();
        let outcome_bg = outcome.clone();

        tokio::spawn(async move {
            // Both pipes must be drained concurrently, not sequentially: a
            // child that fills one pipe's buffer while the other sits closed
            // (e.g. heavy stderr logging with stdout open) would otherwise
            // block on write() forever, since nothing is reading the second
            // pipe until the first hits EOF.
            let read_stdout = async {
                let mut buf = Vec::new();
                if stdout_captured {
                    if let Some(mut pipe) = stdout_pipe.take() {
                        let _ = pipe.read_to_end(&mut buf).await;
                    }
                }
                buf
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                if stderr_captured {
                    if let Some(mut pipe) = stderr_pipe.take() {
                        let _ = pipe.read_to_end(&mut buf).await;
                    }
                }
                buf
            };
            let (out_buf, err_buf) = tokio::join!(read_stdout, read_stderr);
            let status = child.wait().await;
            let success = matches!(&status, Ok(s) if s.success());

            let mut info = info_bg.lock().unwrap();
            info.pid = None;
            info.rc = status.ok().and_then(|s| s.code());
            if !out_buf.is_empty() {
                info.stdout_data = Some(base64::engine::general_purpose::STANDARD.encode(&out_buf));
            }
            if !err_buf.is_empty() {
                info.stderr_data = Some(base64::engine::general_purpose::STANDARD.encode(&err_buf));
            }
            drop(info);

            *outcome_bg.lock().unwrap() = if success {
                Outcome::Success
            } else {
                Outcome::Failure
            };
        });

        Ok(Task {
            info,
            outcome,
            uid,
            gid,
        })
    }

    pub fn info(&self) -> TaskInfo {
        self.info.lock().unwrap().clone()
    }

    /// `None` while running; `Some(true)`/`Some(false)` once the process has
    /// exited, reflecting success/failure. Matches `Task.poll()`.
    pub fn poll(&self) -> Option<bool> {
        match *self.outcome.lock().unwrap() {
            Outcome::Running => None,
            Outcome::Success => Some(true),
            Outcome::Failure => Some(false),
        }
    }

    /// Signals the child via a short-lived `kill` helper process run under
    /// the job's own uid/gid, so this process's own euid/egid never changes
    /// just to deliver a signal.
    pub async fn kill(&self, sig: u32) {
        let pid = match self.info.lock().unwrap().pid {
            Some(pid) => pid,
            None => return,
        };
        let mut cmd = Command::new("kill");
        cmd.arg(format!("-{sig}")).arg(pid.to_string());
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            // SAFETY: see spawn().
            unsafe {
                cmd.pre_exec(move || {
                    drop_privileges_in_child(uid, gid).map_err(std::io::Error::from)
                });
            }
        }
        if let Ok(mut child) = cmd.spawn() {
            let _ = child.wait().await;
        }
    }
}
