//! uid/gid resolution and privilege drop for child processes. Unix only: a
//! job's `uid`/`gid` only ever takes effect when this process can actually
//! assume another identity, matching the original implementation's `su()`.

use crate::error::TaskError;
use crate::job::IdOrName;

/// Resolves a numeric id or user name to a uid via the platform's user
/// database.
#[cfg(unix)]
pub fn resolve_uid(spec: &IdOrName) -> Result<u32, TaskError> {
    match spec {
        IdOrName::Id(id) => Ok(*id),
        IdOrName::Name(name) => lookup_uid(name).ok_or_else(|| TaskError::UnknownUser(name.clone())),
    }
}

/// Resolves a numeric id or group name to a gid via the platform's group
/// database.
#[cfg(unix)]
pub fn resolve_gid(spec: &IdOrName) -> Result<u32, TaskError> {
    match spec {
        IdOrName::Id(id) => Ok(*id),
        IdOrName::Name(name) => {
            lookup_gid(name).ok_or_else(|| TaskError::UnknownGroup(name.clone()))
        }
    }
}

/// The primary group of `uid`, used when a job sets `uid` but not `gid`.
#[cfg(unix)]
pub fn primary_group_of(uid: u32) -> Option<u32> {
    // SAFETY: getpwuid returns a pointer to a thread-local static owned by
    // libc; we copy the single field we need out before it can be reused.
    unsafe {
        let pw = libc::getpwuid(uid as libc::uid_t);
        if pw.is_null() {
            None
        } else {
            Some((*pw).pw_gid as u32)
        }
    }
}

#[cfg(unix)]
fn lookup_uid(name: &str) -> Option<u32> {
    let cname = std::ffi::CString::new(name).ok()?;
    // SAFETY: cname stays alive for the duration of the call; we copy the
    // returned pw_uid immediately rather than retaining the pointer.
    unsafe {
        let pw = libc::getpwnam(cname.as_ptr());
        if pw.is_null() {
            None
        } else {
            Some((*pw).pw_uid as u32)
        }
    }
}

#[cfg(unix)]
fn lookup_gid(name: &str) -> Option<u32> {
    let cname = std::ffi::CString::new(name).ok()?;
    // SAFETY: see lookup_uid.
    unsafe {
        let gr = libc::getgrnam(cname.as_ptr());
        if gr.is_null() {
            None
        } else {
            Some((*gr).gr_gid as u32)
        }
    }
}

/// Drops effective privileges to `uid`/`gid` and becomes a session leader, so
/// a later signal-kill of the whole process group reaches the child. Must
/// only be called from the child side of a fork (e.g. from a `pre_exec`
/// closure); refuses to run as uid 0.
///
/// # Safety
/// Only async-signal-safe libc calls are made here, as required inside a
/// `pre_exec` closure running between `fork` and `exec`.
#[cfg(unix)]
pub unsafe fn drop_privileges_in_child(uid: u32, gid: u32) -> std::io::Result<()> {
    if uid == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "refusing to drop privileges to uid 0",
        ));
    }
    if libc::setgid(gid as libc::gid_t) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if libc::setuid(uid as libc::uid_t) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    if libc::setsid() < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn resolve_numeric_uid_is_identity() {
        assert_eq!(resolve_uid(&IdOrName::Id(1000)).unwrap(), 1000);
    }

    #[test]
    fn resolve_unknown_user_errors() {
        let err = resolve_uid(&IdOrName::Name(
            "definitely-not-a-real-user-xyz".to_string(),
        ));
        assert!(err.is_err());
    }
}
