//! Real-time scheduling, CPU affinity and privilege drop.

use std::ffi::CString;

use crate::config::GlobalConfig;

/// Apply the `[global]` process tuning. Scheduler and affinity failures are
/// warnings (the gateway still works, just without RT guarantees); an
/// unknown user or group aborts startup.
pub fn init(global: &GlobalConfig) -> Result<(), RtError> {
    if global.priority != 0 {
        set_fifo_priority(global.priority);
    }
    if global.affinity != 0 {
        set_affinity(global.affinity);
    }

    // Resolve the group first; setgid must happen before setuid drops the
    // right to call it.
    let gid = match &global.group {
        Some(group) => Some(lookup_group(group)?),
        None => None,
    };
    let user_ids = match &global.user {
        Some(user) => Some(lookup_user(user)?),
        None => None,
    };

    if let Some(gid) = gid.or(user_ids.map(|(_, gid)| gid)) {
        if unsafe { libc::setgid(gid) } != 0 {
            tracing::warn!(gid, "failed to change group id");
        }
    }
    if let Some((uid, _)) = user_ids {
        if unsafe { libc::setuid(uid) } != 0 {
            tracing::warn!(uid, "failed to change user id");
        }
    }
    Ok(())
}

fn set_fifo_priority(priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } != 0 {
        tracing::warn!(priority, "failed to set real-time priority");
    } else {
        tracing::debug!(priority, "set SCHED_FIFO priority");
    }
}

fn set_affinity(mask: u64) {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    for cpu in 0..64 {
        if mask & (1 << cpu) != 0 {
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
    }
    let rc = unsafe {
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if rc != 0 {
        tracing::warn!(mask = format!("{mask:#x}"), "failed to set CPU affinity");
    } else {
        tracing::debug!(mask = format!("{mask:#x}"), "set CPU affinity");
    }
}

fn lookup_user(name: &str) -> Result<(libc::uid_t, libc::gid_t), RtError> {
    let c_name =
        CString::new(name).map_err(|_| RtError::UnknownUser(name.to_string()))?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return Err(RtError::UnknownUser(name.to_string()));
    }
    let pw = unsafe { &*pw };
    Ok((pw.pw_uid, pw.pw_gid))
}

fn lookup_group(name: &str) -> Result<libc::gid_t, RtError> {
    let c_name =
        CString::new(name).map_err(|_| RtError::UnknownGroup(name.to_string()))?;
    let gr = unsafe { libc::getgrnam(c_name.as_ptr()) };
    if gr.is_null() {
        return Err(RtError::UnknownGroup(name.to_string()));
    }
    Ok(unsafe { (*gr).gr_gid })
}

#[derive(Debug, thiserror::Error)]
pub enum RtError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_user_is_reported() {
        assert!(matches!(
            lookup_user("no-such-user-gatewire"),
            Err(RtError::UnknownUser(_))
        ));
    }

    #[test]
    fn root_user_resolves() {
        let (uid, _gid) = lookup_user("root").unwrap();
        assert_eq!(uid, 0);
    }
}
