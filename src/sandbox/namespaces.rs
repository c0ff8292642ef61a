//! Namespace entry and identity mapping.
//!
//! The user namespace comes first, deliberately: once the caller holds
//! root *inside* that namespace, the remaining namespace creations need no
//! host privileges. Identity maps are written through `/proc/self` before
//! anything else depends on in-namespace capabilities.
//!
//! ```text
//! outside:  uid=1000          inside:  uid=0
//!                 └── "0 1000 1" ──┘
//! ```

use crate::error::{Error, Result};
use std::fs;
use std::io;
use tracing::{debug, warn};

/// Detaches the calling process into a new user namespace.
pub fn enter_user_namespace() -> Result<()> {
    // SAFETY: unshare takes no pointers; it only manipulates kernel state
    // of the calling process.
    if unsafe { libc::unshare(libc::CLONE_NEWUSER) } != 0 {
        return Err(Error::Namespace {
            op: "unshare(CLONE_NEWUSER)",
            source: io::Error::last_os_error(),
        });
    }
    debug!("entered new user namespace");
    Ok(())
}

/// Maps the caller's host identity to uid/gid 0 inside the namespace.
///
/// `deny` must land in `setgroups` before the gid map is written; that is
/// a kernel precondition for unprivileged group mapping. Some
/// distributions permit the map without it, so a failed `setgroups` write
/// is a warning while failed map writes are fatal.
pub fn write_identity_maps() -> Result<()> {
    // SAFETY: getuid and getgid are always safe to call.
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    if let Err(e) = fs::write("/proc/self/setgroups", "deny") {
        warn!("could not write 'deny' to /proc/self/setgroups: {}", e);
    }

    fs::write("/proc/self/uid_map", format!("0 {} 1\n", uid)).map_err(|source| {
        Error::Namespace {
            op: "write uid_map",
            source,
        }
    })?;
    fs::write("/proc/self/gid_map", format!("0 {} 1\n", gid)).map_err(|source| {
        Error::Namespace {
            op: "write gid_map",
            source,
        }
    })?;

    debug!("mapped host {}:{} to container 0:0", uid, gid);
    Ok(())
}

/// Detaches into new PID, mount, UTS, IPC, and cgroup namespaces.
///
/// The PID namespace only takes effect at the next fork: the calling
/// process keeps its PID, its next child becomes PID 1 inside.
pub fn enter_isolation_namespaces() -> Result<()> {
    let flags = libc::CLONE_NEWPID
        | libc::CLONE_NEWNS
        | libc::CLONE_NEWUTS
        | libc::CLONE_NEWIPC
        | libc::CLONE_NEWCGROUP;
    // SAFETY: unshare takes no pointers.
    if unsafe { libc::unshare(flags) } != 0 {
        return Err(Error::Namespace {
            op: "unshare(PID|NS|UTS|IPC|CGROUP)",
            source: io::Error::last_os_error(),
        });
    }
    debug!("entered pid, mount, uts, ipc, and cgroup namespaces");
    Ok(())
}
