//! Cgroup v2 resource limits.
//!
//! A leaf directory named after the container id is created under
//! `/sys/fs/cgroup/nsirun/`. The memory limit string is written to
//! `memory.max` exactly as supplied (`max` or a decimal byte count; the
//! cgroup interface documents the grammar). Every failure in this module
//! degrades to a warning: delegated cgroup write access is
//! environment-dependent, and a container without limits is still a
//! container.

use crate::constants::{CGROUP_PARENT, CGROUP_ROOT, CGROUP_TEARDOWN_TIMEOUT};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Path of the cgroup leaf for a container id.
pub fn leaf_path(container_id: &str) -> PathBuf {
    Path::new(CGROUP_ROOT).join(CGROUP_PARENT).join(container_id)
}

/// Creates the leaf, applies the memory limit, and moves the calling
/// process into it. Best-effort throughout.
pub fn enter(container_id: &str, memory_limit: Option<&str>) {
    let parent = Path::new(CGROUP_ROOT).join(CGROUP_PARENT);
    if let Err(e) = create_dir_tolerant(&parent) {
        warn!("could not create cgroup parent {}: {}", parent.display(), e);
    }
    let leaf = leaf_path(container_id);
    match create_dir_tolerant(&leaf) {
        Ok(()) => debug!("cgroup leaf ready at {}", leaf.display()),
        Err(e) => warn!("could not create cgroup leaf {}: {}", leaf.display(), e),
    }

    if let Some(limit) = memory_limit {
        match fs::write(leaf.join("memory.max"), limit) {
            Ok(()) => debug!("set memory.max = {}", limit),
            Err(e) => warn!("could not set memory.max: {}", e),
        }
    }

    // SAFETY: getpid is always safe to call.
    let pid = unsafe { libc::getpid() };
    match fs::write(leaf.join("cgroup.procs"), pid.to_string()) {
        Ok(()) => debug!("moved pid {} into {}", pid, leaf.display()),
        Err(e) => warn!("could not join cgroup {}: {}", leaf.display(), e),
    }
}

fn create_dir_tolerant(path: &Path) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Removes the cgroup leaf, retrying briefly.
///
/// The kernel refuses the rmdir until the leaf holds no processes, which
/// is only guaranteed some time after the container has been reaped.
pub fn teardown(container_id: &str) {
    let leaf = leaf_path(container_id);
    let deadline = Instant::now() + CGROUP_TEARDOWN_TIMEOUT;
    loop {
        match fs::remove_dir(&leaf) {
            Ok(()) => {
                debug!("removed cgroup leaf {}", leaf.display());
                return;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return,
            Err(e) => {
                if Instant::now() >= deadline {
                    warn!("could not remove cgroup leaf {}: {}", leaf.display(), e);
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}
