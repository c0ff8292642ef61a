//! Root filesystem pivot and virtual filesystem mounts.
//!
//! The pivot sequence is order-sensitive; every step is a kernel
//! precondition for the next:
//!
//! 1. Mark the whole mount tree recursively private so later mount events
//!    cannot escape the namespace.
//! 2. Bind-mount the new root onto itself; `pivot_root` requires the new
//!    root to be a mount point distinct from the old one.
//! 3. Create the landing directory for the old root (mode 0700).
//! 4. `pivot_root`.
//! 5. Change directory to the new `/`.
//! 6. Lazily detach the old root and remove its mount point.
//!
//! After the pivot, `/proc`, `/dev`, and `/sys` are mounted fresh. All
//! three are required; device node population beyond the bare `/dev`
//! tmpfs is left to the image.

use crate::constants::{DEV_TMPFS_DATA, HOSTNAME_MAX_LEN, OLD_ROOT_DIR};
use crate::error::{Error, Result};
use std::ffi::{CStr, CString};
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use tracing::{debug, warn};

fn path_to_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
}

/// Truncates a container id to the kernel's hostname length limit,
/// respecting UTF-8 boundaries.
pub fn truncate_hostname(id: &str) -> &str {
    if id.len() <= HOSTNAME_MAX_LEN {
        return id;
    }
    let mut end = HOSTNAME_MAX_LEN;
    while !id.is_char_boundary(end) {
        end -= 1;
    }
    &id[..end]
}

/// Sets the UTS hostname of the current namespace.
pub fn set_hostname(name: &str) -> io::Result<()> {
    // SAFETY: sethostname reads exactly name.len() bytes from the pointer.
    if unsafe { libc::sethostname(name.as_ptr().cast::<libc::c_char>(), name.len()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Swaps the mount tree over to `new_root` (sequence in the module docs).
pub fn pivot_into(new_root: &Path) -> Result<()> {
    make_mounts_private()?;
    bind_mount_self(new_root)?;

    let old_root = new_root.join(OLD_ROOT_DIR);
    match fs::DirBuilder::new().mode(0o700).create(&old_root) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(source) => {
            return Err(Error::Pivot {
                new_root: new_root.to_path_buf(),
                source,
            });
        }
    }

    let new_root_c = path_to_cstring(new_root).map_err(|source| Error::Pivot {
        new_root: new_root.to_path_buf(),
        source,
    })?;
    let old_root_c = path_to_cstring(&old_root).map_err(|source| Error::Pivot {
        new_root: new_root.to_path_buf(),
        source,
    })?;

    // SAFETY: both arguments are valid NUL-terminated paths.
    if unsafe { libc::syscall(libc::SYS_pivot_root, new_root_c.as_ptr(), old_root_c.as_ptr()) } != 0
    {
        return Err(Error::Pivot {
            new_root: new_root.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    debug!("pivoted root into {}", new_root.display());

    // SAFETY: chdir with a static NUL-terminated path.
    if unsafe { libc::chdir(c"/".as_ptr()) } != 0 {
        return Err(Error::Pivot {
            new_root: new_root.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }

    // A failed detach leaves the host tree reachable from inside, so it is
    // loud, but the pivot itself already succeeded.
    let old_root_inside = path_to_cstring(Path::new(&format!("/{}", OLD_ROOT_DIR)))
        .map_err(|source| Error::Pivot {
            new_root: new_root.to_path_buf(),
            source,
        })?;
    // SAFETY: valid NUL-terminated path; MNT_DETACH performs a lazy unmount.
    if unsafe { libc::umount2(old_root_inside.as_ptr(), libc::MNT_DETACH) } != 0 {
        warn!(
            "could not detach old root: {}",
            io::Error::last_os_error()
        );
    } else if let Err(e) = fs::remove_dir(format!("/{}", OLD_ROOT_DIR)) {
        warn!("could not remove old root mount point: {}", e);
    }

    Ok(())
}

fn make_mounts_private() -> Result<()> {
    // SAFETY: a propagation-flag mount call; null source/fstype/data are
    // what the kernel expects for it.
    let rc = unsafe {
        libc::mount(
            std::ptr::null(),
            c"/".as_ptr(),
            std::ptr::null(),
            libc::MS_REC | libc::MS_PRIVATE,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(Error::Mount {
            target: "/ (make private)".to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn bind_mount_self(root: &Path) -> Result<()> {
    let root_c = path_to_cstring(root).map_err(|source| Error::Mount {
        target: root.display().to_string(),
        source,
    })?;
    // SAFETY: source and target are the same valid NUL-terminated path.
    let rc = unsafe {
        libc::mount(
            root_c.as_ptr(),
            root_c.as_ptr(),
            std::ptr::null(),
            libc::MS_BIND | libc::MS_REC,
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(Error::Mount {
            target: root.display().to_string(),
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// Mounts `/proc`, `/dev`, and `/sys` inside the pivoted root.
///
/// All three are required; any failure aborts the launch.
pub fn mount_virtual_filesystems() -> Result<()> {
    mount_fs(
        c"proc",
        c"/proc",
        c"proc",
        libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
        None,
    )?;
    mount_fs(
        c"tmpfs",
        c"/dev",
        c"tmpfs",
        libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_STRICTATIME,
        Some(DEV_TMPFS_DATA),
    )?;
    mount_fs(
        c"sysfs",
        c"/sys",
        c"sysfs",
        libc::MS_RDONLY | libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC,
        None,
    )?;
    Ok(())
}

fn mount_fs(
    source: &CStr,
    target: &CStr,
    fstype: &CStr,
    flags: libc::c_ulong,
    data: Option<&str>,
) -> Result<()> {
    let target_str = target.to_string_lossy().into_owned();

    // Images are not required to carry the mount points.
    if let Err(e) = fs::create_dir_all(&target_str) {
        return Err(Error::Mount {
            target: target_str,
            source: e,
        });
    }

    let data_c = match data {
        Some(d) => Some(CString::new(d).map_err(|_| Error::Mount {
            target: target_str.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "mount data contains NUL"),
        })?),
        None => None,
    };
    let data_ptr: *const libc::c_void = data_c
        .as_ref()
        .map_or(std::ptr::null(), |d| d.as_ptr().cast());

    // SAFETY: all pointers are valid NUL-terminated strings, or null where
    // the kernel accepts null.
    let rc = unsafe { libc::mount(source.as_ptr(), target.as_ptr(), fstype.as_ptr(), flags, data_ptr) };
    if rc != 0 {
        return Err(Error::Mount {
            target: target_str,
            source: io::Error::last_os_error(),
        });
    }
    debug!("mounted {}", target_str);
    Ok(())
}
