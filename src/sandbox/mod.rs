//! # Sandbox Launcher
//!
//! Launches the command described by an image header inside a fully
//! isolated domain and returns its exit code. The launcher is a staged
//! state machine spanning three processes:
//!
//! ```text
//! supervisor (host namespaces)
//! └── outer (unshares user ns, writes id maps, unshares pid/mnt/uts/ipc/
//!     │      cgroup, sets hostname, forks, waits, forwards exit status)
//!     └── inner (PID 1: joins cgroup, pivots root, mounts /proc /dev
//!                /sys, chdirs, builds the environment, execs)
//! ```
//!
//! Stage order is total and load-bearing: user namespace → identity maps →
//! other namespaces → fork → cgroup → pivot → virtual mounts → workdir →
//! exec. Several transitions are kernel preconditions (setgroups deny
//! before the gid map, private mounts before the self bind-mount), not
//! style.
//!
//! ## Why a supervisor process
//!
//! `pivot_root` re-roots every process in the mount namespace whose root
//! is the old root — including the waiting outer process. Host-side
//! cleanup of the rootfs and the cgroup leaf must therefore run in a
//! process that never unshared; the launcher forks that boundary first.
//! Teardown runs on every exit path, success or failure.
//!
//! ## Signals
//!
//! INT/TERM/HUP arriving at the supervisor are forwarded to the sandbox
//! process group, which then has [`KILL_GRACE`] to exit before SIGKILL.
//!
//! ## Exit codes
//!
//! | Condition | Code |
//! |---|---|
//! | child exited with status `k` | `k` |
//! | child killed by signal `s` | `128 + s` |
//! | inner setup stage failed | 125 |
//! | exec failed, program exists | 126 |
//! | exec failed, program missing | 127 |
//!
//! [`KILL_GRACE`]: crate::constants::KILL_GRACE

mod cgroup;
mod namespaces;
mod rootfs;

pub use cgroup::leaf_path as cgroup_leaf_path;
pub use rootfs::truncate_hostname;

use crate::constants::{CONTAINER_MARKER_VAR, DEFAULT_PATH, KILL_GRACE, validate_name};
use crate::error::{Error, Result};
use crate::image::ImageHeader;
use std::collections::HashMap;
use std::convert::Infallible;
use std::ffi::CString;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Exit code used when an inner setup stage fails before exec.
const SETUP_FAILURE_CODE: i32 = 125;
/// Exit code when the target program could not be executed.
const EXEC_FAILURE_CODE: i32 = 126;
/// Exit code when the target program does not exist.
const EXEC_NOT_FOUND_CODE: i32 = 127;

// =============================================================================
// Launch Specification
// =============================================================================

/// Everything the launcher needs for one `run` invocation.
///
/// The rootfs is owned by this launch: it is removed at teardown on every
/// exit path.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Extracted root filesystem; becomes the container's `/`.
    pub rootfs: PathBuf,
    /// argv of the program; the first token is the program itself.
    pub command: Vec<String>,
    /// Working directory inside the container; `/` when empty.
    pub workdir: String,
    /// Environment baked into the image.
    pub image_env: HashMap<String, String>,
    /// Caller-supplied overrides; win over `image_env` on conflict.
    pub env_override: HashMap<String, String>,
    /// Opaque limit string for `memory.max` (`max` or a byte count).
    pub memory_limit: Option<String>,
    /// Container id: names the cgroup leaf and the UTS hostname.
    pub container_id: String,
}

impl LaunchSpec {
    /// Builds a spec from a loaded image header and a rootfs directory.
    pub fn from_header(header: &ImageHeader, rootfs: PathBuf, container_id: String) -> Self {
        Self {
            rootfs,
            command: header.runtime.cmd.clone(),
            workdir: header.runtime.work_dir.clone(),
            image_env: header.runtime.env.clone(),
            env_override: HashMap::new(),
            memory_limit: None,
            container_id,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::MissingField {
                field: "runtime.cmd",
            });
        }
        validate_name(&self.container_id).map_err(|reason| Error::InvalidName {
            name: self.container_id.clone(),
            reason,
        })?;
        if !self.rootfs.is_dir() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("rootfs {} is not a directory", self.rootfs.display()),
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Launch
// =============================================================================

/// Runs the container and returns its exit code.
///
/// Blocks until the container exits. Must be called from a
/// single-threaded process: the launcher forks.
pub fn launch(spec: &LaunchSpec) -> Result<i32> {
    spec.validate()?;

    // Supervisor boundary (module docs): the sandbox side never returns.
    // SAFETY: fork in a single-threaded process; the child immediately
    // continues with ordinary code and exits via process::exit.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Process {
            op: "fork",
            source: io::Error::last_os_error(),
        });
    }
    if pid == 0 {
        process::exit(outer_process(spec));
    }

    let status = supervise(pid);
    teardown(spec);
    status
}

/// Host-side teardown, attempted unconditionally.
fn teardown(spec: &LaunchSpec) {
    match fs::remove_dir_all(&spec.rootfs) {
        Ok(()) => debug!("removed rootfs {}", spec.rootfs.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove rootfs {}: {}", spec.rootfs.display(), e),
    }
    cgroup::teardown(&spec.container_id);
}

// =============================================================================
// Supervisor
// =============================================================================

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn note_signal(signo: libc::c_int) {
    PENDING_SIGNAL.store(signo, Ordering::SeqCst);
}

fn install_forwarding_handlers() {
    // SAFETY: note_signal performs a single atomic store, which is
    // async-signal-safe. sa_flags deliberately omits SA_RESTART so the
    // blocking waitpid returns EINTR and the loop can forward the signal.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = note_signal as extern "C" fn(libc::c_int) as usize;
        for signo in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::sigaction(signo, &action, std::ptr::null_mut());
        }
    }
}

/// Waits for the sandbox, forwarding termination signals to its process
/// group with a grace period before SIGKILL.
fn supervise(child: libc::pid_t) -> Result<i32> {
    install_forwarding_handlers();
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waitpid with a valid child pid and status pointer.
        let rc = unsafe { libc::waitpid(child, &mut status, 0) };
        if rc == child {
            return Ok(decode_wait_status(status));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(Error::Process {
                op: "waitpid",
                source: err,
            });
        }
        let signo = PENDING_SIGNAL.swap(0, Ordering::SeqCst);
        if signo != 0 {
            return forward_and_reap(child, signo);
        }
    }
}

fn signal_group(child: libc::pid_t, signo: i32) {
    // SAFETY: kill with a negative pid signals the process group; the
    // fallback targets the sandbox directly if it has not called setpgid
    // yet.
    unsafe {
        if libc::kill(-child, signo) != 0 {
            libc::kill(child, signo);
        }
    }
}

fn forward_and_reap(child: libc::pid_t, signo: i32) -> Result<i32> {
    warn!("forwarding signal {} to sandbox", signo);
    signal_group(child, signo);

    let deadline = Instant::now() + KILL_GRACE;
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: as above; WNOHANG keeps the loop responsive.
        let rc = unsafe { libc::waitpid(child, &mut status, libc::WNOHANG) };
        if rc == child {
            return Ok(decode_wait_status(status));
        }
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(Error::Process {
                    op: "waitpid",
                    source: err,
                });
            }
        }
        if Instant::now() >= deadline {
            warn!("grace period expired, killing sandbox");
            signal_group(child, libc::SIGKILL);
            loop {
                // SAFETY: blocking waitpid with valid arguments.
                let rc = unsafe { libc::waitpid(child, &mut status, 0) };
                if rc == child {
                    return Ok(decode_wait_status(status));
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(Error::Process {
                        op: "waitpid",
                        source: err,
                    });
                }
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Maps a raw wait status to the exit-code contract: the child's own
/// status for a normal exit, `128 + signo` when it died from a signal.
pub fn decode_wait_status(status: i32) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        1
    }
}

// =============================================================================
// Outer Process
// =============================================================================

fn outer_process(spec: &LaunchSpec) -> i32 {
    // Own process group, so one supervisor signal reaches outer and inner.
    // SAFETY: setpgid on self is always safe.
    unsafe {
        libc::setpgid(0, 0);
    }
    match run_outer(spec) {
        Ok(code) => code,
        Err(err) => {
            error!("sandbox setup failed: {}", err);
            SETUP_FAILURE_CODE
        }
    }
}

fn run_outer(spec: &LaunchSpec) -> Result<i32> {
    namespaces::enter_user_namespace()?;
    namespaces::write_identity_maps()?;
    namespaces::enter_isolation_namespaces()?;

    let hostname = rootfs::truncate_hostname(&spec.container_id).to_string();
    if let Err(e) = rootfs::set_hostname(&hostname) {
        warn!("could not set container hostname: {}", e);
    }

    // The PID namespace takes effect now: this fork's child is PID 1.
    // SAFETY: single-threaded process.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Process {
            op: "fork",
            source: io::Error::last_os_error(),
        });
    }
    if pid == 0 {
        process::exit(inner_process(spec, &hostname));
    }

    // From here the outer's only job is forwarding the child's status.
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: waitpid with a valid child pid and status pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Ok(decode_wait_status(status));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(Error::Process {
                op: "waitpid",
                source: err,
            });
        }
    }
}

// =============================================================================
// Inner Process (PID 1)
// =============================================================================

fn inner_process(spec: &LaunchSpec, hostname: &str) -> i32 {
    match run_inner(spec, hostname) {
        Err(Error::Exec { program, source }) => {
            let code = if source.raw_os_error() == Some(libc::ENOENT) {
                EXEC_NOT_FOUND_CODE
            } else {
                EXEC_FAILURE_CODE
            };
            error!("exec of {} failed: {}", program, source);
            code
        }
        Err(err) => {
            error!("container setup failed: {}", err);
            SETUP_FAILURE_CODE
        }
        Ok(never) => match never {},
    }
}

fn run_inner(spec: &LaunchSpec, hostname: &str) -> Result<Infallible> {
    cgroup::enter(&spec.container_id, spec.memory_limit.as_deref());
    rootfs::pivot_into(&spec.rootfs)?;
    rootfs::mount_virtual_filesystems()?;

    let workdir = if spec.workdir.is_empty() {
        "/"
    } else {
        spec.workdir.as_str()
    };
    let workdir_c = CString::new(workdir).map_err(|_| Error::Workdir {
        dir: workdir.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, "workdir contains NUL"),
    })?;
    // SAFETY: chdir with a valid NUL-terminated path.
    if unsafe { libc::chdir(workdir_c.as_ptr()) } != 0 {
        return Err(Error::Workdir {
            dir: workdir.to_string(),
            source: io::Error::last_os_error(),
        });
    }

    let env = assemble_env(&spec.image_env, &spec.env_override, hostname);
    exec_command(&spec.command, &env)
}

/// Builds the container environment: the image's variables, overlaid by
/// the caller's overrides, plus `PATH` (when absent), `HOSTNAME`, and the
/// sandbox marker. The inherited environment is discarded entirely.
pub fn assemble_env(
    image_env: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
    hostname: &str,
) -> HashMap<String, String> {
    let mut env = image_env.clone();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env.entry("PATH".to_string())
        .or_insert_with(|| DEFAULT_PATH.to_string());
    env.insert("HOSTNAME".to_string(), hostname.to_string());
    env.insert(CONTAINER_MARKER_VAR.to_string(), "true".to_string());
    env
}

fn exec_command(command: &[String], env: &HashMap<String, String>) -> Result<Infallible> {
    let program = command[0].clone();
    let nul_err = |what: &str| Error::Exec {
        program: program.clone(),
        source: io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} contains NUL byte", what),
        ),
    };

    let mut argv_c = Vec::with_capacity(command.len());
    for arg in command {
        argv_c.push(CString::new(arg.as_str()).map_err(|_| nul_err("argument"))?);
    }
    let mut envp_c = Vec::with_capacity(env.len());
    for (key, value) in env {
        envp_c.push(CString::new(format!("{}={}", key, value)).map_err(|_| nul_err("environment"))?);
    }

    let mut argv: Vec<*const libc::c_char> = argv_c.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());
    let mut envp: Vec<*const libc::c_char> = envp_c.iter().map(|e| e.as_ptr()).collect();
    envp.push(std::ptr::null());

    // SAFETY: argv and envp are NULL-terminated arrays of valid C strings
    // that outlive the call. execve does not return on success.
    unsafe {
        libc::execve(argv_c[0].as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    Err(Error::Exec {
        program,
        source: io::Error::last_os_error(),
    })
}
