//! Tests for the sandbox launcher.
//!
//! The unprivileged tests cover the pure pieces: environment assembly,
//! hostname truncation, cgroup path shape, wait-status decoding, and
//! launch-spec validation. The end-to-end isolation tests need a Linux
//! kernel with unprivileged user namespaces plus a static busybox, so
//! they are `#[ignore]`d by default:
//!
//! ```sh
//! cargo test --test sandbox_tests -- --ignored
//! ```

use nsirun::image::{ImageHeader, RuntimeSpec};
use nsirun::sandbox::{
    LaunchSpec, assemble_env, cgroup_leaf_path, decode_wait_status, launch, truncate_hostname,
};
use nsirun::{Error, constants};
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// =============================================================================
// Environment Assembly
// =============================================================================

#[test]
fn test_env_overrides_win_over_image() {
    let image_env = HashMap::from([
        ("A".to_string(), "image".to_string()),
        ("B".to_string(), "image".to_string()),
    ]);
    let overrides = HashMap::from([
        ("A".to_string(), "caller".to_string()),
        ("C".to_string(), "caller".to_string()),
    ]);

    let env = assemble_env(&image_env, &overrides, "host-1");

    assert_eq!(env["A"], "caller", "caller wins on conflict");
    assert_eq!(env["B"], "image");
    assert_eq!(env["C"], "caller");
}

#[test]
fn test_env_injects_default_path_when_absent() {
    let env = assemble_env(&HashMap::new(), &HashMap::new(), "h");
    assert_eq!(env["PATH"], constants::DEFAULT_PATH);
}

#[test]
fn test_env_keeps_explicit_path() {
    let image_env = HashMap::from([("PATH".to_string(), "/opt/bin".to_string())]);
    let env = assemble_env(&image_env, &HashMap::new(), "h");
    assert_eq!(env["PATH"], "/opt/bin");
}

#[test]
fn test_env_always_carries_hostname_and_marker() {
    let overrides = HashMap::from([("HOSTNAME".to_string(), "spoofed".to_string())]);
    let env = assemble_env(&HashMap::new(), &overrides, "real-host");

    assert_eq!(env["HOSTNAME"], "real-host", "the UTS hostname always wins");
    assert_eq!(env[constants::CONTAINER_MARKER_VAR], "true");
}

// =============================================================================
// Hostname Truncation
// =============================================================================

#[test]
fn test_hostname_truncated_to_kernel_limit() {
    let long = "a".repeat(100);
    assert_eq!(truncate_hostname(&long).len(), 63);
    assert_eq!(truncate_hostname("short"), "short");
    assert_eq!(truncate_hostname(&"b".repeat(63)).len(), 63);
}

#[test]
fn test_hostname_truncation_respects_char_boundaries() {
    // 31 two-byte characters = 62 bytes; one more would split.
    let s = "\u{00e9}".repeat(40);
    let truncated = truncate_hostname(&s);
    assert!(truncated.len() <= 63);
    assert!(s.starts_with(truncated));
}

// =============================================================================
// Cgroup Paths
// =============================================================================

#[test]
fn test_cgroup_leaf_under_tool_parent() {
    assert_eq!(
        cgroup_leaf_path("job-42"),
        Path::new("/sys/fs/cgroup/nsirun/job-42")
    );
}

// =============================================================================
// Wait Status Decoding
// =============================================================================

#[test]
fn test_exit_status_passes_through() {
    // Raw Linux encoding: normal exit with code k is k << 8.
    assert_eq!(decode_wait_status(0), 0);
    assert_eq!(decode_wait_status(3 << 8), 3);
    assert_eq!(decode_wait_status(255 << 8), 255);
}

#[test]
fn test_signal_death_maps_to_128_plus_signo() {
    // Raw Linux encoding: death by signal s is s in the low bits.
    assert_eq!(decode_wait_status(libc::SIGTERM), 128 + libc::SIGTERM);
    assert_eq!(decode_wait_status(libc::SIGKILL), 128 + libc::SIGKILL);
    assert_eq!(decode_wait_status(libc::SIGINT), 128 + libc::SIGINT);
}

// =============================================================================
// Launch Spec Validation
// =============================================================================

fn valid_spec(rootfs: PathBuf) -> LaunchSpec {
    LaunchSpec {
        rootfs,
        command: vec!["/bin/true".to_string()],
        workdir: "/".to_string(),
        image_env: HashMap::new(),
        env_override: HashMap::new(),
        memory_limit: None,
        container_id: "test-1".to_string(),
    }
}

#[test]
fn test_launch_rejects_empty_command() {
    let temp = TempDir::new().unwrap();
    let mut spec = valid_spec(temp.path().to_path_buf());
    spec.command.clear();

    let err = launch(&spec).unwrap_err();
    assert!(
        matches!(err, Error::MissingField { field: "runtime.cmd" }),
        "got {:?}",
        err
    );
}

#[test]
fn test_launch_rejects_invalid_container_id() {
    let temp = TempDir::new().unwrap();
    let mut spec = valid_spec(temp.path().to_path_buf());
    spec.container_id = "../escape".to_string();

    let err = launch(&spec).unwrap_err();
    assert!(matches!(err, Error::InvalidName { .. }), "got {:?}", err);
}

#[test]
fn test_launch_rejects_missing_rootfs() {
    let spec = valid_spec(PathBuf::from("/nonexistent/rootfs/path"));
    let err = launch(&spec).unwrap_err();
    assert!(matches!(err, Error::Io(_)), "got {:?}", err);
}

#[test]
fn test_spec_from_header_copies_runtime() {
    let header = ImageHeader::template(
        "demo".to_string(),
        "1.0".to_string(),
        RuntimeSpec {
            work_dir: "/srv".to_string(),
            cmd: vec!["/srv/app".to_string(), "--flag".to_string()],
            env: HashMap::from([("K".to_string(), "V".to_string())]),
        },
    );

    let spec = LaunchSpec::from_header(&header, PathBuf::from("/tmp/r"), "id-1".to_string());
    assert_eq!(spec.command, vec!["/srv/app", "--flag"]);
    assert_eq!(spec.workdir, "/srv");
    assert_eq!(spec.image_env["K"], "V");
    assert_eq!(spec.container_id, "id-1");
    assert!(spec.env_override.is_empty());
    assert!(spec.memory_limit.is_none());
}

// =============================================================================
// End-to-End Isolation (ignored by default)
// =============================================================================

fn find_busybox() -> Option<PathBuf> {
    ["/bin/busybox", "/usr/bin/busybox", "/sbin/busybox"]
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Builds a minimal rootfs with a static busybox at /bin/busybox.
fn busybox_rootfs(dir: &Path, busybox: &Path) -> PathBuf {
    let rootfs = dir.join("rootfs");
    fs::create_dir_all(rootfs.join("bin")).unwrap();
    fs::copy(busybox, rootfs.join("bin/busybox")).unwrap();
    fs::set_permissions(rootfs.join("bin/busybox"), fs::Permissions::from_mode(0o755)).unwrap();
    rootfs
}

fn shell_spec(rootfs: PathBuf, id: &str, script: &str) -> LaunchSpec {
    LaunchSpec {
        rootfs,
        command: vec![
            "/bin/busybox".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ],
        workdir: "/".to_string(),
        image_env: HashMap::new(),
        env_override: HashMap::new(),
        memory_limit: None,
        container_id: id.to_string(),
    }
}

#[test]
#[ignore = "requires unprivileged user namespaces and a static busybox"]
fn test_container_exit_code_propagates() {
    let Some(busybox) = find_busybox() else {
        return;
    };
    let temp = TempDir::new().unwrap();
    let rootfs = busybox_rootfs(temp.path(), &busybox);

    let code = launch(&shell_spec(rootfs, "nsitest-exit", "exit 7")).unwrap();
    assert_eq!(code, 7);
}

#[test]
#[ignore = "requires unprivileged user namespaces and a static busybox"]
fn test_signalled_child_reports_128_plus_signo() {
    let Some(busybox) = find_busybox() else {
        return;
    };
    let temp = TempDir::new().unwrap();
    let rootfs = busybox_rootfs(temp.path(), &busybox);

    let code = launch(&shell_spec(rootfs, "nsitest-term", "kill -TERM $$")).unwrap();
    assert_eq!(code, 128 + libc::SIGTERM);
}

#[test]
#[ignore = "requires unprivileged user namespaces and a static busybox"]
fn test_isolation_properties() {
    let Some(busybox) = find_busybox() else {
        return;
    };
    let temp = TempDir::new().unwrap();
    let rootfs = busybox_rootfs(temp.path(), &busybox);

    // Each check exits with a distinct code so a failure names itself:
    // PID 1, hostname == container id, procfs mounted, marker set, and
    // no inherited caller environment.
    let script = r#"
        [ "$$" = "1" ] || exit 40
        [ "$(/bin/busybox hostname)" = "nsitest-iso" ] || exit 41
        [ -d /proc/1 ] || exit 42
        [ "$NSIRUN_CONTAINER" = "true" ] || exit 43
        [ -z "$HOME" ] || exit 44
        exit 0
    "#;
    let code = launch(&shell_spec(rootfs, "nsitest-iso", script)).unwrap();
    assert_eq!(code, 0, "isolation check failed with code {}", code);
}

#[test]
#[ignore = "requires unprivileged user namespaces and a static busybox"]
fn test_rootfs_removed_after_run() {
    let Some(busybox) = find_busybox() else {
        return;
    };
    let temp = TempDir::new().unwrap();
    let rootfs = busybox_rootfs(temp.path(), &busybox);

    launch(&shell_spec(rootfs.clone(), "nsitest-clean", "exit 0")).unwrap();
    assert!(!rootfs.exists(), "rootfs must be removed at teardown");
}
