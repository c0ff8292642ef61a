//! Tests for build configuration parsing and validation.

use nsirun::BuildConfig;
use nsirun::Error;
use nsirun::config::prefix_matches;

// =============================================================================
// Parsing
// =============================================================================

#[test]
fn test_full_config_parses() {
    let yaml = r#"
name: h
version: "0.1"
build:
  - make release
  - make strip
include:
  - src
  - assets/static
exclude:
  - src/testdata
runtime:
  cmd: ["/bin/sh", "-c", "cat /app/hello.txt"]
  workDir: /app
  env:
    MODE: production
    REGION: eu
"#;
    let config = BuildConfig::from_yaml(yaml).unwrap();
    assert_eq!(config.name, "h");
    assert_eq!(config.version, "0.1");
    assert_eq!(config.build, vec!["make release", "make strip"]);
    assert_eq!(config.include, vec!["src", "assets/static"]);
    assert_eq!(config.exclude, vec!["src/testdata"]);
    assert_eq!(
        config.runtime.cmd,
        vec!["/bin/sh", "-c", "cat /app/hello.txt"]
    );
    assert_eq!(config.runtime.work_dir.as_deref(), Some("/app"));
    assert_eq!(config.runtime.env["MODE"], "production");
    assert_eq!(config.runtime.env["REGION"], "eu");
    assert_eq!(config.output_file_name(), "h-0.1.nsi");
}

#[test]
fn test_numeric_version_accepted() {
    // `version: 0.1` is a YAML float; it must still land as a string.
    let yaml = r#"
name: h
version: 0.1
runtime:
  cmd: ["/bin/true"]
"#;
    let config = BuildConfig::from_yaml(yaml).unwrap();
    assert_eq!(config.version, "0.1");
    assert_eq!(config.output_file_name(), "h-0.1.nsi");
}

#[test]
fn test_minimal_config() {
    let yaml = r#"
name: tiny
version: 1
runtime:
  cmd: ["/bin/app"]
"#;
    let config = BuildConfig::from_yaml(yaml).unwrap();
    assert!(config.build.is_empty());
    assert!(config.include.is_empty());
    assert!(config.exclude.is_empty());
    assert!(config.runtime.work_dir.is_none());
    assert_eq!(config.version, "1");
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_missing_name_rejected() {
    let yaml = "version: 1\nruntime:\n  cmd: [\"/bin/app\"]\n";
    let err = BuildConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {:?}", err);
}

#[test]
fn test_missing_version_rejected() {
    let yaml = "name: h\nruntime:\n  cmd: [\"/bin/app\"]\n";
    let err = BuildConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {:?}", err);
}

#[test]
fn test_missing_cmd_rejected() {
    let yaml = "name: h\nversion: 1\n";
    let err = BuildConfig::from_yaml(yaml).unwrap_err();
    assert!(
        matches!(err, Error::MissingField { field: "runtime.cmd" }),
        "got {:?}",
        err
    );
}

#[test]
fn test_invalid_name_rejected() {
    let yaml = "name: \"has spaces\"\nversion: 1\nruntime:\n  cmd: [\"/bin/app\"]\n";
    let err = BuildConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, Error::InvalidName { .. }), "got {:?}", err);
}

#[test]
fn test_absolute_pattern_rejected() {
    let yaml = "name: h\nversion: 1\ninclude: [\"/etc\"]\nruntime:\n  cmd: [\"/bin/app\"]\n";
    let err = BuildConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {:?}", err);
}

#[test]
fn test_parent_pattern_rejected() {
    let yaml = "name: h\nversion: 1\nexclude: [\"../up\"]\nruntime:\n  cmd: [\"/bin/app\"]\n";
    let err = BuildConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {:?}", err);
}

#[test]
fn test_relative_workdir_rejected() {
    let yaml = "name: h\nversion: 1\nruntime:\n  cmd: [\"/bin/app\"]\n  workDir: app\n";
    let err = BuildConfig::from_yaml(yaml).unwrap_err();
    assert!(matches!(err, Error::Config(_)), "got {:?}", err);
}

// =============================================================================
// Prefix Semantics
// =============================================================================

#[test]
fn test_prefix_matching_is_path_aware() {
    // Prefix patterns operate on whole path segments, not raw bytes.
    assert!(prefix_matches("src", "src"));
    assert!(prefix_matches("src", "src/deep/file.rs"));
    assert!(!prefix_matches("src", "src-old/file.rs"));
    assert!(!prefix_matches("src/deep", "src"));
    assert!(prefix_matches("src/", "src/file.rs"));
}
