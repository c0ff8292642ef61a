//! Build configuration parsing.
//!
//! A build configuration is a small YAML document describing what goes
//! into an image and how the result should run:
//!
//! ```yaml
//! name: h
//! version: 0.1
//! build:
//!   - make release
//! include:
//!   - src
//!   - assets/static
//! exclude:
//!   - src/testdata
//! runtime:
//!   cmd: ["/bin/sh", "-c", "cat /app/hello.txt"]
//!   workDir: /app
//!   env:
//!     MODE: production
//! ```
//!
//! `include` and `exclude` are plain prefix patterns over `/`-separated
//! paths relative to the configuration file's directory. No globbing.

use crate::constants::{MAX_CONFIG_SIZE, validate_name};
use crate::error::{Error, Result};
use crate::image::RuntimeSpec;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

// =============================================================================
// Types
// =============================================================================

/// Parsed and validated build configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    /// Image name; combined with `version` to derive the output filename.
    pub name: String,
    /// Application version string. YAML numbers (`version: 0.1`) are
    /// accepted and stringified.
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    /// Shell commands executed in the scratch directory before packing.
    #[serde(default)]
    pub build: Vec<String>,
    /// Prefix patterns selecting source entries to pack. Empty means
    /// everything.
    #[serde(default)]
    pub include: Vec<String>,
    /// Prefix patterns excluding source entries from packing.
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Runtime settings copied verbatim into the image header.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// The `runtime` block of a build configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// argv of the program to run inside the container.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Working directory inside the container.
    #[serde(default)]
    pub work_dir: Option<String>,
    /// Environment variables baked into the image.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl From<RuntimeConfig> for RuntimeSpec {
    fn from(config: RuntimeConfig) -> Self {
        let mut spec = RuntimeSpec {
            cmd: config.cmd,
            env: config.env,
            ..RuntimeSpec::default()
        };
        if let Some(work_dir) = config.work_dir {
            spec.work_dir = work_dir;
        }
        spec
    }
}

// =============================================================================
// Parsing
// =============================================================================

impl BuildConfig {
    /// Loads and validates a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let metadata = fs::metadata(path)?;
        if metadata.len() > MAX_CONFIG_SIZE as u64 {
            return Err(Error::Config(format!(
                "configuration file exceeds {} bytes",
                MAX_CONFIG_SIZE
            )));
        }
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parses and validates a configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: BuildConfig =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        validate_name(&self.name).map_err(|reason| Error::InvalidName {
            name: self.name.clone(),
            reason,
        })?;
        if self.version.is_empty() {
            return Err(Error::MissingField { field: "version" });
        }
        if self.runtime.cmd.is_empty() {
            return Err(Error::MissingField { field: "runtime.cmd" });
        }
        for pattern in self.include.iter().chain(self.exclude.iter()) {
            validate_pattern(pattern)?;
        }
        if let Some(work_dir) = &self.runtime.work_dir
            && !work_dir.starts_with('/')
        {
            return Err(Error::Config(format!(
                "runtime.workDir must be an absolute path, got '{}'",
                work_dir
            )));
        }
        Ok(())
    }

    /// Derives the output image filename, `<name>-<version>.nsi`.
    pub fn output_file_name(&self) -> String {
        format!(
            "{}-{}.{}",
            self.name,
            self.version,
            crate::constants::IMAGE_EXTENSION
        )
    }
}

/// Validates an include/exclude pattern: relative, no parent components.
fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::Config("empty include/exclude pattern".to_string()));
    }
    if pattern.starts_with('/') {
        return Err(Error::Config(format!(
            "pattern '{}' must be relative",
            pattern
        )));
    }
    if pattern.split('/').any(|part| part == "..") {
        return Err(Error::Config(format!(
            "pattern '{}' must not contain '..'",
            pattern
        )));
    }
    Ok(())
}

/// Returns true when `path` (relative, `/`-separated) matches the prefix
/// `pattern`. A pattern matches the entry with that exact path and
/// everything below it; `sr` does not match `src`.
pub fn prefix_matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim_end_matches('/');
    match path.strip_prefix(pattern) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Value {
        String(String),
        Number(serde_yaml::Number),
    }

    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
    })
}
