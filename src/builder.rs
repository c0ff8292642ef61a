//! # Image Builder
//!
//! Turns a source tree plus a build configuration into an image file:
//!
//! 1. Parse and validate the YAML configuration
//! 2. Create a scratch directory beside the configuration file
//! 3. Copy the selected source entries into the scratch
//! 4. Run the declared build commands inside the scratch
//! 5. Pack the scratch into an image via the codec
//! 6. Remove the scratch on every exit path
//!
//! Whatever the scratch contains after step 4 is packed, so artifacts
//! produced by build commands are included automatically.

use crate::config::{BuildConfig, prefix_matches};
use crate::constants::{IMAGE_EXTENSION, SCRATCH_DIR_PREFIX};
use crate::error::{Error, Result};
use crate::image::{ImageHeader, write_image};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// Path of the written image file.
    pub image_path: PathBuf,
    /// Header as written into the image.
    pub header: ImageHeader,
}

/// Removes the scratch directory on drop, success or failure.
struct ScratchGuard {
    path: PathBuf,
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!("failed to remove scratch {}: {}", self.path.display(), e);
        }
    }
}

/// Builds an image from the configuration at `config_path`.
///
/// The configuration file's directory is the source tree. The image is
/// written to `output`, or to `<name>-<version>.nsi` beside the
/// configuration when `output` is `None`.
pub fn build_image(config_path: &Path, output: Option<&Path>) -> Result<BuildOutput> {
    let config_path = config_path.canonicalize()?;
    let config = BuildConfig::load(&config_path)?;
    let source_dir = config_path
        .parent()
        .ok_or_else(|| Error::Config("configuration file has no parent directory".to_string()))?;
    let config_file_name = config_path
        .file_name()
        .ok_or_else(|| Error::Config("configuration path has no file name".to_string()))?
        .to_os_string();

    let scratch = source_dir.join(format!("{}{}", SCRATCH_DIR_PREFIX, uuid::Uuid::now_v7()));
    fs::DirBuilder::new().mode(0o700).create(&scratch)?;
    let _guard = ScratchGuard {
        path: scratch.clone(),
    };
    debug!("building {} in scratch {}", config.name, scratch.display());

    copy_selection(source_dir, &scratch, &config, &config_file_name)?;
    run_build_steps(&config, &scratch)?;

    let image_path = match output {
        Some(path) => path.to_path_buf(),
        None => source_dir.join(config.output_file_name()),
    };
    let template = ImageHeader::template(
        config.name.clone(),
        config.version.clone(),
        config.runtime.clone().into(),
    );
    let header = write_image(&image_path, &scratch, template)?;

    info!(
        "built image {} ({} v{})",
        image_path.display(),
        header.image_name,
        header.version
    );
    Ok(BuildOutput { image_path, header })
}

// =============================================================================
// Source Selection
// =============================================================================

/// Copies the configured selection of the source tree into the scratch.
///
/// Include patterns that matched nothing produce warnings, not failures.
fn copy_selection(
    source_dir: &Path,
    scratch: &Path,
    config: &BuildConfig,
    config_file_name: &std::ffi::OsStr,
) -> Result<()> {
    let mut matched = vec![false; config.include.len()];
    copy_dir(source_dir, scratch, "", config, config_file_name, &mut matched)?;
    for (pattern, matched) in config.include.iter().zip(&matched) {
        if !matched {
            warn!("include pattern '{}' matched nothing in the source tree", pattern);
        }
    }
    Ok(())
}

fn copy_dir(
    src: &Path,
    dst_root: &Path,
    rel: &str,
    config: &BuildConfig,
    config_file_name: &std::ffi::OsStr,
    matched: &mut [bool],
) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            warn!("skipping non-UTF-8 entry {:?}", name);
            continue;
        };

        // The scratch itself, the configuration file, and prior image
        // outputs live beside the source tree and are never packed.
        if rel.is_empty()
            && (name_str.starts_with(SCRATCH_DIR_PREFIX)
                || name == *config_file_name
                || name_str.ends_with(&format!(".{}", IMAGE_EXTENSION)))
        {
            continue;
        }

        let rel_child = if rel.is_empty() {
            name_str.to_string()
        } else {
            format!("{}/{}", rel, name_str)
        };

        if config.exclude.iter().any(|p| prefix_matches(p, &rel_child)) {
            debug!("excluding {}", rel_child);
            continue;
        }

        let mut hit_any = false;
        for (i, pattern) in config.include.iter().enumerate() {
            if prefix_matches(pattern, &rel_child) {
                matched[i] = true;
                hit_any = true;
            }
        }
        let included = config.include.is_empty() || hit_any;

        let file_type = entry.file_type()?;
        let dst = dst_root.join(&rel_child);

        if file_type.is_dir() {
            // Descend when the directory is included, or when some include
            // pattern points below it.
            let ancestor_of_pattern = config
                .include
                .iter()
                .any(|p| p.strip_prefix(&rel_child).is_some_and(|r| r.starts_with('/')));
            if !included && !ancestor_of_pattern {
                continue;
            }
            if included {
                ensure_dir(&dst)?;
                let perms = entry.metadata()?.permissions();
                fs::set_permissions(&dst, perms)?;
            }
            copy_dir(&entry.path(), dst_root, &rel_child, config, config_file_name, matched)?;
        } else if included && file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            ensure_parent(&dst)?;
            std::os::unix::fs::symlink(target, &dst)?;
        } else if included && file_type.is_file() {
            ensure_parent(&dst)?;
            fs::copy(entry.path(), &dst)?;
        }
        // Sockets, fifos, and device nodes are silently skipped.
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    if !path.is_dir() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    Ok(())
}

// =============================================================================
// Build Steps
// =============================================================================

/// Runs each declared build command with the scratch as working directory.
///
/// Commands inherit the caller's environment and stdio, so their output
/// streams straight to the caller. The first non-zero exit aborts.
fn run_build_steps(config: &BuildConfig, scratch: &Path) -> Result<()> {
    for command in &config.build {
        info!("running build step: {}", command);
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(command)
            .current_dir(scratch)
            .status()?;
        if !status.success() {
            return Err(Error::BuildCommand {
                command: command.clone(),
                status: status.code().unwrap_or(-1),
            });
        }
    }
    Ok(())
}
