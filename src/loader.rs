//! # Image Loader
//!
//! Opens an image, validates its header, and extracts the payload into a
//! fresh root directory. The rootfs directory is created with mode 0700
//! and is removed again if anything goes wrong before the loader returns.

use crate::error::{Error, Result};
use crate::image::{Image, ImageHeader, IntegrityPolicy, extract, verify_integrity};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A loaded image: parsed header plus the populated rootfs directory.
///
/// Ownership of the rootfs passes to the caller; the sandbox launcher
/// removes it at teardown.
#[derive(Debug)]
pub struct LoadedImage {
    /// Header read from the image.
    pub header: ImageHeader,
    /// Directory holding the extracted root filesystem.
    pub rootfs: PathBuf,
}

/// Opens `image_path` and extracts its payload into `rootfs_dir`.
///
/// `rootfs_dir` must not exist yet; it is created empty with mode 0700.
/// On any failure the partial directory is removed before the error is
/// returned. The payload digest observed during extraction is checked
/// against the header under the given policy.
pub fn load_image(
    image_path: &Path,
    rootfs_dir: &Path,
    policy: IntegrityPolicy,
) -> Result<LoadedImage> {
    let image = Image::open(image_path)?;
    let (header, payload) = image.into_parts();

    if let Some(parent) = rootfs_dir.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::DirBuilder::new()
        .mode(0o700)
        .create(rootfs_dir)
        .map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                Error::Io(std::io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("rootfs directory {} already exists", rootfs_dir.display()),
                ))
            } else {
                Error::Io(e)
            }
        })?;

    let result = extract(payload, rootfs_dir)
        .and_then(|summary| verify_integrity(&header, &summary.digest, policy).map(|()| summary));

    match result {
        Ok(summary) => {
            debug!(
                "loaded image {} into {} ({} entries)",
                header.image_name,
                rootfs_dir.display(),
                summary.entries
            );
            Ok(LoadedImage {
                header,
                rootfs: rootfs_dir.to_path_buf(),
            })
        }
        Err(err) => {
            if let Err(e) = fs::remove_dir_all(rootfs_dir) {
                warn!(
                    "failed to remove partial rootfs {}: {}",
                    rootfs_dir.display(),
                    e
                );
            }
            Err(err)
        }
    }
}
