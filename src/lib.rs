//! # nsirun
//!
//! **Self-contained application images and a rootless Linux sandbox to
//! run them.**
//!
//! An image is a single `.nsi` file: a magic-tagged binary container with
//! a JSON metadata header and a zlib-compressed tar payload. The builder
//! packs a source tree into one; the launcher extracts it and runs its
//! command inside a freshly constructed isolation domain — user, PID,
//! mount, UTS, IPC, and cgroup namespaces, a pivoted root filesystem, and
//! cgroup v2 resource limits. No host root required.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                           nsirun                               │
//! ├────────────────────────────────────────────────────────────────┤
//! │   build                                run                     │
//! │                                                                │
//! │  YAML config ──► builder               image file ──► loader   │
//! │                    │                                    │      │
//! │            scratch + build steps               rootfs (0700)   │
//! │                    │                                    │      │
//! │                    ▼                                    ▼      │
//! │               image codec ◄──── .nsi file ────► sandbox        │
//! │        (tar → sha256 → zlib)                  launcher         │
//! │                                        (namespaces, pivot,     │
//! │                                         cgroups, exec)         │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Image Format
//!
//! | Field | Size | Contents |
//! |-------|------|----------|
//! | magic | 4 B | `N` `S` `I` `!` |
//! | version | 4 B | big-endian u32, currently 1 |
//! | header length | 4 B | big-endian u32, capped at 10 MiB |
//! | header | variable | UTF-8 JSON ([`ImageHeader`]) |
//! | payload | rest | zlib-compressed tar archive |
//!
//! Both codec directions stream: images larger than memory encode and
//! decode with a bounded working set.
//!
//! # Key Security Properties
//!
//! - **Path traversal protection**: payload extraction rejects `..`
//!   components, absolute paths, and escaping link targets.
//! - **Bounded parsing**: the header length is validated before any
//!   allocation; extraction bounds total size and entry count.
//! - **Integrity**: the payload's SHA-256 travels in the header and is
//!   recomputed on extraction (warn by default, strict on request).
//! - **Rootless isolation**: the user namespace is created first, so the
//!   whole launch sequence runs without host privileges.
//!
//! # Example
//!
//! ```rust,ignore
//! use nsirun::{builder, loader, sandbox, IntegrityPolicy};
//!
//! // Build an image from ./app/app.yaml -> ./app/<name>-<version>.nsi
//! let built = builder::build_image("app/app.yaml".as_ref(), None)?;
//!
//! // Extract and run it.
//! let loaded = loader::load_image(
//!     &built.image_path,
//!     "/tmp/rootfs-1".as_ref(),
//!     IntegrityPolicy::Warn,
//! )?;
//! let spec = sandbox::LaunchSpec::from_header(
//!     &loaded.header,
//!     loaded.rootfs,
//!     "demo-1".to_string(),
//! );
//! let exit_code = sandbox::launch(&spec)?;
//! # Ok::<(), nsirun::Error>(())
//! ```

pub mod builder;
pub mod config;
pub mod constants;
mod error;
pub mod image;
pub mod loader;
pub mod sandbox;

pub use builder::{BuildOutput, build_image};
pub use config::BuildConfig;
pub use error::{Error, Result};
pub use image::{Image, ImageHeader, IntegrityPolicy, RuntimeSpec, write_image};
pub use loader::{LoadedImage, load_image};
pub use sandbox::{LaunchSpec, launch};
