//! Error types for the image format and the sandbox launcher.

use std::io;
use std::path::PathBuf;

/// Result type alias for image and sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, reading, or running images.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Build configuration could not be parsed or is missing fields.
    #[error("invalid build configuration: {0}")]
    Config(String),

    /// A required field is absent or empty.
    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    /// An image or container name failed validation.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    // =========================================================================
    // Image Format Errors
    // =========================================================================
    /// The file does not start with the image magic tag.
    #[error("bad magic {found:?}: not an image file")]
    BadMagic { found: [u8; 4] },

    /// The image declares a format version this build does not understand.
    #[error("unsupported image format version {version}")]
    UnsupportedVersion { version: u32 },

    /// The declared header length exceeds the parsing bound.
    #[error("header length {declared} exceeds limit of {limit} bytes")]
    HeaderTooLarge { declared: u32, limit: u32 },

    /// The header bytes are not valid JSON for the header schema.
    #[error("invalid header JSON: {reason}")]
    HeaderJson { reason: String },

    /// The file ended before the declared structure was complete.
    #[error("truncated image file while reading {context}")]
    Truncated { context: &'static str },

    /// The payload source produced no entries.
    #[error("payload is empty: source directory has no entries")]
    EmptyPayload,

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// Payload digest does not match the header's `hash` field.
    /// Only raised under the strict integrity policy; the default policy
    /// downgrades the mismatch to a warning.
    #[error("payload hash mismatch: header says {expected}, payload is {computed}")]
    HashMismatch { expected: String, computed: String },

    // =========================================================================
    // Compression Errors
    // =========================================================================
    /// The zlib stream could not be produced or consumed.
    #[error("zlib {direction} failed: {reason}")]
    Compression {
        direction: &'static str,
        reason: String,
    },

    // =========================================================================
    // Tar Errors
    // =========================================================================
    /// Packing the payload archive failed.
    #[error("failed to pack payload from {path}: {reason}")]
    TarPack { path: PathBuf, reason: String },

    /// Unpacking the payload archive failed.
    #[error("failed to unpack payload: {reason}")]
    TarUnpack { reason: String },

    /// A payload entry would resolve outside the extraction root.
    #[error("path traversal detected in payload: {path}")]
    PathTraversal { path: String },

    /// The payload exceeds the extraction size bound.
    #[error("payload exceeds size limit: {size} > {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// The payload exceeds the extraction entry-count bound.
    #[error("payload exceeds entry limit of {limit}")]
    TooManyEntries { limit: usize },

    // =========================================================================
    // Build Errors
    // =========================================================================
    /// A user-supplied build step exited non-zero.
    #[error("build command failed with status {status}: {command}")]
    BuildCommand { command: String, status: i32 },

    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    /// A namespace creation or identity-map syscall failed.
    #[error("namespace setup failed during {op}: {source}")]
    Namespace {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// A required mount failed.
    #[error("mount of {target} failed: {source}")]
    Mount {
        target: String,
        #[source]
        source: io::Error,
    },

    /// `pivot_root` into the new root filesystem failed.
    #[error("pivot_root into {new_root} failed: {source}")]
    Pivot {
        new_root: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Changing into the container working directory failed.
    #[error("chdir to workdir {dir} failed: {source}")]
    Workdir {
        dir: String,
        #[source]
        source: io::Error,
    },

    /// The target program could not be executed.
    #[error("exec of {program} failed: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Forking or waiting on the sandbox process failed.
    #[error("process control failed during {op}: {source}")]
    Process {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
