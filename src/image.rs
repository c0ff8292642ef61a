//! # Image Format Codec
//!
//! Encodes and decodes the on-disk image format. An image file is, in
//! order:
//!
//! ```text
//! ┌────────┬──────────┬────────────┬──────────────┬────────────────────┐
//! │ "NSI!" │ version  │ header len │ header JSON  │ zlib(tar payload)  │
//! │ 4 B    │ u32 (BE) │ u32 (BE)   │ UTF-8 JSON   │ until EOF          │
//! └────────┴──────────┴────────────┴──────────────┴────────────────────┘
//! ```
//!
//! The header's `hash` field is the lowercase hex SHA-256 of the
//! *uncompressed* tar stream.
//!
//! ## Streaming
//!
//! Both directions stream with a bounded working set:
//!
//! - [`write_image`] feeds the tar stream through a digest/byte counter
//!   into the zlib encoder as it is produced, spooling the compressed
//!   payload to a sibling temp file so the header (whose length must come
//!   first) can be assembled afterwards. The final file appears atomically
//!   via rename; a partially written image never exists under the final
//!   name.
//! - [`Image::open`] validates the fixed prefix, reads exactly the declared
//!   header bytes, then hands the same buffered reader to the decoder, so
//!   payload bytes that were buffered during header parsing are consumed
//!   before any further file reads. Payload decompression happens lazily as
//!   the caller pulls bytes.
//!
//! ## Security Model
//!
//! Extraction is a security boundary. Every payload entry is validated
//! before unpacking:
//!
//! - Paths with `..` components are rejected
//! - Absolute paths are rejected
//! - Symlink and hardlink targets that resolve outside the extraction
//!   root are rejected
//! - Total size is bounded by [`MAX_EXTRACT_SIZE`], entry count by
//!   [`MAX_EXTRACT_ENTRIES`]
//!
//! [`MAX_EXTRACT_SIZE`]: crate::constants::MAX_EXTRACT_SIZE
//! [`MAX_EXTRACT_ENTRIES`]: crate::constants::MAX_EXTRACT_ENTRIES

use crate::constants::{
    DEFAULT_WORKDIR, HEADER_SCHEMA_VERSION, IMAGE_FORMAT_VERSION, IMAGE_MAGIC, IMAGE_PREFIX_LEN,
    MAX_EXTRACT_ENTRIES, MAX_EXTRACT_SIZE, MAX_HEADER_LEN, MIN_HEADER_LEN,
};
use crate::error::{Error, Result};
use chrono::{SecondsFormat, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::Archive;
use tracing::{debug, warn};

// =============================================================================
// Header Types
// =============================================================================

/// Parsed image header.
///
/// Serialized as the JSON document between the fixed prefix and the
/// compressed payload. Unrecognised fields are ignored on read so headers
/// written by newer builds remain loadable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageHeader {
    /// Human name of the image.
    pub image_name: String,
    /// Application version string.
    pub version: String,
    /// Header schema version; reserved for future evolution.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// ISO-8601 timestamp recorded when the image was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    /// Lowercase hex SHA-256 of the uncompressed tar payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Uncompressed payload size in KiB, rounded up. Advisory.
    #[serde(default, rename = "sizeKB", skip_serializing_if = "Option::is_none")]
    pub size_kb: Option<u64>,
    /// Runtime settings for the container.
    #[serde(default)]
    pub runtime: RuntimeSpec,
}

fn default_schema_version() -> u32 {
    HEADER_SCHEMA_VERSION
}

impl ImageHeader {
    /// Creates a header template carrying only identity and runtime
    /// settings. [`write_image`] fills in `created`, `hash`, and `sizeKB`.
    pub fn template(image_name: String, version: String, runtime: RuntimeSpec) -> Self {
        Self {
            image_name,
            version,
            schema_version: HEADER_SCHEMA_VERSION,
            created: None,
            hash: None,
            size_kb: None,
            runtime,
        }
    }
}

/// Runtime settings embedded in the image header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Absolute working directory inside the container.
    #[serde(default = "default_workdir")]
    pub work_dir: String,
    /// argv of the program to run; the first token is the program itself.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Environment variables set inside the container.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self {
            work_dir: default_workdir(),
            cmd: Vec::new(),
            env: HashMap::new(),
        }
    }
}

// =============================================================================
// Write
// =============================================================================

/// Counts and digests bytes on their way into the compressor.
///
/// Sits between the tar builder and the zlib encoder so the digest covers
/// the uncompressed tar stream, exactly what the extractor will observe.
struct DigestWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> DigestWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Removes a temp file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn temp_sibling(path: &Path, tag: &str) -> PathBuf {
    path.with_extension(format!("{}.{}", tag, uuid::Uuid::now_v7()))
}

/// Packs `payload_source` and writes a complete image file at `path`.
///
/// The directory's entries are placed at the archive root, not nested
/// under the source directory's name. The write is atomic relative to the
/// final name: the image is assembled in a sibling temp file and renamed
/// into place, so a partially written image never appears at `path`.
///
/// Returns the finalized header as written, with `created`, `hash`, and
/// `sizeKB` filled in.
pub fn write_image(path: &Path, payload_source: &Path, template: ImageHeader) -> Result<ImageHeader> {
    let mut entries = fs::read_dir(payload_source)?;
    if entries.next().is_none() {
        return Err(Error::EmptyPayload);
    }

    // Pass 1: tar -> digest/count -> zlib -> spool file.
    let spool_path = temp_sibling(path, "payload");
    let _spool_guard = TempFileGuard::new(spool_path.clone());

    let spool = File::create(&spool_path)?;
    let encoder = ZlibEncoder::new(BufWriter::new(spool), Compression::best());
    let mut builder = tar::Builder::new(DigestWriter::new(encoder));
    builder.follow_symlinks(false);
    // An empty prefix puts the directory's entries at the archive root
    // without an entry for the root itself, so extraction never rewrites
    // the destination directory's own mode.
    builder
        .append_dir_all("", payload_source)
        .map_err(|e| Error::TarPack {
            path: payload_source.to_path_buf(),
            reason: e.to_string(),
        })?;
    let digest_writer = builder.into_inner().map_err(|e| Error::TarPack {
        path: payload_source.to_path_buf(),
        reason: e.to_string(),
    })?;
    let (encoder, digest, payload_len) = digest_writer.finish();
    let writer = encoder.finish().map_err(|e| Error::Compression {
        direction: "compress",
        reason: e.to_string(),
    })?;
    writer.into_inner().map_err(|e| Error::Io(e.into_error()))?;

    if payload_len == 0 {
        return Err(Error::EmptyPayload);
    }

    // Finalize the header now that digest and size are known.
    let header = ImageHeader {
        created: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        hash: Some(digest),
        size_kb: Some(payload_len.div_ceil(1024)),
        ..template
    };
    let header_bytes = serde_json::to_vec(&header).map_err(|e| Error::HeaderJson {
        reason: e.to_string(),
    })?;
    if header_bytes.len() > MAX_HEADER_LEN as usize {
        return Err(Error::HeaderTooLarge {
            declared: header_bytes.len() as u32,
            limit: MAX_HEADER_LEN,
        });
    }

    // Pass 2: assemble prefix + header + payload, then rename into place.
    let image_tmp = temp_sibling(path, "image");
    let mut image_guard = TempFileGuard::new(image_tmp.clone());
    {
        let mut out = BufWriter::new(File::create(&image_tmp)?);
        out.write_all(&IMAGE_MAGIC)?;
        out.write_all(&IMAGE_FORMAT_VERSION.to_be_bytes())?;
        out.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
        out.write_all(&header_bytes)?;
        let mut payload = File::open(&spool_path)?;
        io::copy(&mut payload, &mut out)?;
        out.flush()?;
    }
    fs::rename(&image_tmp, path)?;
    image_guard.disarm();

    debug!(
        "wrote image {} ({} KiB uncompressed payload)",
        path.display(),
        payload_len.div_ceil(1024)
    );
    Ok(header)
}

// =============================================================================
// Open
// =============================================================================

/// An opened image: parsed header plus a lazy payload reader.
#[derive(Debug)]
pub struct Image {
    header: ImageHeader,
    payload: PayloadReader,
}

impl Image {
    /// Opens an image file, validating the prefix and parsing the header.
    ///
    /// The payload is not touched: decompression happens lazily as the
    /// returned reader is consumed.
    pub fn open(path: &Path) -> Result<Image> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut prefix = [0u8; IMAGE_PREFIX_LEN];
        read_exact_or_truncated(&mut reader, &mut prefix, "prefix")?;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&prefix[..4]);
        if magic != IMAGE_MAGIC {
            return Err(Error::BadMagic { found: magic });
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&prefix[4..8]);
        let version = u32::from_be_bytes(word);
        if version != IMAGE_FORMAT_VERSION {
            return Err(Error::UnsupportedVersion { version });
        }

        word.copy_from_slice(&prefix[8..12]);
        let declared = u32::from_be_bytes(word);
        if declared > MAX_HEADER_LEN {
            return Err(Error::HeaderTooLarge {
                declared,
                limit: MAX_HEADER_LEN,
            });
        }
        if declared < MIN_HEADER_LEN {
            return Err(Error::HeaderJson {
                reason: format!("declared header length {} is too small", declared),
            });
        }

        let mut header_bytes = vec![0u8; declared as usize];
        read_exact_or_truncated(&mut reader, &mut header_bytes, "header")?;
        let header: ImageHeader =
            serde_json::from_slice(&header_bytes).map_err(|e| Error::HeaderJson {
                reason: e.to_string(),
            })?;
        if header.image_name.is_empty() {
            return Err(Error::MissingField { field: "imageName" });
        }
        if header.version.is_empty() {
            return Err(Error::MissingField { field: "version" });
        }
        if header.schema_version != HEADER_SCHEMA_VERSION {
            warn!(
                "image {} has header schema {} (expected {}); continuing",
                header.image_name, header.schema_version, HEADER_SCHEMA_VERSION
            );
        }

        // The decoder takes over the buffered reader, so payload bytes that
        // were buffered while parsing the header are consumed first.
        Ok(Image {
            header,
            payload: PayloadReader::new(reader),
        })
    }

    /// Returns the parsed header.
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Splits the image into its header and payload reader.
    pub fn into_parts(self) -> (ImageHeader, PayloadReader) {
        (self.header, self.payload)
    }
}

fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    context: &'static str,
) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Truncated { context }
        } else {
            Error::Io(e)
        }
    })
}

/// Lazy reader over the decompressed tar payload.
///
/// Digests every byte it yields so the payload hash can be verified after
/// extraction without a second pass over the file.
#[derive(Debug)]
pub struct PayloadReader {
    decoder: ZlibDecoder<BufReader<File>>,
    hasher: Sha256,
    bytes: u64,
    corrupt: bool,
}

impl PayloadReader {
    fn new(reader: BufReader<File>) -> Self {
        Self {
            decoder: ZlibDecoder::new(reader),
            hasher: Sha256::new(),
            bytes: 0,
            corrupt: false,
        }
    }

    /// True once a read has failed on a corrupt zlib stream (as opposed to
    /// a transport error).
    fn is_corrupt(&self) -> bool {
        self.corrupt
    }

    /// Drains the remaining payload and returns the digest over everything
    /// this reader yielded, plus the total decompressed byte count.
    ///
    /// Draining matters: the tar extractor stops after the end-of-archive
    /// marker, but the header hash covers the entire tar stream including
    /// trailing padding.
    pub fn finish(mut self) -> Result<(String, u64)> {
        io::copy(&mut self, &mut io::sink()).map_err(|e| {
            if self.corrupt {
                Error::Compression {
                    direction: "decompress",
                    reason: e.to_string(),
                }
            } else {
                Error::Io(e)
            }
        })?;
        Ok((hex::encode(self.hasher.finalize()), self.bytes))
    }
}

impl Read for PayloadReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.decoder.read(buf) {
            Ok(n) => {
                self.hasher.update(&buf[..n]);
                self.bytes += n as u64;
                Ok(n)
            }
            Err(e) => {
                if matches!(e.kind(), ErrorKind::InvalidInput | ErrorKind::InvalidData) {
                    self.corrupt = true;
                }
                Err(e)
            }
        }
    }
}

// =============================================================================
// Extract
// =============================================================================

/// Outcome of a successful extraction.
#[derive(Debug, Clone)]
pub struct ExtractSummary {
    /// Number of archive entries unpacked.
    pub entries: usize,
    /// Total decompressed payload bytes consumed.
    pub payload_bytes: u64,
    /// Lowercase hex SHA-256 of the decompressed payload stream.
    pub digest: String,
}

/// Pipes the payload into a tar extractor rooted at `dest`.
///
/// Rejects entries that would escape `dest` (see the module security
/// notes). On error the caller is expected to remove `dest`; entries
/// extracted before the offending one are left behind for that cleanup.
pub fn extract(payload: PayloadReader, dest: &Path) -> Result<ExtractSummary> {
    let mut archive = Archive::new(payload);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let mut count = 0usize;
    let mut total_size = 0u64;
    let mut failure: Option<Error> = None;
    let mut io_failure: Option<io::Error> = None;

    match archive.entries() {
        Err(e) => io_failure = Some(e),
        Ok(entries) => {
            for entry in entries {
                let mut entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        io_failure = Some(e);
                        break;
                    }
                };

                count += 1;
                if count > MAX_EXTRACT_ENTRIES {
                    failure = Some(Error::TooManyEntries {
                        limit: MAX_EXTRACT_ENTRIES,
                    });
                    break;
                }

                if let Err(e) = check_entry(&entry, &mut total_size) {
                    failure = Some(e);
                    break;
                }

                match entry.unpack_in(dest) {
                    Ok(true) => {}
                    Ok(false) => {
                        // The extractor refused the destination path.
                        failure = Some(Error::PathTraversal {
                            path: entry
                                .path()
                                .map(|p| p.display().to_string())
                                .unwrap_or_else(|_| "<unreadable>".to_string()),
                        });
                        break;
                    }
                    Err(e) => {
                        io_failure = Some(e);
                        break;
                    }
                }
            }
        }
    }

    let reader = archive.into_inner();
    if let Some(err) = failure {
        return Err(err);
    }
    if let Some(e) = io_failure {
        return Err(if reader.is_corrupt() {
            Error::Compression {
                direction: "decompress",
                reason: e.to_string(),
            }
        } else {
            Error::TarUnpack {
                reason: e.to_string(),
            }
        });
    }

    let (digest, payload_bytes) = reader.finish()?;
    debug!(
        "extracted {} entries ({} bytes) into {}",
        count,
        payload_bytes,
        dest.display()
    );
    Ok(ExtractSummary {
        entries: count,
        payload_bytes,
        digest,
    })
}

/// Validates one archive entry before it is unpacked.
fn check_entry(entry: &tar::Entry<'_, PayloadReader>, total_size: &mut u64) -> Result<()> {
    let path = entry.path().map_err(|e| Error::TarUnpack {
        reason: e.to_string(),
    })?;
    let path_str = path.display().to_string();

    if path.is_absolute() {
        return Err(Error::PathTraversal { path: path_str });
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(Error::PathTraversal { path: path_str });
    }

    *total_size += entry.size();
    if *total_size > MAX_EXTRACT_SIZE {
        return Err(Error::PayloadTooLarge {
            size: *total_size,
            limit: MAX_EXTRACT_SIZE,
        });
    }

    // Symlinks and hardlinks can escape via their targets: an absolute
    // target with `..`, or a relative target that climbs above the root.
    let entry_type = entry.header().entry_type();
    if (entry_type.is_symlink() || entry_type.is_hard_link())
        && let Ok(Some(target)) = entry.link_name()
    {
        let target_str = target.display().to_string();
        if target.is_absolute() {
            if target.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(Error::PathTraversal {
                    path: format!("link target: {}", target_str),
                });
            }
        } else {
            let parent = path.parent().unwrap_or(Path::new(""));
            let resolved = parent.join(&*target);
            let mut depth: i32 = 0;
            for component in resolved.components() {
                match component {
                    Component::ParentDir => depth -= 1,
                    Component::Normal(_) => depth += 1,
                    _ => {}
                }
                if depth < 0 {
                    return Err(Error::PathTraversal {
                        path: format!("link target escapes root: {}", target_str),
                    });
                }
            }
        }
    }

    Ok(())
}

// =============================================================================
// Integrity
// =============================================================================

/// What to do when the payload digest disagrees with the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityPolicy {
    /// Warn and continue. Images with legacy or recomputed hashes stay
    /// runnable.
    #[default]
    Warn,
    /// Fail with [`Error::HashMismatch`].
    Strict,
}

/// Compares the digest observed during extraction against the header.
pub fn verify_integrity(
    header: &ImageHeader,
    computed: &str,
    policy: IntegrityPolicy,
) -> Result<()> {
    let Some(expected) = header.hash.as_deref() else {
        warn!(
            "image {} carries no payload hash; skipping verification",
            header.image_name
        );
        return Ok(());
    };
    if expected.eq_ignore_ascii_case(computed) {
        return Ok(());
    }
    match policy {
        IntegrityPolicy::Warn => {
            warn!(
                "payload hash mismatch for image {}: header says {}, payload is {}",
                header.image_name, expected, computed
            );
            Ok(())
        }
        IntegrityPolicy::Strict => Err(Error::HashMismatch {
            expected: expected.to_string(),
            computed: computed.to_string(),
        }),
    }
}
