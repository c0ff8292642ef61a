//! Shared helpers for integration tests.
//!
//! The crafted-tar helpers build raw 512-byte headers by hand so that
//! hostile entries (`../evil`, absolute paths, escaping symlinks) can be
//! encoded without fighting the `tar` crate's writer-side validation.

#![allow(dead_code)] // each test binary uses a subset

use flate2::Compression;
use flate2::write::ZlibEncoder;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// zlib-compresses a byte slice at best compression, matching the codec.
pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Assembles a complete image file from raw parts.
pub fn craft_image(version: u32, header_json: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"NSI!");
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    out.extend_from_slice(header_json);
    out.extend_from_slice(payload);
    out
}

fn raw_tar_entry(name: &str, data: &[u8], typeflag: u8, link: Option<&str>) -> Vec<u8> {
    assert!(name.len() < 100, "test entry name too long");
    let mut header = [0u8; 512];
    header[..name.len()].copy_from_slice(name.as_bytes());
    header[100..107].copy_from_slice(b"0000644");
    header[108..115].copy_from_slice(b"0000000");
    header[116..123].copy_from_slice(b"0000000");
    header[124..135].copy_from_slice(format!("{:011o}", data.len()).as_bytes());
    header[136..147].copy_from_slice(b"00000000000");
    header[156] = typeflag;
    if let Some(link) = link {
        assert!(link.len() < 100, "test link target too long");
        header[157..157 + link.len()].copy_from_slice(link.as_bytes());
    }
    // Checksum is computed with the checksum field set to spaces.
    header[148..156].copy_from_slice(b"        ");
    let sum: u32 = header.iter().map(|&b| u32::from(b)).sum();
    header[148..156].copy_from_slice(format!("{:06o}\0 ", sum).as_bytes());

    let mut out = header.to_vec();
    out.extend_from_slice(data);
    if !data.is_empty() {
        out.resize(out.len() + (512 - data.len() % 512) % 512, 0);
    }
    out
}

/// A regular-file tar entry.
pub fn raw_tar_file(name: &str, data: &[u8]) -> Vec<u8> {
    raw_tar_entry(name, data, b'0', None)
}

/// A symlink tar entry.
pub fn raw_tar_symlink(name: &str, target: &str) -> Vec<u8> {
    raw_tar_entry(name, &[], b'2', Some(target))
}

/// The two zero blocks that terminate a tar stream.
pub fn tar_end() -> Vec<u8> {
    vec![0u8; 1024]
}

/// Creates a file, creating parent directories as needed.
pub fn write_file(path: &Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

#[derive(Debug, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
    Symlink(std::path::PathBuf),
}

fn collect_tree(root: &Path, rel: &Path, out: &mut BTreeMap<std::path::PathBuf, Node>) {
    for entry in fs::read_dir(root.join(rel)).unwrap() {
        let entry = entry.unwrap();
        let rel_child = rel.join(entry.file_name());
        let file_type = entry.file_type().unwrap();
        if file_type.is_symlink() {
            out.insert(rel_child, Node::Symlink(fs::read_link(entry.path()).unwrap()));
        } else if file_type.is_dir() {
            out.insert(rel_child.clone(), Node::Dir);
            collect_tree(root, &rel_child, out);
        } else {
            out.insert(rel_child, Node::File(fs::read(entry.path()).unwrap()));
        }
    }
}

/// Asserts two directory trees match: same structure, same file contents,
/// same symlink targets.
pub fn assert_trees_equal(expected: &Path, actual: &Path) {
    let mut a = BTreeMap::new();
    let mut b = BTreeMap::new();
    collect_tree(expected, Path::new(""), &mut a);
    collect_tree(actual, Path::new(""), &mut b);
    assert_eq!(
        a.keys().collect::<Vec<_>>(),
        b.keys().collect::<Vec<_>>(),
        "tree structure differs"
    );
    for (path, node) in &a {
        assert_eq!(node, &b[path], "entry {} differs", path.display());
    }
}
