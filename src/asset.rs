//! Defines code bundle assets: local directories that are
//! fingerprinted, zipped and staged to S3 so a function can reference
//! them by hash.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{copy, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Visit files within `dir`. Source:
/// https://doc.rust-lang.org/stable/std/fs/fn.read_dir.html
fn visit_dirs<F>(dir: &Path, cb: &mut F) -> Result<()>
where
    F: FnMut(PathBuf) -> Result<()>,
{
    if dir.is_dir() {
        for entry in dir.read_dir()? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                visit_dirs(&path, cb)?;
            } else {
                cb(path.to_path_buf())?;
            }
        }
    }
    Ok(())
}

/// Produce a hash for the given path.
fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha1::new();
    copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Name of a file inside the bundle, relative to its root and using
/// forward slashes regardless of platform.
fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("File {:?} is outside of asset {:?}", path, root))?;
    Ok(relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// One file of a bundle, as it will be packaged.
struct Signature {
    path: PathBuf,
    hash: String,
    mode: u32,
}

/// Produces a snapshot of the given folder, keyed by entry name.
fn compute_signatures(root: &Path) -> Result<BTreeMap<String, Signature>> {
    let mut signatures = BTreeMap::new();
    visit_dirs(root, &mut |filepath| {
        let hash = hash_file(&filepath)?;
        let mode = file_mode(&filepath)?;
        signatures.insert(
            entry_name(root, &filepath)?,
            Signature {
                path: filepath,
                hash,
                mode,
            },
        );
        Ok(())
    })?;
    Ok(signatures)
}

/// How an asset is shipped to the staging bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Packaging {
    Zip,
}

/// A directory holding deployable code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    /// The directory, as given.
    pub source: PathBuf,

    /// Hex SHA-1 fingerprint of the directory's contents.
    pub hash: String,
}

impl Asset {
    /// Fingerprint a code bundle directory. The fingerprint covers the
    /// name, packaged mode and contents of every file, so it changes whenever the
    /// bundle needs redeploying, and doesn't depend on where the
    /// directory lives.
    pub fn from_dir(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            bail!("Cannot find asset directory {:?}", path);
        }
        let signatures = compute_signatures(path)
            .with_context(|| format!("Failed to fingerprint asset {:?}", path))?;
        let mut hasher = Sha1::new();
        for (name, signature) in &signatures {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(format!("{:o}", signature.mode).as_bytes());
            hasher.update([0u8]);
            hasher.update(signature.hash.as_bytes());
            hasher.update([0u8]);
        }
        Ok(Asset {
            source: path.to_path_buf(),
            hash: format!("{:x}", hasher.finalize()),
        })
    }

    pub fn packaging(&self) -> Packaging {
        Packaging::Zip
    }

    /// The key under which the packaged asset is staged.
    pub fn object_key(&self) -> String {
        format!("{}.zip", self.hash)
    }

    /// Zip the directory into `dest`. Entries are written in name
    /// order; executables keep their mode so that custom runtimes can
    /// find their bootstrap.
    pub fn package(&self, dest: &Path) -> Result<()> {
        let signatures = compute_signatures(&self.source)
            .with_context(|| format!("Failed to list asset {:?}", self.source))?;
        let file = File::create(dest)
            .with_context(|| format!("Failed to create archive {:?}", dest))?;
        let mut zip = ZipWriter::new(file);
        for (name, signature) in &signatures {
            let path = &signature.path;
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(signature.mode);
            zip.start_file(name.as_str(), options)
                .with_context(|| format!("Failed to add {:?} to archive {:?}", name, dest))?;
            let contents = std::fs::read(path)
                .with_context(|| format!("Failed to read asset file {:?}", path))?;
            zip.write_all(&contents)?;
        }
        zip.finish()
            .with_context(|| format!("Failed to finish archive {:?}", dest))?;
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;
    let mode = path.metadata()?.permissions().mode();
    Ok(if mode & 0o111 != 0 { 0o755 } else { 0o644 })
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> Result<u32> {
    Ok(0o644)
}
