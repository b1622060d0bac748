//! Project input-file fingerprinting (component C1).
//!
//! A [`Fingerprint`] is a compact, order-independent summary of a module's
//! input file set: how many files there are, the newest modification time
//! among them, and (optionally) one or two MD5 checksums. The checksums are
//! mandated as MD5 by the persisted-state format, not chosen for strength.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};
use walkdir::WalkDir;

use crate::error::CacheResult;
use crate::pattern::{relativize, to_posix_string, FileFilter};

/// A 16-byte MD5 digest, stored as a fixed array rather than a `String` so
/// equality and ordering are cheap; display/serialization render it as hex.
pub type Md5Digest = [u8; 16];

pub fn hex(digest: &Md5Digest) -> String {
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn parse_hex(s: &str) -> Option<Md5Digest> {
    if s.len() != 32 {
        return None;
    }
    let mut out = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk).ok()?;
        out[i] = u8::from_str_radix(byte_str, 16).ok()?;
    }
    Some(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub count: u32,
    pub max_mtime_ms: i64,
    #[serde(with = "opt_digest")]
    pub aggregate_md5: Option<Md5Digest>,
    pub per_file_md5: BTreeMap<String, Md5Digest>,
}

mod opt_digest {
    use super::{hex, parse_hex, Md5Digest};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Md5Digest>, s: S) -> Result<S::Ok, S::Error> {
        v.map(|d| hex(&d)).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Md5Digest>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        Ok(raw.and_then(|s| parse_hex(&s)))
    }
}

impl Fingerprint {
    pub fn empty() -> Self {
        Fingerprint {
            count: 0,
            max_mtime_ms: 0,
            aggregate_md5: None,
            per_file_md5: BTreeMap::new(),
        }
    }

    /// The weak-equality policy from the data model: counts must match, and
    /// either the mtimes agree or (when both sides carry a checksum) the
    /// checksums agree. This deliberately tolerates mtime skew when a
    /// checksum is available, and is kept as specified rather than
    /// tightened to a conjunction.
    pub fn is_unchanged_from(&self, prior: &Fingerprint) -> bool {
        if self.count != prior.count {
            return false;
        }
        let mtime_equal = self.max_mtime_ms == prior.max_mtime_ms;
        let checksum_equal = match (self.aggregate_md5, prior.aggregate_md5) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        mtime_equal || checksum_equal
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintOptions {
    pub enable_checksum: bool,
    pub include_all_checksums: bool,
}

impl Default for FingerprintOptions {
    fn default() -> Self {
        FingerprintOptions {
            enable_checksum: true,
            include_all_checksums: false,
        }
    }
}

/// Walks `project_dir`, pruning `prune_dirs` (the module's own build dir and
/// any submodule roots), and folds the matching files into a [`Fingerprint`].
#[instrument(skip(filter, options), fields(project_dir = %project_dir.display()))]
pub fn fingerprint_project(
    project_dir: &Path,
    prune_dirs: &[PathBuf],
    filter: &FileFilter,
    options: &FingerprintOptions,
) -> CacheResult<Fingerprint> {
    let mut paths: Vec<String> = Vec::new();

    let walker = WalkDir::new(project_dir).follow_links(true).into_iter();
    for entry in walker.filter_entry(|e| {
        if !e.file_type().is_dir() {
            return true;
        }
        !prune_dirs.iter().any(|p| p == e.path())
    }) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry during fingerprinting");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = relativize(project_dir, entry.path());
        let relative_str = to_posix_string(&relative);
        if filter.matches(&relative_str) {
            paths.push(relative_str);
        }
    }

    // Sort order is load-bearing: the aggregate checksum and the stability
    // property in the testable-properties list both depend on it.
    paths.sort();

    let mut max_mtime_ms: i64 = 0;
    let mut aggregate = options.enable_checksum.then(Md5::new);
    let mut per_file_md5 = BTreeMap::new();

    if options.include_all_checksums {
        let digests: Vec<(String, Option<Md5Digest>)> = paths
            .par_iter()
            .map(|relative_str| {
                let full = project_dir.join(relative_str);
                match std::fs::read(&full) {
                    Ok(bytes) => {
                        let mut hasher = Md5::new();
                        hasher.update(&bytes);
                        let digest: Md5Digest = hasher.finalize().into();
                        (relative_str.clone(), Some(digest))
                    }
                    Err(err) => {
                        warn!(path = %full.display(), error = %err, "skipping unreadable file during fingerprinting");
                        (relative_str.clone(), None)
                    }
                }
            })
            .collect();
        for (path, digest) in digests {
            if let Some(digest) = digest {
                per_file_md5.insert(path, digest);
            }
        }
    }

    for relative_str in &paths {
        let full = project_dir.join(relative_str);
        let metadata = match std::fs::metadata(&full) {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %full.display(), error = %err, "skipping unreadable file during fingerprinting");
                continue;
            }
        };
        if let Ok(modified) = metadata.modified() {
            if let Ok(since_epoch) = modified.duration_since(UNIX_EPOCH) {
                max_mtime_ms = max_mtime_ms.max(since_epoch.as_millis() as i64);
            }
        }
        if let Some(hasher) = aggregate.as_mut() {
            match std::fs::read(&full) {
                Ok(bytes) => hasher.update(&bytes),
                Err(err) => {
                    warn!(path = %full.display(), error = %err, "skipping unreadable file during fingerprinting");
                }
            }
        }
    }

    Ok(Fingerprint {
        count: paths.len() as u32,
        max_mtime_ms,
        aggregate_md5: aggregate.map(|h| h.finalize().into()),
        per_file_md5,
    })
}
