//! Compiled executable cache.
//!
//! Executables are keyed by the graph hash, the compile-relevant options and
//! the device capability. An in-process LRU sits in front of artifacts stored
//! at `<cachePath>/<key:016x>.fgexe`. Each artifact starts with a magic and
//! format version followed by a bincode header naming the key, the graph hash
//! and the stream names it was compiled for; any mismatch is reported rather
//! than loaded.

use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::hashing::Fingerprint;
use crate::ir::TensorId;
use crate::logging::{Diagnostic, DiagnosticSink};

use super::executable::Executable;
use super::options::SessionOptions;

const MAGIC: &[u8; 8] = b"FGEXE\0\0\0";
const VERSION: u32 = 1;
const LRU_ENTRIES: usize = 64;

static ENGINE_LRU: Lazy<Mutex<LruCache<u64, Arc<Executable>>>> = Lazy::new(|| {
    let capacity = NonZeroUsize::new(LRU_ENTRIES).unwrap_or(NonZeroUsize::MIN);
    Mutex::new(LruCache::new(capacity))
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ArtifactHeader {
    key: u64,
    graph_hash: u64,
    stream_names: Vec<TensorId>,
}

pub fn cache_key(graph_hash: u64, options: &SessionOptions, device: &DeviceInfo) -> Result<u64> {
    let mut fp = Fingerprint::new();
    fp.write_u64(graph_hash);
    options.write_cache_fingerprint(&mut fp)?;
    fp.write_str(&device.capability_key());
    Ok(fp.finish())
}

pub fn artifact_path(dir: &Path, key: u64) -> PathBuf {
    dir.join(format!("{key:016x}.fgexe"))
}

/// Finds the executable for `key`, first in memory, then on disk.
pub fn lookup(
    dir: &Path,
    key: u64,
    graph_hash: u64,
    stream_names: &[TensorId],
    sink: &dyn DiagnosticSink,
) -> Result<Option<Arc<Executable>>> {
    let cached = ENGINE_LRU
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .cloned();
    if let Some(executable) = cached {
        if executable.graph_hash == graph_hash {
            let path = artifact_path(dir, key);
            if !path.exists() {
                write_artifact(&path, key, &executable)?;
            }
            sink.emit(Diagnostic::CacheHit { key });
            return Ok(Some(executable));
        }
    }

    let path = artifact_path(dir, key);
    if !path.exists() {
        sink.emit(Diagnostic::CacheMiss { key });
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    let (header, executable) = decode_artifact(&bytes)?;
    let expected = ArtifactHeader {
        key,
        graph_hash,
        stream_names: stream_names.to_vec(),
    };
    if header != expected || executable.graph_hash != graph_hash {
        return Err(Error::CacheIntegrity(format!(
            "{} was compiled for key {:016x} (graph {:016x}) but key {key:016x} (graph {graph_hash:016x}) was requested",
            path.display(),
            header.key,
            header.graph_hash
        )));
    }
    let executable = Arc::new(executable);
    remember(key, &executable);
    sink.emit(Diagnostic::CacheHit { key });
    Ok(Some(executable))
}

/// Writes the artifact for `key` and keeps it in memory.
pub fn store(
    dir: &Path,
    key: u64,
    executable: &Arc<Executable>,
    sink: &dyn DiagnosticSink,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = artifact_path(dir, key);
    write_artifact(&path, key, executable)?;
    remember(key, executable);
    sink.emit(Diagnostic::CacheStored {
        key,
        path: path.display().to_string(),
    });
    Ok(path)
}

fn remember(key: u64, executable: &Arc<Executable>) {
    ENGINE_LRU
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .put(key, Arc::clone(executable));
}

fn write_artifact(path: &Path, key: u64, executable: &Executable) -> Result<()> {
    let header = ArtifactHeader {
        key,
        graph_hash: executable.graph_hash,
        stream_names: executable.stream_names(),
    };
    let body = bincode::serialize(&(&header, executable))?;
    let mut bytes = Vec::with_capacity(MAGIC.len() + 4 + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&VERSION.to_le_bytes());
    bytes.extend_from_slice(&body);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

fn decode_artifact(bytes: &[u8]) -> Result<(ArtifactHeader, Executable)> {
    if bytes.len() < MAGIC.len() + 4 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(Error::CacheIntegrity(
            "artifact does not start with the executable magic".into(),
        ));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&bytes[MAGIC.len()..MAGIC.len() + 4]);
    let version = u32::from_le_bytes(version);
    if version != VERSION {
        return Err(Error::CacheIntegrity(format!(
            "artifact format version {version} is not {VERSION}"
        )));
    }
    bincode::deserialize(&bytes[MAGIC.len() + 4..])
        .map_err(|e| Error::CacheIntegrity(format!("artifact body does not decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_bytes_fail_integrity() {
        assert!(matches!(
            decode_artifact(b"FGMODEL\0\x01\0\0\0"),
            Err(Error::CacheIntegrity(_))
        ));
        assert!(matches!(
            decode_artifact(b"FGEXE\0\0\0\x07\0\0\0"),
            Err(Error::CacheIntegrity(_))
        ));
    }
}
