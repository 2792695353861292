//! The on-disk half of the cache: one directory per VistA, one JSON document per query.
//!
//! Layout: `<caches_root>/<label>/<query>.json`, with both the label and the query string passed
//! through [`sanitize_component`]. Documents are written with temp-file-and-rename so a reader
//! never sees a partial write and a failed write never clobbers the previous entry.

use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

const ENTRY_EXTENSION: &str = "json";

/// One cached FMQL reply.
///
/// FMQL replies carry a `results` array and a `count`; `count` arrives either as a number or as a
/// decimal string depending on the FMQL release, so [`CachedResponse::count`] accepts both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CachedResponse(Value);

impl CachedResponse {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn from_slice(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes).map(Self)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn count(&self) -> Option<u64> {
        match self.0.get("count")? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn results(&self) -> &[Value] {
        match self.0.get("results") {
            Some(Value::Array(results)) => results,
            _ => &[],
        }
    }

    pub fn into_results(self) -> Vec<Value> {
        match self.0 {
            Value::Object(mut map) => match map.remove("results") {
                Some(Value::Array(results)) => results,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// The `error` message FMQL puts in place of results for a failed query.
    pub fn error(&self) -> Option<&str> {
        self.0.get("error").and_then(Value::as_str)
    }

    /// Number of records in this page: `count`, else the length of `results`.
    pub fn page_len(&self) -> u64 {
        self.count().unwrap_or(self.results().len() as u64)
    }
}

/// Replace every character that is unsafe in a file name with `_`.
///
/// Spaces are the common case (`DESCRIBE TYPE 9_6` -> `DESCRIBE_TYPE_9_6`). The mapping is stable
/// but not injective; cache keys come from [`crate::FmqlQuery`] so collisions do not arise in
/// practice.
pub fn sanitize_component(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => format!("_{sanitized}"),
        _ => sanitized,
    }
}

#[derive(Clone, Debug)]
pub struct DiskCacheStore {
    root: PathBuf,
}

impl DiskCacheStore {
    /// Open (creating if needed) the caches root directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|err| CacheError::storage(&root, err))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vista_dir(&self, vista_label: &str) -> PathBuf {
        self.root.join(sanitize_component(vista_label))
    }

    pub fn ensure_vista_directory(&self, vista_label: &str) -> Result<PathBuf> {
        let dir = self.vista_dir(vista_label);
        fs::create_dir_all(&dir).map_err(|err| CacheError::storage(&dir, err))?;
        Ok(dir)
    }

    pub fn entry_path(&self, vista_label: &str, query: &str) -> PathBuf {
        self.vista_dir(vista_label)
            .join(format!("{}.{ENTRY_EXTENSION}", sanitize_component(query)))
    }

    pub fn exists(&self, vista_label: &str, query: &str) -> bool {
        self.entry_path(vista_label, query).is_file()
    }

    pub fn read(&self, vista_label: &str, query: &str) -> Result<CachedResponse> {
        let path = self.entry_path(vista_label, query);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound {
                    query: query.to_owned(),
                })
            }
            Err(err) => return Err(CacheError::storage(path, err)),
        };
        CachedResponse::from_slice(&bytes).map_err(|err| CacheError::CorruptCacheEntry {
            message: err.to_string(),
            path,
        })
    }

    pub fn write(&self, vista_label: &str, query: &str, response: &CachedResponse) -> Result<()> {
        let bytes = serde_json::to_vec(response).map_err(|err| CacheError::InvalidResponse {
            query: query.to_owned(),
            message: err.to_string(),
        })?;
        self.persist(vista_label, query, &bytes)
    }

    /// Persist a reply exactly as the backend sent it, after checking it parses.
    pub fn write_raw(
        &self,
        vista_label: &str,
        query: &str,
        bytes: &[u8],
    ) -> Result<CachedResponse> {
        let response =
            CachedResponse::from_slice(bytes).map_err(|err| CacheError::InvalidResponse {
                query: query.to_owned(),
                message: err.to_string(),
            })?;
        self.persist(vista_label, query, bytes)?;
        Ok(response)
    }

    /// Entries are immutable and shared with other tools; clearing is deliberately inert.
    pub fn clear_cache(&self, vista_label: &str) -> Result<()> {
        tracing::debug!(
            target = "vdm.cache",
            vista = vista_label,
            "clear_cache is a no-op; remove the cache directory by hand to reset"
        );
        Ok(())
    }

    fn persist(&self, vista_label: &str, query: &str, bytes: &[u8]) -> Result<()> {
        self.ensure_vista_directory(vista_label)?;
        let path = self.entry_path(vista_label, query);
        atomic_write(&path, bytes).map_err(|err| CacheError::storage(&path, err))
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Write `bytes` to a unique sibling temp file, fsync it, then rename it over `path`.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::other("cache entry path has no file name"))?;

    let pid = std::process::id();
    let (tmp_path, mut file) = loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = std::ffi::OsString::from(".");
        tmp_name.push(file_name);
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => break (tmp_path, file),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    };

    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);
    if let Err(err) = written {
        remove_tmp(&tmp_path);
        return Err(err);
    }

    let mut renamed = fs::rename(&tmp_path, path);
    if cfg!(windows) && renamed.is_err() && path.exists() {
        // `rename` does not replace an existing file on Windows.
        let _ = fs::remove_file(path);
        renamed = fs::rename(&tmp_path, path);
    }
    if let Err(err) = renamed {
        remove_tmp(&tmp_path);
        return Err(err);
    }

    #[cfg(unix)]
    if let Err(err) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
        tracing::debug!(
            target = "vdm.cache",
            dir = %parent.display(),
            error = %err,
            "failed to sync cache directory (best effort)"
        );
    }
    Ok(())
}

fn remove_tmp(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(
                target = "vdm.cache",
                path = %tmp_path.display(),
                error = %err,
                "failed to remove temporary cache file"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_replaces_spaces_and_separators() {
        assert_eq!(
            sanitize_component("DESCRIBE 9_6 CSTOP 10 LIMIT 200 OFFSET 0"),
            "DESCRIBE_9_6_CSTOP_10_LIMIT_200_OFFSET_0"
        );
        assert_eq!(sanitize_component("MY VISTA"), "MY_VISTA");
        assert_eq!(sanitize_component("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_component(".."), "_..");
    }

    #[test]
    fn count_accepts_numbers_and_strings() {
        let numeric = CachedResponse::new(json!({"count": 3, "results": [1, 2, 3]}));
        let textual = CachedResponse::new(json!({"count": "50", "results": []}));
        let missing = CachedResponse::new(json!({"results": [1, 2]}));
        assert_eq!(numeric.count(), Some(3));
        assert_eq!(textual.count(), Some(50));
        assert_eq!(missing.count(), None);
        assert_eq!(missing.page_len(), 2);
    }

    #[test]
    fn write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        let doc = CachedResponse::new(json!({
            "count": "2",
            "results": [{"uri": {"type": "uri", "value": "9_6-1"}}, {"name": {"value": "X"}}],
        }));

        store.write("GOLD", "SELECT TYPES", &doc).unwrap();
        assert!(store.exists("GOLD", "SELECT TYPES"));
        assert_eq!(store.read("GOLD", "SELECT TYPES").unwrap(), doc);
        assert!(tmp.path().join("GOLD").join("SELECT_TYPES.json").is_file());
    }

    #[test]
    fn read_distinguishes_missing_from_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();

        let err = store.read("GOLD", "COUNT 2").unwrap_err();
        assert!(matches!(err, CacheError::NotFound { .. }), "{err:?}");

        store.ensure_vista_directory("GOLD").unwrap();
        fs::write(store.entry_path("GOLD", "DESCRIBE TYPE 2"), b"{\"count\": ").unwrap();
        let err = store.read("GOLD", "DESCRIBE TYPE 2").unwrap_err();
        assert!(matches!(err, CacheError::CorruptCacheEntry { .. }), "{err:?}");
    }

    #[test]
    fn write_raw_rejects_non_json_and_keeps_previous_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        store
            .write_raw("GOLD", "SELECT TYPES", br#"{"count": 1, "results": [{}]}"#)
            .unwrap();

        let err = store
            .write_raw("GOLD", "SELECT TYPES", b"<html>502</html>")
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidResponse { .. }), "{err:?}");
        assert_eq!(store.read("GOLD", "SELECT TYPES").unwrap().count(), Some(1));
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        for i in 0..5 {
            store
                .write("GOLD", "SELECT TYPES", &CachedResponse::new(json!({ "count": i })))
                .unwrap();
        }
        let names: Vec<String> = fs::read_dir(store.vista_dir("GOLD"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["SELECT_TYPES.json".to_owned()]);
    }

    #[test]
    fn ensure_vista_directory_fails_when_root_is_a_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        fs::write(store.vista_dir("BLOCKED"), b"not a directory").unwrap();

        let err = store.ensure_vista_directory("BLOCKED").unwrap_err();
        assert!(matches!(err, CacheError::StorageUnavailable { .. }), "{err:?}");
    }

    #[test]
    fn clear_cache_is_inert() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DiskCacheStore::open(tmp.path()).unwrap();
        store
            .write("GOLD", "SELECT TYPES", &CachedResponse::new(json!({})))
            .unwrap();
        store.clear_cache("GOLD").unwrap();
        assert!(store.exists("GOLD", "SELECT TYPES"));
    }
}
