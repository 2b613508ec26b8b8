//! Atomic file writes and tolerant JSON reads.
//!
//! Writers go through a uniquely named temporary sibling followed by a rename, so readers
//! running in other processes see either the old file, the new file, or nothing.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Atomically write JSON data to a file, creating parent directories.
pub fn atomic_write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes to a file, creating parent directories.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(path);
    if let Err(e) = std::fs::write(&tmp, data) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

// Unique per writer so concurrent processes never share a temp file.
fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

/// Outcome of reading a JSON document that may be mid-write.
#[derive(Debug)]
pub enum JsonRead<T> {
    Missing,
    /// Empty or truncated; the writer has not finished.
    Incomplete,
    Malformed(String),
    Ready(T),
}

/// Read and deserialize JSON, classifying truncated content as incomplete.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> JsonRead<T> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return JsonRead::Missing,
        Err(e) => return JsonRead::Malformed(e.to_string()),
    };
    if data.trim().is_empty() {
        return JsonRead::Incomplete;
    }
    match serde_json::from_str(&data) {
        Ok(value) => JsonRead::Ready(value),
        Err(e) if e.classify() == serde_json::error::Category::Eof => JsonRead::Incomplete,
        Err(e) => JsonRead::Malformed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestData {
        name: String,
        count: u32,
    }

    #[test]
    fn test_atomic_write_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("test.json");
        let data = TestData {
            name: "hello".into(),
            count: 42,
        };

        atomic_write_json(&path, &data).unwrap();
        match read_json::<TestData>(&path) {
            JsonRead::Ready(loaded) => assert_eq!(loaded, data),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_tmp_leftover() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clean.json");
        atomic_write_json(&path, &"test").unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_read_json_classifies_states() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing.json");
        assert!(matches!(read_json::<TestData>(&missing), JsonRead::Missing));

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "").unwrap();
        assert!(matches!(read_json::<TestData>(&empty), JsonRead::Incomplete));

        let truncated = dir.path().join("truncated.json");
        std::fs::write(&truncated, r#"{"name": "x", "cou"#).unwrap();
        assert!(matches!(
            read_json::<TestData>(&truncated),
            JsonRead::Incomplete
        ));

        let broken = dir.path().join("broken.json");
        std::fs::write(&broken, r#"{"name": 5, "count": 1}"#).unwrap();
        assert!(matches!(
            read_json::<TestData>(&broken),
            JsonRead::Malformed(_)
        ));
    }
}
