use crate::error::StoreError;
use crate::fsutil;
use crate::types::{CaptureFile, CaptureMeta, CaptureRecord};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

pub const BODY_ENCODING: &str = "base64";

/// Persistence for captured requests.
pub trait CaptureRepository: Send + Sync {
    fn ensure_storage_dir(&self) -> Result<(), StoreError>;

    /// A skeleton record with a fresh id and timestamp for the caller to fill in.
    fn build_base_record(&self, tool_version: &str) -> CaptureRecord;

    fn save(&self, record: CaptureRecord) -> Result<CaptureFile, StoreError>;

    /// Most recent first, at most `limit` entries.
    fn list(&self, limit: usize) -> Result<Vec<CaptureFile>, StoreError>;

    fn resolve_by_id_or_prefix(&self, selector: &str) -> Result<CaptureFile, StoreError>;

    fn delete_by_id_or_prefix(&self, selector: &str) -> Result<CaptureFile, StoreError> {
        let file = self.resolve_by_id_or_prefix(selector)?;
        self.delete_by_file(&file)?;
        Ok(file)
    }

    fn delete_by_file(&self, file: &CaptureFile) -> Result<(), StoreError>;
}

/// One JSON file per capture under a single directory. File names are
/// `<sortable timestamp>_<id>.json`, so lexical order is chronological.
pub struct FileCaptureStore {
    dir: PathBuf,
}

impl FileCaptureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Capture file names, newest first. Temp files and strays are skipped.
    fn file_names(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if id_from_file_name(&name).is_some() {
                names.push(name);
            }
        }
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn load(&self, file_name: &str) -> Result<CaptureFile, StoreError> {
        let path = self.dir.join(file_name);
        let raw = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::CaptureNotFound(file_name.to_string()),
            _ => StoreError::io(&path, e),
        })?;
        let record: CaptureRecord = serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        Ok(CaptureFile {
            file_name: file_name.to_string(),
            path,
            record,
        })
    }
}

impl CaptureRepository for FileCaptureStore {
    fn ensure_storage_dir(&self) -> Result<(), StoreError> {
        fsutil::ensure_private_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))
    }

    fn build_base_record(&self, tool_version: &str) -> CaptureRecord {
        let now = Utc::now();
        CaptureRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: now,
            method: String::new(),
            url: String::new(),
            path: String::new(),
            headers: Vec::new(),
            remote_addr: String::new(),
            content_type: String::new(),
            content_length: 0,
            raw_body: String::new(),
            parsed_json_preview: None,
            provider: String::new(),
            meta: CaptureMeta {
                stored_at: now,
                body_encoding: BODY_ENCODING.to_string(),
                capture_tool_version: tool_version.to_string(),
            },
        }
    }

    fn save(&self, mut record: CaptureRecord) -> Result<CaptureFile, StoreError> {
        record.meta.stored_at = Utc::now();
        let file_name = capture_file_name(&record.timestamp, &record.id);
        let contents = serde_json::to_vec_pretty(&record)?;

        let path = fsutil::write_atomic(&self.dir, &file_name, &contents)
            .map_err(|e| StoreError::io(self.dir.join(&file_name), e))?;

        tracing::debug!(id = %record.id, path = %path.display(), "stored capture");
        Ok(CaptureFile {
            file_name,
            path,
            record,
        })
    }

    fn list(&self, limit: usize) -> Result<Vec<CaptureFile>, StoreError> {
        if limit == 0 {
            return Err(StoreError::InvalidLimit(0));
        }

        let mut files = Vec::new();
        for name in self.file_names()? {
            if files.len() == limit {
                break;
            }
            match self.load(&name) {
                Ok(file) => files.push(file),
                // Deleted between listing and reading.
                Err(StoreError::CaptureNotFound(_)) => continue,
                Err(StoreError::Corrupt { path, source }) => {
                    tracing::warn!(path = %path.display(), error = %source, "skipping unreadable capture");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(files)
    }

    fn resolve_by_id_or_prefix(&self, selector: &str) -> Result<CaptureFile, StoreError> {
        let selector = selector.trim();
        if selector.is_empty() {
            return Err(StoreError::InvalidSelector);
        }

        let matches: Vec<String> = self
            .file_names()?
            .into_iter()
            .filter(|name| id_from_file_name(name).is_some_and(|id| id.starts_with(selector)))
            .collect();

        match matches.as_slice() {
            [] => Err(StoreError::CaptureNotFound(selector.to_string())),
            [name] => self.load(name),
            _ => Err(StoreError::AmbiguousSelector {
                selector: selector.to_string(),
                matches: matches
                    .iter()
                    .filter_map(|n| id_from_file_name(n).map(str::to_string))
                    .collect(),
            }),
        }
    }

    fn delete_by_file(&self, file: &CaptureFile) -> Result<(), StoreError> {
        let removed = fsutil::remove_if_exists(&file.path).map_err(|e| StoreError::io(&file.path, e))?;
        if removed {
            tracing::info!(id = %file.record.id, "deleted capture");
        }
        Ok(())
    }
}

/// `20240501T120000.123456789Z_<id>.json`
pub fn capture_file_name(timestamp: &DateTime<Utc>, id: &str) -> String {
    format!("{}_{}.json", timestamp.format("%Y%m%dT%H%M%S%.9fZ"), id)
}

fn id_from_file_name(name: &str) -> Option<&str> {
    if name.starts_with('.') {
        return None;
    }
    let stem = name.strip_suffix(".json")?;
    let (_, id) = stem.split_once('_')?;
    (!id.is_empty()).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use chrono::TimeZone;

    fn record_with_body(store: &FileCaptureStore, body: &[u8]) -> CaptureRecord {
        let mut record = store.build_base_record("test");
        record.method = "POST".into();
        record.content_length = body.len() as u64;
        record.raw_body = base64::engine::general_purpose::STANDARD.encode(body);
        record.provider = "unknown".into();
        record
    }

    fn record_with_id(store: &FileCaptureStore, id: &str, second: u32) -> CaptureRecord {
        let mut record = record_with_body(store, b"{}");
        record.id = id.to_string();
        record.timestamp = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap();
        record
    }

    #[test]
    fn save_then_resolve_is_binary_safe() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCaptureStore::new(dir.path().join("captures"));
        store.ensure_storage_dir().unwrap();

        let body: Vec<u8> = (0..=255u8).chain([0, 0, 0xff]).collect();
        let saved = store.save(record_with_body(&store, &body)).unwrap();

        let resolved = store.resolve_by_id_or_prefix(&saved.record.id).unwrap();
        assert_eq!(resolved.record.decode_body().unwrap(), body);
        assert_eq!(resolved.record.content_length, body.len() as u64);
        assert_eq!(resolved.file_name, saved.file_name);
        assert!(saved.file_name.ends_with(&format!("_{}.json", saved.record.id)));
        assert_eq!(resolved.record.meta.body_encoding, "base64");
    }

    #[test]
    fn prefix_resolution_and_ambiguity() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCaptureStore::new(dir.path());

        store.save(record_with_id(&store, "abc111", 1)).unwrap();
        store.save(record_with_id(&store, "abc222", 2)).unwrap();
        store.save(record_with_id(&store, "def333", 3)).unwrap();

        assert_eq!(store.resolve_by_id_or_prefix("abc1").unwrap().record.id, "abc111");
        assert_eq!(store.resolve_by_id_or_prefix("d").unwrap().record.id, "def333");

        match store.resolve_by_id_or_prefix("abc") {
            Err(StoreError::AmbiguousSelector { matches, .. }) => {
                assert_eq!(matches, vec!["abc222".to_string(), "abc111".to_string()]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
        assert!(matches!(
            store.resolve_by_id_or_prefix("zzz"),
            Err(StoreError::CaptureNotFound(_))
        ));
        assert!(matches!(
            store.resolve_by_id_or_prefix(""),
            Err(StoreError::InvalidSelector)
        ));
    }

    #[test]
    fn list_is_newest_first_and_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCaptureStore::new(dir.path());

        for (i, id) in ["a1", "b2", "c3", "d4"].iter().enumerate() {
            store.save(record_with_id(&store, id, i as u32)).unwrap();
        }
        // Strays never show up in listings.
        fs::write(dir.path().join(".tmp-abc.part"), b"partial").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let ids: Vec<String> = store.list(3).unwrap().into_iter().map(|f| f.record.id).collect();
        assert_eq!(ids, vec!["d4", "c3", "b2"]);
        assert_eq!(store.list(10).unwrap().len(), 4);
        assert!(matches!(store.list(0), Err(StoreError::InvalidLimit(0))));
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCaptureStore::new(dir.path().join("never-created"));
        assert!(store.list(5).unwrap().is_empty());
    }

    #[test]
    fn delete_is_idempotent_by_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCaptureStore::new(dir.path());
        let saved = store.save(record_with_body(&store, b"x")).unwrap();

        let deleted = store.delete_by_id_or_prefix(&saved.record.id[..6]).unwrap();
        assert_eq!(deleted.record.id, saved.record.id);
        assert!(!saved.path.exists());

        store.delete_by_file(&saved).unwrap();
        assert!(matches!(
            store.delete_by_id_or_prefix(&saved.record.id),
            Err(StoreError::CaptureNotFound(_))
        ));
    }

    #[test]
    fn file_names_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        assert!(capture_file_name(&early, "zz") < capture_file_name(&late, "aa"));
        assert_eq!(
            capture_file_name(&late, "abc"),
            "20240110T000000.000000000Z_abc.json"
        );
    }
}
