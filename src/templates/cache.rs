use crate::error::TemplateError;
use crate::fsutil;
use crate::types::{CachedIndex, TemplatesIndex};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// Local copy of the remote template index, kept in a single JSON file.
/// Freshness is the caller's decision; the cache only records `cachedAt`.
pub struct IndexCache {
    path: PathBuf,
}

impl IndexCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when nothing has been cached yet.
    pub fn get(&self) -> Result<Option<CachedIndex>, TemplateError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TemplateError::io(&self.path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| TemplateError::Corrupt {
                path: self.path.clone(),
                source,
            })
    }

    /// Overwrite the cache with `index`, stamped now.
    pub fn set(&self, index: &TemplatesIndex) -> Result<CachedIndex, TemplateError> {
        let cached = CachedIndex {
            index: index.clone(),
            cached_at: Utc::now(),
        };
        self.put(&cached)?;
        Ok(cached)
    }

    pub fn put(&self, cached: &CachedIndex) -> Result<(), TemplateError> {
        let (dir, file_name) = match (self.path.parent(), self.path.file_name()) {
            (Some(dir), Some(name)) => (dir, name.to_string_lossy().into_owned()),
            _ => {
                return Err(TemplateError::io(
                    &self.path,
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "cache path has no file name"),
                ))
            }
        };
        let contents = serde_json::to_vec_pretty(cached)?;
        fsutil::write_atomic(dir, &file_name, &contents).map_err(|e| TemplateError::io(&self.path, e))?;
        Ok(())
    }

    pub fn clear(&self) -> Result<(), TemplateError> {
        fsutil::remove_if_exists(&self.path).map_err(|e| TemplateError::io(&self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TemplateMetadata;

    fn index() -> TemplatesIndex {
        TemplatesIndex {
            version: "2024-05-01".into(),
            templates: vec![TemplateMetadata {
                id: "push".into(),
                name: "Push".into(),
                provider: "github".into(),
                event: "push".into(),
                file: "github/push.json".into(),
                description: Some("A push to a branch".into()),
                version: None,
                docs_url: None,
            }],
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path().join("cache").join("templates-index.json"));

        assert!(cache.get().unwrap().is_none());
        let written = cache.set(&index()).unwrap();
        let read = cache.get().unwrap().unwrap();
        assert_eq!(read, written);
        assert_eq!(read.index, index());

        let raw: serde_json::Value = serde_json::from_slice(&fs::read(cache.path()).unwrap()).unwrap();
        assert!(raw["cachedAt"].is_string());
        assert_eq!(raw["index"]["templates"][0]["id"], "push");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(cache.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path().join("index.json"));
        cache.set(&index()).unwrap();
        cache.clear().unwrap();
        cache.clear().unwrap();
        assert!(cache.get().unwrap().is_none());
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = IndexCache::new(dir.path().join("index.json"));
        fs::write(cache.path(), b"{not json").unwrap();
        assert!(matches!(cache.get(), Err(TemplateError::Corrupt { .. })));
    }
}
