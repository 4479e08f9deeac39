use crate::error::TemplateError;
use crate::fsutil;
use crate::types::{LocalTemplate, LocalTemplateMetadata, TemplateDocument, TemplateMetadata, WebhookTemplate};
use chrono::Utc;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,128}$").expect("token pattern compiles"))
}

/// Providers and ids become path components, so they are restricted to a
/// small alphabet with no separators and no `..`.
pub fn validate_token(field: &'static str, value: &str) -> Result<(), TemplateError> {
    if !token_pattern().is_match(value) || value == "." || value.contains("..") {
        return Err(TemplateError::InvalidToken {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Downloaded templates, one file per template at `<dir>/<provider>/<id>.json`.
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn provider_dir(&self, provider: &str) -> Result<PathBuf, TemplateError> {
        validate_token("provider", provider)?;
        Ok(self.dir.join(provider))
    }

    pub fn path_for(&self, provider: &str, id: &str) -> Result<PathBuf, TemplateError> {
        validate_token("id", id)?;
        Ok(self.provider_dir(provider)?.join(format!("{id}.json")))
    }

    pub fn save(&self, metadata: &TemplateMetadata, template: &WebhookTemplate) -> Result<LocalTemplate, TemplateError> {
        let dir = self.provider_dir(&metadata.provider)?;
        validate_token("id", &metadata.id)?;

        let document = TemplateDocument {
            metadata: LocalTemplateMetadata {
                metadata: metadata.clone(),
                downloaded_at: Utc::now(),
            },
            template: template.clone(),
        };
        let contents = serde_json::to_vec_pretty(&document)?;
        let file_name = format!("{}.json", metadata.id);
        let file_path = fsutil::write_atomic(&dir, &file_name, &contents)
            .map_err(|e| TemplateError::io(dir.join(&file_name), e))?;

        tracing::debug!(provider = %metadata.provider, id = %metadata.id, "saved template");
        Ok(into_local(document, file_path))
    }

    pub fn get(&self, provider: &str, id: &str) -> Result<LocalTemplate, TemplateError> {
        let path = self.path_for(provider, id)?;
        let document = match read_document(&path) {
            Err(TemplateError::Io { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::TemplateNotFound(format!("{provider}/{id}")))
            }
            other => other?,
        };
        Ok(into_local(document, path))
    }

    /// All managed templates, ordered by provider then id.
    pub fn list(&self) -> Result<Vec<LocalTemplate>, TemplateError> {
        let mut templates = Vec::new();
        for (provider, id, path) in self.candidate_files(None)? {
            match read_document(&path) {
                Ok(doc) if is_managed(&doc, &provider, &id) => templates.push(into_local(doc, path)),
                Ok(_) => tracing::debug!(path = %path.display(), "ignoring unmanaged template file"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable template"),
            }
        }
        templates.sort_by(|a, b| {
            (a.metadata.provider.as_str(), a.metadata.id.as_str())
                .cmp(&(b.metadata.provider.as_str(), b.metadata.id.as_str()))
        });
        Ok(templates)
    }

    /// Locate a template by id alone. An id present under several providers is ambiguous.
    pub fn find_by_id(&self, id: &str) -> Result<LocalTemplate, TemplateError> {
        validate_token("id", id)?;
        let mut found: Vec<LocalTemplate> = self
            .candidate_files(Some(id))?
            .into_iter()
            .filter_map(|(provider, id, path)| {
                let doc = read_document(&path).ok()?;
                is_managed(&doc, &provider, &id).then(|| into_local(doc, path))
            })
            .collect();

        match found.len() {
            0 => Err(TemplateError::TemplateNotFound(id.to_string())),
            1 => Ok(found.remove(0)),
            _ => Err(TemplateError::AmbiguousTemplate {
                id: id.to_string(),
                providers: found.into_iter().map(|t| t.metadata.provider).collect(),
            }),
        }
    }

    pub fn delete(&self, provider: &str, id: &str) -> Result<(), TemplateError> {
        let path = self.path_for(provider, id)?;
        let removed = fsutil::remove_if_exists(&path).map_err(|e| TemplateError::io(&path, e))?;
        if !removed {
            return Err(TemplateError::TemplateNotFound(format!("{provider}/{id}")));
        }
        if let Some(parent) = path.parent() {
            // Only succeeds once the provider directory is empty.
            let _ = fs::remove_dir(parent);
        }
        Ok(())
    }

    /// Remove every managed template; files that do not describe themselves
    /// consistently with their location are left alone.
    pub fn delete_all(&self) -> Result<usize, TemplateError> {
        let mut removed = 0;
        for template in self.list()? {
            fsutil::remove_if_exists(&template.file_path)
                .map_err(|e| TemplateError::io(&template.file_path, e))?;
            if let Some(parent) = template.file_path.parent() {
                let _ = fs::remove_dir(parent);
            }
            removed += 1;
        }
        tracing::info!(removed, "deleted downloaded templates");
        Ok(removed)
    }

    /// `(provider, id, path)` for every `<provider>/<id>.json` with valid tokens.
    fn candidate_files(&self, only_id: Option<&str>) -> Result<Vec<(String, String, PathBuf)>, TemplateError> {
        let providers = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TemplateError::io(&self.dir, e)),
        };

        let mut out = Vec::new();
        for entry in providers {
            let entry = entry.map_err(|e| TemplateError::io(&self.dir, e))?;
            let provider = entry.file_name().to_string_lossy().into_owned();
            if validate_token("provider", &provider).is_err() || !entry.path().is_dir() {
                continue;
            }
            let files = fs::read_dir(entry.path()).map_err(|e| TemplateError::io(entry.path(), e))?;
            for file in files {
                let file = file.map_err(|e| TemplateError::io(entry.path(), e))?;
                let name = file.file_name().to_string_lossy().into_owned();
                let Some(id) = name.strip_suffix(".json") else {
                    continue;
                };
                if validate_token("id", id).is_err() || only_id.is_some_and(|want| want != id) {
                    continue;
                }
                out.push((provider.clone(), id.to_string(), file.path()));
            }
        }
        Ok(out)
    }
}

fn read_document(path: &Path) -> Result<TemplateDocument, TemplateError> {
    let raw = fs::read(path).map_err(|e| TemplateError::io(path, e))?;
    serde_json::from_slice(&raw).map_err(|source| TemplateError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn is_managed(doc: &TemplateDocument, provider: &str, id: &str) -> bool {
    doc.metadata.metadata.provider == provider && doc.metadata.metadata.id == id
}

fn into_local(doc: TemplateDocument, file_path: PathBuf) -> LocalTemplate {
    LocalTemplate {
        metadata: doc.metadata.metadata,
        template: doc.template,
        downloaded_at: doc.metadata.downloaded_at,
        file_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(provider: &str, id: &str) -> TemplateMetadata {
        TemplateMetadata {
            id: id.to_string(),
            name: format!("{provider} {id}"),
            provider: provider.to_string(),
            event: id.to_string(),
            file: format!("{provider}/{id}.json"),
            description: None,
            version: Some("1".into()),
            docs_url: None,
        }
    }

    fn template() -> WebhookTemplate {
        WebhookTemplate {
            method: "POST".into(),
            headers: [("X-GitHub-Event".to_string(), "push".to_string())].into(),
            body: serde_json::json!({"ref": "refs/heads/main"}),
        }
    }

    #[test]
    fn tokens_reject_traversal() {
        let too_long = "a".repeat(129);
        for bad in ["", "..", ".", "../etc", "a/b", "a\\b", "x..y", "has space", too_long.as_str()] {
            assert!(validate_token("id", bad).is_err(), "{bad:?} should be rejected");
        }
        let longest = "a".repeat(128);
        for good in ["push", "pull_request.opened", "v1-2", longest.as_str()] {
            validate_token("id", good).unwrap();
        }
    }

    #[test]
    fn save_get_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());

        let saved = store.save(&metadata("github", "push"), &template()).unwrap();
        assert_eq!(saved.file_path, dir.path().join("github").join("push.json"));

        let loaded = store.get("github", "push").unwrap();
        assert_eq!(loaded, saved);

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(&saved.file_path).unwrap()).unwrap();
        assert_eq!(raw["_metadata"]["provider"], "github");
        assert!(raw["_metadata"]["downloadedAt"].is_string());

        assert!(matches!(
            store.get("github", "missing"),
            Err(TemplateError::TemplateNotFound(_))
        ));
        assert!(matches!(
            store.get("..", "push"),
            Err(TemplateError::InvalidToken { field: "provider", .. })
        ));
    }

    #[test]
    fn delete_all_only_touches_managed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        store.save(&metadata("github", "push"), &template()).unwrap();
        store.save(&metadata("stripe", "charge.succeeded"), &template()).unwrap();

        // Claims to be stripe/charge but lives at github/imposter.json.
        let imposter = dir.path().join("github").join("imposter.json");
        let doc = fs::read(dir.path().join("stripe").join("charge.succeeded.json")).unwrap();
        fs::write(&imposter, doc).unwrap();
        let notes = dir.path().join("github").join("notes.txt");
        fs::write(&notes, b"keep me").unwrap();

        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.delete_all().unwrap(), 2);
        assert!(imposter.exists());
        assert!(notes.exists());
        assert!(!dir.path().join("stripe").exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn find_by_id_detects_ambiguity() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        store.save(&metadata("github", "ping"), &template()).unwrap();
        assert_eq!(store.find_by_id("ping").unwrap().metadata.provider, "github");

        store.save(&metadata("gitlab", "ping"), &template()).unwrap();
        assert!(matches!(
            store.find_by_id("ping"),
            Err(TemplateError::AmbiguousTemplate { .. })
        ));
        assert!(matches!(
            store.find_by_id("nope"),
            Err(TemplateError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn delete_single() {
        let dir = tempfile::tempdir().unwrap();
        let store = TemplateStore::new(dir.path());
        store.save(&metadata("github", "push"), &template()).unwrap();

        store.delete("github", "push").unwrap();
        assert!(matches!(
            store.delete("github", "push"),
            Err(TemplateError::TemplateNotFound(_))
        ));
    }
}
