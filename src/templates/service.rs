use super::cache::IndexCache;
use super::source::TemplateSource;
use super::store::{validate_token, TemplateStore};
use crate::error::TemplateError;
use crate::replay::{DispatchRequest, DispatchResult, Dispatcher};
use crate::signing;
use crate::types::{HeaderEntry, LocalTemplate, RemoteTemplate, TemplateMetadata, TemplatesIndex};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target_url: String,
    /// Sign the body the way the template's provider would.
    pub secret: Option<String>,
    pub timeout: Duration,
    /// Applied last; replaces template headers of the same name.
    pub extra_headers: Vec<HeaderEntry>,
}

/// Remote catalog, index cache and local store behind one API.
pub struct TemplateService {
    store: TemplateStore,
    cache: IndexCache,
    source: Option<Arc<dyn TemplateSource>>,
    dispatcher: Arc<dyn Dispatcher>,
    ttl: Duration,
}

impl TemplateService {
    pub fn new(store: TemplateStore, cache: IndexCache, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            store,
            cache,
            source: None,
            dispatcher,
            ttl: DEFAULT_INDEX_TTL,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn TemplateSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn store(&self) -> &TemplateStore {
        &self.store
    }

    fn source(&self) -> Result<&Arc<dyn TemplateSource>, TemplateError> {
        self.source.as_ref().ok_or(TemplateError::NoCatalog)
    }

    // ─── Index ───────────────────────────────────────────────────────────────

    /// The catalog index. A fresh cache entry is used as-is unless
    /// `force_refresh`; a failed fetch falls back to any cached copy, however
    /// old, except when refreshing was forced.
    pub async fn index(&self, force_refresh: bool) -> Result<TemplatesIndex, TemplateError> {
        let cached = if force_refresh {
            None
        } else {
            match self.cache.get() {
                Ok(cached) => cached,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable template index cache");
                    None
                }
            }
        };

        if let Some(cached) = &cached {
            if cached.is_fresh(Utc::now(), self.ttl) {
                tracing::debug!(cached_at = %cached.cached_at, "using cached template index");
                return Ok(cached.index.clone());
            }
        }

        let fetched = match self.source() {
            Ok(source) => source.fetch_index().await,
            Err(e) => Err(e),
        };

        match fetched {
            Ok(index) => {
                if let Err(e) = self.cache.set(&index) {
                    tracing::warn!(error = %e, "failed to update template index cache");
                }
                Ok(index)
            }
            Err(e) => match cached {
                Some(stale) if !force_refresh => {
                    tracing::warn!(
                        error = %e,
                        cached_at = %stale.cached_at,
                        "template catalog unreachable, using stale index"
                    );
                    Ok(stale.index)
                }
                _ => Err(e),
            },
        }
    }

    pub async fn list_remote(&self, force_refresh: bool) -> Result<Vec<RemoteTemplate>, TemplateError> {
        let index = self.index(force_refresh).await?;
        let downloaded: HashSet<(String, String)> = self
            .store
            .list()?
            .into_iter()
            .map(|t| (t.metadata.provider, t.metadata.id))
            .collect();

        Ok(index
            .templates
            .into_iter()
            .map(|metadata| {
                let is_downloaded = downloaded.contains(&(metadata.provider.clone(), metadata.id.clone()));
                RemoteTemplate {
                    metadata,
                    is_downloaded,
                }
            })
            .collect())
    }

    pub fn clear_cache(&self) -> Result<(), TemplateError> {
        self.cache.clear()
    }

    // ─── Download ────────────────────────────────────────────────────────────

    /// Fetch and store one template. `selector` is `provider/id` or a bare id.
    pub async fn download(&self, selector: &str) -> Result<LocalTemplate, TemplateError> {
        let index = self.index(false).await?;
        let metadata = select_from_index(&index, selector)?;
        self.fetch_and_save(&metadata).await
    }

    pub async fn download_all(&self) -> Result<Vec<LocalTemplate>, TemplateError> {
        let index = self.index(false).await?;
        let mut saved = Vec::with_capacity(index.templates.len());
        for metadata in &index.templates {
            saved.push(self.fetch_and_save(metadata).await?);
        }
        tracing::info!(count = saved.len(), "downloaded templates");
        Ok(saved)
    }

    async fn fetch_and_save(&self, metadata: &TemplateMetadata) -> Result<LocalTemplate, TemplateError> {
        validate_token("provider", &metadata.provider)?;
        validate_token("id", &metadata.id)?;
        let template = self.source()?.fetch_template(metadata).await?;
        self.store.save(metadata, &template)
    }

    // ─── Local ───────────────────────────────────────────────────────────────

    pub fn list_local(&self) -> Result<Vec<LocalTemplate>, TemplateError> {
        self.store.list()
    }

    pub fn get_local(&self, selector: &str) -> Result<LocalTemplate, TemplateError> {
        match parse_selector(selector)? {
            (Some(provider), id) => self.store.get(provider, id),
            (None, id) => self.store.find_by_id(id),
        }
    }

    pub fn delete(&self, selector: &str) -> Result<(), TemplateError> {
        let template = self.get_local(selector)?;
        self.store.delete(&template.metadata.provider, &template.metadata.id)
    }

    pub fn delete_all(&self) -> Result<usize, TemplateError> {
        self.store.delete_all()
    }

    // ─── Run ─────────────────────────────────────────────────────────────────

    /// Send a template to `opts.target_url`, downloading it first if needed.
    pub async fn run(&self, selector: &str, opts: RunOptions) -> Result<DispatchResult, TemplateError> {
        let local = match self.get_local(selector) {
            Ok(local) => local,
            Err(TemplateError::TemplateNotFound(_)) if self.source.is_some() => {
                tracing::info!(selector, "template not downloaded yet, fetching");
                self.download(selector).await?
            }
            Err(e) => return Err(e),
        };

        let body = match &local.template.body {
            serde_json::Value::Null => Vec::new(),
            serde_json::Value::String(raw) => raw.clone().into_bytes(),
            other => serde_json::to_vec(other)?,
        };

        let mut headers: Vec<HeaderEntry> = local
            .template
            .headers
            .iter()
            .map(|(k, v)| HeaderEntry::new(k.as_str(), v.as_str()))
            .collect();
        let is_json = !matches!(local.template.body, serde_json::Value::Null | serde_json::Value::String(_));
        if is_json
            && !headers.iter().any(|h| h.key.eq_ignore_ascii_case("content-type"))
        {
            headers.push(HeaderEntry::new("Content-Type", "application/json"));
        }
        if let Some(secret) = &opts.secret {
            let timestamp = Utc::now().timestamp();
            let signed = signing::signature_headers(&local.metadata.provider, secret, &body, timestamp)?;
            replace_headers(&mut headers, signed);
        }
        replace_headers(&mut headers, opts.extra_headers);

        let request = DispatchRequest {
            method: local.template.method.clone(),
            url: opts.target_url,
            headers,
            body,
            timeout: opts.timeout,
        };
        let result = self.dispatcher.dispatch(request).await?;
        tracing::debug!(
            provider = %local.metadata.provider,
            id = %local.metadata.id,
            status = result.status,
            duration_ms = result.duration.as_millis() as u64,
            "template run finished"
        );
        Ok(result)
    }
}

fn replace_headers(headers: &mut Vec<HeaderEntry>, overrides: Vec<HeaderEntry>) {
    for entry in &overrides {
        headers.retain(|h| !h.key.eq_ignore_ascii_case(&entry.key));
    }
    headers.extend(overrides);
}

/// `provider/id` or a bare `id`.
fn parse_selector(selector: &str) -> Result<(Option<&str>, &str), TemplateError> {
    match selector.split_once('/') {
        Some((provider, id)) => {
            validate_token("provider", provider)?;
            validate_token("id", id)?;
            Ok((Some(provider), id))
        }
        None => {
            validate_token("id", selector)?;
            Ok((None, selector))
        }
    }
}

fn select_from_index(index: &TemplatesIndex, selector: &str) -> Result<TemplateMetadata, TemplateError> {
    let (provider, id) = parse_selector(selector)?;
    let mut matches: Vec<&TemplateMetadata> = index
        .templates
        .iter()
        .filter(|t| t.id == id && provider.map_or(true, |p| t.provider == p))
        .collect();

    match matches.len() {
        0 => Err(TemplateError::TemplateNotFound(selector.to_string())),
        1 => Ok(matches.remove(0).clone()),
        _ => Err(TemplateError::AmbiguousTemplate {
            id: id.to_string(),
            providers: matches.into_iter().map(|t| t.provider.clone()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplayError;
    use crate::types::{CachedIndex, WebhookTemplate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct StubSource {
        fail: AtomicBool,
        index_fetches: AtomicUsize,
    }

    #[async_trait]
    impl TemplateSource for StubSource {
        async fn fetch_index(&self) -> Result<TemplatesIndex, TemplateError> {
            self.index_fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(TemplateError::Remote("catalog offline".into()));
            }
            Ok(TemplatesIndex {
                version: "remote".into(),
                templates: vec![metadata("github", "push"), metadata("stripe", "charge.succeeded")],
            })
        }

        async fn fetch_template(&self, metadata: &TemplateMetadata) -> Result<WebhookTemplate, TemplateError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(TemplateError::Remote("catalog offline".into()));
            }
            Ok(WebhookTemplate {
                method: "POST".into(),
                headers: [("X-Event".to_string(), metadata.event.clone())].into(),
                body: serde_json::json!({"ref": "refs/heads/main"}),
            })
        }
    }

    #[derive(Default)]
    struct StubDispatcher {
        seen: Mutex<Vec<DispatchRequest>>,
    }

    #[async_trait]
    impl Dispatcher for StubDispatcher {
        async fn dispatch(&self, request: DispatchRequest) -> Result<DispatchResult, ReplayError> {
            self.seen.lock().unwrap().push(request);
            Ok(DispatchResult {
                status: 204,
                status_text: "No Content".into(),
                headers: Vec::new(),
                body: Vec::new(),
                body_truncated: false,
                duration: Duration::from_millis(1),
            })
        }
    }

    fn metadata(provider: &str, id: &str) -> TemplateMetadata {
        TemplateMetadata {
            id: id.into(),
            name: id.into(),
            provider: provider.into(),
            event: id.into(),
            file: format!("{provider}/{id}.json"),
            description: None,
            version: None,
            docs_url: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        source: Arc<StubSource>,
        dispatcher: Arc<StubDispatcher>,
        service: TemplateService,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(StubSource::default());
        let dispatcher = Arc::new(StubDispatcher::default());
        let service = TemplateService::new(
            TemplateStore::new(dir.path().join("templates")),
            IndexCache::new(dir.path().join("cache").join("index.json")),
            dispatcher.clone(),
        )
        .with_source(source.clone());
        Fixture {
            _dir: dir,
            source,
            dispatcher,
            service,
        }
    }

    fn seed_cache(service: &TemplateService, age: chrono::Duration) {
        service
            .cache
            .put(&CachedIndex {
                index: TemplatesIndex {
                    version: "cached".into(),
                    templates: vec![metadata("github", "push")],
                },
                cached_at: Utc::now() - age,
            })
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_cache_skips_remote() {
        let f = fixture();
        seed_cache(&f.service, chrono::Duration::minutes(5));

        let index = f.service.index(false).await.unwrap();
        assert_eq!(index.version, "cached");
        assert_eq!(f.source.index_fetches.load(Ordering::SeqCst), 0);

        let index = f.service.index(true).await.unwrap();
        assert_eq!(index.version, "remote");
        assert_eq!(f.service.cache.get().unwrap().unwrap().index.version, "remote");
    }

    #[tokio::test]
    async fn stale_cache_is_used_when_remote_fails() {
        let f = fixture();
        seed_cache(&f.service, chrono::Duration::hours(3));
        f.source.fail.store(true, Ordering::SeqCst);

        let index = f.service.index(false).await.unwrap();
        assert_eq!(index.version, "cached");
        assert_eq!(f.source.index_fetches.load(Ordering::SeqCst), 1);

        assert!(matches!(f.service.index(true).await, Err(TemplateError::Remote(_))));
    }

    #[tokio::test]
    async fn remote_failure_without_cache_is_an_error() {
        let f = fixture();
        f.source.fail.store(true, Ordering::SeqCst);
        assert!(matches!(f.service.index(false).await, Err(TemplateError::Remote(_))));
    }

    #[tokio::test]
    async fn missing_catalog_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let service = TemplateService::new(
            TemplateStore::new(dir.path().join("templates")),
            IndexCache::new(dir.path().join("index.json")),
            Arc::new(StubDispatcher::default()),
        );
        assert!(matches!(service.index(false).await, Err(TemplateError::NoCatalog)));
    }

    #[tokio::test]
    async fn list_remote_marks_downloaded() {
        let f = fixture();
        f.service.download("github/push").await.unwrap();

        let remote = f.service.list_remote(false).await.unwrap();
        let flags: Vec<(&str, bool)> = remote
            .iter()
            .map(|t| (t.metadata.id.as_str(), t.is_downloaded))
            .collect();
        assert_eq!(flags, vec![("push", true), ("charge.succeeded", false)]);
    }

    #[tokio::test]
    async fn run_downloads_and_signs() {
        let f = fixture();
        let result = f
            .service
            .run(
                "push",
                RunOptions {
                    target_url: "http://127.0.0.1:1/hook".into(),
                    secret: Some("It's a Secret to Everybody".into()),
                    timeout: Duration::from_secs(1),
                    extra_headers: vec![HeaderEntry::new("x-event", "override")],
                },
            )
            .await
            .unwrap();
        assert_eq!(result.status, 204);
        assert_eq!(f.service.list_local().unwrap().len(), 1);

        let seen = f.dispatcher.seen.lock().unwrap();
        let request = &seen[0];
        assert_eq!(request.method, "POST");
        assert_eq!(request.body, br#"{"ref":"refs/heads/main"}"#.to_vec());
        let header = |name: &str| crate::types::header_value(&request.headers, name).map(str::to_string);
        assert_eq!(header("Content-Type").as_deref(), Some("application/json"));
        assert_eq!(header("X-Event").as_deref(), Some("override"));
        assert_eq!(
            header("X-Hub-Signature-256"),
            Some(signing::github_signature("It's a Secret to Everybody", &request.body).unwrap())
        );
    }

    #[tokio::test]
    async fn delete_and_delete_all() {
        let f = fixture();
        f.service.download_all().await.unwrap();
        assert_eq!(f.service.list_local().unwrap().len(), 2);

        f.service.delete("stripe/charge.succeeded").unwrap();
        assert!(matches!(
            f.service.get_local("charge.succeeded"),
            Err(TemplateError::TemplateNotFound(_))
        ));
        assert_eq!(f.service.delete_all().unwrap(), 1);
        assert!(f.service.list_local().unwrap().is_empty());
    }
}
