use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A single header line. Headers are kept as an ordered list rather than a
/// map so repeated names and their original order survive a replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub key: String,
    pub value: String,
}

impl HeaderEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Case-insensitive lookup of the first value for `name`.
pub fn header_value<'a>(headers: &'a [HeaderEntry], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.key.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMeta {
    #[serde(with = "rfc3339_nanos")]
    pub stored_at: DateTime<Utc>,
    pub body_encoding: String,
    pub capture_tool_version: String,
}

/// One captured inbound request, as written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRecord {
    pub id: String,
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub path: String,
    pub headers: Vec<HeaderEntry>,
    pub remote_addr: String,
    pub content_type: String,
    pub content_length: u64,
    /// Base64 (standard alphabet) of the exact request body.
    pub raw_body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_json_preview: Option<Box<serde_json::value::RawValue>>,
    pub provider: String,
    pub meta: CaptureMeta,
}

impl CaptureRecord {
    pub fn decode_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.decode(&self.raw_body)
    }
}

/// A record together with the storage file that owns it.
#[derive(Debug, Clone)]
pub struct CaptureFile {
    pub file_name: String,
    pub path: PathBuf,
    pub record: CaptureRecord,
}

// ─── Templates ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub event: String,
    /// Path of the template document within the remote catalog.
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs_url: Option<String>,
}

/// The request a template describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookTemplate {
    #[serde(default = "default_template_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: serde_json::Value,
}

fn default_template_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalTemplateMetadata {
    #[serde(flatten)]
    pub metadata: TemplateMetadata,
    #[serde(with = "rfc3339_nanos")]
    pub downloaded_at: DateTime<Utc>,
}

/// On-disk template document: the request plus an embedded `_metadata` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDocument {
    #[serde(rename = "_metadata")]
    pub metadata: LocalTemplateMetadata,
    #[serde(flatten)]
    pub template: WebhookTemplate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalTemplate {
    pub metadata: TemplateMetadata,
    pub template: WebhookTemplate,
    pub downloaded_at: DateTime<Utc>,
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTemplate {
    #[serde(flatten)]
    pub metadata: TemplateMetadata,
    pub is_downloaded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplatesIndex {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub templates: Vec<TemplateMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedIndex {
    pub index: TemplatesIndex,
    #[serde(with = "rfc3339_nanos")]
    pub cached_at: DateTime<Utc>,
}

impl CachedIndex {
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: std::time::Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.cached_at) < ttl,
            Err(_) => true,
        }
    }
}

/// Serializes timestamps as RFC 3339 with a fixed nanosecond fraction.
pub mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn header_lookup_ignores_case() {
        let headers = vec![
            HeaderEntry::new("Content-Type", "application/json"),
            HeaderEntry::new("x-github-event", "push"),
        ];
        assert_eq!(header_value(&headers, "content-type"), Some("application/json"));
        assert_eq!(header_value(&headers, "X-GitHub-Event"), Some("push"));
        assert_eq!(header_value(&headers, "x-missing"), None);
    }

    #[test]
    fn cached_index_freshness() {
        let cached_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let cached = CachedIndex {
            index: TemplatesIndex::default(),
            cached_at,
        };
        let ttl = std::time::Duration::from_secs(3600);
        assert!(cached.is_fresh(cached_at + chrono::Duration::minutes(59), ttl));
        assert!(!cached.is_fresh(cached_at + chrono::Duration::minutes(60), ttl));
    }

    #[test]
    fn template_document_layout() {
        let doc: TemplateDocument = serde_json::from_value(serde_json::json!({
            "_metadata": {
                "id": "push",
                "name": "Push",
                "provider": "github",
                "event": "push",
                "file": "github/push.json",
                "downloadedAt": "2024-05-01T12:00:00.000000000Z"
            },
            "headers": {"X-GitHub-Event": "push"},
            "body": {"ref": "refs/heads/main"}
        }))
        .unwrap();

        assert_eq!(doc.metadata.metadata.provider, "github");
        assert_eq!(doc.template.method, "POST");
        assert_eq!(doc.template.headers["X-GitHub-Event"], "push");

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["_metadata"]["downloadedAt"], "2024-05-01T12:00:00.000000000Z");
        assert_eq!(value["body"]["ref"], "refs/heads/main");
    }
}
