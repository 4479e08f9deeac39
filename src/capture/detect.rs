use crate::types::{header_value, HeaderEntry};

pub const UNKNOWN_PROVIDER: &str = "unknown";

/// What a detector gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct DetectionContext<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a [HeaderEntry],
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub provider: String,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl DetectionResult {
    pub fn unknown() -> Self {
        Self {
            provider: UNKNOWN_PROVIDER.to_string(),
            confidence: 0.0,
        }
    }
}

/// Classifies a request as coming from a particular provider. Detection is
/// advisory: `None` means "no opinion", never an error.
pub trait ProviderDetector: Send + Sync {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<DetectionResult>;
}

/// Header-driven detector. A provider's signature header is conclusive, its
/// event/topic header nearly so, and a User-Agent substring is a good hint.
#[derive(Debug, Clone)]
pub struct HeaderDetector {
    pub provider: &'static str,
    pub signature_headers: &'static [&'static str],
    pub event_headers: &'static [&'static str],
    pub user_agent: Option<&'static str>,
}

const SIGNATURE_CONFIDENCE: f64 = 1.0;
const EVENT_CONFIDENCE: f64 = 0.9;
const USER_AGENT_CONFIDENCE: f64 = 0.8;
const BODY_SHAPE_CONFIDENCE: f64 = 0.6;

impl ProviderDetector for HeaderDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<DetectionResult> {
        let present = |names: &[&str]| names.iter().any(|n| header_value(ctx.headers, n).is_some());

        let confidence = if present(self.signature_headers) {
            SIGNATURE_CONFIDENCE
        } else if present(self.event_headers) {
            EVENT_CONFIDENCE
        } else if self.user_agent.is_some_and(|needle| {
            header_value(ctx.headers, "user-agent")
                .is_some_and(|ua| ua.to_ascii_lowercase().contains(&needle.to_ascii_lowercase()))
        }) {
            USER_AGENT_CONFIDENCE
        } else {
            return None;
        };

        Some(DetectionResult {
            provider: self.provider.to_string(),
            confidence,
        })
    }
}

/// Stripe event payloads are recognizable without headers:
/// `{"id": "evt_...", "object": "event", ...}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripeEventBodyDetector;

impl ProviderDetector for StripeEventBodyDetector {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<DetectionResult> {
        let value: serde_json::Value = serde_json::from_slice(ctx.body).ok()?;
        let is_event = value.get("object").and_then(|v| v.as_str()) == Some("event");
        let has_event_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .is_some_and(|id| id.starts_with("evt_"));

        (is_event && has_event_id).then(|| DetectionResult {
            provider: "stripe".to_string(),
            confidence: BODY_SHAPE_CONFIDENCE,
        })
    }
}

pub fn builtin_detectors() -> Vec<Box<dyn ProviderDetector>> {
    vec![
        Box::new(HeaderDetector {
            provider: "github",
            signature_headers: &["x-hub-signature-256", "x-hub-signature"],
            event_headers: &["x-github-event", "x-github-delivery"],
            user_agent: Some("GitHub-Hookshot"),
        }),
        Box::new(HeaderDetector {
            provider: "gitlab",
            signature_headers: &["x-gitlab-token"],
            event_headers: &["x-gitlab-event"],
            user_agent: Some("GitLab"),
        }),
        Box::new(HeaderDetector {
            provider: "stripe",
            signature_headers: &["stripe-signature"],
            event_headers: &[],
            user_agent: Some("Stripe/"),
        }),
        Box::new(HeaderDetector {
            provider: "slack",
            signature_headers: &["x-slack-signature"],
            event_headers: &["x-slack-request-timestamp"],
            user_agent: Some("Slackbot"),
        }),
        Box::new(HeaderDetector {
            provider: "shopify",
            signature_headers: &["x-shopify-hmac-sha256"],
            event_headers: &["x-shopify-topic", "x-shopify-shop-domain"],
            user_agent: Some("Shopify"),
        }),
        Box::new(HeaderDetector {
            provider: "twilio",
            signature_headers: &["x-twilio-signature"],
            event_headers: &[],
            user_agent: Some("TwilioProxy"),
        }),
        Box::new(HeaderDetector {
            provider: "standard-webhooks",
            signature_headers: &["webhook-signature"],
            event_headers: &["webhook-id"],
            user_agent: None,
        }),
        Box::new(StripeEventBodyDetector),
    ]
}

/// Runs every registered detector and keeps the most confident answer.
/// Ties go to the detector registered first.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn ProviderDetector>>,
}

impl DetectorRegistry {
    pub fn new(detectors: Vec<Box<dyn ProviderDetector>>) -> Self {
        Self { detectors }
    }

    pub fn with_builtin() -> Self {
        Self::new(builtin_detectors())
    }

    pub fn register(&mut self, detector: Box<dyn ProviderDetector>) {
        self.detectors.push(detector);
    }

    /// Like [`ProviderDetector::detect`], but falls back to `unknown` with confidence 0.
    pub fn detect_provider(&self, ctx: &DetectionContext<'_>) -> DetectionResult {
        self.detect(ctx).unwrap_or_else(DetectionResult::unknown)
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ProviderDetector for DetectorRegistry {
    fn detect(&self, ctx: &DetectionContext<'_>) -> Option<DetectionResult> {
        let mut best: Option<DetectionResult> = None;
        for detector in &self.detectors {
            let Some(candidate) = detector.detect(ctx) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| candidate.confidence > b.confidence) {
                best = Some(candidate);
            }
        }
        best
    }
}
