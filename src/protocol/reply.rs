//! Reply payload and its codec.
//!
//! # Format
//!
//! Success:
//! ```json
//! {
//!   "exception": false,
//!   "html": "<html>...</html>",
//!   "url": "https://example.com",
//!   "scraper_parameters": { ... }
//! }
//! ```
//!
//! Failure:
//! ```json
//! {
//!   "exception": true,
//!   "kind": "TimeoutError",
//!   "str": "selector never appeared",
//!   "repr": "TimeoutError(\"selector never appeared\")",
//!   "url": "https://example.com",
//!   "scraper_parameters": { ... }
//! }
//! ```
//!
//! `exception` is the only discriminant. `kind` is optional on the wire;
//! when a worker omits it, the kind is read from `repr`. A `kind` that is
//! present is taken verbatim, even when empty.

// ============================================================================
// Imports
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{FetchOptions, null_as_default};

/// Kind reported when neither `kind` nor a usable `repr` is present.
const UNKNOWN_KIND: &str = "Exception";

// ============================================================================
// FetchOutcome
// ============================================================================

/// Result of one fetch as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Page rendered; carries its HTML.
    Success {
        /// Rendered page content.
        html: String,
    },
    /// Fetch failed on the worker.
    Failure {
        /// Failure category, e.g. `TimeoutError`.
        kind: String,
        /// Human-readable message, verbatim from the fetcher.
        message: String,
    },
}

impl FetchOutcome {
    /// Creates a success outcome.
    #[inline]
    #[must_use]
    pub fn success(html: impl Into<String>) -> Self {
        Self::Success { html: html.into() }
    }

    /// Creates a failure outcome.
    #[inline]
    #[must_use]
    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failure {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Returns `true` for [`FetchOutcome::Success`].
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

// ============================================================================
// Reply
// ============================================================================

/// A decoded reply: the outcome plus the echoed request.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// URL of the request that produced this reply.
    pub url: String,
    /// Options of the request that produced this reply.
    pub parameters: FetchOptions,
    /// Success or failure.
    pub outcome: FetchOutcome,
}

impl Reply {
    /// Creates a reply.
    #[inline]
    #[must_use]
    pub fn new(url: impl Into<String>, parameters: FetchOptions, outcome: FetchOutcome) -> Self {
        Self {
            url: url.into(),
            parameters,
            outcome,
        }
    }

    /// Returns `true` if the fetch succeeded.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Returns the HTML if the fetch succeeded.
    #[inline]
    #[must_use]
    pub fn html(&self) -> Option<&str> {
        match &self.outcome {
            FetchOutcome::Success { html } => Some(html),
            FetchOutcome::Failure { .. } => None,
        }
    }

    /// Extracts the HTML, turning a failure into an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Fetch`] if the worker reported a failure.
    pub fn into_html(self) -> Result<String> {
        match self.outcome {
            FetchOutcome::Success { html } => Ok(html),
            FetchOutcome::Failure { kind, message } => Err(Error::fetch(kind, message)),
        }
    }
}

// ============================================================================
// Wire Record
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct ReplyRecord {
    exception: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    html: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,

    #[serde(rename = "str", default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    repr: Option<String>,

    #[serde(default)]
    url: String,

    #[serde(default, deserialize_with = "null_as_default")]
    scraper_parameters: FetchOptions,
}

// ============================================================================
// Codec
// ============================================================================

/// Encodes a reply payload.
///
/// # Errors
///
/// Returns [`Error::Json`] if serialization fails.
pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    let record = match &reply.outcome {
        FetchOutcome::Success { html } => ReplyRecord {
            exception: false,
            html: Some(html.clone()),
            kind: None,
            message: None,
            repr: None,
            url: reply.url.clone(),
            scraper_parameters: reply.parameters.clone(),
        },
        FetchOutcome::Failure { kind, message } => ReplyRecord {
            exception: true,
            html: None,
            kind: Some(kind.clone()),
            message: Some(message.clone()),
            repr: Some(format!("{kind}({message:?})")),
            url: reply.url.clone(),
            scraper_parameters: reply.parameters.clone(),
        },
    };

    Ok(serde_json::to_vec(&record)?)
}

/// Decodes a reply payload.
///
/// # Errors
///
/// Returns [`Error::MalformedReply`] if the payload is not JSON, lacks the
/// `exception` discriminant, or is a success without `html`.
pub fn decode_reply(body: &[u8]) -> Result<Reply> {
    let record: ReplyRecord =
        serde_json::from_slice(body).map_err(|e| Error::malformed_reply(e.to_string()))?;

    let outcome = if record.exception {
        let kind = match record.kind {
            Some(kind) => kind,
            None => record
                .repr
                .as_deref()
                .and_then(kind_from_repr)
                .unwrap_or_else(|| UNKNOWN_KIND.to_string()),
        };

        FetchOutcome::Failure {
            kind,
            message: record.message.unwrap_or_default(),
        }
    } else {
        let html = record
            .html
            .ok_or_else(|| Error::malformed_reply("success reply without `html`"))?;

        FetchOutcome::Success { html }
    };

    Ok(Reply {
        url: record.url,
        parameters: record.scraper_parameters,
        outcome,
    })
}

/// Extracts `Kind` from `Kind(...)`.
fn kind_from_repr(repr: &str) -> Option<String> {
    let kind = repr.split_once('(').map_or(repr, |(head, _)| head).trim();
    (!kind.is_empty()).then(|| kind.to_string())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::{Value, json};

    fn options() -> FetchOptions {
        FetchOptions::new()
            .with_wait_for(".content")
            .with("wait_for_timeout", 2)
    }

    #[test]
    fn test_success_wire_shape() {
        let reply = Reply::new("https://x", options(), FetchOutcome::success("<html>ok</html>"));
        let value: Value = serde_json::from_slice(&encode_reply(&reply).expect("encode")).expect("json");

        assert_eq!(
            value,
            json!({
                "exception": false,
                "html": "<html>ok</html>",
                "url": "https://x",
                "scraper_parameters": {"wait_for": ".content", "wait_for_timeout": 2}
            })
        );
    }

    #[test]
    fn test_failure_wire_shape() {
        let reply = Reply::new(
            "https://x",
            FetchOptions::new(),
            FetchOutcome::failure("TimeoutError", "selector never appeared"),
        );
        let value: Value = serde_json::from_slice(&encode_reply(&reply).expect("encode")).expect("json");

        assert_eq!(value["exception"], json!(true));
        assert_eq!(value["str"], json!("selector never appeared"));
        assert_eq!(value["repr"], json!("TimeoutError(\"selector never appeared\")"));
        assert_eq!(value["kind"], json!("TimeoutError"));
        assert!(value.get("html").is_none());
    }

    #[test]
    fn test_roundtrip_both_outcomes() {
        for outcome in [
            FetchOutcome::success("<p>hi</p>"),
            FetchOutcome::failure("timeout", "selector never appeared"),
        ] {
            let reply = Reply::new("https://x", options(), outcome);
            let decoded = decode_reply(&encode_reply(&reply).expect("encode")).expect("decode");
            assert_eq!(decoded, reply);
        }
    }

    #[test]
    fn test_decode_kind_from_repr_when_absent() {
        let body = br#"{
            "exception": true,
            "str": "",
            "repr": "TimeoutError()",
            "url": "https://x",
            "scraper_parameters": {}
        }"#;

        let reply = decode_reply(body).expect("decode");
        assert_eq!(reply.outcome, FetchOutcome::failure("TimeoutError", ""));
    }

    #[test]
    fn test_decode_failure_without_repr_or_kind() {
        let reply = decode_reply(br#"{"exception": true, "str": "boom"}"#).expect("decode");
        assert_eq!(reply.outcome, FetchOutcome::failure(UNKNOWN_KIND, "boom"));
    }

    #[test]
    fn test_discriminant_beats_payload_shape() {
        // html present but exception = true: still a failure
        let body = br#"{"exception": true, "html": "<html/>", "str": "late"}"#;
        let reply = decode_reply(body).expect("decode");
        assert!(!reply.is_success());
    }

    #[test]
    fn test_decode_missing_discriminant_is_malformed() {
        let err = decode_reply(br#"{"html": "<html/>"}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedReply { .. }));
    }

    #[test]
    fn test_decode_success_without_html_is_malformed() {
        let err = decode_reply(br#"{"exception": false}"#).unwrap_err();
        assert!(matches!(err, Error::MalformedReply { .. }));
    }

    #[test]
    fn test_into_html() {
        let ok = Reply::new("u", FetchOptions::new(), FetchOutcome::success("<b/>"));
        assert_eq!(ok.html(), Some("<b/>"));
        assert_eq!(ok.into_html().expect("html"), "<b/>");

        let failed = Reply::new("u", FetchOptions::new(), FetchOutcome::failure("NavError", "dns"));
        assert_eq!(failed.html(), None);
        let err = failed.into_html().unwrap_err();
        assert!(matches!(err, Error::Fetch { ref kind, ref message } if kind == "NavError" && message == "dns"));
    }

    #[test]
    fn test_empty_kind_survives_roundtrip() {
        let reply = Reply::new("https://x", FetchOptions::new(), FetchOutcome::failure("", "boom"));
        let decoded = decode_reply(&encode_reply(&reply).expect("encode")).expect("decode");
        assert_eq!(decoded.outcome, FetchOutcome::failure("", "boom"));
    }

    #[test]
    fn test_explicit_kind_beats_repr() {
        let body = br#"{"exception": true, "kind": "", "str": "x", "repr": "KeyError('x')"}"#;
        let reply = decode_reply(body).expect("decode");
        assert_eq!(reply.outcome, FetchOutcome::failure("", "x"));
    }

    #[test]
    fn test_kind_from_repr() {
        assert_eq!(kind_from_repr("KeyError('x')").as_deref(), Some("KeyError"));
        assert_eq!(kind_from_repr("Plain").as_deref(), Some("Plain"));
        assert_eq!(kind_from_repr("(x)"), None);
    }

    fn option_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(Value::from),
            "[(){}\"'=*a-z ]*".prop_map(Value::from),
        ]
    }

    fn any_outcome() -> impl Strategy<Value = FetchOutcome> {
        let text = "[(){}\"'=*a-zA-Z ]*";
        prop_oneof![
            text.prop_map(FetchOutcome::success),
            (text, text).prop_map(|(kind, message)| FetchOutcome::failure(kind, message)),
        ]
    }

    proptest! {
        #[test]
        fn prop_reply_roundtrip(
            url in ".*",
            entries in prop::collection::btree_map(".*", option_value(), 0..6),
            outcome in any_outcome(),
        ) {
            let reply = Reply::new(url, entries.into_iter().collect(), outcome);
            let decoded = decode_reply(&encode_reply(&reply).expect("encode")).expect("decode");

            prop_assert_eq!(decoded, reply);
        }
    }
}
