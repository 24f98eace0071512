//! Core data model: requests, operation results, and the URL normalization
//! rule used to derive a `unique_key` when the caller doesn't supply one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// A single crawl request.
///
/// `user_data` preserves any caller-supplied fields the coordinator doesn't
/// understand, the same way `jira::JiraFields` keeps an untyped
/// `serde_json::Value` escape hatch for fields it doesn't model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub user_data: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            unique_key: None,
            id: None,
            handled_at: None,
            user_data: serde_json::Map::new(),
        }
    }

    pub fn is_handled(&self) -> bool {
        self.handled_at.is_some()
    }
}

/// Result of add / mark-handled / reclaim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOperationResult {
    pub request_id: String,
    pub unique_key: String,
    pub was_already_present: bool,
    pub was_already_handled: bool,
}

/// Entry in the local request cache, keyed by the derived request-ID
/// (not the remote `id`).
#[derive(Debug, Clone)]
pub struct CachedRequestInfo {
    pub id: String,
    pub unique_key: String,
    pub is_handled: bool,
    pub was_already_handled: bool,
}

/// Normalize a URL per the dedup contract:
/// lower-case scheme/host, trailing slash stripped, query params sorted,
/// `utm_*` params removed, fragment dropped unless `keep_fragment` is set.
///
/// Idempotent: `normalize(normalize(u)) == normalize(u)`.
pub fn normalize_url(raw: &str, keep_fragment: bool) -> Result<String, crate::error::Error> {
    let mut parsed = Url::parse(raw)
        .map_err(|e| crate::error::Error::client(format!("invalid url '{raw}': {e}")))?;

    let scheme = parsed.scheme().to_ascii_lowercase();
    parsed
        .set_scheme(&scheme)
        .map_err(|_| crate::error::Error::client(format!("invalid scheme in '{raw}'")))?;

    if let Some(host) = parsed.host_str() {
        let lower = host.to_ascii_lowercase();
        parsed
            .set_host(Some(&lower))
            .map_err(|e| crate::error::Error::client(format!("invalid host in '{raw}': {e}")))?;
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }

    if !keep_fragment {
        parsed.set_fragment(None);
    }

    let mut path = parsed.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
        parsed.set_path(&path);
    }

    Ok(parsed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_utm_and_sorts_params() {
        let got = normalize_url(
            "https://A.example.com/p/?utm_source=x&b=2&a=1#frag",
            false,
        )
        .unwrap();
        assert_eq!(got, "https://a.example.com/p?a=1&b=2");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_url("https://A.example.com/p/?utm_source=x&b=2&a=1#frag", false).unwrap();
        let twice = normalize_url(&once, false).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalization_strips_trailing_slash() {
        let got = normalize_url("https://a/", false).unwrap();
        assert_eq!(got, "https://a/");
        // root path "/" is preserved (stripping it would be invalid), but a
        // non-root trailing slash is removed.
        let got = normalize_url("https://a/p/", false).unwrap();
        assert_eq!(got, "https://a/p");
    }

    #[test]
    fn normalization_keeps_fragment_when_requested() {
        let got = normalize_url("https://a/p#frag", true).unwrap();
        assert_eq!(got, "https://a/p#frag");
    }
}
