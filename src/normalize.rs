use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Path prefixes that never participate in learning, prediction, or caching.
/// Requests under these are passed through verbatim at every boundary.
pub const NOISE_PREFIXES: &[&str] = &[
    "/health",
    "/metrics",
    "/docs",
    "/openapi.json",
    "/redoc",
    "/_whoami",
];

lazy_static! {
    /// Canonical 8-4-4-4-12 UUID with version nibble 1-5 and RFC 4122 variant.
    static ref UUID_SEGMENT: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[1-5][0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$"
    )
    .unwrap();
}

pub fn is_noise(path: &str) -> bool {
    NOISE_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Collapse a concrete path to its template: UUID segments become `{uuid}`,
/// pure-decimal segments become `{id}`. A trailing slash (except on the root
/// path) is stripped before replacement. Noise paths pass through verbatim.
pub fn normalize(path: &str) -> String {
    if is_noise(path) {
        return path.to_string();
    }

    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    if trimmed.is_empty() {
        return "/".to_string();
    }

    let mut out = String::with_capacity(trimmed.len());
    for segment in trimmed.split('/') {
        if !out.is_empty() || trimmed.starts_with('/') {
            out.push('/');
        }
        if UUID_SEGMENT.is_match(segment) {
            out.push_str("{uuid}");
        } else if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
            out.push_str("{id}");
        } else {
            out.push_str(segment);
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// Last pure-decimal segment of a concrete path, if any.
pub fn last_numeric_segment(path: &str) -> Option<&str> {
    path.split('/')
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .next_back()
}

/// Last UUID-form segment of a concrete path, if any.
pub fn last_uuid_segment(path: &str) -> Option<&str> {
    path.split('/')
        .filter(|s| UUID_SEGMENT.is_match(s))
        .next_back()
}

/// Substitute `{id}` / `{uuid}` placeholders in a template with the values
/// extracted from `src_path`. Returns `None` when the template needs a
/// placeholder the source path cannot supply.
pub fn concretize(template: &str, src_path: &str) -> Option<String> {
    let mut out = template.to_string();
    if out.contains("{id}") {
        let id = last_numeric_segment(src_path)?;
        out = out.replace("{id}", id);
    }
    if out.contains("{uuid}") {
        let uuid = last_uuid_segment(src_path)?;
        out = out.replace("{uuid}", uuid);
    }
    Some(out)
}

/// How query strings fold into request keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    /// Request key is the path alone.
    #[default]
    Ignore,
    /// Sorted allow-listed query keys are appended.
    Stable,
    /// All query keys, sorted.
    Full,
}

impl std::str::FromStr for QueryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(QueryMode::Ignore),
            "stable" => Ok(QueryMode::Stable),
            "full" => Ok(QueryMode::Full),
            other => Err(format!("unknown query mode: {other}")),
        }
    }
}

/// Build the request key used for markers, inflight locks, and chain steps.
/// The key is stable under query-parameter reordering.
pub fn request_key(path: &str, query: &str, mode: QueryMode, allowlist: &[String]) -> String {
    if query.is_empty() || mode == QueryMode::Ignore {
        return path.to_string();
    }

    let mut pairs: Vec<(&str, &str)> = query
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k, v),
            None => (kv, ""),
        })
        .filter(|(k, _)| match mode {
            QueryMode::Stable => allowlist.iter().any(|a| a == k),
            _ => true,
        })
        .collect();

    if pairs.is_empty() {
        return path.to_string();
    }
    pairs.sort_unstable();

    let qs = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");
    format!("{path}?{qs}")
}

/// A `(service, path-template)` pair, the unit of the transition graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    pub service: String,
    pub template: String,
}

impl Node {
    pub fn new(service: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            template: template.into(),
        }
    }

    /// External-table serialization (`service::template`), as written by the
    /// offline similarity trainer.
    pub fn key(&self) -> String {
        format!("{}::{}", self.service, self.template)
    }

    /// Parse a `service::template` key back into a node.
    pub fn parse(key: &str) -> Option<Self> {
        let (service, template) = key.split_once("::")?;
        if service.is_empty() || template.is_empty() {
            return None;
        }
        Some(Self::new(service, template))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.service, self.template)
    }
}
