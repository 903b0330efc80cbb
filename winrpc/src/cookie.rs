//! Path-scoped cookie jar (§4.11), shared by the client (attaches cookies to
//! outgoing requests, parses `Set-Cookie` from responses) and the server
//! (`ServerResponse::cookie` accumulates outgoing `Set-Cookie` entries).

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

#[derive(Debug, Clone, Default)]
pub struct CookieAttrs {
    pub path: Option<String>,
    pub expires: Option<u64>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

#[derive(Debug, Clone)]
pub struct CookieEntry {
    pub value: String,
    pub attrs: CookieAttrs,
}

fn path_matches(entry_path: &str, request_path: &str) -> bool {
    request_path == entry_path || request_path.starts_with(&format!("{entry_path}/"))
}

/// Serializes one cookie into a `Set-Cookie` header value.
fn to_set_cookie_string(name: &str, entry: &CookieEntry) -> String {
    let mut parts = vec![format!("{name}={}", entry.value)];
    if let Some(path) = &entry.attrs.path {
        parts.push(format!("Path={path}"));
    }
    if let Some(expires) = entry.attrs.expires {
        parts.push(format!("Expires={expires}"));
    }
    if let Some(max_age) = entry.attrs.max_age {
        parts.push(format!("Max-Age={max_age}"));
    }
    if entry.attrs.secure {
        parts.push("Secure".to_string());
    }
    if entry.attrs.http_only {
        parts.push("HttpOnly".to_string());
    }
    if let Some(same_site) = entry.attrs.same_site {
        let value = match same_site {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        };
        parts.push(format!("SameSite={value}"));
    }
    parts.join("; ")
}

/// Parses a single `Set-Cookie` header value into `(name, entry)`. Only the
/// subset of attributes this protocol cares about is recognized; unknown
/// attributes are ignored rather than rejected.
pub fn parse_set_cookie(header: &str) -> Option<(String, CookieEntry)> {
    let mut segments = header.split(';').map(str::trim);
    let (name, value) = segments.next()?.split_once('=')?;
    let mut attrs = CookieAttrs::default();
    for segment in segments {
        let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
        match key.to_ascii_lowercase().as_str() {
            "path" => attrs.path = Some(value.to_string()),
            "max-age" => attrs.max_age = value.parse().ok(),
            "secure" => attrs.secure = true,
            "httponly" => attrs.http_only = true,
            "samesite" => {
                attrs.same_site = match value.to_ascii_lowercase().as_str() {
                    "strict" => Some(SameSite::Strict),
                    "lax" => Some(SameSite::Lax),
                    "none" => Some(SameSite::None),
                    _ => None,
                }
            }
            _ => {}
        }
    }
    Some((name.to_string(), CookieEntry { value: value.to_string(), attrs }))
}

/// A mutable, path-scoped cookie store. One jar per client endpoint.
#[derive(Default)]
pub struct CookieJar {
    entries: Mutex<HashMap<String, CookieEntry>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>, attrs: CookieAttrs) {
        self.entries.lock().insert(name.into(), CookieEntry { value: value.into(), attrs });
    }

    pub fn get_cookie(&self, name: &str) -> Option<String> {
        self.entries.lock().get(name).map(|entry| entry.value.clone())
    }

    /// Every cookie whose path is an ancestor of `for_path` (or has no path
    /// restriction at all).
    pub fn get_cookies(&self, for_path: Option<&str>) -> HashMap<String, String> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, entry)| match (&entry.attrs.path, for_path) {
                (Some(entry_path), Some(request_path)) => path_matches(entry_path, request_path),
                _ => true,
            })
            .map(|(name, entry)| (name.clone(), entry.value.clone()))
            .collect()
    }

    pub fn remove_cookie(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    pub fn clear_cookies(&self) {
        self.entries.lock().clear();
    }

    /// Absorbs `Set-Cookie` header values from a response.
    pub fn absorb(&self, set_cookie: &serde_json::Value) {
        let values: Vec<String> = match set_cookie {
            serde_json::Value::String(s) => vec![s.clone()],
            serde_json::Value::Array(items) => {
                items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
            }
            _ => return,
        };
        for raw in values {
            if let Some((name, entry)) = parse_set_cookie(&raw) {
                self.entries.lock().insert(name, entry);
            }
        }
    }

    /// Cookies to attach to an outgoing request for `path`, with
    /// user-supplied cookies winning per-key over jar entries.
    pub fn merge_for_request(
        &self,
        path: &str,
        user_supplied: Option<&HashMap<String, String>>,
    ) -> HashMap<String, String> {
        let mut merged = self.get_cookies(Some(path));
        if let Some(user_supplied) = user_supplied {
            for (key, value) in user_supplied {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

pub fn format_set_cookie_header(name: &str, entry: &CookieEntry) -> String {
    to_set_cookie_string(name, entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_scoping_only_returns_ancestors() {
        let jar = CookieJar::new();
        jar.set_cookie("a", "1", CookieAttrs { path: Some("/api".into()), ..Default::default() });
        jar.set_cookie("b", "2", CookieAttrs::default());

        let for_api_users = jar.get_cookies(Some("/api/users"));
        assert_eq!(for_api_users.get("a"), Some(&"1".to_string()));
        assert_eq!(for_api_users.get("b"), Some(&"2".to_string()));

        let for_other = jar.get_cookies(Some("/other"));
        assert_eq!(for_other.get("a"), None);
    }

    #[test]
    fn user_supplied_cookie_wins_over_jar() {
        let jar = CookieJar::new();
        jar.set_cookie("session", "jar-value", CookieAttrs::default());
        let mut user_supplied = HashMap::new();
        user_supplied.insert("session".to_string(), "user-value".to_string());
        let merged = jar.merge_for_request("/x", Some(&user_supplied));
        assert_eq!(merged.get("session"), Some(&"user-value".to_string()));
    }

    #[test]
    fn parses_set_cookie_attributes() {
        let (name, entry) = parse_set_cookie("session=abc123; Path=/api; Secure; HttpOnly; SameSite=Lax").unwrap();
        assert_eq!(name, "session");
        assert_eq!(entry.value, "abc123");
        assert_eq!(entry.attrs.path.as_deref(), Some("/api"));
        assert!(entry.attrs.secure);
        assert!(entry.attrs.http_only);
        assert_eq!(entry.attrs.same_site, Some(SameSite::Lax));
    }

    #[test]
    fn round_trips_through_set_cookie_string() {
        let attrs = CookieAttrs {
            path: Some("/a".into()),
            max_age: Some(60),
            secure: true,
            http_only: true,
            same_site: Some(SameSite::Strict),
            ..Default::default()
        };
        let entry = CookieEntry { value: "v".into(), attrs };
        let header = format_set_cookie_header("n", &entry);
        let (name, parsed) = parse_set_cookie(&header).unwrap();
        assert_eq!(name, "n");
        assert_eq!(parsed.value, "v");
        assert_eq!(parsed.attrs.max_age, Some(60));
    }
}
