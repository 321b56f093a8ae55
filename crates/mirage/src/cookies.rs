//! Persisted cookie jar loading.
//!
//! Two formats are accepted: a Netscape `cookies.txt` jar, or a JSON array
//! of cookie objects as exported by browser automation tools
//! (`name`, `value`, `domain`, `path`, `secure`, `httpOnly`, `expires`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// A cookie applied to the shared browsing context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    /// Unix seconds; `None` for session cookies.
    pub expires: Option<i64>,
}

/// Cookie object in the JSON export format.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportedCookie {
    name: String,
    value: String,
    domain: String,
    #[serde(default = "root_path")]
    path: String,
    #[serde(default)]
    secure: bool,
    #[serde(default, alias = "http_only")]
    http_only: bool,
    /// Unix seconds, `-1` for session cookies.
    #[serde(default)]
    expires: Option<f64>,
}

fn root_path() -> String {
    "/".to_string()
}

impl From<ExportedCookie> for Cookie {
    fn from(c: ExportedCookie) -> Self {
        Cookie {
            expires: c.expires.filter(|ts| *ts > 0.0).map(|ts| ts as i64),
            name: c.name,
            value: c.value,
            domain: c.domain,
            path: c.path,
            secure: c.secure,
            http_only: c.http_only,
        }
    }
}

/// Load a cookie jar from disk, in either supported format.
pub fn load_cookie_file(path: &Path) -> Result<Vec<Cookie>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read cookie jar: {}", path.display()))?;
    let cookies = if raw.trim_start().starts_with('[') {
        parse_cookie_json(&raw)
            .with_context(|| format!("invalid JSON cookie file: {}", path.display()))?
    } else {
        parse_cookie_jar(&raw)
    };
    tracing::debug!("loaded {} cookies from {}", cookies.len(), path.display());
    Ok(cookies)
}

/// Parse Netscape cookie jar text. Malformed lines are skipped.
pub fn parse_cookie_jar(raw: &str) -> Vec<Cookie> {
    raw.lines().filter_map(parse_line).collect()
}

/// Parse a JSON array of exported cookies.
pub fn parse_cookie_json(raw: &str) -> Result<Vec<Cookie>> {
    let exported: Vec<ExportedCookie> = serde_json::from_str(raw)?;
    Ok(exported.into_iter().map(Cookie::from).collect())
}

fn parse_line(line: &str) -> Option<Cookie> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (line, http_only) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
        Some(rest) => (rest, true),
        None => (line, false),
    };
    if line.trim().is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 7 {
        tracing::debug!("skipping malformed cookie line with {} fields", fields.len());
        return None;
    }

    let expires = match fields[4].parse::<i64>() {
        Ok(0) | Err(_) => None,
        Ok(ts) => Some(ts),
    };

    Some(Cookie {
        domain: fields[0].to_string(),
        path: fields[2].to_string(),
        secure: fields[3].eq_ignore_ascii_case("TRUE"),
        expires,
        name: fields[5].to_string(),
        value: fields[6].to_string(),
        http_only,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const JAR: &str = "# Netscape HTTP Cookie File\n\
        \n\
        .instagram.com\tTRUE\t/\tTRUE\t1900000000\tcsrftoken\tabc123\n\
        #HttpOnly_.instagram.com\tTRUE\t/\tTRUE\t0\tsessionid\txyz\n\
        broken line without tabs\n";

    #[test]
    fn test_parse_cookie_jar() {
        let cookies = parse_cookie_jar(JAR);
        assert_eq!(cookies.len(), 2);

        assert_eq!(cookies[0].name, "csrftoken");
        assert_eq!(cookies[0].domain, ".instagram.com");
        assert_eq!(cookies[0].expires, Some(1_900_000_000));
        assert!(cookies[0].secure);
        assert!(!cookies[0].http_only);

        assert_eq!(cookies[1].name, "sessionid");
        assert!(cookies[1].http_only);
        assert_eq!(cookies[1].expires, None);
    }

    #[test]
    fn test_load_cookie_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(JAR.as_bytes()).unwrap();
        let cookies = load_cookie_file(file.path()).unwrap();
        assert_eq!(cookies.len(), 2);
    }

    #[test]
    fn test_load_json_cookie_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[
                {"name": "sessionid", "value": "xyz", "domain": ".instagram.com",
                 "path": "/", "secure": true, "httpOnly": true, "expires": -1},
                {"name": "csrftoken", "value": "abc", "domain": ".instagram.com",
                 "expires": 1900000000.5}
            ]"#,
        )
        .unwrap();

        let cookies = load_cookie_file(file.path()).unwrap();
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].http_only);
        assert_eq!(cookies[0].expires, None);
        assert_eq!(cookies[1].path, "/");
        assert!(!cookies[1].secure);
        assert_eq!(cookies[1].expires, Some(1_900_000_000));
    }

    #[test]
    fn test_malformed_json_cookie_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"[{"name": "missing value"}]"#).unwrap();
        assert!(load_cookie_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(load_cookie_file(Path::new("/nonexistent/cookies.txt")).is_err());
    }
}
