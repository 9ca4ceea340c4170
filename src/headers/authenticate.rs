// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `WWW-Authenticate:` (challenge) and `Authorization:` (response) headers
//!. The actual digest computation lives in [crate::auth]; this
//! module only handles the header grammar: `Scheme param=value, ...` with
//! comma-separated, possibly-quoted parameters.

use std::collections::BTreeMap;

/// A parsed challenge or credentials header: a scheme name plus its
/// comma-separated `key=value` parameters (quotes stripped).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WwwAuthenticate {
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

pub type Authenticate = WwwAuthenticate;

impl WwwAuthenticate {
    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        let (scheme, rest) = value
            .split_once(' ')
            .ok_or_else(|| format!("Authenticate header missing params: {:?}", value))?;
        let mut params = BTreeMap::new();
        for part in split_comma_respecting_quotes(rest) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (k, v) = part
                .split_once('=')
                .ok_or_else(|| format!("malformed auth parameter {:?}", part))?;
            params.insert(k.trim().to_string(), v.trim().trim_matches('"').to_string());
        }
        Ok(Self {
            scheme: scheme.to_string(),
            params,
        })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn is_digest(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("digest")
    }

    pub fn is_basic(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("basic")
    }

    /// Renders as an `Authorization:`-header value: `Scheme k="v", ...`.
    pub fn write(&self) -> String {
        let mut s = self.scheme.clone();
        s.push(' ');
        let parts: Vec<String> = self
            .params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v))
            .collect();
        s.push_str(&parts.join(", "));
        s
    }
}

/// Splits `s` on top-level commas, ignoring commas inside double quotes
/// (digest `domain=` lists and similar can embed commas).
fn split_comma_respecting_quotes(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_challenge() {
        let h = WwwAuthenticate::parse(r#"Digest realm="realm", nonce="abc", qop="auth""#).unwrap();
        assert!(h.is_digest());
        assert_eq!(h.param("realm"), Some("realm"));
        assert_eq!(h.param("nonce"), Some("abc"));
        assert_eq!(h.param("qop"), Some("auth"));
    }

    #[test]
    fn parses_basic_challenge() {
        let h = WwwAuthenticate::parse(r#"Basic realm="realm""#).unwrap();
        assert!(h.is_basic());
    }

    #[test]
    fn rejects_missing_params() {
        assert!(WwwAuthenticate::parse("Digest").is_err());
    }

    #[test]
    fn write_is_reparseable() {
        let h = WwwAuthenticate::parse(r#"Digest realm="r", nonce="n""#).unwrap();
        let reparsed = WwwAuthenticate::parse(&h.write()).unwrap();
        assert_eq!(h, reparsed);
    }
}
