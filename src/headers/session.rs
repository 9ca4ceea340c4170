// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `Session:` header: `session-id[;timeout=delta-seconds]` (RFC 2326 §12.37).

/// Default session timeout in seconds, per the configured default timeout.
pub const DEFAULT_TIMEOUT_SECS: u32 = 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: String,
    pub timeout: Option<u32>,
}

impl SessionHeader {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: u32) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let value = value.trim();
        if value.is_empty() {
            return Err("empty Session header".into());
        }
        match value.find(';') {
            None => Ok(Self {
                id: value.to_string(),
                timeout: None,
            }),
            Some(i) => {
                let (id, rest) = (&value[..i], &value[i + 1..]);
                if id.is_empty() {
                    return Err("empty session id".into());
                }
                let rest = rest.trim();
                let timeout = rest.strip_prefix("timeout=").ok_or_else(|| {
                    format!("unrecognized Session header parameter {:?}", rest)
                })?;
                let timeout: u32 = timeout
                    .trim()
                    .parse()
                    .map_err(|_| format!("bad timeout value {:?}", timeout))?;
                Ok(Self {
                    id: id.to_string(),
                    timeout: Some(timeout),
                })
            }
        }
    }

    pub fn write(&self) -> String {
        match self.timeout {
            Some(t) => format!("{};timeout={}", self.id, t),
            None => self.id.clone(),
        }
    }

    pub fn effective_timeout(&self) -> u32 {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }
}

/// Generates a fresh, opaque session identifier: 128 bits of randomness,
/// base-64 encoded.
pub fn generate_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_id_only() {
        let h = SessionHeader::parse("abc123").unwrap();
        assert_eq!(h.id, "abc123");
        assert_eq!(h.timeout, None);
        assert_eq!(h.effective_timeout(), DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn parses_id_with_timeout() {
        let h = SessionHeader::parse("xyz;timeout=30").unwrap();
        assert_eq!(h.id, "xyz");
        assert_eq!(h.timeout, Some(30));
    }

    #[test]
    fn write_round_trips() {
        let h = SessionHeader::new("abc").with_timeout(60);
        assert_eq!(SessionHeader::parse(&h.write()).unwrap(), h);
    }

    #[test]
    fn rejects_empty() {
        assert!(SessionHeader::parse("").is_err());
    }

    #[test]
    fn generated_ids_are_nonempty_and_differ() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert!(!a.is_empty());
        assert_ne!(a, b);
    }
}
