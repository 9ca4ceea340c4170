// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Basic and Digest authentication, client and
//! server sides. Digest supports `MD5` and `SHA-256`, with `qop=auth`
//! including `nc`/`cnonce` tracking to reject replayed requests.

use std::collections::HashMap;
use std::sync::Mutex;

use md5::Digest as _;
use sha2::Digest as _;

use crate::headers::WwwAuthenticate;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn parse(s: Option<&str>) -> Self {
        match s.map(str::to_ascii_uppercase).as_deref() {
            Some("SHA-256") => DigestAlgorithm::Sha256,
            _ => DigestAlgorithm::Md5,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }

    fn hex_digest(self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => {
                let mut h = md5::Md5::new();
                h.update(data.as_bytes());
                hex::encode(h.finalize())
            }
            DigestAlgorithm::Sha256 => {
                let mut h = sha2::Sha256::new();
                h.update(data.as_bytes());
                hex::encode(h.finalize())
            }
        }
    }
}

/// Credentials supplied by the application for client operations that
/// require authentication.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Builds an `Authorization:` header value in response to a cached
/// challenge, for the client side of a 401-challenge/retry exchange.
pub struct DigestClient {
    algorithm: DigestAlgorithm,
    realm: String,
    nonce: String,
    opaque: Option<String>,
    qop: Option<String>,
    nonce_count: u32,
}

impl DigestClient {
    pub fn from_challenge(challenge: &WwwAuthenticate) -> Result<Self, String> {
        if !challenge.is_digest() {
            return Err(format!("not a Digest challenge: {}", challenge.scheme));
        }
        let realm = challenge
            .param("realm")
            .ok_or("Digest challenge missing realm")?
            .to_string();
        let nonce = challenge
            .param("nonce")
            .ok_or("Digest challenge missing nonce")?
            .to_string();
        Ok(Self {
            algorithm: DigestAlgorithm::parse(challenge.param("algorithm")),
            realm,
            nonce,
            opaque: challenge.param("opaque").map(str::to_string),
            qop: challenge.param("qop").map(str::to_string),
            nonce_count: 0,
        })
    }

    /// Computes the `Authorization:` value for one request, per RFC 2617/7616.
    pub fn authorize(
        &mut self,
        creds: &Credentials,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = self
            .algorithm
            .hex_digest(&format!("{}:{}:{}", creds.username, self.realm, creds.password));
        let ha2 = self.algorithm.hex_digest(&format!("{}:{}", method, uri));
        self.nonce_count += 1;
        let nc = format!("{:08x}", self.nonce_count);

        let (response, qop_field) = if let Some(qop) = &self.qop {
            let response = self.algorithm.hex_digest(&format!(
                "{}:{}:{}:{}:{}:{}",
                ha1, self.nonce, nc, cnonce, qop, ha2
            ));
            (response, Some(qop.clone()))
        } else {
            (
                self.algorithm.hex_digest(&format!("{}:{}:{}", ha1, self.nonce, ha2)),
                None,
            )
        };

        let mut s = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}", algorithm={}"#,
            creds.username,
            self.realm,
            self.nonce,
            uri,
            response,
            self.algorithm.name(),
        );
        if let Some(qop) = qop_field {
            s.push_str(&format!(r#", qop={}, nc={}, cnonce="{}""#, qop, nc, cnonce));
        }
        if let Some(opaque) = &self.opaque {
            s.push_str(&format!(r#", opaque="{}""#, opaque));
        }
        s
    }
}

/// Renders a plain `Authorization: Basic ...` header value (RFC 2617 §2).
pub fn basic_authorize(creds: &Credentials) -> String {
    let raw = format!("{}:{}", creds.username, creds.password);
    format!("Basic {}", base64::encode(raw))
}

/// Server-side digest challenge/verification state: issues a challenge on
/// any request lacking `Authorization`, caches the nonce per connection, and
/// tracks `nc` to reject replayed requests.
pub struct DigestServer {
    realm: String,
    algorithm: DigestAlgorithm,
    /// nonce -> highest `nc` value seen so far, for replay rejection.
    nonces: Mutex<HashMap<String, u64>>,
}

impl DigestServer {
    pub fn new(realm: impl Into<String>, algorithm: DigestAlgorithm) -> Self {
        Self {
            realm: realm.into(),
            algorithm,
            nonces: Mutex::new(HashMap::new()),
        }
    }

    /// Issues a fresh challenge and remembers its nonce.
    pub fn challenge(&self) -> WwwAuthenticate {
        let nonce = fresh_nonce();
        self.nonces.lock().unwrap().insert(nonce.clone(), 0);
        let mut params = std::collections::BTreeMap::new();
        params.insert("realm".to_string(), self.realm.clone());
        params.insert("nonce".to_string(), nonce);
        params.insert("qop".to_string(), "auth".to_string());
        params.insert("algorithm".to_string(), self.algorithm.name().to_string());
        WwwAuthenticate {
            scheme: "Digest".to_string(),
            params,
        }
    }

    /// Validates an `Authorization:` header against a known password,
    /// rejecting stale/replayed nonce-counts.
    pub fn verify(
        &self,
        auth: &WwwAuthenticate,
        method: &str,
        password: &str,
    ) -> Result<(), String> {
        if !auth.is_digest() {
            return Err("expected Digest credentials".into());
        }
        let username = auth.param("username").ok_or("missing username")?;
        let realm = auth.param("realm").ok_or("missing realm")?;
        let nonce = auth.param("nonce").ok_or("missing nonce")?;
        let uri = auth.param("uri").ok_or("missing uri")?;
        let response = auth.param("response").ok_or("missing response")?;
        let qop = auth.param("qop");
        let nc = auth.param("nc");
        let cnonce = auth.param("cnonce");

        {
            let mut nonces = self.nonces.lock().unwrap();
            let last_nc = nonces.get(nonce).copied().ok_or("unknown or expired nonce")?;
            if let Some(nc) = nc {
                let nc_val = u64::from_str_radix(nc, 16).map_err(|_| "bad nc")?;
                if nc_val <= last_nc {
                    return Err("replayed nonce count".into());
                }
                nonces.insert(nonce.to_string(), nc_val);
            }
        }

        let ha1 = self
            .algorithm
            .hex_digest(&format!("{}:{}:{}", username, realm, password));
        let ha2 = self.algorithm.hex_digest(&format!("{}:{}", method, uri));
        let expected = match (qop, nc, cnonce) {
            (Some(qop), Some(nc), Some(cnonce)) => self
                .algorithm
                .hex_digest(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2)),
            _ => self.algorithm.hex_digest(&format!("{}:{}:{}", ha1, nonce, ha2)),
        };
        if expected != response {
            return Err("digest response mismatch".into());
        }
        Ok(())
    }
}

pub fn fresh_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_digest_round_trips_client_and_server() {
        let server = DigestServer::new("testrealm", DigestAlgorithm::Md5);
        let challenge = server.challenge();

        let creds = Credentials {
            username: "alice".into(),
            password: "secret".into(),
        };
        let mut client = DigestClient::from_challenge(&challenge).unwrap();
        let auth_value = client.authorize(&creds, "DESCRIBE", "rtsp://h/s", "cnonce123");

        let parsed = WwwAuthenticate::parse(&auth_value).unwrap();
        server.verify(&parsed, "DESCRIBE", "secret").unwrap();
    }

    #[test]
    fn sha256_digest_round_trips() {
        let server = DigestServer::new("testrealm", DigestAlgorithm::Sha256);
        let challenge = server.challenge();
        let creds = Credentials {
            username: "bob".into(),
            password: "hunter2".into(),
        };
        let mut client = DigestClient::from_challenge(&challenge).unwrap();
        let auth_value = client.authorize(&creds, "SETUP", "rtsp://h/s/trackID=0", "cn");
        let parsed = WwwAuthenticate::parse(&auth_value).unwrap();
        server.verify(&parsed, "SETUP", "hunter2").unwrap();
    }

    #[test]
    fn wrong_password_is_rejected() {
        let server = DigestServer::new("r", DigestAlgorithm::Md5);
        let challenge = server.challenge();
        let creds = Credentials {
            username: "alice".into(),
            password: "secret".into(),
        };
        let mut client = DigestClient::from_challenge(&challenge).unwrap();
        let auth_value = client.authorize(&creds, "DESCRIBE", "rtsp://h/s", "cn");
        let parsed = WwwAuthenticate::parse(&auth_value).unwrap();
        assert!(server.verify(&parsed, "DESCRIBE", "wrong").is_err());
    }

    #[test]
    fn replayed_nonce_count_is_rejected() {
        let server = DigestServer::new("r", DigestAlgorithm::Md5);
        let challenge = server.challenge();
        let creds = Credentials {
            username: "alice".into(),
            password: "secret".into(),
        };
        let mut client = DigestClient::from_challenge(&challenge).unwrap();
        let auth_value = client.authorize(&creds, "DESCRIBE", "rtsp://h/s", "cn");
        let parsed = WwwAuthenticate::parse(&auth_value).unwrap();
        server.verify(&parsed, "DESCRIBE", "secret").unwrap();
        // Replaying the exact same nc=00000001 must fail.
        assert!(server.verify(&parsed, "DESCRIBE", "secret").is_err());
    }

    #[test]
    fn basic_auth_header_is_base64_user_colon_pass() {
        let creds = Credentials {
            username: "alice".into(),
            password: "secret".into(),
        };
        let header = basic_authorize(&creds);
        assert!(header.starts_with("Basic "));
    }
}
