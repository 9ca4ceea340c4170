// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A request without credentials draws a Digest challenge; the client
//! retries with an `Authorization:` header computed from it, and the
//! server accepts.

use rtsp_rt::auth::{basic_authorize, Credentials, DigestAlgorithm, DigestClient, DigestServer};
use rtsp_rt::headers::WwwAuthenticate;

#[test]
fn describe_is_retried_with_digest_credentials_after_a_401_challenge() {
    let server = DigestServer::new("streaming-realm", DigestAlgorithm::Md5);
    let creds = Credentials {
        username: "alice".to_string(),
        password: "hunter2".to_string(),
    };

    // First DESCRIBE has no Authorization header; the server issues a challenge.
    let challenge = server.challenge();
    assert_eq!(challenge.scheme, "Digest");
    assert!(challenge.param("qop").is_some());

    // Client re-sends DESCRIBE with an Authorization computed from the challenge.
    let mut client = DigestClient::from_challenge(&challenge).unwrap();
    let header_value = client.authorize(&creds, "DESCRIBE", "rtsp://cam.example/s", "clientnonce");

    // The header round-trips through the wire grammar exactly as a real
    // Authorization: header would be parsed off the socket.
    let parsed = WwwAuthenticate::parse(&header_value).unwrap();
    assert!(parsed.is_digest());
    server
        .verify(&parsed, "DESCRIBE", "hunter2")
        .expect("server should accept the client's response");
}

#[test]
fn second_request_with_incremented_nc_is_accepted_but_stale_nc_is_replay_rejected() {
    let server = DigestServer::new("streaming-realm", DigestAlgorithm::Sha256);
    let creds = Credentials {
        username: "alice".to_string(),
        password: "hunter2".to_string(),
    };
    let challenge = server.challenge();
    let mut client = DigestClient::from_challenge(&challenge).unwrap();

    let describe_auth = client.authorize(&creds, "DESCRIBE", "rtsp://cam.example/s", "cn1");
    let parsed = WwwAuthenticate::parse(&describe_auth).unwrap();
    server.verify(&parsed, "DESCRIBE", "hunter2").unwrap();

    // The SETUP that follows reuses the same nonce with nc=2; that's fine.
    let setup_auth = client.authorize(&creds, "SETUP", "rtsp://cam.example/s/trackID=0", "cn2");
    let parsed_setup = WwwAuthenticate::parse(&setup_auth).unwrap();
    server.verify(&parsed_setup, "SETUP", "hunter2").unwrap();

    // Replaying the first (now-stale) nc=1 request must be rejected.
    assert!(server.verify(&parsed, "DESCRIBE", "hunter2").is_err());
}

#[test]
fn basic_auth_header_carries_base64_user_colon_pass() {
    let creds = Credentials {
        username: "alice".to_string(),
        password: "hunter2".to_string(),
    };
    let header = basic_authorize(&creds);
    assert!(header.starts_with("Basic "));
    let encoded = header.strip_prefix("Basic ").unwrap();
    let decoded = base64::decode(encoded).unwrap();
    assert_eq!(decoded, b"alice:hunter2");
}
