// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A session that goes quiet past its negotiated timeout is swept out of
//! the registry by the server's periodic expiry sweep; any later request
//! against that session id gets 454 Session Not Found, distinct from the
//! short-lived `TEARDOWN` linger covered by the dispatch unit tests.

mod common;

use std::time::Duration;

use url::Url;

use rtsp_rt::client::{Session, SessionOptions, TransportPreference};
use rtsp_rt::headers::transport::Mode;
use rtsp_rt::server::ServerOptions;

#[tokio::test]
async fn an_idle_session_past_its_timeout_is_rejected_with_454() {
    let (addr, server) = common::spawn_server(
        common::NoDescribeHandler,
        ServerOptions {
            session_timeout_secs: 1,
            ..ServerOptions::default()
        },
    )
    .await;
    let base_url = Url::parse(&format!("rtsp://{}/cam/", addr)).unwrap();
    server.publish("/cam", common::h264_sdp(), base_url).unwrap();

    let mut session = Session::start(
        "rtsp",
        &addr.ip().to_string(),
        addr.port(),
        SessionOptions::default().transport(TransportPreference::Udp),
    )
    .await
    .unwrap();

    let url = Url::parse(&format!("rtsp://{}/cam", addr)).unwrap();
    session.describe(&url).await.unwrap();
    session.setup(0, Mode::Play).await.unwrap();

    // Outlast both the 1s session timeout and the server's 5s periodic
    // sweep that actually removes expired sessions from the registry.
    tokio::time::sleep(Duration::from_secs(7)).await;

    let err = session.play(None).await.expect_err("session should have expired");
    assert!(
        format!("{}", err).contains("454"),
        "expected a 454 Session Not Found failure, got: {}",
        err
    );
}
