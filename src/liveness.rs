// Copyright (C) 2021 RTSP-RT contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timers for session timeout, RTCP SR/RR cadence, and stream dead detection
//! (the "Liveness" component, the timeout/cancellation model).
//!
//! None of these types touch a socket; they're pure bookkeeping consulted by
//! the connection/session tasks that do.

use std::time::{Duration, Instant};

/// Tracks a session's `Session: ...;timeout=` deadline. Reset on
/// any request that references the session (not just keep-alives); expiry is
/// checked by the caller on each request and by a periodic sweep.
#[derive(Debug)]
pub struct SessionTimeoutTracker {
    last_activity: Instant,
    timeout: Duration,
}

impl SessionTimeoutTracker {
    pub fn new(timeout_secs: u32) -> Self {
        Self {
            last_activity: Instant::now(),
            timeout: Duration::from_secs(u64::from(timeout_secs.max(1))),
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.last_activity.elapsed() > self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The recommended keep-alive cadence: `min(timeout, 60s)/2`.
    pub fn keepalive_interval(&self) -> Duration {
        self.timeout.min(Duration::from_secs(60)) / 2
    }
}

#[cfg(test)]
mod timeout_tests {
    use super::*;

    #[test]
    fn fresh_tracker_is_not_expired() {
        let t = SessionTimeoutTracker::new(30);
        assert!(!t.is_expired());
    }

    #[test]
    fn keepalive_interval_halves_capped_timeout() {
        let t = SessionTimeoutTracker::new(120);
        assert_eq!(t.keepalive_interval(), Duration::from_secs(30));
        let t = SessionTimeoutTracker::new(20);
        assert_eq!(t.keepalive_interval(), Duration::from_secs(10));
    }
}

/// Schedules RTCP SR/RR emission per RFC 3550 §6.2's bandwidth-derived
/// interval, recomputed on every tick from the current membership/packet-size
/// estimate and clamped to `[min, max]` (default `[1s, 5s]`).
pub struct RtcpScheduler {
    min: Duration,
    max: Duration,
    next: Instant,
    current_interval: Duration,
}

impl RtcpScheduler {
    pub fn new(min: Duration, max: Duration) -> Self {
        let current_interval = max;
        Self {
            min,
            max,
            next: Instant::now() + current_interval,
            current_interval,
        }
    }

    /// Recomputes the interval from the current session/bandwidth estimate
    /// and arms the next deadline relative to *now* (called right after a
    /// report is sent).
    pub fn rearm(&mut self, members: usize, rtcp_bw_bytes_per_sec: f64, is_sender: bool, avg_packet_size: f64) {
        self.current_interval = crate::rtcp::reporting_interval(
            members,
            rtcp_bw_bytes_per_sec,
            is_sender,
            avg_packet_size,
            self.min,
            self.max,
        );
        self.next = Instant::now() + self.current_interval;
    }

    pub fn is_due(&self) -> bool {
        Instant::now() >= self.next
    }

    pub fn interval(&self) -> Duration {
        self.current_interval
    }

    /// Sleeps until the next scheduled report; suitable for `tokio::select!`.
    pub async fn wait(&self) {
        tokio::time::sleep_until(self.next.into()).await;
    }
}

#[cfg(test)]
mod rtcp_scheduler_tests {
    use super::*;

    #[test]
    fn new_scheduler_starts_at_max_interval() {
        let s = RtcpScheduler::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(s.interval(), Duration::from_secs(5));
    }

    #[test]
    fn rearm_clamps_to_configured_bounds() {
        let mut s = RtcpScheduler::new(Duration::from_secs(1), Duration::from_secs(5));
        s.rearm(1, 1_000_000.0, false, 100.0);
        assert!(s.interval() >= Duration::from_secs(1));
        assert!(s.interval() <= Duration::from_secs(5));
    }
}

/// Flags a media as dead when no packet (RTP or RTCP) has been seen for
/// longer than a threshold. No numeric threshold is fixed by any RFC; this
/// crate defaults it to `4x` the stream's expected RTCP interval with a 10s
/// floor, matching the usual RFC 3550 "five intervals" dead-source heuristic
/// loosely (we use 4 here since our interval is already capped to a
/// conservative 5s max).
pub struct DeadStreamDetector {
    last_seen: Instant,
    threshold: Duration,
}

impl DeadStreamDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            last_seen: Instant::now(),
            threshold: threshold.max(Duration::from_secs(1)),
        }
    }

    pub fn from_rtcp_interval(rtcp_interval: Duration) -> Self {
        Self::new((rtcp_interval * 4).max(Duration::from_secs(10)))
    }

    pub fn mark_alive(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_dead(&self) -> bool {
        self.last_seen.elapsed() > self.threshold
    }
}


/// A single cooperative cancellation signal shared by every task spawned for
/// one connection (the "Cancellation": "all tasks observe a single
/// cancel signal per connection"). Cloning shares the same underlying flag.
#[derive(Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<tokio::sync::Notify>,
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            tx: std::sync::Arc::new(tokio::sync::Notify::new()),
            cancelled: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
        self.tx.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Resolves once [Self::cancel] has been called (from any clone).
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.tx.notified().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod cancel_tests {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        assert!(!token.is_cancelled());
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_resolves_immediately() {
        let token = CancelToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("should resolve immediately");
    }
}
