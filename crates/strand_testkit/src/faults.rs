//! Fault injection for transports and token providers.
//!
//! A [`FaultPlan`] holds counters of failures still to inject. Each counter
//! is consumed by the next matching call, so a test can say "fail the next
//! three uploads" and then assert the session recovered.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strand_protocol::{AccessToken, Changeset, Version};
use strand_session::{ChangesetStream, ChangesetTransport, TransportError, TransportResult};
use tracing::debug;

/// Failures to inject, shared between a test and the wrapped collaborators.
#[derive(Debug, Default)]
pub struct FaultPlan {
    connect_failures: AtomicU32,
    connect_rejections: AtomicU32,
    send_failures: AtomicU32,
    send_rejections: AtomicU32,
    watermark_failures: AtomicU32,
    watermark_rejections: AtomicU32,
    token_failures: AtomicU32,
    send_delay_ms: AtomicU64,
    injected: AtomicU32,
    sends_started: AtomicU32,
}

impl FaultPlan {
    /// Creates a plan that injects nothing.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `n` connects with a network error.
    pub fn fail_connects(&self, n: u32) {
        self.connect_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Rejects the token on the next `n` connects.
    pub fn reject_connects(&self, n: u32) {
        self.connect_rejections.fetch_add(n, Ordering::SeqCst);
    }

    /// Fails the next `n` uploads with a network error.
    pub fn fail_sends(&self, n: u32) {
        self.send_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Rejects the token on the next `n` uploads.
    pub fn reject_sends(&self, n: u32) {
        self.send_rejections.fetch_add(n, Ordering::SeqCst);
    }

    /// Fails the next `n` high-water mark queries with a network error.
    pub fn fail_watermarks(&self, n: u32) {
        self.watermark_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Rejects the token on the next `n` high-water mark queries.
    pub fn reject_watermarks(&self, n: u32) {
        self.watermark_rejections.fetch_add(n, Ordering::SeqCst);
    }

    /// Fails the next `n` token requests with a network error.
    pub fn fail_tokens(&self, n: u32) {
        self.token_failures.fetch_add(n, Ordering::SeqCst);
    }

    /// Delays every upload by `delay`.
    pub fn delay_sends(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.send_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Cancels every failure not yet injected and removes the send delay.
    pub fn clear(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::SeqCst);
        }
        self.send_delay_ms.store(0, Ordering::SeqCst);
    }

    /// Returns the number of failures injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    /// Returns the number of uploads the transport has started, including
    /// ones still delayed or failed.
    pub fn sends_started(&self) -> u32 {
        self.sends_started.load(Ordering::SeqCst)
    }

    /// Returns true if every planned failure has been injected.
    pub fn exhausted(&self) -> bool {
        self.counters()
            .iter()
            .all(|counter| counter.load(Ordering::SeqCst) == 0)
    }

    fn counters(&self) -> [&AtomicU32; 7] {
        [
            &self.connect_failures,
            &self.connect_rejections,
            &self.send_failures,
            &self.send_rejections,
            &self.watermark_failures,
            &self.watermark_rejections,
            &self.token_failures,
        ]
    }

    pub(crate) fn take_token_failure(&self) -> bool {
        self.take(&self.token_failures)
    }

    fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms.load(Ordering::SeqCst))
    }

    fn take(&self, counter: &AtomicU32) -> bool {
        let taken = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        taken
    }
}

/// Wraps a transport and injects the failures of a [`FaultPlan`].
pub struct FlakyTransport {
    inner: Arc<dyn ChangesetTransport>,
    plan: Arc<FaultPlan>,
}

impl FlakyTransport {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn ChangesetTransport>, plan: Arc<FaultPlan>) -> Self {
        Self { inner, plan }
    }
}

#[async_trait]
impl ChangesetTransport for FlakyTransport {
    async fn connect(&self, token: &AccessToken) -> TransportResult<()> {
        if self.plan.take(&self.plan.connect_failures) {
            debug!("injecting connect failure");
            return Err(TransportError::Network("injected connect failure".into()));
        }
        if self.plan.take(&self.plan.connect_rejections) {
            debug!("injecting token rejection on connect");
            return Err(TransportError::TokenRejected("injected rejection".into()));
        }
        self.inner.connect(token).await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    async fn send(&self, changeset: &Changeset) -> TransportResult<()> {
        self.plan.sends_started.fetch_add(1, Ordering::SeqCst);
        let delay = self.plan.send_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.plan.take(&self.plan.send_failures) {
            debug!(version = %changeset.local_version, "injecting send failure");
            return Err(TransportError::Network("injected send failure".into()));
        }
        if self.plan.take(&self.plan.send_rejections) {
            debug!(version = %changeset.local_version, "injecting token rejection on send");
            return Err(TransportError::TokenRejected("injected rejection".into()));
        }
        self.inner.send(changeset).await
    }

    fn receive(&self, after: Version) -> ChangesetStream {
        self.inner.receive(after)
    }

    async fn server_high_water_mark(&self) -> TransportResult<Version> {
        if self.plan.take(&self.plan.watermark_failures) {
            debug!("injecting high-water mark failure");
            return Err(TransportError::Network("injected high-water mark failure".into()));
        }
        if self.plan.take(&self.plan.watermark_rejections) {
            debug!("injecting token rejection on high-water mark");
            return Err(TransportError::TokenRejected("injected rejection".into()));
        }
        self.inner.server_high_water_mark().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_consumed_once() {
        let plan = FaultPlan::new();
        plan.fail_sends(2);
        assert!(!plan.exhausted());

        assert!(plan.take(&plan.send_failures));
        assert!(plan.take(&plan.send_failures));
        assert!(!plan.take(&plan.send_failures));

        assert_eq!(plan.injected(), 2);
        assert!(plan.exhausted());
    }

    #[test]
    fn token_failures_are_tracked() {
        let plan = FaultPlan::new();
        plan.fail_tokens(1);
        assert!(plan.take_token_failure());
        assert!(!plan.take_token_failure());
        assert_eq!(plan.injected(), 1);
    }

    #[test]
    fn clear_drops_pending_failures() {
        let plan = FaultPlan::new();
        plan.fail_connects(5);
        plan.delay_sends(Duration::from_secs(1));
        plan.clear();

        assert!(plan.exhausted());
        assert_eq!(plan.send_delay(), Duration::ZERO);
        assert_eq!(plan.injected(), 0);
    }

    #[test]
    fn watermark_rejections_count_toward_exhaustion() {
        let plan = FaultPlan::new();
        plan.reject_watermarks(1);
        assert!(!plan.exhausted());

        assert!(plan.take(&plan.watermark_rejections));
        assert!(plan.exhausted());
        assert_eq!(plan.injected(), 1);
    }
}
