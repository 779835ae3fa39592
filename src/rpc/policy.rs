//! Retry and heartbeat policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{ClientError, FailureKind};

/// How a client retries and monitors its link.
///
/// Everything is fixed at construction except the heartbeat toggles, which
/// may be flipped at runtime without touching the configured intervals.
/// Turning a toggle on has no effect while its interval is zero.
#[derive(Debug)]
pub struct ClientPolicy {
    retry_timeout: Duration,
    retry_number: u32,
    incoming_heartbeat: Duration,
    outgoing_heartbeat: Duration,
    retryable: Vec<FailureKind>,
    identifier: Option<String>,
    incoming_enabled: AtomicBool,
    outgoing_enabled: AtomicBool,
}

impl ClientPolicy {
    pub fn new(
        retry_timeout: Duration,
        retry_number: u32,
        incoming_heartbeat: Duration,
        outgoing_heartbeat: Duration,
        retryable: Vec<FailureKind>,
    ) -> Self {
        Self {
            retry_timeout,
            retry_number,
            incoming_heartbeat,
            outgoing_heartbeat,
            retryable,
            identifier: None,
            incoming_enabled: AtomicBool::new(!incoming_heartbeat.is_zero()),
            outgoing_enabled: AtomicBool::new(!outgoing_heartbeat.is_zero()),
        }
    }

    /// Policy with no outgoing heartbeat and no retryable failure kinds.
    pub fn with_retry(retry_timeout: Duration, retry_number: u32, incoming_heartbeat: Duration) -> Self {
        Self::new(retry_timeout, retry_number, incoming_heartbeat, Duration::ZERO, Vec::new())
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    pub fn retry_number(&self) -> u32 {
        self.retry_number
    }

    pub fn incoming_heartbeat(&self) -> Duration {
        self.incoming_heartbeat
    }

    pub fn outgoing_heartbeat(&self) -> Duration {
        self.outgoing_heartbeat
    }

    pub fn retryable_kinds(&self) -> &[FailureKind] {
        &self.retryable
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Whether `error` may be retried under this policy.
    pub fn is_retryable(&self, error: &ClientError) -> bool {
        self.retryable.contains(&error.kind())
    }

    pub fn is_incoming_heartbeat(&self) -> bool {
        self.incoming_enabled.load(Ordering::Acquire)
    }

    pub fn set_incoming_heartbeat(&self, enabled: bool) {
        self.incoming_enabled
            .store(enabled && !self.incoming_heartbeat.is_zero(), Ordering::Release);
    }

    pub fn is_outgoing_heartbeat(&self) -> bool {
        self.outgoing_enabled.load(Ordering::Acquire)
    }

    pub fn set_outgoing_heartbeat(&self, enabled: bool) {
        self.outgoing_enabled
            .store(enabled && !self.outgoing_heartbeat.is_zero(), Ordering::Release);
    }
}

impl Clone for ClientPolicy {
    /// Toggles are re-derived from the intervals, not copied.
    fn clone(&self) -> Self {
        let mut policy = Self::new(
            self.retry_timeout,
            self.retry_number,
            self.incoming_heartbeat,
            self.outgoing_heartbeat,
            self.retryable.clone(),
        );
        policy.identifier = self.identifier.clone();
        policy
    }
}

impl Default for ClientPolicy {
    /// 3 attempts, 10s apart, no heartbeats, socket failures retryable.
    fn default() -> Self {
        Self::new(
            Duration::from_secs(10),
            3,
            Duration::ZERO,
            Duration::ZERO,
            vec![FailureKind::Io],
        )
    }
}
