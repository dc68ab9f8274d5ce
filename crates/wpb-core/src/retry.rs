//! Pairing-code requests with bounded exponential backoff.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{domain::PhoneKey, errors::Error, messaging::port::ProtocolClient, Result};

/// Lowercased fragments of upstream error text that are worth retrying.
const TRANSIENT_PHRASES: &[&str] = &[
    "service currently unavailable",
    "temporarily unavailable",
    "unavailable",
    "timed out",
    "timeout",
    "rate limit",
    "rate-limit",
    "rate-overlimit",
    "too many",
    "server",
    "503",
    "504",
];

const TRANSIENT_STATUS: &[u16] = &[408, 429, 500, 502, 503, 504];

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay before the first attempt (absorbs cold-start connection jitter).
    pub initial_delay: Duration,
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_factor: f64,
    /// Upper bound of the uniform jitter added to every wait.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(400),
            max_attempts: 5,
            base_backoff: Duration::from_millis(1200),
            backoff_factor: 1.8,
            max_jitter: Duration::from_millis(400),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retry as i32);
        let ms = self.base_backoff.as_millis() as f64 * factor;
        Duration::from_millis(ms.round() as u64)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}

/// Whether a pairing failure is likely to succeed on retry.
///
/// Structured status codes win when the boundary provides them; otherwise this
/// falls back to matching the human-readable error text.
pub fn is_transient(err: &Error) -> bool {
    if let Some(status) = err.status() {
        if TRANSIENT_STATUS.contains(&status) {
            return true;
        }
    }
    let text = err.to_string().to_lowercase();
    TRANSIENT_PHRASES.iter().any(|p| text.contains(p))
}

#[derive(Clone, Debug, Default)]
pub struct PairingRetrier {
    policy: RetryPolicy,
}

impl PairingRetrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Request a pairing code, retrying transient failures.
    ///
    /// Non-transient failures return `PairingRejected` immediately; running out
    /// of attempts returns `PairingExhausted` carrying the last error.
    pub async fn request_code(
        &self,
        client: &dyn ProtocolClient,
        phone: &PhoneKey,
    ) -> Result<String> {
        if !self.policy.initial_delay.is_zero() {
            sleep(self.policy.initial_delay).await;
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1u32;
        loop {
            let err = match client.request_pairing_code(phone).await {
                Ok(code) => {
                    debug!(phone = %phone, attempt, "pairing code issued");
                    return Ok(code);
                }
                Err(e) => e,
            };

            if !is_transient(&err) {
                warn!(phone = %phone, attempt, error = %err, "pairing code request rejected");
                return Err(Error::PairingRejected(err.to_string()));
            }
            if attempt >= max_attempts {
                warn!(phone = %phone, attempt, error = %err, "pairing code retries exhausted");
                return Err(Error::PairingExhausted {
                    attempts: attempt,
                    details: err.to_string(),
                });
            }

            let wait = self.policy.backoff(attempt - 1) + self.policy.jitter();
            debug!(phone = %phone, attempt, ?wait, error = %err, "transient pairing failure, backing off");
            sleep(wait).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Jid, MessageKey};
    use crate::messaging::types::OutgoingMessage;
    use crate::phone::normalize;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct ScriptedClient {
        script: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProtocolClient for ScriptedClient {
        async fn request_pairing_code(&self, _phone: &PhoneKey) -> Result<String> {
            self.calls.lock().unwrap().push(Instant::now());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::External("script exhausted".to_string())))
        }

        async fn send_message(&self, _jid: &Jid, _message: OutgoingMessage) -> Result<()> {
            Ok(())
        }

        async fn read_messages(&self, _keys: &[MessageKey]) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn transient() -> Result<String> {
        Err(Error::External("Service currently unavailable".to_string()))
    }

    #[test]
    fn classifies_transient_text_and_status() {
        assert!(is_transient(&Error::External("Request Timed Out".into())));
        assert!(is_transient(&Error::External("rate-overlimit".into())));
        assert!(is_transient(&Error::External("HTTP 503".into())));
        assert!(is_transient(&Error::Protocol {
            status: Some(429),
            message: "slow down".into()
        }));
        assert!(!is_transient(&Error::External("bad request: invalid number".into())));
        assert!(!is_transient(&Error::External("failed to generate code".into())));
        assert!(!is_transient(&Error::Protocol {
            status: Some(400),
            message: "bad-request".into()
        }));
    }

    #[test]
    fn backoff_grows_geometrically() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(0), Duration::from_millis(1200));
        assert_eq!(p.backoff(1), Duration::from_millis(2160));
        assert!(p.backoff(3) > p.backoff(2));
    }

    #[tokio::test(start_paused = true)]
    async fn four_transient_failures_then_success() {
        let client = ScriptedClient::new(vec![
            transient(),
            transient(),
            transient(),
            transient(),
            Ok("ABCD-1234".to_string()),
        ]);
        let retrier = PairingRetrier::default();
        let phone = normalize("15551234567").unwrap();

        let start = Instant::now();
        let code = retrier.request_code(&client, &phone).await.unwrap();
        assert_eq!(code, "ABCD-1234");

        let calls = client.calls();
        assert_eq!(calls.len(), 5);
        assert!(calls[0] - start >= Duration::from_millis(400));

        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        for pair in gaps.windows(2) {
            assert!(pair[1] > pair[0], "waits must grow: {gaps:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_failure_is_immediate() {
        let client = ScriptedClient::new(vec![
            Err(Error::External("number is banned".to_string())),
            Ok("never".to_string()),
        ]);
        let retrier = PairingRetrier::new(RetryPolicy {
            initial_delay: Duration::ZERO,
            ..RetryPolicy::default()
        });
        let phone = normalize("15551234567").unwrap();

        let start = Instant::now();
        let err = retrier.request_code(&client, &phone).await.unwrap_err();
        assert!(matches!(err, Error::PairingRejected(ref s) if s.contains("banned")));
        assert_eq!(client.calls().len(), 1);
        assert_eq!(Instant::now() - start, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_transient_error() {
        let client = ScriptedClient::new(vec![
            transient(),
            transient(),
            Err(Error::External("too many requests".to_string())),
        ]);
        let retrier = PairingRetrier::new(RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        });
        let phone = normalize("15551234567").unwrap();

        let err = retrier.request_code(&client, &phone).await.unwrap_err();
        match err {
            Error::PairingExhausted { attempts, details } => {
                assert_eq!(attempts, 3);
                assert!(details.contains("too many requests"));
            }
            other => panic!("expected PairingExhausted, got {other:?}"),
        }
        assert_eq!(client.calls().len(), 3);
    }
}
