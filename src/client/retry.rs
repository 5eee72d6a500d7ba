//! Retry classification and scheduling for the connect pipeline.

use serde::Serialize;

use crate::errors::BtpsError;

/// What the connector will do about the error it just reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryInfo {
    pub will_retry: bool,
    pub retries_left: u32,
    pub next_delay_ms: u64,
}

/// Bounds and base delay for reconnect attempts.
///
/// The delay doubles per performed retry, so consecutive attempts are always
/// at least the base delay apart.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Derive [`RetryInfo`] from the attempt history and the current error.
    ///
    /// `retries` counts retries already performed. All four conjuncts must
    /// hold for a retry: the caller still wants one, the connection is not
    /// destroyed, the budget is not exhausted, and the error is transient.
    pub fn info(
        &self,
        retries: u32,
        should_retry: bool,
        destroyed: bool,
        error: Option<&BtpsError>,
    ) -> RetryInfo {
        let retryable = error.map(BtpsError::is_transient).unwrap_or(true);
        RetryInfo {
            will_retry: should_retry && !destroyed && retries < self.max_retries && retryable,
            retries_left: self.max_retries.saturating_sub(retries),
            next_delay_ms: self.next_delay_ms(retries),
        }
    }

    pub fn next_delay_ms(&self, retries: u32) -> u64 {
        self.base_delay_ms.saturating_mul(1u64 << retries.min(16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
        }
    }

    #[test]
    fn transient_errors_retry_until_the_budget_runs_out() {
        let policy = policy();
        let err = BtpsError::DnsResolutionFailed("nxdomain".into());

        let first = policy.info(0, true, false, Some(&err));
        assert!(first.will_retry);
        assert_eq!(first.retries_left, 2);
        assert_eq!(first.next_delay_ms, 10);

        let second = policy.info(1, true, false, Some(&err));
        assert!(second.will_retry);
        assert_eq!(second.retries_left, 1);
        assert_eq!(second.next_delay_ms, 20);

        let third = policy.info(2, true, false, Some(&err));
        assert!(!third.will_retry);
        assert_eq!(third.retries_left, 0);
    }

    #[test]
    fn terminal_errors_never_retry() {
        let policy = policy();
        for err in [
            BtpsError::InvalidIdentity("bad".into()),
            BtpsError::InvalidHostname("bad".into()),
            BtpsError::UnsupportedProtocol("https".into()),
            BtpsError::SignatureVerificationFailed("mismatch".into()),
            BtpsError::DecryptionFailed("padding".into()),
            BtpsError::Destroyed,
        ] {
            assert!(!policy.info(0, true, false, Some(&err)).will_retry, "{err}");
        }
    }

    #[test]
    fn destroyed_and_should_retry_gate_everything() {
        let policy = policy();
        let err = BtpsError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));

        assert!(policy.info(0, true, false, Some(&err)).will_retry);
        assert!(!policy.info(0, true, true, Some(&err)).will_retry);
        assert!(!policy.info(0, false, false, Some(&err)).will_retry);
    }

    #[test]
    fn delay_doubles_and_saturates() {
        let policy = RetryPolicy {
            max_retries: 100,
            base_delay_ms: u64::MAX / 2,
        };
        assert_eq!(policy.next_delay_ms(64), u64::MAX);

        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
        };
        assert_eq!(policy.next_delay_ms(0), 100);
        assert_eq!(policy.next_delay_ms(3), 800);
    }
}
