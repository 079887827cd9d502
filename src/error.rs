use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the trading agent
#[derive(Error, Debug)]
pub enum LirabotError {
    // Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Single-writer lock
    #[error("Lock contention: {0}")]
    LockContention(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Transport errors (classified; drives retry or reconcile)
    #[error("Transport error ({kind}): {message}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
        /// Retry-After hint in seconds, when the exchange sent one
        retry_after_secs: Option<u64>,
    },

    // Exchange-reported rejection (per-intent)
    #[error("Exchange rejected request: {0}")]
    Exchange(String),

    // Rate limiter exhausted for this cycle
    #[error("Throttled: {0}")]
    Throttled(String),

    // Validation errors (per-intent reject; cycle continues)
    #[error("Validation failed: {0}")]
    Validation(String),

    // Same idempotency key reused with a different payload
    #[error("Idempotency conflict on key {key}: stored hash {stored}, new hash {submitted}")]
    IdempotencyConflict {
        key: String,
        stored: String,
        submitted: String,
    },

    // Reconciliation could not resolve an order within budget
    #[error("Reconcile inconclusive for {client_order_id} after {attempts} attempts")]
    ReconcileUnknown {
        client_order_id: String,
        attempts: u32,
    },

    // Integrity errors abort the current cycle transaction
    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for LirabotError
pub type Result<T> = std::result::Result<T, LirabotError>;

/// Classification of transport failures, used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection-level failure; safe to retry reads
    Network,
    /// HTTP 429; honor Retry-After when present
    RateLimit,
    /// HTTP 5xx
    Server,
    /// HTTP 4xx other than 429 (not retried)
    Client,
    /// Request deadline elapsed with no response
    Timeout,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::RateLimit => "RATE_LIMIT",
            Self::Server => "SERVER",
            Self::Client => "CLIENT",
            Self::Timeout => "TIMEOUT",
        }
    }

    /// Read calls may be retried for these kinds. Writes never retry
    /// blindly; ambiguous outcomes go through reconciliation instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::RateLimit | Self::Server | Self::Timeout
        )
    }

    /// Kinds where the request may have reached the exchange even though no
    /// acknowledgement came back.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Network | Self::Server | Self::Timeout)
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Hard invariant failures. These abort the cycle transaction and surface to
/// the operator; durable state is never left partially applied.
#[derive(Error, Debug, Clone)]
pub enum IntegrityError {
    #[error("Oversell on {symbol}: requested {requested}, open lots cover {available}")]
    Oversell {
        symbol: String,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Non-monotonic ledger checkpoint: stored event count {stored}, observed {observed}")]
    NonMonotonicLedger { stored: i64, observed: i64 },

    #[error("Illegal order state transition: {from} -> {to} ({client_order_id})")]
    IllegalTransition {
        client_order_id: String,
        from: String,
        to: String,
    },

    #[error("Schema invariant violated: {0}")]
    Schema(String),
}

impl LirabotError {
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// 429 with the exchange's Retry-After hint attached.
    pub fn rate_limited(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self::Transport {
            kind: TransportErrorKind::RateLimit,
            message: message.into(),
            retry_after_secs,
        }
    }

    /// Errors that abort the whole cycle rather than a single intent.
    pub fn is_fatal_for_cycle(&self) -> bool {
        matches!(
            self,
            Self::Integrity(_) | Self::Database(_) | Self::LockContention(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn transport_kind_retryability() {
        assert!(TransportErrorKind::Network.is_retryable());
        assert!(TransportErrorKind::RateLimit.is_retryable());
        assert!(TransportErrorKind::Server.is_retryable());
        assert!(TransportErrorKind::Timeout.is_retryable());
        assert!(!TransportErrorKind::Client.is_retryable());
    }

    #[test]
    fn ambiguity_excludes_rate_limit_and_client() {
        // A 429 means the exchange refused before processing; the write
        // cannot have taken effect.
        assert!(!TransportErrorKind::RateLimit.is_ambiguous());
        assert!(!TransportErrorKind::Client.is_ambiguous());
        assert!(TransportErrorKind::Timeout.is_ambiguous());
    }

    #[test]
    fn oversell_error_formats_amounts() {
        let err = IntegrityError::Oversell {
            symbol: "BTCTRY".to_string(),
            requested: dec!(1.5),
            available: dec!(1.0),
        };
        let msg = err.to_string();
        assert!(msg.contains("BTCTRY"));
        assert!(msg.contains("1.5"));
    }

    #[test]
    fn integrity_error_is_fatal_for_cycle() {
        let err: LirabotError = IntegrityError::NonMonotonicLedger {
            stored: 10,
            observed: 5,
        }
        .into();
        assert!(err.is_fatal_for_cycle());
        assert!(!LirabotError::Validation("qty".into()).is_fatal_for_cycle());
    }
}
