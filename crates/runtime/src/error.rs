use tidal_apply::EnsureError;
use tidal_core::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ensure(#[from] EnsureError),
    #[error("worker failed in phase {phase}: {message}")]
    Worker { phase: String, message: String },
    /// Another cluster's request queue is not registered yet.
    #[error("no request queue registered for cluster {cluster}")]
    Unrouted { cluster: String },
    /// Broken engine invariant. Logged and dropped, never retried.
    #[error("internal [{context}]: {message}")]
    Internal { context: &'static str, message: String },
    #[error("config: {0}")]
    Config(String),
}

impl RuntimeError {
    pub fn internal(context: &'static str, message: impl Into<String>) -> Self {
        RuntimeError::Internal { context, message: message.into() }
    }

    pub fn worker(phase: &str, err: &anyhow::Error) -> Self {
        RuntimeError::Worker { phase: phase.to_string(), message: format!("{:#}", err) }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, RuntimeError::Internal { .. })
    }

    /// Store failures are dropped once the queue's retry budget is spent.
    /// Worker, ensure and routing failures keep retrying at the capped
    /// backoff until they converge.
    pub fn exhausts_budget(&self) -> bool {
        matches!(self, RuntimeError::Store(_) | RuntimeError::Config(_))
    }

    /// Transient by nature; anything else is logged louder but still retried
    /// through the queue's backoff unless it is internal.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Store(e) => e.is_retryable(),
            RuntimeError::Ensure(e) => e.is_retryable(),
            RuntimeError::Worker { .. } | RuntimeError::Unrouted { .. } => true,
            RuntimeError::Internal { .. } | RuntimeError::Config(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors() {
        assert!(RuntimeError::from(StoreError::Conflict("x".into())).is_retryable());
        assert!(!RuntimeError::from(StoreError::Forbidden("x".into())).is_retryable());
        let e = RuntimeError::internal("event-cache", "token missing");
        assert!(e.is_internal() && !e.is_retryable());
        assert_eq!(e.to_string(), "internal [event-cache]: token missing");
        let w = RuntimeError::worker("Ready", &anyhow::anyhow!("boom").context("probing"));
        assert_eq!(w.to_string(), "worker failed in phase Ready: probing: boom");
        assert!(!w.exhausts_budget());
        assert!(!RuntimeError::Unrouted { cluster: "b".into() }.exhausts_budget());
        assert!(RuntimeError::from(StoreError::Transient("x".into())).exhausts_budget());
    }
}
