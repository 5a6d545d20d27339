use crate::core::types::Hash256;
use crate::storage::StorageError;

use super::coins::CoinsError;

/// Why a block or transaction was refused. Never fatal to the node.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Fails checks that need no chain context
    #[error("malformed: {0}")]
    Malformed(String),
    /// Well formed but breaks a rule given the chain or coin state
    #[error("invalid: {0}")]
    ContextuallyInvalid(String),
    /// Parent block or input transactions are not known yet
    #[error("orphan: {} missing parent(s)", .missing.len())]
    Orphan { missing: Vec<Hash256> },
    #[error("already known")]
    Duplicate,
    /// A pool or cache limit refused the item
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl ValidationError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        ValidationError::Malformed(reason.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        ValidationError::ContextuallyInvalid(reason.into())
    }

    pub fn orphan(missing: Vec<Hash256>) -> Self {
        ValidationError::Orphan { missing }
    }

    /// Whether the sender provably broke consensus rules. Only context-free
    /// failures qualify; contextual ones may come from clock skew or a
    /// different view of the chain.
    pub fn is_ban_worthy(&self) -> bool {
        matches!(self, ValidationError::Malformed(_))
    }

    pub fn reason(&self) -> String {
        match self {
            ValidationError::Malformed(r) | ValidationError::ContextuallyInvalid(r) => r.clone(),
            ValidationError::ResourceExhausted(r) => r.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors from the chain state. Everything except `Validation` is fatal: the
/// node must stop rather than keep serving possibly wrong state.
#[derive(Debug, thiserror::Error)]
pub enum ChainStateError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("internal consistency failure: {0}")]
    InternalConsistency(String),
    #[error("unknown block {}", hex::encode(.0))]
    UnknownBlock(Hash256),
    #[error("chain state halted after an earlier fatal error")]
    Halted,
    #[error("configuration error: {0}")]
    Config(String),
}

impl ChainStateError {
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ChainStateError::Validation(_) | ChainStateError::Config(_) | ChainStateError::UnknownBlock(_)
        )
    }

    pub fn consistency(reason: impl Into<String>) -> Self {
        ChainStateError::InternalConsistency(reason.into())
    }
}

impl From<CoinsError> for ChainStateError {
    fn from(e: CoinsError) -> Self {
        match e {
            CoinsError::Storage(s) => ChainStateError::Storage(s),
            other => ChainStateError::InternalConsistency(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ban_worthiness() {
        assert!(ValidationError::malformed("bad-txns-vin-empty").is_ban_worthy());
        assert!(!ValidationError::invalid("bad-cb-amount").is_ban_worthy());
        assert!(!ValidationError::invalid("time-too-new").is_ban_worthy());
        assert!(!ValidationError::orphan(vec![[1u8; 32]]).is_ban_worthy());
        assert!(!ValidationError::Duplicate.is_ban_worthy());
        assert!(!ValidationError::ResourceExhausted("mempool full".into()).is_ban_worthy());
    }

    #[test]
    fn test_fatality() {
        assert!(!ChainStateError::from(ValidationError::Duplicate).is_fatal());
        assert!(ChainStateError::consistency("missing undo").is_fatal());
        assert!(!ChainStateError::UnknownBlock([7u8; 32]).is_fatal());
        assert!(ChainStateError::from(StorageError::DbError("io".into())).is_fatal());
        let coins = CoinsError::MissingOrSpent(crate::core::types::OutPoint::new([0u8; 32], 0));
        assert!(ChainStateError::from(coins).is_fatal());
    }

    #[test]
    fn test_orphan_display() {
        let e = ValidationError::orphan(vec![[1u8; 32], [2u8; 32]]);
        assert_eq!(e.to_string(), "orphan: 2 missing parent(s)");
    }
}
