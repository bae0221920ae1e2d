//! Error types for the classifier.

use thiserror::Error;

/// Classifier error type.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierError {
    /// A rule with the same masked key already exists in the subtable.
    ///
    /// The classifier never deduplicates on the caller's behalf; install
    /// paths that want replace semantics must remove the old rule first.
    #[error("a rule with an identical masked key is already installed")]
    DuplicateRule,

    /// The rule handle does not name an installed rule.
    #[error("rule not found")]
    RuleNotFound,
}

/// Result type for classifier operations.
pub type Result<T> = std::result::Result<T, ClassifierError>;
