//! Error taxonomies for configuration compilation and modifier execution.

use thiserror::Error;

/// Errors raised while compiling parsed configuration into a [`RootConfig`].
///
/// These are configuration-rejection errors: once a `RootConfig` exists, rule
/// evaluation never raises them.
///
/// [`RootConfig`]: crate::context::RootConfig
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown filter case: {0}")]
    UnknownFilterCase(String),

    #[error("invalid action in rule '{rule}': {reason}")]
    InvalidAction { rule: String, reason: String },

    #[error("invalid scrambling profile for '{partner}': {reason}")]
    InvalidScramblingProfile { partner: String, reason: String },

    #[error("symbol table overflow: more than {0} interned names in one namespace")]
    SymbolOverflow(usize),
}

/// Why a string-modifier chain gave up on a value.
///
/// `FqdnIsIp` is a precondition, not a failure: the value is left unmodified
/// and the chain continues. All other reasons abort the chain and trigger the
/// configured miss policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModifierFailure {
    #[error("value is an IP address, not an FQDN")]
    FqdnIsIp,

    #[error("no scrambling profile for roaming partner '{0}'")]
    EncryptionProfileNotFound(String),

    #[error("no key for generation prefix '{0}'")]
    IncorrectEncryptionId(String),

    #[error("label cannot be scrambled or descrambled")]
    FqdnUnmodifiable,

    #[error("no table entry for key '{0}'")]
    LookupMiss(String),
}

/// Failure of an external asynchronous lookup (SLF slice, NF discovery).
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    #[error("lookup timed out")]
    Timeout,

    #[error("lookup target unreachable: {0}")]
    Unreachable(String),

    #[error("identity not found")]
    NotFound,

    #[error("malformed lookup response: {0}")]
    MalformedResponse(String),

    #[error("lookup cancelled")]
    Cancelled,
}
