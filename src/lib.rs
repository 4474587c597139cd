//! Rule evaluation for 5G SBI signalling proxies.
//!
//! An HTTP exchange (request headers, response headers, JSON bodies) is
//! screened by operator-configured rule-sets across six processing phases.
//! Configuration is parsed from YAML, validated, and compiled once into an
//! immutable [`context::RootConfig`]: every string the rules mention is
//! interned to a dense index, every condition lowered to a typed operator
//! tree, every action resolved to arena ids. Per-request state lives in a
//! [`context::RunState`] that materializes values lazily, driven by each
//! rule's recorded requirements.
//!
//! The [`filter::Engine`] drives the phases; asynchronous lookups (SLF,
//! NF discovery) surface as explicit pause/resume points so the host proxy
//! keeps ownership of its event loop.

pub mod condition;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod lookup;
pub mod message;
pub mod modifier;

pub use config::ProxyConfig;
pub use context::{NetworkOrigin, RootConfig, RunState};
pub use error::{CompileError, LookupError, ModifierFailure};
pub use filter::{Engine, ExchangeOutcome, LocalReply, Phase};
pub use lookup::{LookupRequest, LookupResult, LookupService};
pub use message::{Body, Exchange, HeaderMap, MemoryBody, MemoryHeaderMap};
