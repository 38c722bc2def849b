//! Tamper Core Library
//!
//! A programmable HTTP interception proxy for integration tests. It sits
//! between a client under test and its backend, lets test code observe and
//! rewrite requests, and patches JSON responses before they reach the client.

pub mod body;
pub mod ca;
/// Configuration types and utilities
pub mod config;
pub mod diagnostics;
/// Error types for proxy operations
pub mod error;
pub mod exchange;
pub mod handle;
pub mod handlers;
pub mod hooks;
pub mod json;
pub mod patch;
/// Proxy lifecycle and hook registration
pub mod proxy;
pub mod upstream;

pub use ca::CertificateAuthority;
pub use config::{BodyLimits, CaSource, ProxyConfig, ProxyMode};
pub use diagnostics::{HookDiagnostics, HookEvent};
pub use error::{BodyReadError, ProxyError};
pub use exchange::{InterceptedRequest, InterceptedResponse};
pub use handle::{DummyProxy, ProxyHandle, ResponseCallback};
pub use handlers::InterceptHandler;
pub use hooks::{HookId, HookOutcome, HookRegistry, RequestCallback, ResponseHook, SkipReason};
pub use json::{ArrayLocator, PathMiss};
pub use patch::PatchSpec;
/// Re-export commonly used types
pub use proxy::{new_proxy, HttpProxy, ProxyState};

/// HTTP types used in hook signatures.
pub use hudsucker::hyper::{header, HeaderMap, Method, StatusCode};

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
