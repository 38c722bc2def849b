//! Hook registry: ordered response hooks plus single-slot request callbacks.

use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::json::PathMiss;
use std::fmt;
use std::sync::Arc;

/// Callback run during the request phase. It may rewrite headers or the decoded JSON.
pub type RequestCallback = Arc<dyn Fn(&mut InterceptedRequest) + Send + Sync>;

type HookFn = dyn Fn(&InterceptedRequest, &mut InterceptedResponse) -> HookOutcome + Send + Sync;

/// Identifies a registered response hook in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(pub u64);

impl fmt::Display for HookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hook#{}", self.0)
    }
}

/// What a response hook did with one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Request URL did not match; the hook did not look at the response
    Ignored,
    /// URL matched and the response was mutated
    Applied,
    /// URL matched but the target was missing, nothing changed
    Skipped(SkipReason),
    /// Custom hook ran; it does not report what it did
    Ran,
}

impl HookOutcome {
    /// Outcomes worth recording: a declarative hook matched the URL.
    pub fn is_reportable(&self) -> bool {
        matches!(self, HookOutcome::Applied | HookOutcome::Skipped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Response body was empty or not JSON
    NoJson,
    /// A path segment was absent
    Path(PathMiss),
}

impl From<PathMiss> for SkipReason {
    fn from(miss: PathMiss) -> Self {
        SkipReason::Path(miss)
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoJson => f.write_str("response has no JSON body"),
            SkipReason::Path(miss) => write!(f, "{}", miss),
        }
    }
}

/// A response hook with a human-readable label.
#[derive(Clone)]
pub struct ResponseHook {
    label: String,
    apply: Arc<HookFn>,
}

impl ResponseHook {
    /// Hook that reports its own outcome.
    pub fn new<F>(label: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&InterceptedRequest, &mut InterceptedResponse) -> HookOutcome + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            apply: Arc::new(apply),
        }
    }

    /// Wrap a plain closure; it always reports [`HookOutcome::Ran`].
    pub fn custom<F>(apply: F) -> Self
    where
        F: Fn(&InterceptedRequest, &mut InterceptedResponse) + Send + Sync + 'static,
    {
        Self::new("custom", move |req, res| {
            apply(req, res);
            HookOutcome::Ran
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn apply(&self, req: &InterceptedRequest, res: &mut InterceptedResponse) -> HookOutcome {
        (self.apply)(req, res)
    }
}

impl fmt::Debug for ResponseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHook").field("label", &self.label).finish()
    }
}

/// Registered hooks of one proxy.
///
/// Response hooks run in registration order and each sees the mutations of
/// the ones before it. The three request callbacks are single slots:
/// registering again replaces the previous callback, it never composes.
#[derive(Clone, Default)]
pub struct HookRegistry {
    response_hooks: Vec<(HookId, ResponseHook)>,
    request: Option<RequestCallback>,
    request_header_modify: Option<RequestCallback>,
    request_body_modify: Option<RequestCallback>,
    next_id: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a response hook. No deduplication, no priority.
    pub fn add_response_hook(&mut self, hook: ResponseHook) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.response_hooks.push((id, hook));
        id
    }

    pub fn set_request_callback<F>(&mut self, callback: F)
    where
        F: Fn(&mut InterceptedRequest) + Send + Sync + 'static,
    {
        self.request = Some(Arc::new(callback));
    }

    pub fn set_request_header_modify<F>(&mut self, callback: F)
    where
        F: Fn(&mut InterceptedRequest) + Send + Sync + 'static,
    {
        self.request_header_modify = Some(Arc::new(callback));
    }

    pub fn set_request_body_modify<F>(&mut self, callback: F)
    where
        F: Fn(&mut InterceptedRequest) + Send + Sync + 'static,
    {
        self.request_body_modify = Some(Arc::new(callback));
    }

    /// Drop every response hook and empty all request slots. Hook ids keep
    /// increasing so diagnostics never confuse old and new hooks.
    pub fn clear(&mut self) {
        self.response_hooks.clear();
        self.request = None;
        self.request_header_modify = None;
        self.request_body_modify = None;
    }

    pub fn response_hooks(&self) -> &[(HookId, ResponseHook)] {
        &self.response_hooks
    }

    pub fn request_callback(&self) -> Option<&RequestCallback> {
        self.request.as_ref()
    }

    pub fn request_header_modify(&self) -> Option<&RequestCallback> {
        self.request_header_modify.as_ref()
    }

    pub fn request_body_modify(&self) -> Option<&RequestCallback> {
        self.request_body_modify.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.response_hooks.is_empty()
            && self.request.is_none()
            && self.request_header_modify.is_none()
            && self.request_body_modify.is_none()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("response_hooks", &self.response_hooks)
            .field("request", &self.request.is_some())
            .field("request_header_modify", &self.request_header_modify.is_some())
            .field("request_body_modify", &self.request_body_modify.is_some())
            .finish()
    }
}
