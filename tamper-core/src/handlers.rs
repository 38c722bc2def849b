use crate::body::{self, BufferedBody, DecodedBody};
use crate::config::{BodyLimits, ProxyMode};
use crate::diagnostics::HookDiagnostics;
use crate::error::ProxyError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::hooks::{HookId, HookRegistry, ResponseHook};
use crate::Result;
use hudsucker::{
    hyper::{
        header::{HeaderMap, HeaderValue, CONTENT_ENCODING, HOST},
        http::uri::{Authority, Scheme},
        Body, Method, Request, Response, StatusCode, Uri,
    },
    HttpContext, HttpHandler, RequestOrResponse,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument, Span};

/// Origin that reverse mode forwards every request to.
#[derive(Debug, Clone)]
pub struct ReverseTarget {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
}

impl ReverseTarget {
    pub fn parse(destination_url: &str) -> Result<Self> {
        let uri: Uri = destination_url.parse().map_err(|e| {
            ProxyError::Configuration(format!("Invalid destination URL '{}': {}", destination_url, e))
        })?;

        let (Some(scheme), Some(authority)) = (uri.scheme().cloned(), uri.authority().cloned()) else {
            return Err(ProxyError::Configuration(format!(
                "Destination URL '{}' must include scheme and host",
                destination_url
            )));
        };

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    /// Point `req` at the destination origin, keeping its path and query.
    fn rewrite(&self, req: &mut Request<Body>) {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let rewritten = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, path))
            .build();

        match rewritten {
            Ok(uri) => {
                *req.uri_mut() = uri;
                if let Ok(host) = HeaderValue::from_str(self.authority.as_str()) {
                    req.headers_mut().insert(HOST, host);
                }
            }
            Err(e) => warn!("Could not rewrite {} onto destination: {}", path, e),
        }
    }
}

/// Request phase: general callback, header callback, then, for a non-empty
/// body, JSON decode and the body callback.
pub fn run_request_phase(registry: &HookRegistry, req: &mut InterceptedRequest) {
    if let Some(callback) = registry.request_callback() {
        callback(req);
    }
    if let Some(callback) = registry.request_header_modify() {
        callback(req);
    }

    if req.buffer().is_empty() {
        return;
    }

    match body::decode(req.buffer()) {
        DecodedBody::Json { value, .. } => req.set_decoded_json(value),
        DecodedBody::Text { error, .. } => warn!("Non-JSON request body for {}: {}", req.url(), error),
        DecodedBody::Empty => {}
    }

    if let Some(callback) = registry.request_body_modify() {
        callback(req);
    }
}

/// Decode the buffered response into text and, when possible, JSON.
pub fn decode_response(req: &InterceptedRequest, res: &mut InterceptedResponse) {
    let decoded = body::decode(res.buffer());
    if let DecodedBody::Text { text, error } = &decoded {
        warn!("Non-JSON body for {} ({} bytes): {}", req.url(), text.len(), error);
    }
    let (text, json) = decoded.into_parts();
    res.set_decoded(text, json);
}

/// Response phase: every hook, in registration order, against the same
/// response. Outcomes of declarative hooks that matched go to `diagnostics`.
pub fn run_response_phase(
    hooks: &[(HookId, ResponseHook)],
    diagnostics: &HookDiagnostics,
    req: &InterceptedRequest,
    res: &mut InterceptedResponse,
) {
    for (id, hook) in hooks {
        let outcome = hook.apply(req, res);
        if outcome.is_reportable() {
            debug!("{} {} on {}: {:?}", id, hook.label(), req.url(), outcome);
            diagnostics.record(*id, hook.label(), req.url(), outcome);
        }
    }
}

/// Whether every content-encoding of the response can be removed before decoding.
fn is_decodable(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONTENT_ENCODING)
        .iter()
        .flat_map(|value| value.to_str().unwrap_or("unknown").split(','))
        .map(|coding| coding.trim().to_ascii_lowercase())
        .all(|coding| matches!(coding.as_str(), "" | "identity" | "gzip" | "x-gzip" | "deflate" | "br" | "zstd"))
}

fn error_response(status: StatusCode) -> Response<Body> {
    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    res
}

/// Split a buffered body into the bytes hooks work on and the stream that
/// replaces them when the body was over the limit.
fn split(buffered: BufferedBody) -> (Bytes, Option<Body>) {
    match buffered {
        BufferedBody::Complete(bytes) => (bytes, None),
        BufferedBody::Oversized(stream) => (Bytes::new(), Some(stream)),
    }
}

/// Phase handler installed into the interception engine.
///
/// The engine clones the handler for every request, so the buffered request
/// kept in `pending` belongs to exactly one exchange. Every log line of an
/// exchange is emitted inside a span carrying the proxy identity.
#[derive(Clone)]
pub struct InterceptHandler {
    identity: Arc<str>,
    reverse: Option<Arc<ReverseTarget>>,
    registry: Arc<RwLock<HookRegistry>>,
    diagnostics: HookDiagnostics,
    limits: BodyLimits,
    pending: Option<(Arc<InterceptedRequest>, Span)>,
}

impl InterceptHandler {
    pub fn new(
        identity: Arc<str>,
        mode: ProxyMode,
        destination_url: &str,
        registry: Arc<RwLock<HookRegistry>>,
        diagnostics: HookDiagnostics,
        limits: BodyLimits,
    ) -> Result<Self> {
        let reverse = match mode {
            ProxyMode::Reverse => Some(Arc::new(ReverseTarget::parse(destination_url)?)),
            ProxyMode::Direct => None,
        };

        Ok(Self {
            identity,
            reverse,
            registry,
            diagnostics,
            limits,
            pending: None,
        })
    }

    async fn intercept_request(&mut self, req: Request<Body>, span: Span) -> RequestOrResponse {
        let (parts, body) = req.into_parts();
        let (buffer, overflow) = match body::read_body(body, &self.limits).await {
            Ok(buffered) => split(buffered),
            Err(e) => {
                warn!("Failed to read request body for {}: {}", parts.uri, e);
                return RequestOrResponse::Response(error_response(StatusCode::BAD_REQUEST));
            }
        };

        let mut intercepted = InterceptedRequest::from_parts(parts, buffer);
        info!(
            exchange = %intercepted.id(),
            "request sent for {} {}",
            intercepted.method(),
            intercepted.url()
        );

        let registry = self.registry.read().clone();
        run_request_phase(&registry, &mut intercepted);

        // Hooks see the path the client asked for; only the forwarded copy is rewritten.
        let mut forward = match overflow {
            Some(stream) => {
                warn!(
                    "Request body for {} is over the {} byte limit; forwarded without decoding",
                    intercepted.url(),
                    self.limits.max_body_bytes
                );
                intercepted.to_request_with_body(stream)
            }
            None => intercepted.to_request(),
        };
        if let Some(target) = &self.reverse {
            target.rewrite(&mut forward);
        }
        self.pending = Some((Arc::new(intercepted), span));
        RequestOrResponse::Request(forward)
    }

    async fn intercept_response(&self, req: Arc<InterceptedRequest>, res: Response<Body>) -> Response<Body> {
        info!(exchange = %req.id(), "response get for {} ({})", req.url(), res.status());

        if !is_decodable(res.headers()) {
            warn!("Unsupported content-encoding for {}, passing response through", req.url());
            return res;
        }

        let res = match hudsucker::decode_response(res) {
            Ok(res) => res,
            Err(e) => {
                warn!("Could not decode content-encoding for {}: {}", req.url(), e);
                return error_response(StatusCode::BAD_GATEWAY);
            }
        };

        let (parts, body) = res.into_parts();
        let (buffer, overflow) = match body::read_body(body, &self.limits).await {
            Ok(buffered) => split(buffered),
            Err(e) => {
                warn!("Failed to read response body for {}: {}", req.url(), e);
                return error_response(StatusCode::BAD_GATEWAY);
            }
        };

        let mut intercepted = InterceptedResponse::from_parts(parts, buffer);
        if overflow.is_none() {
            decode_response(&req, &mut intercepted);
        } else {
            warn!(
                "Response body for {} is over the {} byte limit; not decoded",
                req.url(),
                self.limits.max_body_bytes
            );
        }

        let hooks = self.registry.read().response_hooks().to_vec();
        run_response_phase(&hooks, &self.diagnostics, &req, &mut intercepted);

        match overflow {
            Some(stream) => intercepted.into_response_with_body(stream),
            None => intercepted.into_response(),
        }
    }
}

#[async_trait::async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        // CONNECT tunnels are handled by the engine; the decrypted requests come back through here.
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        let span = info_span!("exchange", proxy = %self.identity);
        self.intercept_request(req, span.clone()).instrument(span).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some((req, span)) = self.pending.take() else {
            return res;
        };
        self.intercept_response(req, res).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::HookOutcome;
    use crate::json::ArrayLocator;
    use crate::patch;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(url: &str, body: &str) -> InterceptedRequest {
        let (parts, _) = Request::builder()
            .method("POST")
            .uri(url)
            .body(())
            .unwrap()
            .into_parts();
        InterceptedRequest::from_parts(parts, Bytes::from(body.to_string()))
    }

    fn response(status: u16, body: &str) -> InterceptedResponse {
        let (parts, _) = Response::builder().status(status).body(()).unwrap().into_parts();
        InterceptedResponse::from_parts(parts, Bytes::from(body.to_string()))
    }

    fn respond(registry: &HookRegistry, diagnostics: &HookDiagnostics, url: &str, body: &str) -> InterceptedResponse {
        let req = request(url, "");
        let mut res = response(200, body);
        decode_response(&req, &mut res);
        run_response_phase(registry.response_hooks(), diagnostics, &req, &mut res);
        res
    }

    #[test]
    fn test_request_phase_order_and_body_callback() {
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = HookRegistry::new();

        let log = calls.clone();
        registry.set_request_callback(move |_| log.lock().push("request"));
        let log = calls.clone();
        registry.set_request_header_modify(move |req| {
            log.lock().push("headers");
            req.headers_mut().insert("x-test-scenario", HeaderValue::from_static("outage"));
        });
        let log = calls.clone();
        registry.set_request_body_modify(move |req| {
            log.lock().push("body");
            if let Some(json) = req.json.as_mut() {
                json["amount"] = json!(0);
            }
        });

        let mut req = request("/api/pay", r#"{"amount": 100}"#);
        run_request_phase(&registry, &mut req);

        assert_eq!(*calls.lock(), vec!["request", "headers", "body"]);
        assert_eq!(req.headers()["x-test-scenario"], "outage");
        assert_eq!(req.json, Some(json!({"amount": 0})));
        assert!(req.json_changed());
    }

    #[test]
    fn test_empty_request_body_skips_body_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();
        let counter = hits.clone();
        registry.set_request_body_modify(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut req = request("/api/pay", "");
        run_request_phase(&registry, &mut req);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(req.json.is_none());

        // non-JSON body still reaches the callback, without JSON
        let mut req = request("/api/pay", "a=1&b=2");
        run_request_phase(&registry, &mut req);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(req.json.is_none());
    }

    #[test]
    fn test_replaced_request_callback_is_the_one_that_runs() {
        let mut registry = HookRegistry::new();
        registry.set_request_header_modify(|req| {
            req.headers_mut().insert("x-first", HeaderValue::from_static("1"));
        });
        registry.set_request_header_modify(|req| {
            req.headers_mut().insert("x-second", HeaderValue::from_static("1"));
        });

        let mut req = request("/", "");
        run_request_phase(&registry, &mut req);
        assert!(req.headers().get("x-first").is_none());
        assert!(req.headers().get("x-second").is_some());
    }

    #[test]
    fn test_non_json_response_keeps_text_and_runs_hooks() {
        let diagnostics = HookDiagnostics::default();
        let mut registry = HookRegistry::new();
        let field = registry.add_response_hook(patch::field_replace("/page", "title", "x"));
        let status = registry.add_response_hook(patch::status_override("/page", StatusCode::IM_A_TEAPOT));

        let res = respond(&registry, &diagnostics, "/page", "<html></html>");
        assert_eq!(res.raw_body(), Some("<html></html>"));
        assert!(res.json.is_none());
        assert_eq!(res.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(diagnostics.skipped_count(field), 1);
        assert_eq!(diagnostics.applied_count(status), 1);
    }

    #[test]
    fn test_hooks_compose_in_registration_order() {
        let diagnostics = HookDiagnostics::default();
        let mut registry = HookRegistry::new();
        registry.add_response_hook(patch::field_replace("/cfg", "mode", "first"));
        registry.add_response_hook(ResponseHook::custom(|_, res| {
            // sees the previous hook's write
            if let Some(json) = res.json.as_mut() {
                let seen = json["mode"].clone();
                json["seen"] = seen;
            }
        }));
        registry.add_response_hook(patch::field_replace("/cfg", "mode", "second"));

        let res = respond(&registry, &diagnostics, "/cfg", r#"{"mode": "original"}"#);
        assert_eq!(res.json, Some(json!({"mode": "second", "seen": "first"})));
    }

    #[test]
    fn test_maintenance_routine_scenario() {
        let diagnostics = HookDiagnostics::default();
        let mut registry = HookRegistry::new();
        let id = registry.add_response_hook(patch::array_element_replace(
            "/api/users/app-config",
            ArrayLocator::new("maintenanceRoutines", "featureName", "top_up_payment"),
            "startTime",
            123456,
        ));

        let res = respond(
            &registry,
            &diagnostics,
            "/api/users/app-config",
            r#"{"maintenanceRoutines":[{"featureName":"top_up_payment","startTime":61200000,"endTime":61260000}]}"#,
        );
        assert_eq!(
            res.json,
            Some(json!({"maintenanceRoutines":[{"featureName":"top_up_payment","startTime":123456,"endTime":61260000}]}))
        );
        assert_eq!(diagnostics.outcomes_for(id), vec![HookOutcome::Applied]);
    }

    #[test]
    fn test_locator_miss_leaves_bytes_unchanged() {
        let diagnostics = HookDiagnostics::default();
        let mut registry = HookRegistry::new();
        let id = registry.add_response_hook(patch::array_element_replace(
            "/api/users/app-config",
            ArrayLocator::new("maintenanceRoutines", "featureName", "no_such_feature"),
            "startTime",
            1,
        ));

        let original = r#"{"maintenanceRoutines": [ {"featureName":"bill_payment","startTime":61200000} ]}"#;
        let res = respond(&registry, &diagnostics, "/api/users/app-config", original);
        assert!(!res.json_changed());
        assert_eq!(diagnostics.skipped_count(id), 1);
        assert_eq!(res.buffer(), &Bytes::from(original.to_string()));
    }

    #[test]
    fn test_unmatched_url_records_nothing() {
        let diagnostics = HookDiagnostics::default();
        let mut registry = HookRegistry::new();
        registry.add_response_hook(patch::field_replace("/a", "x", 1));

        let res = respond(&registry, &diagnostics, "/b", r#"{"x": 0}"#);
        assert!(!res.json_changed());
        assert!(diagnostics.events().is_empty());
    }

    #[test]
    fn test_repeated_field_patch_is_idempotent() {
        let body = r#"{"darkMode": false, "theme": "light"}"#;

        let mut once = HookRegistry::new();
        once.add_response_hook(patch::field_replace("/api/flags", "darkMode", true));
        let single = respond(&once, &HookDiagnostics::default(), "/api/flags", body);

        let diagnostics = HookDiagnostics::default();
        let mut twice = HookRegistry::new();
        let first = twice.add_response_hook(patch::field_replace("/api/flags", "darkMode", true));
        let second = twice.add_response_hook(patch::field_replace("/api/flags", "darkMode", true));
        assert_eq!(twice.response_hooks().len(), 2);

        let res = respond(&twice, &diagnostics, "/api/flags", body);
        assert_eq!(res.json, single.json);
        assert_eq!(res.json, Some(json!({"darkMode": true, "theme": "light"})));
        assert_eq!(diagnostics.outcomes_for(first), vec![HookOutcome::Applied]);
        assert_eq!(diagnostics.outcomes_for(second), vec![HookOutcome::Applied]);
        assert_eq!(diagnostics.events().len(), 2);
    }

    fn handler(registry: HookRegistry, diagnostics: HookDiagnostics, max_body_bytes: usize) -> InterceptHandler {
        let limits = BodyLimits {
            max_body_bytes,
            ..BodyLimits::default()
        };
        InterceptHandler::new(
            Arc::from("test 1"),
            ProxyMode::Reverse,
            "http://127.0.0.1:3000",
            Arc::new(RwLock::new(registry)),
            diagnostics,
            limits,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_oversized_response_is_streamed_and_status_hooks_apply() {
        let diagnostics = HookDiagnostics::default();
        let mut registry = HookRegistry::new();
        let field = registry.add_response_hook(patch::field_replace("/big", "a", 2));
        let status = registry.add_response_hook(patch::status_override("/big", StatusCode::ACCEPTED));
        let handler = handler(registry, diagnostics.clone(), 4);

        let original = r#"{"a": 1, "padding": "more than four bytes"}"#;
        let res = handler
            .intercept_response(Arc::new(request("/big", "")), Response::new(Body::from(original)))
            .await;

        assert_eq!(res.status(), StatusCode::ACCEPTED);
        let bytes = hudsucker::hyper::body::to_bytes(res.into_body()).await.unwrap();
        assert_eq!(&bytes[..], original.as_bytes());
        assert_eq!(diagnostics.skipped_count(field), 1);
        assert_eq!(diagnostics.applied_count(status), 1);
    }

    #[tokio::test]
    async fn test_oversized_request_skips_body_callback() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = HookRegistry::new();
        let counter = hits.clone();
        registry.set_request_body_modify(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry.set_request_header_modify(|req| {
            req.headers_mut().insert("x-seen", HeaderValue::from_static("1"));
        });
        let mut handler = handler(registry, HookDiagnostics::default(), 4);

        let original = r#"{"amount": 100}"#;
        let req = Request::builder()
            .method("POST")
            .uri("/api/pay")
            .body(Body::from(original))
            .unwrap();
        let RequestOrResponse::Request(forward) = handler.intercept_request(req, Span::none()).await else {
            panic!("request must be forwarded");
        };

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(forward.headers()["x-seen"], "1");
        assert_eq!(forward.uri(), "http://127.0.0.1:3000/api/pay");
        let bytes = hudsucker::hyper::body::to_bytes(forward.into_body()).await.unwrap();
        assert_eq!(&bytes[..], original.as_bytes());
        assert!(handler.pending.is_some());
    }

    #[test]
    fn test_decodable_encodings() {
        let mut headers = HeaderMap::new();
        assert!(is_decodable(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip, br"));
        assert!(is_decodable(&headers));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("compress"));
        assert!(!is_decodable(&headers));
    }

    #[test]
    fn test_reverse_rewrite() {
        let target = ReverseTarget::parse("https://api.example.com:8443/base/").unwrap();
        let mut req = Request::builder()
            .uri("/api/users?id=1")
            .body(Body::empty())
            .unwrap();
        target.rewrite(&mut req);
        assert_eq!(req.uri(), "https://api.example.com:8443/base/api/users?id=1");
        assert_eq!(req.headers()[HOST], "api.example.com:8443");

        assert!(ReverseTarget::parse("/relative").is_err());
    }
}
