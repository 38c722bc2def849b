//! In-memory representation of one intercepted HTTP exchange.
//!
//! Each exchange produces one [`InterceptedRequest`] and one
//! [`InterceptedResponse`]; both are dropped when the exchange completes.

use bytes::Bytes;
use hudsucker::hyper::{
    header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING},
    http::{request, response},
    Body, Method, Request, Response, StatusCode, Uri,
};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

/// A buffered request as seen by the request callbacks and response hooks.
#[derive(Debug)]
pub struct InterceptedRequest {
    id: Uuid,
    parts: request::Parts,
    url: String,
    buffer: Bytes,
    /// Decoded body; present only for a non-empty body that parsed as JSON
    pub json: Option<Value>,
    decoded: Option<Value>,
}

impl InterceptedRequest {
    pub fn from_parts(parts: request::Parts, buffer: Bytes) -> Self {
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Self {
            id: Uuid::new_v4(),
            parts,
            url,
            buffer,
            json: None,
            decoded: None,
        }
    }

    /// Correlates log lines of the request and response phases.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Path and query of the request, e.g. `/api/users/app-config?x=1`.
    /// Patch hooks match on this string exactly.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.parts.headers
    }

    /// Raw buffered body as received from the client.
    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    pub(crate) fn set_decoded_json(&mut self, value: Value) {
        self.decoded = Some(value.clone());
        self.json = Some(value);
    }

    /// Whether a callback changed the decoded JSON.
    pub fn json_changed(&self) -> bool {
        self.json != self.decoded
    }

    /// Build the request to forward. The body is re-serialized only when
    /// the JSON changed; otherwise the original bytes are sent.
    pub fn to_request(&self) -> Request<Body> {
        let mut headers = self.parts.headers.clone();
        let body = match (self.json_changed(), &self.json) {
            (true, Some(value)) => encode_json(&mut headers, value, self.buffer.clone()),
            _ => self.buffer.clone(),
        };
        self.rebuild(headers, Body::from(body))
    }

    /// Build the request to forward with a body that was never buffered,
    /// e.g. one over the size limit. Callback edits to `json` are not applied.
    pub fn to_request_with_body(&self, body: Body) -> Request<Body> {
        self.rebuild(self.parts.headers.clone(), body)
    }

    fn rebuild(&self, headers: HeaderMap, body: Body) -> Request<Body> {
        let mut request = Request::new(body);
        *request.method_mut() = self.parts.method.clone();
        *request.uri_mut() = self.parts.uri.clone();
        *request.version_mut() = self.parts.version;
        *request.headers_mut() = headers;
        request
    }
}

/// A buffered response as seen by the response hooks.
#[derive(Debug)]
pub struct InterceptedResponse {
    parts: response::Parts,
    buffer: Bytes,
    raw_body: Option<String>,
    /// Decoded body; present only for a non-empty body that parsed as JSON
    pub json: Option<Value>,
    decoded: Option<Value>,
}

impl InterceptedResponse {
    pub fn from_parts(parts: response::Parts, buffer: Bytes) -> Self {
        Self {
            parts,
            buffer,
            raw_body: None,
            json: None,
            decoded: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.parts.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.parts.headers
    }

    pub fn buffer(&self) -> &Bytes {
        &self.buffer
    }

    /// Body decoded as UTF-8 text; `None` for an empty or undecoded body.
    pub fn raw_body(&self) -> Option<&str> {
        self.raw_body.as_deref()
    }

    pub(crate) fn set_decoded(&mut self, text: Option<String>, json: Option<Value>) {
        self.raw_body = text;
        self.decoded = json.clone();
        self.json = json;
    }

    pub fn json_changed(&self) -> bool {
        self.json != self.decoded
    }

    /// Rebuild the response to return to the client.
    pub fn into_response(self) -> Response<Body> {
        let changed = self.json_changed();
        let mut parts = self.parts;
        let body = match (changed, &self.json) {
            (true, Some(value)) => encode_json(&mut parts.headers, value, self.buffer),
            _ => self.buffer,
        };
        Response::from_parts(parts, Body::from(body))
    }

    /// Rebuild the response around a body that was never buffered. Status
    /// and header edits apply; `json` edits do not.
    pub fn into_response_with_body(self, body: Body) -> Response<Body> {
        if self.json_changed() {
            warn!("Response body was not buffered, JSON edits are dropped");
        }
        Response::from_parts(self.parts, body)
    }
}

fn encode_json(headers: &mut HeaderMap, value: &Value, original: Bytes) -> Bytes {
    match serde_json::to_vec(value) {
        Ok(encoded) => {
            headers.remove(TRANSFER_ENCODING);
            headers.insert(CONTENT_LENGTH, HeaderValue::from(encoded.len()));
            Bytes::from(encoded)
        }
        Err(e) => {
            warn!("Failed to re-encode modified JSON body, forwarding original: {}", e);
            original
        }
    }
}
