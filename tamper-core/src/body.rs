//! Body buffering and decoding.

use crate::config::BodyLimits;
use crate::error::BodyReadError;
use bytes::{Bytes, BytesMut};
use hudsucker::hyper::{body::HttpBody, Body};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of decoding one fully buffered body.
#[derive(Debug)]
pub enum DecodedBody {
    /// Zero-length buffer: no text, no JSON
    Empty,
    /// Valid JSON
    Json { text: String, value: Value },
    /// Non-empty text that did not parse as JSON
    Text {
        text: String,
        error: serde_json::Error,
    },
}

impl DecodedBody {
    pub fn text(&self) -> Option<&str> {
        match self {
            DecodedBody::Empty => None,
            DecodedBody::Json { text, .. } | DecodedBody::Text { text, .. } => Some(text),
        }
    }

    pub fn into_parts(self) -> (Option<String>, Option<Value>) {
        match self {
            DecodedBody::Empty => (None, None),
            DecodedBody::Json { text, value } => (Some(text), Some(value)),
            DecodedBody::Text { text, .. } => (Some(text), None),
        }
    }
}

/// Decode a complete buffer as UTF-8 text and, when possible, JSON.
///
/// Invalid UTF-8 sequences are replaced with U+FFFD. The buffer is always the
/// whole body, so a multi-byte sequence is never split.
pub fn decode(buffer: &[u8]) -> DecodedBody {
    if buffer.is_empty() {
        return DecodedBody::Empty;
    }

    let text = String::from_utf8_lossy(buffer).into_owned();
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => DecodedBody::Json { text, value },
        Err(error) => DecodedBody::Text { text, error },
    }
}

/// A request or response body after buffering.
#[derive(Debug)]
pub enum BufferedBody {
    /// The whole body, at most `max_body_bytes` long
    Complete(Bytes),
    /// Larger than the limit. Yields the already read prefix followed by the
    /// rest of the original stream, so the bytes arrive unchanged.
    Oversized(Body),
}

enum Capture {
    Complete(Bytes),
    Overflow(Bytes),
}

/// Read chunks until the body ends or grows past `max` bytes.
async fn capture(body: &mut Body, max: usize) -> Result<Capture, BodyReadError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| BodyReadError::Stream(e.to_string()))?;
        let overflow = buffer.len() + chunk.len() > max;
        buffer.extend_from_slice(&chunk);
        if overflow {
            return Ok(Capture::Overflow(buffer.freeze()));
        }
    }
    Ok(Capture::Complete(buffer.freeze()))
}

/// Prepend `prefix` to what is left of `rest`.
fn chain(prefix: Bytes, mut rest: Body) -> Body {
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        if sender.send_data(prefix).await.is_err() {
            return;
        }
        while let Some(chunk) = rest.data().await {
            match chunk {
                Ok(chunk) => {
                    if sender.send_data(chunk).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    warn!("Upstream body stream failed while passing through: {}", e);
                    sender.abort();
                    return;
                }
            }
        }
        if let Ok(Some(trailers)) = rest.trailers().await {
            let _ = sender.send_trailers(trailers).await;
        }
    });
    body
}

/// Buffer a hyper body, bounded by the configured size and read timeout.
///
/// At most `max_body_bytes` plus one chunk is held in memory; a longer body
/// comes back as [`BufferedBody::Oversized`] and is streamed on.
pub async fn read_body(mut body: Body, limits: &BodyLimits) -> Result<BufferedBody, BodyReadError> {
    let captured = timeout(limits.read_timeout(), capture(&mut body, limits.max_body_bytes))
        .await
        .map_err(|_| BodyReadError::Timeout)??;

    match captured {
        Capture::Complete(bytes) => {
            debug!("Buffered body of {} bytes", bytes.len());
            Ok(BufferedBody::Complete(bytes))
        }
        Capture::Overflow(prefix) => {
            debug!(
                "Body exceeds {} bytes after {} buffered, streaming the rest",
                limits.max_body_bytes,
                prefix.len()
            );
            Ok(BufferedBody::Oversized(chain(prefix, body)))
        }
    }
}
