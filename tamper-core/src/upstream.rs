//! Outbound client the proxy forwards requests with.
//!
//! Certificate verification can be disabled for this client only, so a proxy
//! in front of a service with a self-signed certificate works without
//! weakening any other TLS connection in the process.

use hudsucker::hyper::{client::HttpConnector, Body, Client};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, Error as TlsError, ServerName};
use std::sync::Arc;
use std::time::SystemTime;

pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// Accepts any server certificate.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

fn insecure_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth()
}

/// Build the client used for upstream connections.
pub fn build_client(accept_invalid_certs: bool) -> UpstreamClient {
    let builder = HttpsConnectorBuilder::new();
    let builder = if accept_invalid_certs {
        builder.with_tls_config(insecure_tls_config())
    } else {
        builder.with_native_roots()
    };

    let https = builder.https_or_http().enable_http1().build();

    Client::builder()
        .http1_title_case_headers(true)
        .http1_preserve_header_case(true)
        .build(https)
}
