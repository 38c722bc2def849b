//! Object-safe proxy surface, so test code can swap a real proxy for a no-op one.

use crate::config::ProxyMode;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::hooks::{RequestCallback, ResponseHook};
use crate::json::ArrayLocator;
use crate::proxy::HttpProxy;
use crate::Result;
use async_trait::async_trait;
use hudsucker::hyper::StatusCode;
use serde_json::Value;
use std::sync::Arc;

pub type ResponseCallback = Arc<dyn Fn(&InterceptedRequest, &mut InterceptedResponse) + Send + Sync>;

#[async_trait]
pub trait ProxyHandle: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;

    fn proxy_type(&self) -> ProxyMode;

    fn client_endpoint_url(&self) -> String;

    fn description(&self) -> String;

    fn on_request(&self, callback: RequestCallback);

    fn on_request_header_modify(&self, callback: RequestCallback);

    fn on_request_body_modify(&self, callback: RequestCallback);

    fn add_on_response_hook(&self, hook: ResponseCallback);

    fn modify_field_in_response(&self, request_url: &str, field: &str, value: Value);

    fn modify_array_element_in_response(
        &self,
        request_url: &str,
        locator: ArrayLocator,
        property: &str,
        value: Value,
    );

    fn modify_element_value_in_response(
        &self,
        request_url: &str,
        locator: ArrayLocator,
        property: &str,
        nested_key: &str,
        value: Value,
    );

    fn modify_response_status_code(&self, request_url: &str, status: StatusCode);

    fn clear_hooks(&self);
}

#[async_trait]
impl ProxyHandle for HttpProxy {
    async fn start(&self) -> Result<()> {
        HttpProxy::start(self).await
    }

    async fn shutdown(&self) -> Result<()> {
        HttpProxy::shutdown(self).await
    }

    fn proxy_type(&self) -> ProxyMode {
        HttpProxy::proxy_type(self)
    }

    fn client_endpoint_url(&self) -> String {
        HttpProxy::client_endpoint_url(self)
    }

    fn description(&self) -> String {
        HttpProxy::description(self)
    }

    fn on_request(&self, callback: RequestCallback) {
        HttpProxy::on_request(self, move |req| callback(req));
    }

    fn on_request_header_modify(&self, callback: RequestCallback) {
        HttpProxy::on_request_header_modify(self, move |req| callback(req));
    }

    fn on_request_body_modify(&self, callback: RequestCallback) {
        HttpProxy::on_request_body_modify(self, move |req| callback(req));
    }

    fn add_on_response_hook(&self, hook: ResponseCallback) {
        HttpProxy::add_response_hook(self, ResponseHook::custom(move |req, res| hook(req, res)));
    }

    fn modify_field_in_response(&self, request_url: &str, field: &str, value: Value) {
        HttpProxy::modify_field_in_response(self, request_url, field, value);
    }

    fn modify_array_element_in_response(
        &self,
        request_url: &str,
        locator: ArrayLocator,
        property: &str,
        value: Value,
    ) {
        HttpProxy::modify_array_element_in_response(self, request_url, locator, property, value);
    }

    fn modify_element_value_in_response(
        &self,
        request_url: &str,
        locator: ArrayLocator,
        property: &str,
        nested_key: &str,
        value: Value,
    ) {
        HttpProxy::modify_element_value_in_response(self, request_url, locator, property, nested_key, value);
    }

    fn modify_response_status_code(&self, request_url: &str, status: StatusCode) {
        HttpProxy::modify_response_status_code(self, request_url, status);
    }

    fn clear_hooks(&self) {
        HttpProxy::clear_hooks(self)
    }
}

/// Accepts every call and does nothing. Stands in for a proxy when a test
/// run should talk to its backend directly.
#[derive(Debug, Clone, Default)]
pub struct DummyProxy;

#[async_trait]
impl ProxyHandle for DummyProxy {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn proxy_type(&self) -> ProxyMode {
        ProxyMode::default()
    }

    fn client_endpoint_url(&self) -> String {
        String::new()
    }

    fn description(&self) -> String {
        "[dummy proxy]".to_string()
    }

    fn on_request(&self, _callback: RequestCallback) {}

    fn on_request_header_modify(&self, _callback: RequestCallback) {}

    fn on_request_body_modify(&self, _callback: RequestCallback) {}

    fn add_on_response_hook(&self, _hook: ResponseCallback) {}

    fn modify_field_in_response(&self, _request_url: &str, _field: &str, _value: Value) {}

    fn modify_array_element_in_response(
        &self,
        _request_url: &str,
        _locator: ArrayLocator,
        _property: &str,
        _value: Value,
    ) {
    }

    fn modify_element_value_in_response(
        &self,
        _request_url: &str,
        _locator: ArrayLocator,
        _property: &str,
        _nested_key: &str,
        _value: Value,
    ) {
    }

    fn modify_response_status_code(&self, _request_url: &str, _status: StatusCode) {}

    fn clear_hooks(&self) {}
}
