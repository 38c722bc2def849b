//! Declarative response patches.
//!
//! Each constructor returns one [`ResponseHook`] that only acts on requests
//! whose `url` (path and query) equals `request_url` exactly. A missing
//! target is never an error: the hook reports [`HookOutcome::Skipped`] and
//! leaves the response as it was.
//!
//! ```text
//! GET /api/users/app-config
//! {
//!   "maintenanceRoutines": [
//!     { "featureName": "bill_payment",   "startTime": 61200000, "endTime": 61260000 },
//!     { "featureName": "top_up_payment", "startTime": 61200000, "endTime": 61260000,
//!       "days": [ { "name": "saturday", "isAllDay": true } ] }
//!   ]
//! }
//! ```
//!
//! * `array_element_replace("/api/users/app-config",
//!   ArrayLocator::new("maintenanceRoutines", "featureName", "top_up_payment"),
//!   "startTime", 123456)` rewrites the second routine's `startTime`.
//! * `nested_element_replace(..same locator.., "days", "name", "monday")`
//!   rewrites `days[0].name` of that routine.

use crate::error::ProxyError;
use crate::exchange::{InterceptedRequest, InterceptedResponse};
use crate::hooks::{HookOutcome, ResponseHook, SkipReason};
use crate::json::{self, ArrayLocator};
use crate::Result;
use hudsucker::hyper::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Run `patch` against the decoded JSON of responses to `request_url`.
fn json_hook<F>(label: String, request_url: String, patch: F) -> ResponseHook
where
    F: Fn(&mut Value) -> std::result::Result<(), json::PathMiss> + Send + Sync + 'static,
{
    ResponseHook::new(label.clone(), move |req: &InterceptedRequest, res: &mut InterceptedResponse| {
        if req.url() != request_url {
            return HookOutcome::Ignored;
        }

        let Some(body) = res.json.as_mut() else {
            debug!("{} skipped for {}: no JSON body", label, request_url);
            return HookOutcome::Skipped(SkipReason::NoJson);
        };

        match patch(body) {
            Ok(()) => HookOutcome::Applied,
            Err(miss) => {
                debug!("{} skipped for {}: {}", label, request_url, miss);
                HookOutcome::Skipped(miss.into())
            }
        }
    })
}

/// `json[field] = value`.
pub fn field_replace(request_url: impl Into<String>, field: impl Into<String>, value: impl Into<Value>) -> ResponseHook {
    let field = field.into();
    let value = value.into();
    let label = format!("modify_field({})", field);

    json_hook(label, request_url.into(), move |body| {
        json::set_field(body, &field, value.clone())
    })
}

/// Locate an element of an array field and set one of its properties.
pub fn array_element_replace(
    request_url: impl Into<String>,
    locator: ArrayLocator,
    property: impl Into<String>,
    value: impl Into<Value>,
) -> ResponseHook {
    let property = property.into();
    let value = value.into();
    let label = format!("modify_array_element({}[{}].{})", locator.array_path, locator.key, property);

    json_hook(label, request_url.into(), move |body| {
        let element = json::locate_mut(body, &locator)?;
        json::set_field(element, &property, value.clone())
    })
}

/// Locate an element of an array field, then set `nested_key` on the object
/// at index 0 of the array stored in its `property`.
pub fn nested_element_replace(
    request_url: impl Into<String>,
    locator: ArrayLocator,
    property: impl Into<String>,
    nested_key: impl Into<String>,
    value: impl Into<Value>,
) -> ResponseHook {
    let property = property.into();
    let nested_key = nested_key.into();
    let value = value.into();
    let label = format!(
        "modify_element_value({}[{}].{}[0].{})",
        locator.array_path, locator.key, property, nested_key
    );

    json_hook(label, request_url.into(), move |body| {
        let element = json::locate_mut(body, &locator)?;
        json::first_nested_object_mut(element, &property)?.insert(nested_key.clone(), value.clone());
        Ok(())
    })
}

/// Override the status code whenever the URL matches, JSON or not.
pub fn status_override(request_url: impl Into<String>, status: StatusCode) -> ResponseHook {
    let request_url = request_url.into();
    let label = format!("modify_status({})", status.as_u16());

    ResponseHook::new(label, move |req: &InterceptedRequest, res: &mut InterceptedResponse| {
        if req.url() != request_url {
            return HookOutcome::Ignored;
        }
        res.set_status(status);
        HookOutcome::Applied
    })
}

/// Serializable form of the four patches, used by scenario files.
///
/// ```json
/// [
///   { "op": "field", "request_url": "/api/flags", "field": "darkMode", "value": true },
///   { "op": "status_code", "request_url": "/api/pay", "status": 503 }
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchSpec {
    Field {
        request_url: String,
        field: String,
        value: Value,
    },
    ArrayElement {
        request_url: String,
        #[serde(flatten)]
        locator: LocatorSpec,
        property: String,
        value: Value,
    },
    NestedElement {
        request_url: String,
        #[serde(flatten)]
        locator: LocatorSpec,
        property: String,
        nested_key: String,
        value: Value,
    },
    StatusCode {
        request_url: String,
        status: u16,
    },
}

/// Locator fields as they appear inline in a [`PatchSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatorSpec {
    pub array_path: String,
    pub locator_key: String,
    pub locator_value: Value,
}

impl From<LocatorSpec> for ArrayLocator {
    fn from(spec: LocatorSpec) -> Self {
        ArrayLocator::new(spec.array_path, spec.locator_key, spec.locator_value)
    }
}

impl PatchSpec {
    /// Parse a JSON array of patches.
    pub fn parse_list(json: &str) -> Result<Vec<PatchSpec>> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn into_hook(self) -> Result<ResponseHook> {
        let hook = match self {
            PatchSpec::Field { request_url, field, value } => field_replace(request_url, field, value),
            PatchSpec::ArrayElement {
                request_url,
                locator,
                property,
                value,
            } => array_element_replace(request_url, locator.into(), property, value),
            PatchSpec::NestedElement {
                request_url,
                locator,
                property,
                nested_key,
                value,
            } => nested_element_replace(request_url, locator.into(), property, nested_key, value),
            PatchSpec::StatusCode { request_url, status } => {
                let status = StatusCode::from_u16(status).map_err(|e| {
                    ProxyError::Configuration(format!("Invalid status code {}: {}", status, e))
                })?;
                status_override(request_url, status)
            }
        };
        Ok(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hudsucker::hyper::{Request, Response};
    use serde_json::json;

    fn exchange(url: &str, body: Value) -> (InterceptedRequest, InterceptedResponse) {
        let (req_parts, _) = Request::builder().uri(url).body(()).unwrap().into_parts();
        let (res_parts, _) = Response::builder().status(200).body(()).unwrap().into_parts();
        let text = body.to_string();
        let mut res = InterceptedResponse::from_parts(res_parts, Bytes::from(text.clone()));
        res.set_decoded(Some(text), Some(body));
        (InterceptedRequest::from_parts(req_parts, Bytes::new()), res)
    }

    fn app_config() -> Value {
        json!({
            "maintenanceRoutines": [
                {"featureName": "bill_payment", "startTime": 61200000, "endTime": 61260000},
                {
                    "featureName": "fcd_own_account_transfer",
                    "startTime": 61200000,
                    "endTime": 61260000,
                    "days": [
                        {"name": "saturday", "startTime": 61200000, "endTime": 147600000, "isAllDay": true},
                        {"name": "sunday", "startTime": 61200000, "endTime": 147600000, "isAllDay": true}
                    ]
                }
            ]
        })
    }

    #[test]
    fn test_field_replace() {
        let hook = field_replace("/api/flags", "darkMode", true);
        let (req, mut res) = exchange("/api/flags", json!({"darkMode": false, "other": 1}));
        assert_eq!(hook.apply(&req, &mut res), HookOutcome::Applied);
        assert_eq!(res.json, Some(json!({"darkMode": true, "other": 1})));
    }

    #[test]
    fn test_field_replace_without_json_is_skipped() {
        let hook = field_replace("/api/flags", "darkMode", true);
        let (req, mut res) = exchange("/api/flags", json!(null));
        res.set_decoded(Some("<html/>".into()), None);
        assert_eq!(hook.apply(&req, &mut res), HookOutcome::Skipped(SkipReason::NoJson));
        assert_eq!(res.json, None);
    }

    #[test]
    fn test_url_match_is_exact() {
        let hook = field_replace("/api/flags", "darkMode", true);
        for url in ["/api/flags/", "/API/flags", "/api/flags?x=1", "/api"] {
            let (req, mut res) = exchange(url, json!({"darkMode": false}));
            assert_eq!(hook.apply(&req, &mut res), HookOutcome::Ignored, "{}", url);
            assert!(!res.json_changed());
        }
    }

    #[test]
    fn test_nested_element_replace() {
        let locator = ArrayLocator::new("maintenanceRoutines", "featureName", "fcd_own_account_transfer");
        let hook = nested_element_replace("/api/users/app-config", locator, "days", "name", "monday");
        let (req, mut res) = exchange("/api/users/app-config", app_config());

        assert_eq!(hook.apply(&req, &mut res), HookOutcome::Applied);
        let body = res.json.unwrap();
        assert_eq!(body["maintenanceRoutines"][1]["days"][0]["name"], "monday");
        assert_eq!(body["maintenanceRoutines"][1]["days"][1]["name"], "sunday");
    }

    #[test]
    fn test_nested_element_missing_array_is_skipped() {
        let locator = ArrayLocator::new("maintenanceRoutines", "featureName", "bill_payment");
        let hook = nested_element_replace("/api/users/app-config", locator, "days", "name", "monday");
        let (req, mut res) = exchange("/api/users/app-config", app_config());

        assert_eq!(
            hook.apply(&req, &mut res),
            HookOutcome::Skipped(SkipReason::Path(json::PathMiss::MissingField("days".into())))
        );
        assert!(!res.json_changed());
    }

    #[test]
    fn test_status_override_ignores_body() {
        let hook = status_override("/api/pay", StatusCode::SERVICE_UNAVAILABLE);
        let (req, mut res) = exchange("/api/pay", json!({"ok": true}));
        res.set_decoded(None, None);
        assert_eq!(hook.apply(&req, &mut res), HookOutcome::Applied);
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_patch_spec_parsing() {
        let specs = PatchSpec::parse_list(
            r#"[
                {"op": "field", "request_url": "/a", "field": "f", "value": 1},
                {"op": "array_element", "request_url": "/b", "array_path": "items",
                 "locator_key": "id", "locator_value": "x", "property": "p", "value": false},
                {"op": "nested_element", "request_url": "/c", "array_path": "items",
                 "locator_key": "id", "locator_value": 3, "property": "days",
                 "nested_key": "name", "value": "monday"},
                {"op": "status_code", "request_url": "/d", "status": 503}
            ]"#,
        )
        .unwrap();

        assert_eq!(specs.len(), 4);
        assert!(matches!(&specs[1], PatchSpec::ArrayElement { locator, .. } if locator.locator_value == json!("x")));
        for spec in specs {
            assert!(spec.into_hook().is_ok());
        }
    }

    #[test]
    fn test_patch_spec_rejects_bad_status() {
        let spec = PatchSpec::StatusCode {
            request_url: "/d".into(),
            status: 42,
        };
        assert!(matches!(spec.into_hook(), Err(ProxyError::Configuration(_))));
        assert!(PatchSpec::parse_list(r#"[{"op": "rename"}]"#).is_err());
    }
}
