use std::collections::BTreeMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PopulateError;

/// Upper bound passed as `limit` when listing a collection in one page.
pub const LIST_LIMIT: usize = 99_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Post,
    Patch,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Post => write!(f, "POST"),
            Method::Patch => write!(f, "PATCH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Value,
}

impl ApiRequest {
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            body,
        }
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Patch,
            path: path.into(),
            body,
        }
    }
}

/// A rejected or undeliverable submission. `status` is absent when the
/// request never got a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiFailure {
    pub status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    pub response: Value,
}

impl ApiFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            headers: BTreeMap::new(),
            response: Value::String(message.into()),
        }
    }
}

impl fmt::Display for ApiFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.response {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        match self.status {
            Some(status) => write!(f, "status {status}: {body}"),
            None => write!(f, "{body}"),
        }
    }
}

pub trait TrackingClient: Send + Sync {
    /// Lists every record of a collection.
    fn list(&self, path: &str) -> Result<Vec<Value>, PopulateError>;
    fn send(&self, request: &ApiRequest) -> Result<Value, ApiFailure>;
}

/// The server-assigned ID of a creation response. Group creations answer
/// with a list, in which case the first element's ID is used.
pub fn response_id(value: &Value) -> Option<String> {
    match value {
        Value::Array(items) => items.first().and_then(response_id),
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| map.get("info").and_then(response_id))
            .or_else(|| map.get("summary").and_then(response_id)),
        _ => None,
    }
}

#[derive(Clone)]
pub struct TrackingHttpClient {
    client: Client,
    base_url: String,
}

impl TrackingHttpClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        accept_invalid_certificates: bool,
    ) -> Result<Self, PopulateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("populate-scamplers/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PopulateError::ApiHttp(err.to_string()))?,
        );
        let mut key = HeaderValue::from_str(api_key.trim())
            .map_err(|err| PopulateError::ApiHttp(err.to_string()))?;
        key.set_sensitive(true);
        headers.insert("X-API-Key", key);

        let client = Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(accept_invalid_certificates)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| PopulateError::ApiHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Retries are reserved for listing, which is idempotent. Submissions
    /// are sent exactly once.
    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, PopulateError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(PopulateError::ApiHttp(err.to_string()));
                }
            }
        }
    }
}

impl TrackingClient for TrackingHttpClient {
    fn list(&self, path: &str) -> Result<Vec<Value>, PopulateError> {
        let url = self.url(path);
        let limit = LIST_LIMIT.to_string();
        let response = self.send_with_retries(|| {
            self.client.get(&url).query(&[("limit", limit.as_str())])
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "scamplers request failed".to_string());
            return Err(PopulateError::ApiStatus { status, message });
        }
        let body: Value = response
            .json()
            .map_err(|err| PopulateError::ApiDecode(err.to_string()))?;
        match body {
            Value::Array(items) => Ok(items),
            other => Err(PopulateError::ApiDecode(format!(
                "{path}: expected a JSON array, got {other}"
            ))),
        }
    }

    fn send(&self, request: &ApiRequest) -> Result<Value, ApiFailure> {
        let url = self.url(&request.path);
        let builder = match request.method {
            Method::Post => self.client.post(&url),
            Method::Patch => self.client.patch(&url),
        };
        let response = builder
            .json(&request.body)
            .send()
            .map_err(|err| ApiFailure::transport(err.to_string()))?;

        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect::<BTreeMap<_, _>>();
        let text = response
            .text()
            .map_err(|err| ApiFailure::transport(err.to_string()))?;
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if status.is_success() {
            Ok(body)
        } else {
            Err(ApiFailure {
                status: Some(status.as_u16()),
                headers,
                response: body,
            })
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn response_id_variants() {
        assert_eq!(response_id(&json!({"id": "a"})), Some("a".to_string()));
        assert_eq!(
            response_id(&json!({"info": {"id": "b"}})),
            Some("b".to_string())
        );
        assert_eq!(
            response_id(&json!([{"id": "c"}, {"id": "d"}])),
            Some("c".to_string())
        );
        assert_eq!(response_id(&json!("nope")), None);
    }

    #[test]
    fn failure_display() {
        let failure = ApiFailure {
            status: Some(422),
            headers: BTreeMap::new(),
            response: json!({"error": "duplicate"}),
        };
        assert_eq!(failure.to_string(), r#"status 422: {"error":"duplicate"}"#);
        assert_eq!(ApiFailure::transport("timed out").to_string(), "timed out");
    }
}
