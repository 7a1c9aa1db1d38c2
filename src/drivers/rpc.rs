//! JSON-RPC 2.0 transport shared by the ledger drivers.
//!
//! Backends disagree on envelope shapes (bare arrays, `{data: [...]}`,
//! `{value: ...}` context wrappers), so response bodies are interpreted
//! with an ordered list of named [`ParseStrategy`] values instead of
//! probing fields ad hoc.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// JSON-RPC error codes that mean "slow down" rather than "no".
const RATE_LIMIT_CODES: &[i64] = &[-32005, 429];

pub struct JsonRpcClient {
    client: Client,
    url: String,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str, timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("failed to build http client: {}", e)))?;
        Ok(Self::with_client(client, url, retry))
    }

    pub fn with_client(client: Client, url: &str, retry: RetryPolicy) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Underlying HTTP client, for non-RPC endpoints on the same backend.
    pub fn http(&self) -> &Client {
        &self.client
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Call `method`, retrying transient failures.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.retry
            .run(method, || self.call_once(method, params.clone()))
            .await
    }

    async fn call_once(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::trace!("rpc {} #{} -> {}", method, id, self.url);

        let response = self.client.post(&self.url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, method));
        }

        let envelope: Value = response.json().await?;
        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(rpc_error(method, error));
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Malformed(format!("{} response has no result", method)))
    }
}

/// Map a non-success HTTP status onto the error taxonomy.
pub fn classify_status(status: StatusCode, what: &str) -> Error {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::Transient(format!("{} returned status {}", what, status))
    } else {
        Error::Rejected(format!("{} returned status {}", what, status))
    }
}

fn rpc_error(method: &str, error: &Value) -> Error {
    let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let text = format!("{} failed with code {}: {}", method, code, message);
    let lowered = message.to_ascii_lowercase();
    if RATE_LIMIT_CODES.contains(&code)
        || lowered.contains("rate limit")
        || lowered.contains("too many requests")
    {
        Error::Transient(text)
    } else {
        Error::Rejected(text)
    }
}

/// A named way of extracting a `T` from a response body.
#[derive(Clone, Copy)]
pub struct ParseStrategy<T> {
    pub name: &'static str,
    pub parse: fn(&Value) -> Option<T>,
}

impl<T> ParseStrategy<T> {
    pub const fn new(name: &'static str, parse: fn(&Value) -> Option<T>) -> Self {
        Self { name, parse }
    }
}

/// Result of a successful strategy match.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed<T> {
    pub strategy: &'static str,
    pub value: T,
}

/// Try `strategies` in order and return the first match.
pub fn parse_with<T>(value: &Value, strategies: &[ParseStrategy<T>], what: &str) -> Result<Parsed<T>> {
    for strategy in strategies {
        match (strategy.parse)(value) {
            Some(parsed) => {
                tracing::trace!("{} parsed with strategy {:?}", what, strategy.name);
                return Ok(Parsed {
                    strategy: strategy.name,
                    value: parsed,
                });
            }
            None => tracing::trace!("{} did not match strategy {:?}", what, strategy.name),
        }
    }
    let tried: Vec<&str> = strategies.iter().map(|s| s.name).collect();
    Err(Error::Malformed(format!(
        "{} matched none of [{}]",
        what,
        tried.join(", ")
    )))
}

fn bare_array(value: &Value) -> Option<Vec<Value>> {
    value.as_array().cloned()
}

fn data_array(value: &Value) -> Option<Vec<Value>> {
    value.get("data")?.as_array().cloned()
}

fn value_array(value: &Value) -> Option<Vec<Value>> {
    value.get("value")?.as_array().cloned()
}

/// List envelopes seen across backends.
pub const LIST_STRATEGIES: &[ParseStrategy<Vec<Value>>] = &[
    ParseStrategy::new("bare array", bare_array),
    ParseStrategy::new("data wrapper", data_array),
    ParseStrategy::new("value wrapper", value_array),
];

fn bare_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn data_u64(value: &Value) -> Option<u64> {
    bare_u64(value.get("data")?)
}

fn value_u64(value: &Value) -> Option<u64> {
    bare_u64(value.get("value")?)
}

pub const HEIGHT_STRATEGIES: &[ParseStrategy<u64>] = &[
    ParseStrategy::new("bare number", bare_u64),
    ParseStrategy::new("data wrapper", data_u64),
    ParseStrategy::new("value wrapper", value_u64),
];

fn bare_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn data_string(value: &Value) -> Option<String> {
    bare_string(value.get("data")?)
}

fn digest_string(value: &Value) -> Option<String> {
    bare_string(value.get("digest")?)
}

pub const REFERENCE_STRATEGIES: &[ParseStrategy<String>] = &[
    ParseStrategy::new("bare string", bare_string),
    ParseStrategy::new("data wrapper", data_string),
    ParseStrategy::new("digest field", digest_string),
];

fn bare_bool(value: &Value) -> Option<bool> {
    value.as_bool()
}

fn data_bool(value: &Value) -> Option<bool> {
    value.get("data")?.as_bool()
}

fn consensus_word(value: &Value) -> Option<bool> {
    value.as_str().map(|s| s.eq_ignore_ascii_case("established"))
}

pub const FLAG_STRATEGIES: &[ParseStrategy<bool>] = &[
    ParseStrategy::new("bare bool", bare_bool),
    ParseStrategy::new("data wrapper", data_bool),
    ParseStrategy::new("consensus word", consensus_word),
];

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn client(server: &MockServer) -> JsonRpcClient {
        JsonRpcClient::new(
            &server.base_url(),
            Duration::from_secs(5),
            RetryPolicy::new(3, Duration::from_millis(1)),
        )
        .unwrap()
    }

    #[test]
    fn strategies_are_tried_in_order() {
        let wrapped = json!({"data": [1, 2, 3]});
        let parsed = parse_with(&wrapped, LIST_STRATEGIES, "list").unwrap();
        assert_eq!(parsed.strategy, "data wrapper");
        assert_eq!(parsed.value.len(), 3);

        let bare = json!([1]);
        assert_eq!(parse_with(&bare, LIST_STRATEGIES, "list").unwrap().strategy, "bare array");
    }

    #[test]
    fn unmatched_body_names_every_strategy() {
        let err = parse_with(&json!({"weird": true}), LIST_STRATEGIES, "list").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("bare array"));
        assert!(text.contains("value wrapper"));
    }

    #[test]
    fn heights_accept_numeric_strings() {
        let parsed = parse_with(&json!("123"), HEIGHT_STRATEGIES, "height").unwrap();
        assert_eq!(parsed.value, 123);
        let parsed = parse_with(&json!({"value": 9}), HEIGHT_STRATEGIES, "height").unwrap();
        assert_eq!(parsed.value, 9);
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "x").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "x").is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "x"),
            Error::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn returns_result_field() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/")
                .json_body_partial(r#"{"method": "getBlockNumber"}"#);
            then.status(200)
                .json_body(json!({"jsonrpc": "2.0", "id": 1, "result": 42}));
        });

        let result = client(&server).call("getBlockNumber", json!([])).await.unwrap();
        assert_eq!(result, json!(42));
        mock.assert();
    }

    #[tokio::test]
    async fn rpc_errors_are_rejections() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200).json_body(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": {"code": -32602, "message": "invalid params"}
            }));
        });

        let err = client(&server).call("send", json!([])).await.unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        mock.assert_hits(1);
    }

    #[tokio::test]
    async fn server_errors_are_retried_up_to_the_cap() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(503);
        });

        let err = client(&server).call("getBlockNumber", json!([])).await.unwrap_err();
        assert!(err.is_transient());
        mock.assert_hits(3);
    }
}
