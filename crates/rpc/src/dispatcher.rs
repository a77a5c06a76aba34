//! JSON-RPC 2.0 envelope handling: single requests and ordered batches.
//!
//! Malformed JSON and non-conforming envelopes are HTTP 400. Inside a
//! well-formed batch, a bad element yields a per-element `-32600`/`-32602`
//! error while the batch itself rides HTTP 200, preserving input order.
//! Logical failures of valid calls are always HTTP 200.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};
use tokio::time::Instant;
use tracing::debug;

use crate::error::RpcError;
use crate::metrics::record_method_latency;
use crate::{RpcState, handlers};

struct Call {
    id: Value,
    method: String,
    params: Vec<Value>,
}

fn error_response(id: Value, error: &RpcError) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": error.to_value() })
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

/// Check the envelope: `jsonrpc == "2.0"`, a string `method`, `params` an
/// array (absent means empty), `id` a string, number, or null.
fn validate_envelope(request: &Value) -> Result<Call, (Value, RpcError)> {
    let Some(object) = request.as_object() else {
        return Err((
            Value::Null,
            RpcError::invalid_request("request must be an object"),
        ));
    };

    let id = object.get("id").cloned().unwrap_or(Value::Null);
    if !matches!(id, Value::Null | Value::String(_) | Value::Number(_)) {
        return Err((
            Value::Null,
            RpcError::invalid_request("id must be a string, a number, or null"),
        ));
    }

    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err((id, RpcError::invalid_request("jsonrpc must be \"2.0\"")));
    }

    let Some(method) = object.get("method").and_then(Value::as_str) else {
        return Err((id, RpcError::invalid_request("method must be a string")));
    };

    let params = match object.get("params") {
        None => Vec::new(),
        Some(Value::Array(params)) => params.clone(),
        Some(_) => return Err((id, RpcError::invalid_params("params must be an array"))),
    };

    Ok(Call {
        id,
        method: method.to_string(),
        params,
    })
}

async fn execute(state: &RpcState, call: Call) -> Value {
    state.metrics.requests_total.increment(1);
    let started = Instant::now();
    let outcome = handlers::route_method(state, &call.method, &call.params).await;
    record_method_latency(started.elapsed(), &call.method);

    match outcome {
        Ok(result) => result_response(call.id, result),
        Err(error) => {
            state.metrics.errors_total.increment(1);
            debug!(
                method = %call.method,
                code = error.code.code(),
                message = %error.message,
                "rpc error"
            );
            error_response(call.id, &error)
        }
    }
}

pub(crate) async fn handle_rpc(
    State(state): State<RpcState>,
    body: String,
) -> (StatusCode, Json<Value>) {
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_response(
                    Value::Null,
                    &RpcError::parse_error(format!("parse error: {e}")),
                )),
            );
        }
    };

    let started = Instant::now();
    let response = match parsed {
        Value::Array(requests) => {
            if requests.is_empty() {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(error_response(
                        Value::Null,
                        &RpcError::invalid_request("batch must not be empty"),
                    )),
                );
            }
            let mut responses = Vec::with_capacity(requests.len());
            for request in requests {
                let response = match validate_envelope(&request) {
                    Ok(call) => execute(&state, call).await,
                    Err((id, error)) => error_response(id, &error),
                };
                responses.push(response);
            }
            Value::Array(responses)
        }
        request @ Value::Object(_) => match validate_envelope(&request) {
            Ok(call) => execute(&state, call).await,
            Err((id, error)) => {
                return (StatusCode::BAD_REQUEST, Json(error_response(id, &error)));
            }
        },
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(error_response(
                    Value::Null,
                    &RpcError::invalid_request("request must be an object or an array"),
                )),
            );
        }
    };
    state
        .metrics
        .request_duration
        .record(started.elapsed().as_secs_f64());

    (StatusCode::OK, Json(response))
}
