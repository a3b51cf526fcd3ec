//! Generic webhook: external events → workflow trigger.
//!
//! `POST /webhooks/generic` takes `{workflow_name, inputs, signature?}`.
//! With a configured secret, the request must carry a valid HMAC-SHA256
//! signature (hex): either the `x-weft-signature` header computed over the
//! raw request body, or the body's `signature` field computed over
//! `"{workflow_name}\n" + compact JSON of inputs`. Triggered runs go through
//! a bounded worker pool; saturation answers `503` rather than queueing
//! without bound.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

use weft::EngineError;

use crate::app::AppState;
use crate::error::{ApiError, ApiResult};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "x-weft-signature";

#[derive(Debug, Deserialize)]
struct WebhookBody {
    workflow_name: String,
    #[serde(default)]
    inputs: Value,
    #[serde(default)]
    signature: Option<String>,
}

fn valid_signature(secret: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim_start_matches("sha256=")) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(&signature).is_ok()
}

pub async fn generic(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    raw_body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let body: WebhookBody = serde_json::from_slice(&raw_body)
        .map_err(|e| ApiError(EngineError::ConfigParse(format!("webhook body: {}", e))))?;

    if let Some(ref secret) = state.webhook_secret {
        let header_sig = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        let ok = match (header_sig, body.signature.as_deref()) {
            (Some(sig), _) => valid_signature(secret, &raw_body, sig),
            (None, Some(sig)) => {
                let message = format!(
                    "{}\n{}",
                    body.workflow_name,
                    serde_json::to_string(&body.inputs).unwrap_or_default()
                );
                valid_signature(secret, message.as_bytes(), sig)
            }
            (None, None) => false,
        };
        if !ok {
            warn!(workflow = %body.workflow_name, "webhook signature rejected");
            return Ok((
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "invalid signature" })),
            ));
        }
    }

    let plan = state
        .catalog
        .get(&body.workflow_name)
        .ok_or_else(|| ApiError(EngineError::WorkflowNotFound(body.workflow_name.clone())))?
        .clone();

    // Bound concurrent triggered runs; reject instead of queueing unboundedly.
    let Ok(permit) = state.webhook_permits.clone().try_acquire_owned() else {
        return Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "webhook worker pool is saturated" })),
        ));
    };

    let inputs = match body.inputs {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => Default::default(),
        _ => {
            return Err(ApiError(EngineError::ConfigParse(
                "webhook `inputs` must be an object".to_string(),
            )))
        }
    };

    let (run_id, handle) = state
        .engine
        .start_detached(plan, inputs, weft::RunOptions::default())
        .await?;
    info!(run_id = %run_id, workflow = %body.workflow_name, "webhook triggered run");
    // The permit lives as long as the run.
    tokio::spawn(async move {
        let _permit = permit;
        let _ = handle.await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "run_id": run_id })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verifies_and_rejects() {
        let secret = "shared-secret";
        let message = b"payload bytes";
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message);
        let hex_sig = hex::encode(mac.finalize().into_bytes());

        assert!(valid_signature(secret, message, &hex_sig));
        assert!(valid_signature(secret, message, &format!("sha256={}", hex_sig)));
        assert!(!valid_signature(secret, b"other bytes", &hex_sig));
        assert!(!valid_signature("wrong", message, &hex_sig));
        assert!(!valid_signature(secret, message, "not-hex!"));
    }
}
