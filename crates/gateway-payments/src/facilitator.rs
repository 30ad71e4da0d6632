//! x402 Facilitator Integration
//!
//! Instant-settlement payments are checked and settled by a remote
//! facilitator. The `PAYMENT-SIGNATURE` header carries a base64 JSON payment
//! payload; it is sent together with the gateway's requirements:
//!
//! ```text
//! POST {url}/verify  {x402Version, paymentPayload, paymentRequirements}
//!                    -> {isValid, invalidReason?, payer?}
//! POST {url}/settle  {x402Version, paymentPayload, paymentRequirements}
//!                    -> {success, errorReason?, transaction, network, payer?}
//! ```

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::decision::PaymentOption;
use crate::error::{PaymentError, Result};

const SERVICE: &str = "x402 facilitator";

/// Default public facilitator
pub const DEFAULT_FACILITATOR_URL: &str = "https://x402.org/facilitator";

/// Settled payment as reported by the facilitator
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    /// On-chain transaction of the settlement
    pub transaction: String,

    pub payer: Option<String>,

    /// Raw `/settle` response body
    pub settlement: serde_json::Value,
}

impl SettlementReceipt {
    pub fn new(transaction: impl Into<String>, settlement: serde_json::Value) -> Self {
        let payer = settlement
            .get("payer")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Self {
            transaction: transaction.into(),
            payer,
            settlement,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction
    }
}

/// Facilitator interface
#[async_trait]
pub trait Facilitator: Send + Sync {
    /// Verify the payment header against `requirements`, then settle it
    async fn verify_and_settle(
        &self,
        payment_header: &str,
        requirements: &PaymentOption,
    ) -> Result<SettlementReceipt>;
}

/// Decode the base64 JSON payload carried by `PAYMENT-SIGNATURE`
pub fn decode_payment_payload(header: &str) -> Result<serde_json::Value> {
    let header = header.trim();
    let raw = STANDARD
        .decode(header)
        .or_else(|_| URL_SAFE.decode(header))
        .map_err(|e| PaymentError::InvalidProof(format!("payment header is not base64: {e}")))?;

    let payload: serde_json::Value = serde_json::from_slice(&raw)
        .map_err(|e| PaymentError::InvalidProof(format!("payment header is not JSON: {e}")))?;
    if !payload.is_object() {
        return Err(PaymentError::InvalidProof("payment payload must be an object".into()));
    }
    Ok(payload)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FacilitatorRequest<'a> {
    x402_version: u64,
    payment_payload: &'a serde_json::Value,
    payment_requirements: &'a PaymentOption,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponse {
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
    #[serde(default)]
    payer: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponse {
    success: bool,
    #[serde(default)]
    error_reason: Option<String>,
    #[serde(default)]
    transaction: Option<String>,
}

/// HTTP facilitator client
pub struct HttpFacilitator {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpFacilitator {
    /// Create a new facilitator client
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
        })
    }

    /// Create from environment variables
    pub fn from_env(timeout: Duration) -> Result<Self> {
        let base_url = std::env::var("X402_FACILITATOR_URL")
            .unwrap_or_else(|_| DEFAULT_FACILITATOR_URL.to_string());
        let api_key = std::env::var("X402_CDP_API_KEY").ok();

        Self::new(base_url, api_key, timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST to the facilitator and read the JSON body, whatever the status
    ///
    /// Facilitators report rejections in the body, sometimes with a 4xx.
    async fn call(&self, path: &str, body: &FacilitatorRequest<'_>) -> Result<serde_json::Value> {
        let mut request = self
            .client
            .post(format!("{}/{path}", self.base_url))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::from_http(SERVICE, &e))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(PaymentError::UpstreamUnavailable {
                service: SERVICE.into(),
                reason: format!("{path} returned {status}"),
            });
        }

        response.json().await.map_err(|e| {
            tracing::warn!(path, status = %status, error = %e, "Unreadable facilitator response");
            PaymentError::unavailable(SERVICE, e)
        })
    }
}

#[async_trait]
impl Facilitator for HttpFacilitator {
    async fn verify_and_settle(
        &self,
        payment_header: &str,
        requirements: &PaymentOption,
    ) -> Result<SettlementReceipt> {
        let payload = decode_payment_payload(payment_header)?;
        let body = FacilitatorRequest {
            x402_version: payload
                .get("x402Version")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(1),
            payment_payload: &payload,
            payment_requirements: requirements,
        };

        let verified: VerifyResponse = serde_json::from_value(self.call("verify", &body).await?)
            .map_err(|e| PaymentError::unavailable(SERVICE, e))?;
        if !verified.is_valid {
            let reason = verified.invalid_reason.unwrap_or_else(|| "unspecified".into());
            tracing::warn!(reason = %reason, payer = ?verified.payer, "x402 verification failed");
            return Err(PaymentError::PaymentRejected(reason));
        }

        let raw = self.call("settle", &body).await?;
        let settled: SettleResponse =
            serde_json::from_value(raw.clone()).map_err(|e| PaymentError::unavailable(SERVICE, e))?;
        if !settled.success {
            let reason = settled.error_reason.unwrap_or_else(|| "unspecified".into());
            tracing::warn!(reason = %reason, payer = ?verified.payer, "x402 settlement failed");
            return Err(PaymentError::PaymentRejected(reason));
        }

        let transaction = settled
            .transaction
            .filter(|tx| !tx.is_empty())
            .ok_or_else(|| PaymentError::PaymentRejected("settlement has no transaction".into()))?;

        tracing::info!(transaction = %transaction, payer = ?verified.payer, "x402 payment settled");
        Ok(SettlementReceipt::new(transaction, raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::BASE_USDC;
    use axum::{Json, Router, routing::post};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};

    fn requirements() -> PaymentOption {
        PaymentOption::exact_usdc("$0.001", "eip155:8453", "0xpay", BASE_USDC).unwrap()
    }

    fn payment_header() -> String {
        STANDARD.encode(
            json!({
                "x402Version": 1,
                "scheme": "exact",
                "network": "eip155:8453",
                "payload": {"signature": "0xsig"}
            })
            .to_string(),
        )
    }

    /// Serve a facilitator on a local port that answers with fixed bodies
    async fn serve(verify: Value, settle: Value) -> (String, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (on_verify, on_settle) = (seen.clone(), seen.clone());

        let app = Router::new()
            .route(
                "/verify",
                post(move |Json(body): Json<Value>| {
                    on_verify.lock().unwrap().push(body);
                    let verify = verify.clone();
                    async move { Json(verify) }
                }),
            )
            .route(
                "/settle",
                post(move |Json(body): Json<Value>| {
                    on_settle.lock().unwrap().push(body);
                    let settle = settle.clone();
                    async move { Json(settle) }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (format!("http://{addr}"), seen)
    }

    #[test]
    fn test_decode_payment_payload() {
        assert_eq!(decode_payment_payload(&payment_header()).unwrap()["x402Version"], 1);
        assert!(matches!(decode_payment_payload("sig"), Err(PaymentError::InvalidProof(_))));
        assert!(matches!(
            decode_payment_payload(&STANDARD.encode("[1,2]")),
            Err(PaymentError::InvalidProof(_))
        ));
    }

    #[test]
    fn test_base_url_trimmed() {
        let facilitator =
            HttpFacilitator::new("https://x402.org/facilitator/", Some(String::new()), Duration::from_secs(5))
                .unwrap();
        assert_eq!(facilitator.base_url(), "https://x402.org/facilitator");
        assert!(facilitator.api_key.is_none());
    }

    #[tokio::test]
    async fn test_verify_then_settle_sends_requirements() {
        let (url, seen) = serve(
            json!({"isValid": true, "payer": "0xagent"}),
            json!({"success": true, "transaction": "0xtx", "network": "eip155:8453", "payer": "0xagent"}),
        )
        .await;
        let facilitator = HttpFacilitator::new(url, None, Duration::from_secs(5)).unwrap();

        let receipt = facilitator
            .verify_and_settle(&payment_header(), &requirements())
            .await
            .unwrap();
        assert_eq!(receipt.transaction_id(), "0xtx");
        assert_eq!(receipt.payer.as_deref(), Some("0xagent"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        for body in seen.iter() {
            assert_eq!(body["x402Version"], 1);
            assert_eq!(body["paymentPayload"]["payload"]["signature"], "0xsig");
            assert_eq!(body["paymentRequirements"]["payTo"], "0xpay");
            assert_eq!(body["paymentRequirements"]["maxAmountRequired"], "1000");
        }
    }

    #[tokio::test]
    async fn test_invalid_payment_is_not_settled() {
        let (url, seen) = serve(
            json!({"isValid": false, "invalidReason": "insufficient_funds"}),
            json!({"success": true, "transaction": "0xtx"}),
        )
        .await;
        let facilitator = HttpFacilitator::new(url, None, Duration::from_secs(5)).unwrap();

        let err = facilitator
            .verify_and_settle(&payment_header(), &requirements())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::PaymentRejected(reason) if reason == "insufficient_funds"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_settlement_rejected() {
        let (url, _) = serve(
            json!({"isValid": true}),
            json!({"success": false, "errorReason": "invalid_transaction_state", "transaction": ""}),
        )
        .await;
        let facilitator = HttpFacilitator::new(url, None, Duration::from_secs(5)).unwrap();

        let err = facilitator
            .verify_and_settle(&payment_header(), &requirements())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::PaymentRejected(reason) if reason == "invalid_transaction_state"));
    }

    #[tokio::test]
    async fn test_undecodable_header_never_reaches_facilitator() {
        let (url, seen) = serve(json!({"isValid": true}), json!({"success": true})).await;
        let facilitator = HttpFacilitator::new(url, None, Duration::from_secs(5)).unwrap();

        let err = facilitator
            .verify_and_settle("not base64 json", &requirements())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidProof(_)));
        assert!(seen.lock().unwrap().is_empty());
    }
}
