//! Lightning Invoice Proofs (L402)
//!
//! A caller proves payment of a Lightning invoice by presenting the
//! invoice preimage. `sha256(preimage)` is the payment hash, whose
//! settlement status is looked up at the invoice provider.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{PaymentError, Result};

const SERVICE: &str = "invoice provider";

/// Default Alby invoices endpoint
pub const ALBY_INVOICES_URL: &str = "https://api.getalby.com/invoices";

/// Preimage accepted without lookup outside production
pub const DEV_BYPASS_PREIMAGE: &str = "secret_proof_of_payment";

/// Parsed `L402 <preimage>:<signature>` credential
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L402Proof {
    preimage: String,
    signature: String,
}

impl L402Proof {
    /// Parse the credential part after the `L402 ` scheme
    pub fn parse(credential: &str) -> Result<Self> {
        let (preimage, signature) = credential
            .trim()
            .split_once(':')
            .ok_or_else(|| PaymentError::InvalidProof("expected <preimage>:<signature>".into()))?;

        if preimage.is_empty() {
            return Err(PaymentError::InvalidProof("empty preimage".into()));
        }

        Ok(Self {
            preimage: preimage.to_string(),
            signature: signature.to_string(),
        })
    }

    pub fn preimage(&self) -> &str {
        &self.preimage
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_dev_bypass(&self) -> bool {
        self.preimage == DEV_BYPASS_PREIMAGE
    }

    /// Hex sha256 of the hex-decoded preimage
    pub fn payment_hash(&self) -> Result<String> {
        let bytes = hex::decode(&self.preimage)
            .map_err(|e| PaymentError::InvalidProof(format!("preimage is not hex: {e}")))?;
        Ok(hex::encode(Sha256::digest(bytes)))
    }
}

/// Invoice settlement lookup
#[async_trait]
pub trait InvoiceStatus: Send + Sync {
    /// Whether the invoice with `payment_hash` has been paid
    async fn is_settled(&self, payment_hash: &str) -> Result<bool>;
}

#[derive(Deserialize)]
struct InvoiceResponse {
    #[serde(default)]
    settled: bool,
}

/// Alby API client
pub struct AlbyInvoiceClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl AlbyInvoiceClient {
    pub fn new(
        base_url: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        })
    }

    /// Create from environment variables
    pub fn from_env(timeout: Duration) -> Result<Self> {
        let access_token = std::env::var("ALBY_ACCESS_TOKEN")
            .map_err(|_| PaymentError::Config("ALBY_ACCESS_TOKEN not set".into()))?;

        Self::new(ALBY_INVOICES_URL, access_token, timeout)
    }
}

#[async_trait]
impl InvoiceStatus for AlbyInvoiceClient {
    async fn is_settled(&self, payment_hash: &str) -> Result<bool> {
        let response = self
            .client
            .get(format!("{}/{payment_hash}", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| PaymentError::from_http(SERVICE, &e))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !response.status().is_success() {
            return Err(PaymentError::unavailable(
                SERVICE,
                format!("status {}", response.status()),
            ));
        }

        let invoice: InvoiceResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::unavailable(SERVICE, e))?;

        tracing::debug!(payment_hash, settled = invoice.settled, "Checked invoice");
        Ok(invoice.settled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proof() {
        let proof = L402Proof::parse("00ff:sig").unwrap();
        assert_eq!(proof.preimage(), "00ff");
        assert_eq!(proof.signature(), "sig");
        assert!(!proof.is_dev_bypass());
    }

    #[test]
    fn test_parse_rejects_missing_separator() {
        assert!(matches!(L402Proof::parse("deadbeef"), Err(PaymentError::InvalidProof(_))));
        assert!(matches!(L402Proof::parse(":sig"), Err(PaymentError::InvalidProof(_))));
    }

    #[test]
    fn test_payment_hash() {
        // 32 zero bytes
        let proof = L402Proof::parse(&format!("{}:x", "00".repeat(32))).unwrap();
        assert_eq!(
            proof.payment_hash().unwrap(),
            "66687aadf862bd776c8fc18b8e9f8e20089714856ee233b3902a591d0d5f2925"
        );
    }

    #[test]
    fn test_non_hex_preimage() {
        let proof = L402Proof::parse("not-hex:sig").unwrap();
        assert!(matches!(proof.payment_hash(), Err(PaymentError::InvalidProof(_))));
    }

    #[test]
    fn test_dev_bypass_preimage() {
        let proof = L402Proof::parse("secret_proof_of_payment:anything").unwrap();
        assert!(proof.is_dev_bypass());
    }
}
