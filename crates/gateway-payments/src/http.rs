//! axum glue: request extraction and response augmentation

use axum::{
    Json,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::arbitrator::PaymentRequest;
use crate::decision::{Denial, Grant, headers};

/// JSON body of a denied request
#[derive(Debug, Serialize)]
pub struct DenialBody {
    pub error: String,
    pub code: &'static str,
}

impl PaymentRequest {
    /// Collect the payment headers of a request
    pub fn from_headers(map: &HeaderMap, cost: u64) -> Self {
        let get = |name: &str| {
            map.get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        Self {
            payment_signature: get(headers::PAYMENT_SIGNATURE),
            api_key: get(headers::API_KEY),
            authorization: get(header::AUTHORIZATION.as_str()),
            session_deposit: get(headers::SESSION_DEPOSIT),
            cost,
            price_usdc: None,
        }
    }
}

impl IntoResponse for Denial {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status()).unwrap_or(StatusCode::PAYMENT_REQUIRED);
        let body = DenialBody {
            error: self.reason.message(),
            code: self.reason.code(),
        };

        let mut response = (status, Json(body)).into_response();
        let out = response.headers_mut();
        if let Some(challenge) = self.challenge.and_then(|c| HeaderValue::from_str(&c).ok()) {
            out.insert(header::WWW_AUTHENTICATE, challenge);
        }
        if let Some(required) = self.payment_required.and_then(|r| HeaderValue::from_str(&r).ok()) {
            out.insert(HeaderName::from_static(headers::PAYMENT_REQUIRED), required);
        }
        response
    }
}

/// Attach rotated tokens or receipts to a successful response
pub fn apply_grant(grant: &Grant, out: &mut HeaderMap) {
    for (name, value) in grant.response_headers() {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                out.insert(HeaderName::from_static(name), value);
            }
            Err(e) => tracing::error!(header = name, error = %e, "Unencodable response header"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DenialReason;

    #[test]
    fn test_from_headers() {
        let mut map = HeaderMap::new();
        map.insert("payment-signature", HeaderValue::from_static("sig"));
        map.insert("authorization", HeaderValue::from_static("Bearer tok"));
        map.insert("x-sovereign-api-key", HeaderValue::from_static("  "));

        let request = PaymentRequest::from_headers(&map, 7);
        assert_eq!(request.payment_signature.as_deref(), Some("sig"));
        assert_eq!(request.authorization.as_deref(), Some("Bearer tok"));
        assert_eq!(request.api_key, None);
        assert_eq!(request.cost, 7);
    }

    #[test]
    fn test_denial_response() {
        let mut denial = Denial::new(DenialReason::Replay);
        denial.challenge = Some("L402 token".into());

        let response = denial.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "L402 token");
    }

    #[test]
    fn test_apply_fuel_grant() {
        let mut map = HeaderMap::new();
        let grant = Grant::FuelToken {
            token: "change".into(),
            balance: 42,
        };
        apply_grant(&grant, &mut map);
        assert_eq!(map[headers::BALANCE_TOKEN], "change");
        assert_eq!(map[headers::BALANCE], "42");
    }
}
