//! Router

use axum::{
    Router,
    http::{HeaderName, header},
    middleware,
    routing::{get, post},
};
use gateway_payments::headers;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::handlers::{
    admin_mint, balance, claim, health_check, list_keys, metered_ping, register, revoke,
    revoke_key, topup, x402_info,
};
use crate::middleware::{require_payment, require_topup_payment};
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    // Payment headers must be readable by browser clients.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(headers::BALANCE_TOKEN),
            HeaderName::from_static(headers::BALANCE),
            HeaderName::from_static(headers::PAYMENT_RESPONSE),
            HeaderName::from_static(headers::PAYMENT_REQUIRED),
            HeaderName::from_static(headers::MACAROON),
            header::WWW_AUTHENTICATE,
        ]);

    let metered = Router::new()
        .route("/v1/metered/ping", post(metered_ping))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_payment));

    let topups = Router::new()
        .route("/v1/balance/topup", post(topup))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_topup_payment));

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/v1/x402/info", get(x402_info))

        // Deposits & fuel tokens
        .route("/v1/admin/mint", post(admin_mint))
        .route("/v1/balance/claim", post(claim))
        .route("/v1/balance", post(balance))
        .route("/v1/macaroon/revoke", post(revoke))

        // Identity
        .route("/v1/register", post(register))
        .route("/v1/admin/keys", get(list_keys))
        .route("/v1/admin/keys/revoke", post(revoke_key))

        .merge(metered)
        .merge(topups)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use async_trait::async_trait;
    use axum::http::{Request, StatusCode};
    use gateway_payments::{ArbitratorConfig, Facilitator, PaymentOption, SettlementReceipt};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    use crate::config::ServerConfig;

    const ADMIN: &str = "admin-secret";

    fn config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            data_dir: "unused".into(),
            site_url: "https://gateway.test".into(),
            mint_secret: "mint-secret".into(),
            admin_key: ADMIN.into(),
            arbitrator: ArbitratorConfig {
                price_sats: 10,
                ..ArbitratorConfig::default()
            },
            topup_price_usdc: "$1.00".into(),
            topup_credit_sats: 100_000,
        }
    }

    fn state() -> AppState {
        AppState::in_memory(config(), None).unwrap()
    }

    /// Settles every payment with one fixed transaction
    struct FixedFacilitator {
        transaction: &'static str,
        amounts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Facilitator for FixedFacilitator {
        async fn verify_and_settle(
            &self,
            _payment_header: &str,
            requirements: &PaymentOption,
        ) -> gateway_payments::Result<SettlementReceipt> {
            self.amounts
                .lock()
                .unwrap()
                .push(requirements.max_amount_required.clone());
            Ok(SettlementReceipt::new(
                self.transaction,
                json!({"success": true, "transaction": self.transaction}),
            ))
        }
    }

    fn paying_state(transaction: &'static str) -> (AppState, Arc<FixedFacilitator>) {
        let facilitator = Arc::new(FixedFacilitator {
            transaction,
            amounts: Mutex::new(Vec::new()),
        });
        let state = AppState::in_memory(config(), Some(facilitator.clone())).unwrap();
        (state, facilitator)
    }

    fn topup_request(payment: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/v1/balance/topup");
        if let Some(payment) = payment {
            builder = builder.header(headers::PAYMENT_SIGNATURE, payment);
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str) -> axum::http::request::Builder {
        Request::post(uri).header(header::CONTENT_TYPE, "application/json")
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    async fn mint(app: &Router, amount: u64, identifier: &str) -> (StatusCode, Value) {
        let body = json!({"amount_sats": amount, "identifier": identifier});
        let request = post_json("/v1/admin/mint")
            .header(headers::ADMIN_KEY, ADMIN)
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, body) = send(app, request).await;
        (status, body)
    }

    async fn claim(app: &Router, tx_hash: &str) -> (StatusCode, Value) {
        let body = json!({"tx_hash": tx_hash});
        let request = post_json("/v1/balance/claim")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, body) = send(app, request).await;
        (status, body)
    }

    async fn ping(app: &Router, token: &str) -> (StatusCode, axum::http::HeaderMap, Value) {
        let request = Request::post("/v1/metered/ping")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        send(app, request).await
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state());
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_mint_then_claim_once() {
        let app = router(state());

        let (status, body) = claim(&app, "0xdep").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], "not_ready");

        let (status, body) = mint(&app, 1000, "0xdep").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "minted_and_stored");
        assert_eq!(body["balance"], 1000);

        let (status, _) = mint(&app, 1000, "0xdep").await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = claim(&app, "0xdep").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "claimed");
        assert!(body["access_token"].is_string());

        let (status, body) = claim(&app, "0xdep").await;
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body["status"], "already_claimed");
    }

    #[tokio::test]
    async fn test_claim_requires_tx_hash() {
        let app = router(state());
        let request = post_json("/v1/balance/claim")
            .body(Body::from("{}"))
            .unwrap();
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_mint_rejects_bad_admin_key() {
        let app = router(state());
        let body = json!({"amount_sats": 5, "identifier": "dep"});
        let request = post_json("/v1/admin/mint")
            .header(headers::ADMIN_KEY, "wrong")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_metered_call_rotates_token() {
        let app = router(state());
        let (_, body) = mint(&app, 25, "dep-rotate").await;
        let token = body["access_token"].as_str().unwrap().to_string();

        let (status, headers_out, body) = ping(&app, &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paid_with"], "fuel");
        assert_eq!(headers_out[headers::BALANCE], "15");
        let change = headers_out[headers::BALANCE_TOKEN].to_str().unwrap().to_string();

        let (status, _, body) = ping(&app, &token).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "REPLAY_DETECTED");

        let (status, headers_out, _) = ping(&app, &change).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers_out[headers::BALANCE], "5");
        let change = headers_out[headers::BALANCE_TOKEN].to_str().unwrap().to_string();

        let (status, headers_out, body) = ping(&app, &change).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "INSUFFICIENT_FUNDS");
        assert!(headers_out.contains_key(header::WWW_AUTHENTICATE));
        assert!(headers_out.contains_key(headers::PAYMENT_REQUIRED));
    }

    #[tokio::test]
    async fn test_metered_call_without_payment() {
        let app = router(state());
        let request = Request::post("/v1/metered/ping").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "MISSING_AUTHORIZATION");
    }

    #[tokio::test]
    async fn test_balance_and_revoke() {
        let app = router(state());
        let (_, body) = mint(&app, 40, "dep-revoke").await;
        let token = body["access_token"].as_str().unwrap().to_string();

        let request = Request::post("/v1/balance")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance_sats"], 40);
        assert_eq!(body["has_fuel"], true);

        let revoke = || {
            Request::post("/v1/macaroon/revoke")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };
        let (status, _, body) = send(&app, revoke()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["forfeited_sats"], 40);

        let (status, _, _) = send(&app, revoke()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _, _) = ping(&app, &token).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_register_one_key_per_agent() {
        let app = router(state());
        let body = json!({"agent_name": "scout", "description": "test"});
        let register = || {
            post_json("/v1/register")
                .body(Body::from(body.to_string()))
                .unwrap()
        };

        let (status, _, created) = send(&app, register()).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(created["api_key"].as_str().unwrap().starts_with("sk-sov-"));

        let (status, _, body) = send(&app, register()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "AGENT_EXISTS");
    }

    #[tokio::test]
    async fn test_x402_info() {
        let app = router(state());
        let request = Request::get("/v1/x402/info").body(Body::empty()).unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["price_sats"], 10);
        assert_eq!(body["requirements"]["x402Version"], 1);
    }

    #[tokio::test]
    async fn test_topup_mints_once_per_settlement() {
        let (state, facilitator) = paying_state("0xtopup");
        let app = router(state);

        let (status, headers_out, body) = send(&app, topup_request(Some("payment"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credits_sats"], 100_000);
        assert_eq!(body["transaction"], "0xtopup");
        assert!(headers_out.contains_key(headers::PAYMENT_RESPONSE));
        assert_eq!(*facilitator.amounts.lock().unwrap(), vec!["1000000"]);

        let token = body["token"].as_str().unwrap().to_string();
        let (status, headers_out, _) = ping(&app, &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers_out[headers::BALANCE], "99990");

        let (status, _, body) = send(&app, topup_request(Some("payment"))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "DUPLICATE_DEPOSIT");
    }

    #[tokio::test]
    async fn test_topup_requires_x402() {
        let (state, facilitator) = paying_state("0xunused");
        let app = router(state.clone());
        let token = state
            .mint
            .mint(500, &gateway_core::DepositId::new("dep-fuel").unwrap())
            .unwrap();

        let request = Request::post("/v1/balance/topup")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap();
        let (status, headers_out, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["code"], "MISSING_AUTHORIZATION");
        assert!(headers_out.contains_key(headers::PAYMENT_REQUIRED));
        assert!(facilitator.amounts.lock().unwrap().is_empty());

        // The fuel token was not spent on the rejected top-up.
        assert!(!state.mint.inspect(&token).unwrap().spent);
    }

    #[tokio::test]
    async fn test_admin_key_listing_and_revocation() {
        let app = router(state());
        let body = json!({"agent_name": "lister"});
        let request = post_json("/v1/register")
            .body(Body::from(body.to_string()))
            .unwrap();
        let (_, _, created) = send(&app, request).await;
        let key = created["api_key"].as_str().unwrap().to_string();

        let request = Request::get("/v1/admin/keys").body(Body::empty()).unwrap();
        let (status, _, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let request = Request::get("/v1/admin/keys")
            .header(headers::ADMIN_KEY, ADMIN)
            .body(Body::empty())
            .unwrap();
        let (status, _, listed) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["agent_name"], "lister");
        assert_ne!(listed[0]["key"], key.as_str());

        let body = json!({"api_key": key});
        let request = post_json("/v1/admin/keys/revoke")
            .header(headers::ADMIN_KEY, ADMIN)
            .body(Body::from(body.to_string()))
            .unwrap();
        let (status, _, revoked) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(revoked["revoked"], true);

        let request = Request::post("/v1/metered/ping")
            .header(headers::API_KEY, key.as_str())
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "INVALID_API_KEY");
    }
}
