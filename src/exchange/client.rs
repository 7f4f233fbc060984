//! Bithumb REST API client.

use crate::config::ExchangeConfig;
use crate::exchange::error::ExchangeError;
use crate::exchange::traits::{ExchangeApi, ExchangeResult};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::{Client, Response};
use serde_json::json;
use sha2::{Digest, Sha256, Sha512};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, instrument};

const JWT_HEADER: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

/// Bithumb spot API client (v1, JWT authentication).
pub struct BithumbClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    ignored_currencies: Vec<String>,
}

impl BithumbClient {
    /// Create a new Bithumb client from configuration.
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            ignored_currencies: config.ignored_currencies.clone(),
        })
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Url-encoded `k=v&...` string the query hash is computed over.
    fn query_string(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Build a signed bearer token. `params` are hashed into the claims.
    fn authorization(&self, params: Option<&[(&str, String)]>) -> ExchangeResult<String> {
        let mut claims = json!({
            "access_key": self.api_key,
            "nonce": uuid::Uuid::new_v4().to_string(),
            "timestamp": Self::timestamp(),
        });

        if let Some(params) = params {
            let query_hash = hex::encode(Sha512::digest(Self::query_string(params).as_bytes()));
            claims["query_hash"] = json!(query_hash);
            claims["query_hash_alg"] = json!("SHA512");
        }

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(JWT_HEADER),
            URL_SAFE_NO_PAD.encode(claims.to_string())
        );

        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| ExchangeError::Auth(e.to_string()))?;
        mac.update(signing_input.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("Bearer {}.{}", signing_input, signature))
    }

    /// Read a response body, mapping structured errors and bad statuses.
    async fn read_json(response: Response) -> ExchangeResult<serde_json::Value> {
        let status = response.status();
        let body = response.text().await?;

        if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(&body) {
            error!(
                name = %envelope.error.name,
                message = %envelope.error.message,
                "Exchange returned an error"
            );
            let payload = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
            return Err(ExchangeError::Rejected {
                name: envelope.error.name,
                message: envelope.error.message,
                payload,
            });
        }

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ExchangeError::Auth(body));
        }

        if !status.is_success() {
            return Err(ExchangeError::UnexpectedResponse {
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    // ==================== Account (Authenticated) ====================

    /// Get all account balances, minus ignored currencies.
    #[instrument(skip(self))]
    pub async fn fetch_accounts(&self) -> ExchangeResult<Vec<AccountBalance>> {
        let url = format!("{}/v1/accounts", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("Authorization", self.authorization(None)?)
            .send()
            .await?;

        let value = Self::read_json(response).await?;
        let balances: Vec<AccountBalance> = serde_json::from_value(value)?;

        Ok(balances
            .into_iter()
            .filter(|b| !self.ignored_currencies.contains(&b.currency))
            .collect())
    }

    // ==================== Orders (Authenticated) ====================

    /// Place a new order.
    #[instrument(skip(self))]
    pub async fn submit_order(&self, order: &NewOrder) -> ExchangeResult<OrderResponse> {
        let params = order.params();
        let url = format!("{}/v1/orders", self.base_url);

        debug!("Placing order: {:?}", order);

        let response = self
            .http
            .post(&url)
            .header("Authorization", self.authorization(Some(&params))?)
            .json(&order.body())
            .send()
            .await?;

        let value = Self::read_json(response).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch a single order (with its trades) by uuid.
    #[instrument(skip(self))]
    pub async fn fetch_order(&self, uuid: &str) -> ExchangeResult<serde_json::Value> {
        let params = [("uuid", uuid.to_string())];
        let url = format!("{}/v1/order?{}", self.base_url, Self::query_string(&params));

        let response = self
            .http
            .get(&url)
            .header("Authorization", self.authorization(Some(&params))?)
            .send()
            .await?;

        Self::read_json(response).await
    }
}

#[async_trait]
impl ExchangeApi for BithumbClient {
    async fn get_accounts(&self) -> ExchangeResult<Vec<AccountBalance>> {
        self.fetch_accounts().await
    }

    async fn place_order(&self, order: &NewOrder) -> ExchangeResult<OrderResponse> {
        self.submit_order(order).await
    }

    async fn get_order(&self, uuid: &str) -> ExchangeResult<serde_json::Value> {
        self.fetch_order(uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> BithumbClient {
        BithumbClient::new(&ExchangeConfig {
            api_key: "access".to_string(),
            secret_key: "secret".to_string(),
            base_url: base_url.to_string(),
            ..ExchangeConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_authorization_is_three_part_jwt() {
        let client = test_client("http://localhost");
        let params = [("uuid", "abc".to_string())];
        let token = client.authorization(Some(&params)).unwrap();

        let jwt = token.strip_prefix("Bearer ").unwrap();
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["access_key"], "access");
        assert_eq!(claims["query_hash_alg"], "SHA512");
        assert_eq!(
            claims["query_hash"],
            hex::encode(Sha512::digest(b"uuid=abc"))
        );
    }

    #[tokio::test]
    async fn test_accounts_drop_ignored_currencies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/accounts"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"currency": "KRW", "balance": "150000", "locked": "0",
                 "avg_buy_price": "0", "avg_buy_price_modified": false, "unit_currency": "KRW"},
                {"currency": "P", "balance": "12", "locked": "0",
                 "avg_buy_price": "0", "avg_buy_price_modified": false, "unit_currency": "KRW"},
                {"currency": "ETH", "balance": "0.3", "locked": "0",
                 "avg_buy_price": "3500000", "avg_buy_price_modified": false, "unit_currency": "KRW"}
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let balances = client.get_accounts().await.unwrap();

        assert_eq!(balances.len(), 2);
        assert!(balances.iter().all(|b| b.currency != "P"));
        assert_eq!(balances[1].balance, dec!(0.3));
    }

    #[tokio::test]
    async fn test_structured_error_becomes_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"name": "under_min_total_ask", "message": "minimum total is 5000 KRW"}
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let order = OrderIntent::market_sell("KRW-ETH", dec!(0.0001)).to_request();
        let err = client.place_order(&order).await.unwrap_err();

        assert!(matches!(
            err,
            ExchangeError::Rejected { ref name, .. } if name == "under_min_total_ask"
        ));
    }

    #[tokio::test]
    async fn test_order_query_hash_covers_posted_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "uuid": "u-9", "side": "ask", "ord_type": "market", "market": "KRW-ETH",
                "state": "wait", "created_at": "2024-05-01T09:30:00+09:00",
                "volume": "0.5", "executed_volume": "0"
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let volume: rust_decimal::Decimal = "0.50000000".parse().unwrap();
        let order = OrderIntent::market_sell("KRW-ETH", volume).to_request();
        client.place_order(&order).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();

        let posted: Vec<(&str, String)> = ["market", "side", "ord_type", "volume"]
            .into_iter()
            .map(|k| (k, body[k].as_str().unwrap().to_string()))
            .collect();
        let expected_hash =
            hex::encode(Sha512::digest(BithumbClient::query_string(&posted).as_bytes()));

        let token = request
            .headers
            .get("authorization")
            .unwrap()
            .to_str()
            .unwrap();
        let jwt = token.strip_prefix("Bearer ").unwrap();
        let claims_part = jwt.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims_part).unwrap()).unwrap();

        assert_eq!(body["volume"], "0.5");
        assert_eq!(body.as_object().unwrap().len(), posted.len());
        assert_eq!(claims["query_hash"], expected_hash);
    }

    #[tokio::test]
    async fn test_server_error_is_unexpected_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/orders"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let order = OrderIntent::market_buy("KRW-ETH", dec!(10000)).to_request();
        let err = client.place_order(&order).await.unwrap_err();

        assert!(matches!(
            err,
            ExchangeError::UnexpectedResponse { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn test_order_lookup_passes_uuid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/order"))
            .and(query_param("uuid", "u-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": "u-1", "side": "bid", "ord_type": "price", "market": "KRW-ETH",
                "state": "done", "created_at": "2024-05-01T09:30:00+09:00",
                "executed_volume": "0.01"
            })))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let order = client.get_order("u-1").await.unwrap();
        assert_eq!(order["executed_volume"], "0.01");
    }
}
