use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::{
    account::Account,
    config::Settings,
    subscription::{SubscriptionSnapshot, Tier},
    utils::backoff_delay,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Network failures, timeouts, 5xx and 429 are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            ApiError::Status { status, .. } => *status >= 500 || *status == 429,
            ApiError::InvalidRequest(_) => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Status { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonKind {
    Master,
    Slave,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonChange {
    pub action: AddonAction,
    #[serde(rename = "type")]
    pub kind: AddonKind,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientDiscount {
    pub is_client: bool,
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecialDiscount {
    pub percentage: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierChange {
    pub tier: Tier,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    #[serde(default)]
    pub action_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub old_value: JsonValue,
    #[serde(default)]
    pub new_value: JsonValue,
    // Either a user id or a populated user object.
    #[serde(default)]
    pub performed_by: JsonValue,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    #[serde(alias = "history", alias = "items", alias = "data")]
    pub entries: Vec<AuditEntry>,
    #[serde(default)]
    pub total: u64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AccountsBody {
    List(Vec<Account>),
    Wrapped {
        #[serde(alias = "data")]
        accounts: Vec<Account>,
    },
}

#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(settings: &Settings) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.http_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
            token: settings.api_token.clone(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, self.url(path));
        match self.token.as_deref() {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }
        Ok(resp.json::<T>().await?)
    }

    fn admin_path(user_id: &str, tail: &str) -> Result<String, ApiError> {
        let user_id = user_id.trim();
        if user_id.is_empty() || user_id.contains('/') {
            return Err(ApiError::InvalidRequest(format!("bad user id {user_id:?}")));
        }
        Ok(format!("subscriptions/admin/{user_id}/{tail}"))
    }

    pub async fn get_accounts(&self) -> Result<Vec<Account>, ApiError> {
        let body: AccountsBody = self.send(self.request(Method::GET, "users/me/accounts")).await?;
        Ok(match body {
            AccountsBody::List(v) => v,
            AccountsBody::Wrapped { accounts } => accounts,
        })
    }

    pub async fn get_subscription(&self) -> Result<SubscriptionSnapshot, ApiError> {
        self.send(self.request(Method::GET, "subscriptions/hybrid")).await
    }

    pub async fn reset_trial(&self, user_id: &str) -> Result<JsonValue, ApiError> {
        let path = Self::admin_path(user_id, "trial/reset")?;
        self.send(self.request(Method::POST, &path)).await
    }

    pub async fn disable_trial(&self, user_id: &str) -> Result<JsonValue, ApiError> {
        let path = Self::admin_path(user_id, "trial/disable")?;
        self.send(self.request(Method::POST, &path)).await
    }

    pub async fn update_addon(&self, user_id: &str, change: &AddonChange) -> Result<JsonValue, ApiError> {
        if change.quantity == 0 {
            return Err(ApiError::InvalidRequest("quantity must be >= 1".to_string()));
        }
        let path = Self::admin_path(user_id, "addon")?;
        self.send(self.request(Method::POST, &path).json(change)).await
    }

    pub async fn set_client_discount(
        &self,
        user_id: &str,
        discount: &ClientDiscount,
    ) -> Result<JsonValue, ApiError> {
        check_percentage(discount.percentage)?;
        let path = Self::admin_path(user_id, "discount/client")?;
        self.send(self.request(Method::POST, &path).json(discount)).await
    }

    pub async fn set_special_discount(
        &self,
        user_id: &str,
        discount: &SpecialDiscount,
    ) -> Result<JsonValue, ApiError> {
        check_percentage(discount.percentage)?;
        let path = Self::admin_path(user_id, "discount/special")?;
        self.send(self.request(Method::POST, &path).json(discount)).await
    }

    pub async fn update_tier(&self, user_id: &str, change: &TierChange) -> Result<JsonValue, ApiError> {
        let path = Self::admin_path(user_id, "tier")?;
        self.send(self.request(Method::PUT, &path).json(change)).await
    }

    pub async fn get_history(&self, query: &HistoryQuery) -> Result<HistoryPage, ApiError> {
        self.send(self.request(Method::GET, "history").query(query)).await
    }
}

fn check_percentage(p: u8) -> Result<(), ApiError> {
    if p > 100 {
        return Err(ApiError::InvalidRequest(format!("percentage must be 0-100 (got {p})")));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_retries` extra attempts are spent.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let max_delay = base_delay.saturating_mul(16);
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = backoff_delay(attempt, base_delay, max_delay);
                log::warn!(
                    "{}.retry attempt={} delay_ms={} err={}",
                    label,
                    attempt + 1,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
