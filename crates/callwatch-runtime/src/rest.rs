//! Authenticated REST client.
//!
//! The only place the bearer credential is attached to a request. A 401 from
//! any endpoint logs the session out before the error is returned.

use std::future::Future;
use std::time::Duration;

use callwatch_core::{BusinessId, CallRecord};
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::error::ApiError;
use crate::session::SessionStore;

/// Query for `GET /calls`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallListParams {
    pub business_id: BusinessId,
    pub limit: u32,
    pub offset: u32,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl CallListParams {
    pub fn latest(business_id: BusinessId, limit: u32) -> Self {
        Self {
            business_id,
            limit,
            offset: 0,
            date_from: None,
            date_to: None,
        }
    }
}

/// `GET /auth/me`.
#[derive(Debug, Clone, Deserialize)]
pub struct Operator {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub business_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

/// Values that win over `/auth/me` when present.
#[derive(Debug, Clone, Default)]
pub struct OperatorDefaults {
    pub business_id: Option<String>,
    pub takeover_phone: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// Source of call snapshots. Implemented by [`ApiClient`] and by test fakes.
pub trait CallSource: Send + Sync + 'static {
    fn list_calls(
        &self,
        params: &CallListParams,
    ) -> impl Future<Output = Result<Vec<CallRecord>, ApiError>> + Send;
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: Url,
    session: SessionStore,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration, session: SessionStore) -> Result<Self, ApiError> {
        // Url::join replaces the last segment unless the base ends in '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base = Url::parse(&normalized).map_err(|e| ApiError::Url(format!("{base_url}: {e}")))?;
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base,
            session,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|e| ApiError::Url(format!("{path}: {e}")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let credential = self.session.credential().ok_or(ApiError::NoCredential)?;
        let path = url.path().to_string();

        let resp = self
            .http
            .get(url)
            .bearer_auth(credential.expose())
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(path = %path, "api: 401, clearing session");
            self.session.logout();
            return Err(ApiError::AuthorizationLost);
        }

        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                detail: error_detail(&body, status),
            });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    pub async fn me(&self) -> Result<Operator, ApiError> {
        let url = self.endpoint("auth/me")?;
        self.get_json(url).await
    }

    pub async fn fetch_calls(&self, params: &CallListParams) -> Result<Vec<CallRecord>, ApiError> {
        let mut url = self.endpoint("calls")?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("business_id", params.business_id.as_str());
            q.append_pair("limit", &params.limit.to_string());
            q.append_pair("offset", &params.offset.to_string());
            if let Some(from) = params.date_from {
                q.append_pair("date_from", &from.to_rfc3339());
            }
            if let Some(to) = params.date_to {
                q.append_pair("date_to", &to.to_rfc3339());
            }
        }
        self.get_json(url).await
    }
}

impl CallSource for ApiClient {
    fn list_calls(
        &self,
        params: &CallListParams,
    ) -> impl Future<Output = Result<Vec<CallRecord>, ApiError>> + Send {
        self.fetch_calls(params)
    }
}

/// Fill the session's business scope and takeover phone from `known`, then
/// from `/auth/me` for whatever is still missing. Only a 401 is returned as
/// an error, after the client has already cleared the session; any other
/// lookup failure leaves the gaps empty.
pub async fn resolve_operator(
    api: &ApiClient,
    session: &SessionStore,
    known: OperatorDefaults,
) -> Result<Option<BusinessId>, ApiError> {
    let OperatorDefaults {
        mut business_id,
        mut takeover_phone,
    } = known;

    if business_id.is_none() || takeover_phone.is_none() {
        match api.me().await {
            Ok(operator) => {
                tracing::info!(
                    operator = %operator.id,
                    email = operator.email.as_deref(),
                    role = operator.role.as_deref(),
                    "api: authenticated"
                );
                business_id = business_id.or(operator.business_id);
                takeover_phone = takeover_phone.or(operator.phone);
            }
            Err(e) if e.is_auth_lost() => return Err(e),
            Err(e) => tracing::warn!("api: operator lookup failed, continuing: {e}"),
        }
    }

    let business = business_id.filter(|b| !b.is_empty()).map(BusinessId::new);
    if business.is_none() {
        tracing::warn!("no business linked: polling and escalation alerts are disabled");
    }
    session.set_operator_phone(takeover_phone);
    session.set_business(business.clone());
    Ok(business)
}

/// Backend error bodies are `{"detail": "..."}`; validation errors carry a
/// structured `detail` instead, which is passed through as JSON.
fn error_detail(body: &[u8], status: StatusCode) -> String {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody {
            detail: serde_json::Value::String(s),
        }) => s,
        Ok(ErrorBody { detail }) => detail.to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    }
}
