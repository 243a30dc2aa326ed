//! REST client for monitored persons, session history, alerts and behavior
//! reports.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use super::models::{
    Acknowledgement, BehaviorReport, Dashboard, ImageAnalysis, NewPerson, PersonAlerts,
    PersonDetail, PersonList, PersonSessions, SessionDetail,
};
use crate::auth::TokenStore;
use crate::error::ApiError;
use crate::traits::{Headers, HttpClient, Response};

#[derive(Debug, Clone)]
enum Method {
    Get,
    Post(String),
    Patch,
}

/// Read-mostly client over the analysis history endpoints.
///
/// Headers come from the [`TokenStore`] on every call. A 401 triggers one
/// refresh and one retry.
pub struct ReportClient {
    http: Arc<dyn HttpClient>,
    tokens: Arc<TokenStore>,
}

impl ReportClient {
    pub fn new(http: Arc<dyn HttpClient>, tokens: Arc<TokenStore>) -> Self {
        Self { http, tokens }
    }

    /// Every monitored person, newest first.
    pub async fn persons(&self) -> Result<PersonList, ApiError> {
        self.call(Method::Get, "/persons/").await
    }

    pub async fn person(&self, person_id: i64) -> Result<PersonDetail, ApiError> {
        self.call(Method::Get, &format!("/persons/{}/", person_id))
            .await
    }

    /// Register a person to analyse. The server echoes the stored fields
    /// without an id; list persons to find it.
    pub async fn create_person(&self, person: &NewPerson) -> Result<PersonDetail, ApiError> {
        info!("Creating person {} {}", person.first_name, person.last_name);
        let body = serde_json::to_string(person)?;
        self.call(Method::Post(body), "/persons/").await
    }

    /// Analyse one encoded image outside any session. Nothing is recorded.
    pub async fn analyze_image(&self, image: &[u8]) -> Result<ImageAnalysis, ApiError> {
        let body = json!({ "image": STANDARD.encode(image) }).to_string();
        self.call(Method::Post(body), "/analyze/").await
    }

    /// Sessions of a person, newest first.
    pub async fn sessions(&self, person_id: i64) -> Result<PersonSessions, ApiError> {
        self.call(Method::Get, &format!("/persons/{}/sessions/", person_id))
            .await
    }

    pub async fn session_detail(&self, session_id: i64) -> Result<SessionDetail, ApiError> {
        self.call(Method::Get, &format!("/sessions/{}/", session_id))
            .await
    }

    pub async fn behavior_report(&self, person_id: i64) -> Result<BehaviorReport, ApiError> {
        self.call(Method::Get, &format!("/persons/{}/report/", person_id))
            .await
    }

    pub async fn alerts(&self, person_id: i64) -> Result<PersonAlerts, ApiError> {
        self.call(Method::Get, &format!("/persons/{}/alerts/", person_id))
            .await
    }

    pub async fn mark_alert_reviewed(&self, alert_id: i64) -> Result<Acknowledgement, ApiError> {
        info!("Marking alert {} as reviewed", alert_id);
        self.call(Method::Patch, &format!("/alerts/{}/review/", alert_id))
            .await
    }

    /// System-wide totals and recent activity.
    pub async fn dashboard(&self) -> Result<Dashboard, ApiError> {
        self.call(Method::Get, "/dashboard/").await
    }

    async fn call<T: DeserializeOwned>(&self, method: Method, path: &str) -> Result<T, ApiError> {
        let url = self.tokens.url(path);

        let headers = self.tokens.auth_headers();
        let mut response = self.execute(&method, &url, &headers).await?;

        if response.status == 401 {
            let Some(rejected) = bearer(&headers) else {
                return Err(ApiError::from_response(response.status, &response.body));
            };
            debug!("{} rejected the access token, refreshing", path);
            if !self.tokens.refresh_rejected(rejected).await {
                warn!("Refresh failed, giving up on {}", path);
                return Err(ApiError::from_response(response.status, &response.body));
            }
            response = self
                .execute(&method, &url, &self.tokens.auth_headers())
                .await?;
        }

        if !response.is_success() {
            return Err(ApiError::from_response(response.status, &response.body));
        }

        Ok(response.json()?)
    }

    async fn execute(
        &self,
        method: &Method,
        url: &str,
        headers: &Headers,
    ) -> Result<Response, ApiError> {
        let response = match method {
            Method::Get => self.http.get(url, headers).await?,
            Method::Post(body) => self.http.post(url, body, headers).await?,
            Method::Patch => self.http.patch(url, "{}", headers).await?,
        };
        Ok(response)
    }
}

/// The access token a request was sent with.
fn bearer(headers: &Headers) -> Option<&str> {
    headers
        .get("Authorization")
        .and_then(|value| value.strip_prefix("Bearer "))
}
