//! External CRM API client
//!
//! Three bearer-authenticated endpoints are used: listing a tenant's custom
//! fields, fetching tenant metadata (for its timezone), and writing a custom
//! field value on a subject. Non-2xx bodies are surfaced verbatim.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("CRM rejected credentials ({status}): {body}")]
    Unauthorized { status: u16, body: String },

    #[error("CRM API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected CRM response: {0}")]
    Decode(String),
}

impl CrmError {
    /// Whether the failure is an authorization rejection
    pub fn is_authorization(&self) -> bool {
        matches!(self, CrmError::Unauthorized { .. })
    }
}

/// A custom field defined for a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Value write for one subject's custom field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub subject_id: String,
    pub tenant_id: String,
    pub field_id: String,
    pub value: String,
    pub credential: String,
}

#[async_trait]
pub trait CrmApi: Send + Sync + 'static {
    /// Custom fields visible to `credential`
    async fn list_custom_fields(&self, credential: &str) -> Result<Vec<CustomField>, CrmError>;

    /// Timezone configured for the tenant, if any
    async fn tenant_timezone(
        &self,
        tenant_id: &str,
        credential: &str,
    ) -> Result<Option<String>, CrmError>;

    /// Write a custom field value on a subject
    async fn set_custom_field(&self, update: &FieldUpdate) -> Result<(), CrmError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomFieldsResponse {
    #[serde(default)]
    custom_fields: Vec<CustomField>,
}

/// reqwest-backed CRM client
#[derive(Debug, Clone)]
pub struct HttpCrmClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpCrmClient {
    pub fn new(base_url: &str) -> Result<Self, CrmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CrmError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CrmError::Unauthorized {
                status: status.as_u16(),
                body,
            });
        }
        Err(CrmError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

/// Pull a timezone out of tenant metadata, wherever the API put it
fn extract_timezone(body: &serde_json::Value) -> Option<String> {
    ["/location/timezone", "/timezone", "/location/timeZone", "/timeZone"]
        .iter()
        .find_map(|ptr| body.pointer(ptr).and_then(|v| v.as_str()))
        .filter(|tz| !tz.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl CrmApi for HttpCrmClient {
    #[instrument(skip_all)]
    async fn list_custom_fields(&self, credential: &str) -> Result<Vec<CustomField>, CrmError> {
        let url = format!("{}/custom-fields/", self.base_url);
        let response = self.http.get(&url).bearer_auth(credential).send().await?;
        let response = Self::check(response).await?;

        let payload: CustomFieldsResponse = response
            .json()
            .await
            .map_err(|e| CrmError::Decode(e.to_string()))?;
        debug!(count = payload.custom_fields.len(), "listed custom fields");
        Ok(payload.custom_fields)
    }

    #[instrument(skip(self, credential))]
    async fn tenant_timezone(
        &self,
        tenant_id: &str,
        credential: &str,
    ) -> Result<Option<String>, CrmError> {
        let url = format!("{}/locations/{}", self.base_url, tenant_id);
        let response = self.http.get(&url).bearer_auth(credential).send().await?;
        let response = Self::check(response).await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CrmError::Decode(e.to_string()))?;
        Ok(extract_timezone(&body))
    }

    #[instrument(skip(self, update), fields(subject_id = %update.subject_id, tenant_id = %update.tenant_id))]
    async fn set_custom_field(&self, update: &FieldUpdate) -> Result<(), CrmError> {
        let url = format!("{}/contacts/{}", self.base_url, update.subject_id);
        let body = json!({
            "customFields": [{ "id": update.field_id, "field_value": update.value }]
        });

        let response = self
            .http
            .put(&url)
            .bearer_auth(&update.credential)
            .header("LocationId", &update.tenant_id)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;

        debug!("custom field updated");
        Ok(())
    }
}

/// Scripted CRM for testing
///
/// Field lists and timezones are fixed at construction; update outcomes are
/// popped from a queue (success once the queue is empty) and every update is
/// recorded.
#[derive(Default)]
pub struct InMemoryCrm {
    fields: Vec<CustomField>,
    timezone: Option<String>,
    fail_lookups: bool,
    update_outcomes: Mutex<VecDeque<Result<(), CrmError>>>,
    updates: Mutex<Vec<FieldUpdate>>,
    lookups: Mutex<usize>,
}

impl InMemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, id: &str, name: &str) -> Self {
        self.fields.push(CustomField {
            id: id.to_string(),
            name: Some(name.to_string()),
        });
        self
    }

    pub fn with_timezone(mut self, timezone: &str) -> Self {
        self.timezone = Some(timezone.to_string());
        self
    }

    /// Make every lookup fail with a 500
    pub fn with_failing_lookups(mut self) -> Self {
        self.fail_lookups = true;
        self
    }

    /// Queue the outcome of the next update call
    pub fn push_update_outcome(&self, outcome: Result<(), CrmError>) {
        self.update_outcomes.lock().push_back(outcome);
    }

    /// Updates received so far
    pub fn updates(&self) -> Vec<FieldUpdate> {
        self.updates.lock().clone()
    }

    /// Number of lookup calls (field list and metadata)
    pub fn lookup_count(&self) -> usize {
        *self.lookups.lock()
    }

    fn lookup_failure(&self) -> Result<(), CrmError> {
        *self.lookups.lock() += 1;
        if self.fail_lookups {
            return Err(CrmError::Api {
                status: 500,
                body: "lookup failed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CrmApi for InMemoryCrm {
    async fn list_custom_fields(&self, _credential: &str) -> Result<Vec<CustomField>, CrmError> {
        self.lookup_failure()?;
        Ok(self.fields.clone())
    }

    async fn tenant_timezone(
        &self,
        _tenant_id: &str,
        _credential: &str,
    ) -> Result<Option<String>, CrmError> {
        self.lookup_failure()?;
        Ok(self.timezone.clone())
    }

    async fn set_custom_field(&self, update: &FieldUpdate) -> Result<(), CrmError> {
        self.updates.lock().push(update.clone());
        self.update_outcomes.lock().pop_front().unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_custom_fields() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/custom-fields/"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "customFields": [
                    { "id": "f1", "name": "Timer Done" },
                    { "id": "f2", "name": "Other" }
                ]
            })))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new(&server.uri()).unwrap();
        let fields = client.list_custom_fields("tok").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].id, "f1");
    }

    #[tokio::test]
    async fn test_unauthorized_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/contacts/c1"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new(&server.uri()).unwrap();
        let err = client
            .set_custom_field(&FieldUpdate {
                subject_id: "c1".into(),
                tenant_id: "loc1".into(),
                field_id: "f1".into(),
                value: "YES".into(),
                credential: "bad".into(),
            })
            .await
            .unwrap_err();

        assert!(err.is_authorization());
        assert!(err.to_string().contains("invalid token"));
    }

    #[tokio::test]
    async fn test_server_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/custom-fields/"))
            .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new(&server.uri()).unwrap();
        match client.list_custom_fields("tok").await {
            Err(CrmError::Api { status, body }) => {
                assert_eq!(status, 502);
                assert_eq!(body, "upstream down");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_custom_field_sends_value() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/contacts/c1"))
            .and(header("LocationId", "loc1"))
            .and(body_json(json!({
                "customFields": [{ "id": "f1", "field_value": "YES" }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpCrmClient::new(&format!("{}/", server.uri())).unwrap();
        client
            .set_custom_field(&FieldUpdate {
                subject_id: "c1".into(),
                tenant_id: "loc1".into(),
                field_id: "f1".into(),
                value: "YES".into(),
                credential: "tok".into(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tenant_timezone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/locations/loc1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "location": { "id": "loc1", "timezone": "America/Chicago" }
            })))
            .mount(&server)
            .await;

        let client = HttpCrmClient::new(&server.uri()).unwrap();
        let tz = client.tenant_timezone("loc1", "tok").await.unwrap();
        assert_eq!(tz.as_deref(), Some("America/Chicago"));
    }

    #[test]
    fn test_extract_timezone_variants() {
        assert_eq!(
            extract_timezone(&json!({ "timezone": "Europe/Madrid" })).as_deref(),
            Some("Europe/Madrid")
        );
        assert_eq!(extract_timezone(&json!({ "location": {} })), None);
        assert_eq!(extract_timezone(&json!({ "timezone": "" })), None);
    }
}
