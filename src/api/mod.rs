//! Everything needed for communicating with the catalog API

pub mod filter;

use crate::api::filter::{Criteria, CriteriaFilter, CriteriaSorting, CriteriaSortingOrder, LogicOperator};
use crate::catalog::{CatalogError, CatalogStore, RecordId, RecordStatus, RecordWrite};
use crate::config_file::Credentials;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{header, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
    credentials: Arc<Credentials>,
    /// entity name in kebab-case, as used in the URL
    entity: String,
    access_token: Arc<Mutex<String>>,
}

impl CatalogClient {
    pub fn new(credentials: Credentials, entity: &str) -> Result<Self, ApiError> {
        let mut default_headers = HeaderMap::default();
        default_headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            // workaround for long-running requests,
            // see https://github.com/hyperium/hyper/issues/2312#issuecomment-1411360500
            .pool_max_idle_per_host(0)
            .timeout(Duration::from_secs(15))
            .default_headers(default_headers)
            .build()?;
        let credentials = Arc::new(credentials);
        let auth_response = Self::authenticate(&client, credentials.as_ref())?;

        info!(base_url = %credentials.base_url, entity, "catalog API client created and authenticated");
        Ok(Self {
            client,
            credentials,
            // entity needs to be provided as kebab-case instead of snake_case
            entity: entity.replace('_', "-"),
            access_token: Arc::new(Mutex::new(auth_response.access_token)),
        })
    }

    pub fn list<T>(&self, criteria: &Criteria) -> Result<ListResponse<T>, ApiError>
    where
        T: for<'a> Deserialize<'a> + Debug + Send + 'static,
    {
        debug!(
            page = criteria.page,
            limit = criteria.limit,
            entity = %self.entity,
            "fetching page"
        );

        let url = format!("{}/api/search/{}", self.credentials.base_url, self.entity);
        let response =
            self.handle_authenticated_request(|client| client.request(Method::POST, &url).json(criteria))?;
        let response = Self::error_for_status(response)?;

        Self::deserialize(response)
    }

    fn write(&self, method: Method, url: String, body: &serde_json::Value) -> Result<(), ApiError> {
        let response = self.handle_authenticated_request(|client| {
            client
                .request(method.clone(), &url)
                // the import does the indexing of its own writes in bulk later
                .header("indexing-behavior", "use-queue-indexing")
                .json(body)
        })?;
        Self::error_for_status(response)?;
        Ok(())
    }

    fn authenticate(client: &Client, credentials: &Credentials) -> Result<AuthResponse, ApiError> {
        let response = client
            .post(format!("{}/api/oauth/token", credentials.base_url))
            .json(&AuthBody {
                grant_type: "client_credentials".into(),
                client_id: credentials.access_key_id.clone(),
                client_secret: credentials.access_key_secret.clone(),
            })
            .send()?;

        if !response.status().is_success() {
            let status = response.status();
            let body = String::from_utf8_lossy(&response.bytes()?).into_owned();
            return Err(ApiError::AuthFailed(status, body));
        }

        Self::deserialize(response)
    }

    fn error_for_status(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body: ErrorBody = Self::deserialize(response)?;
        Err(ApiError::Server(status, body))
    }

    fn deserialize<T>(response: Response) -> Result<T, ApiError>
    where
        T: for<'a> Deserialize<'a> + Debug + Send + 'static,
    {
        let bytes = response.bytes()?;

        // expensive for large json objects
        match serde_json::from_slice(&bytes) {
            Ok(t) => Ok(t),
            Err(_e) => {
                // try to parse any json
                let body = match serde_json::from_slice::<serde_json::Value>(&bytes) {
                    Ok(json_value) => serde_json::to_string_pretty(&json_value)?,
                    Err(_e) => String::from_utf8_lossy(&bytes).into_owned(),
                };
                Err(ApiError::DeserializeIntoSchema(
                    std::any::type_name::<T>().to_string(),
                    body,
                ))
            }
        }
    }

    /// Sends the request built by `build`, re-authenticating once if the token expired
    fn handle_authenticated_request<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut try_count = 0;
        const MAX_RETRIES: u8 = 1;

        loop {
            let access_token = self
                .access_token
                .lock()
                .expect("access token lock poisoned")
                .clone();
            let request = build(&self.client).bearer_auth(&access_token).build()?;
            let path = request.url().path().to_owned();
            let method = request.method().clone();

            let start_time = Instant::now();
            let response = self.client.execute(request)?;

            if response.status() == StatusCode::UNAUTHORIZED && try_count < MAX_RETRIES {
                let mut access_token_guard =
                    self.access_token.lock().expect("access token lock poisoned");
                // compare the access token with the one we used to make the request
                if *access_token_guard != access_token {
                    // Another thread has already re-authenticated
                    continue;
                }

                let auth_response = Self::authenticate(&self.client, &self.credentials)?;
                *access_token_guard = auth_response.access_token;

                try_count += 1;
                continue;
            }

            debug!(
                %method,
                path,
                status = response.status().as_u16(),
                elapsed_ms = start_time.elapsed().as_millis() as u64,
                "request finished"
            );

            return Ok(response);
        }
    }
}

impl CatalogStore for CatalogClient {
    fn scan_keys(&self, statuses: &[RecordStatus]) -> Result<Vec<(String, RecordId)>, CatalogError> {
        let mut criteria = Criteria {
            limit: Some(Criteria::MAX_LIMIT),
            fields: vec!["id".to_string(), "businessKey".to_string()],
            ..Default::default()
        };
        criteria
            .add_filter(CriteriaFilter::EqualsAny {
                field: "status".to_string(),
                value: statuses.iter().map(|s| json!(s)).collect(),
            })
            .add_filter(CriteriaFilter::Not {
                operator: LogicOperator::Or,
                queries: vec![
                    CriteriaFilter::Equals {
                        field: "businessKey".to_string(),
                        value: serde_json::Value::Null,
                    },
                    CriteriaFilter::Equals {
                        field: "businessKey".to_string(),
                        value: json!(""),
                    },
                ],
            })
            // stable order, so pages don't shift while we walk them
            .add_sorting(CriteriaSorting {
                field: "id".to_string(),
                order: CriteriaSortingOrder::Ascending,
            });

        let mut keys = vec![];
        loop {
            let page: ListResponse<KeyedRecord> = self.list(&criteria)?;
            let page_len = page.data.len();
            keys.extend(
                page.data
                    .into_iter()
                    .filter(|r| !r.business_key.trim().is_empty())
                    .map(|r| (r.business_key, r.id)),
            );

            if page_len < Criteria::MAX_LIMIT {
                break;
            }
            criteria.page += 1;
        }

        Ok(keys)
    }

    fn create(&self, write: &RecordWrite) -> Result<RecordId, CatalogError> {
        // ids are generated client side, the API then doesn't need to echo them back
        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut body = serde_json::to_value(write).map_err(ApiError::from)?;
        if let serde_json::Value::Object(map) = &mut body {
            map.insert("id".to_string(), json!(id));
        }

        let url = format!("{}/api/{}", self.credentials.base_url, self.entity);
        self.write(Method::POST, url, &body)?;
        Ok(id)
    }

    fn update(&self, id: &RecordId, write: &RecordWrite) -> Result<(), CatalogError> {
        let body = serde_json::to_value(write).map_err(ApiError::from)?;
        let url = format!("{}/api/{}/{}", self.credentials.base_url, self.entity, id);
        not_found_as(id, self.write(Method::PATCH, url, &body))
    }

    fn set_status(&self, id: &RecordId, status: RecordStatus) -> Result<(), CatalogError> {
        let url = format!("{}/api/{}/{}", self.credentials.base_url, self.entity, id);
        not_found_as(id, self.write(Method::PATCH, url, &json!({ "status": status })))
    }
}

const RECORD_NOT_FOUND: &str = "FRAMEWORK__ENTITY_NOT_FOUND";

/// A write to a record that no longer exists is [`CatalogError::NotFound`]
fn not_found_as(id: &RecordId, result: Result<(), ApiError>) -> Result<(), CatalogError> {
    match result {
        Err(ApiError::Server(status, body))
            if status == StatusCode::NOT_FOUND || body.check_for_error_code(RECORD_NOT_FOUND) =>
        {
            Err(CatalogError::NotFound(id.clone()))
        }
        other => Ok(other?),
    }
}

#[derive(Debug, Serialize)]
struct AuthBody {
    grant_type: String,
    client_id: String,
    client_secret: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    // token_type: String,
    // expires_in: u32,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct KeyedRecord {
    id: RecordId,
    #[serde(rename = "businessKey", default)]
    business_key: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("The server returned an {0} error response:\n{1:#?}")]
    Server(StatusCode, ErrorBody),
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to deserialize json into schema of type {0}, got:\n{1}")]
    DeserializeIntoSchema(String, String),
    #[error("Failed to authenticate, got {0} with body:\n{1}")]
    AuthFailed(StatusCode, String),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorBody {
    pub errors: Vec<ErrorEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorEntry {
    pub code: String,
    #[serde(default)]
    pub detail: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl ErrorBody {
    pub fn check_for_error_code(&self, error_code: &str) -> bool {
        self.errors.iter().any(|error| error.code == error_code)
    }
}

#[derive(Debug, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_lookup() {
        let body: ErrorBody = serde_json::from_value(json!({
            "errors": [
                {"code": "1213", "status": "500", "title": "Internal Server Error", "detail": "Deadlock found"},
                {"code": "CATALOG__WRITE_ERROR"}
            ]
        }))
        .unwrap();

        assert!(body.check_for_error_code("1213"));
        assert!(body.check_for_error_code("CATALOG__WRITE_ERROR"));
        assert!(!body.check_for_error_code("404"));
    }

    #[test]
    fn missing_record_maps_to_not_found() {
        let id = "a1".to_string();
        let gone = ApiError::Server(StatusCode::NOT_FOUND, ErrorBody { errors: vec![] });
        assert!(matches!(not_found_as(&id, Err(gone)), Err(CatalogError::NotFound(id)) if id == "a1"));

        let body: ErrorBody =
            serde_json::from_value(json!({"errors": [{"code": RECORD_NOT_FOUND}]})).unwrap();
        let gone = ApiError::Server(StatusCode::BAD_REQUEST, body);
        assert!(matches!(not_found_as(&id, Err(gone)), Err(CatalogError::NotFound(_))));

        let body: ErrorBody =
            serde_json::from_value(json!({"errors": [{"code": "1213"}]})).unwrap();
        let other = ApiError::Server(StatusCode::INTERNAL_SERVER_ERROR, body);
        assert!(matches!(not_found_as(&id, Err(other)), Err(CatalogError::Api(_))));
        assert!(not_found_as(&id, Ok(())).is_ok());
    }

    #[test]
    fn keyed_record_without_business_key() {
        let page: ListResponse<KeyedRecord> = serde_json::from_value(json!({
            "data": [
                {"id": "a1", "businessKey": "A100"},
                {"id": "a2"}
            ]
        }))
        .unwrap();

        assert_eq!(page.data[0].business_key, "A100");
        assert_eq!(page.data[1].business_key, "");
    }

    #[test]
    fn record_write_payload_shape() {
        let mut write = RecordWrite {
            business_key: "A100".to_string(),
            status: RecordStatus::Active,
            attributes: Default::default(),
            tags: Default::default(),
        };
        write
            .attributes
            .insert("part_description".to_string(), "20x9 Gloss".to_string());
        write
            .tags
            .insert(crate::catalog::TagKind::StyleGroup, "D538".to_string());

        assert_eq!(
            serde_json::to_value(&write).unwrap(),
            json!({
                "businessKey": "A100",
                "status": "active",
                "attributes": {"part_description": "20x9 Gloss"},
                "tags": {"style_group": "D538"}
            })
        );
    }
}
