// network.rs - NetworkRepository: the wire protocol client (§6)
//
// Grounded on the teacher's `trailbase/client.rs`: a thin `reqwest::Client`
// wrapper, a `build_headers`/`handle_response` pair, and explicit status-code
// to error-kind mapping. Extended here with the Kinvey-style API version
// header, `X-Kinvey-Request-Start` extraction, and a single unauthorized-retry.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::auth::{AuthProvider, AuthType, SessionCredentials};
use crate::client::ClientConfig;
use crate::entity::Entity;
use crate::error::{self, Error, Result};
use crate::query::{Aggregation, GroupResult, Query};

const API_VERSION: &str = "4";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";
const REQUEST_START_HEADER: &str = "x-kinvey-request-start";

/// One page of a delta-set pull: entities changed since the prior mark, ids
/// deleted since the prior mark, and the server's authoritative new mark (§4.8).
pub struct DeltaSetPage {
    pub changed: Vec<Entity>,
    pub deleted_ids: Vec<String>,
    pub request_start: String,
}

/// One page of a regular (non-delta) pull, carrying the request-start mark
/// so the caller can seed a CachedQuery entry for a future delta-set pull.
pub struct Page {
    pub entities: Vec<Entity>,
    pub request_start: String,
}

pub struct NetworkRepository {
    http: reqwest::Client,
    config: Arc<ClientConfig>,
    auth: Arc<AuthProvider>,
}

impl NetworkRepository {
    pub fn new(config: Arc<ClientConfig>, auth: Arc<AuthProvider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.default_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(Error::from)?;
        Ok(Self { http, config, auth })
    }

    fn collection_url(&self, collection: &str, suffix: &str) -> String {
        format!(
            "{}/appdata/{}/{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.app_key,
            collection,
            suffix
        )
    }

    async fn headers(&self, scheme: AuthType) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(ACCEPT, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(
            "X-Kinvey-Api-Version",
            HeaderValue::from_static(API_VERSION),
        );
        if let Some(value) = self.auth.header_value(scheme).await? {
            let header_value = HeaderValue::from_str(&value)
                .map_err(|e| Error::Kinvey(format!("invalid authorization header: {e}")))?;
            headers.insert(AUTHORIZATION, header_value);
        }
        Ok(headers)
    }

    fn request_start(response: &reqwest::Response) -> String {
        response
            .headers()
            .get(REQUEST_START_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default()
    }

    /// Sends `build` once; on a 401 it serializes through the shared refresh
    /// lock and retries exactly once with a freshly-read auth header.
    async fn send_with_retry<F>(&self, scheme: AuthType, build: F) -> Result<reqwest::Response>
    where
        F: Fn(HeaderMap) -> reqwest::RequestBuilder,
    {
        let headers = self.headers(scheme).await?;
        let response = build(headers).send().await.map_err(Error::from)?;
        if response.status().as_u16() != 401 {
            return Ok(response);
        }

        tracing::debug!("received 401, waiting for session refresh before retrying once");
        let refreshed = self.auth.with_refresh_lock(|| self.refresh_session()).await;
        if let Err(err) = refreshed {
            tracing::warn!(error = %err, "session refresh failed, rejecting queued request");
            return Err(Error::InvalidCredentials(err.to_string()));
        }
        let headers = self.headers(scheme).await?;
        build(headers).send().await.map_err(Error::from)
    }

    /// Refreshes the active session against the MIC token endpoint (§4.10):
    /// exchanges the session's stored refresh token for a new access token,
    /// then re-establishes the Kinvey session via a social login call. Any
    /// failure here is surfaced to the caller as `InvalidCredentials` by
    /// `send_with_retry`, which logs the active user out effectively.
    async fn refresh_session(&self) -> Result<()> {
        let refresh_token = self
            .auth
            .session_refresh_token()
            .await
            .ok_or(Error::NoActiveUser)?;
        let mic_host = self
            .config
            .mic_host
            .clone()
            .ok_or_else(|| Error::MissingConfiguration("micHost".into()))?;

        let token_url = format!("{}/oauth/token", mic_host.trim_end_matches('/'));
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("client_id", self.config.app_key.as_str()),
        ];
        let response = self.http.post(&token_url).form(&params).send().await.map_err(Error::from)?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::InvalidGrant(body));
        }
        let token_body: Value = response.json().await.map_err(Error::from)?;
        let access_token = token_body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Kinvey("MIC refresh response missing access_token".into()))?
            .to_string();
        let new_refresh_token = token_body
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(refresh_token);

        let login_url = format!(
            "{}/user/{}/login",
            self.config.base_url.trim_end_matches('/'),
            self.config.app_key
        );
        let login_body = json!({"_socialIdentity": {"kinveyAuth": {"access_token": access_token}}});
        let headers = self.headers(AuthType::App).await?;
        let response = self
            .http
            .post(&login_url)
            .headers(headers)
            .json(&login_body)
            .send()
            .await
            .map_err(Error::from)?;
        let (user, _) = self.handle_json(response).await?;
        let user_id = user
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Kinvey("login response missing _id".into()))?
            .to_string();
        let auth_token = user
            .get("_kmd")
            .and_then(Value::as_object)
            .and_then(|kmd| kmd.get("authtoken"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Kinvey("login response missing _kmd.authtoken".into()))?
            .to_string();

        self.auth
            .set_session(SessionCredentials {
                user_id,
                auth_token,
                refresh_token: Some(new_refresh_token),
            })
            .await;
        Ok(())
    }

    async fn handle_json(&self, response: reqwest::Response) -> Result<(Value, String)> {
        let status = response.status();
        let request_start = Self::request_start(&response);
        if status.is_success() {
            let body: Value = response.json().await.map_err(Error::from)?;
            return Ok((body, request_start));
        }
        let body = response.text().await.unwrap_or_default();
        Err(Self::map_error_body(status.as_u16(), &body))
    }

    fn map_error_body(status: u16, body: &str) -> Error {
        if let Ok(parsed) = serde_json::from_str::<Value>(body) {
            if let (Some(code), Some(message)) = (
                parsed.get("error").and_then(Value::as_str),
                parsed.get("description").and_then(Value::as_str),
            ) {
                return error::from_server_error_code(code, message);
            }
        }
        error::from_status(status, body)
    }

    pub async fn create(&self, collection: &str, entity: Entity) -> Result<Entity> {
        let url = self.collection_url(collection, "");
        let response = self
            .send_with_retry(AuthType::Default, |headers| {
                self.http.post(&url).headers(headers).json(&entity)
            })
            .await?;
        let (body, _) = self.handle_json(response).await?;
        as_entity(body)
    }

    pub async fn update(&self, collection: &str, entity: Entity) -> Result<Entity> {
        let id = crate::entity::id_of(&entity)
            .ok_or_else(|| Error::Sync("cannot update an entity without an _id".into()))?
            .to_string();
        let url = self.collection_url(collection, &format!("/{id}"));
        let response = self
            .send_with_retry(AuthType::Default, |headers| {
                self.http.put(&url).headers(headers).json(&entity)
            })
            .await?;
        let (body, _) = self.handle_json(response).await?;
        as_entity(body)
    }

    pub async fn read(&self, collection: &str, query: Option<&Query>) -> Result<Page> {
        let url = self.collection_url(collection, "");
        let params = query.map(Query::to_query_params).unwrap_or_default();
        let response = self
            .send_with_retry(AuthType::Default, |headers| {
                self.http.get(&url).headers(headers).query(&params)
            })
            .await?;
        let (body, request_start) = self.handle_json(response).await?;
        let entities = match body {
            Value::Array(items) => items.into_iter().map(as_entity).collect::<Result<Vec<_>>>()?,
            other => vec![as_entity(other)?],
        };
        Ok(Page { entities, request_start })
    }

    pub async fn read_by_id(&self, collection: &str, id: &str) -> Result<Entity> {
        let url = self.collection_url(collection, &format!("/{id}"));
        let response = self
            .send_with_retry(AuthType::Default, |headers| self.http.get(&url).headers(headers))
            .await?;
        let (body, _) = self.handle_json(response).await?;
        as_entity(body)
    }

    pub async fn count(&self, collection: &str, query: Option<&Query>) -> Result<u64> {
        let url = self.collection_url(collection, "/_count");
        let params = query.map(Query::to_query_params).unwrap_or_default();
        let response = self
            .send_with_retry(AuthType::Default, |headers| {
                self.http.get(&url).headers(headers).query(&params)
            })
            .await?;
        let (body, _) = self.handle_json(response).await?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Kinvey("_count response missing `count`".into()))
    }

    pub async fn delete_by_id(&self, collection: &str, id: &str) -> Result<u64> {
        let url = self.collection_url(collection, &format!("/{id}"));
        let response = self
            .send_with_retry(AuthType::Default, |headers| self.http.delete(&url).headers(headers))
            .await?;
        let (body, _) = self.handle_json(response).await?;
        Ok(body.get("count").and_then(Value::as_u64).unwrap_or(1))
    }

    pub async fn group(&self, collection: &str, aggregation: &Aggregation) -> Result<Vec<GroupResult>> {
        let url = self.collection_url(collection, "/_group");
        let body = serde_json::to_value(aggregation)?;
        let response = self
            .send_with_retry(AuthType::Default, |headers| {
                self.http.post(&url).headers(headers).json(&body)
            })
            .await?;
        let (body, _) = self.handle_json(response).await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Pulls one delta-set page: changes and deletions since `since` (§4.8, §6).
    pub async fn delta_set(&self, collection: &str, query: Option<&Query>, since: &str) -> Result<DeltaSetPage> {
        let url = self.collection_url(collection, "/_deltaset");
        let mut params = query.map(Query::to_query_params).unwrap_or_default();
        params.push(("since".to_string(), since.to_string()));
        let response = self
            .send_with_retry(AuthType::Default, |headers| {
                self.http.get(&url).headers(headers).query(&params)
            })
            .await?;
        let (body, request_start) = self.handle_json(response).await?;

        let changed = body
            .get("changed")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(as_entity)
            .collect::<Result<Vec<_>>>()?;
        let deleted_ids = body
            .get("deleted")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.get("_id").and_then(Value::as_str).map(str::to_string))
            .collect();

        Ok(DeltaSetPage {
            changed,
            deleted_ids,
            request_start,
        })
    }
}

fn as_entity(value: Value) -> Result<Entity> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::Kinvey(format!("expected a JSON object, got {other}"))),
    }
}
