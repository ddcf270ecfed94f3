use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::types::{
    round_reward, AccumulatedResponse, CompletePayload, CompleteResponse,
    CountdownStatusResponse, LegacyStatusResponse, ReplyEnvelope, SaveCompletedPayload,
    SaveCompletedResponse, StartResponse, UserPayload,
};

/// A non-2xx reply, or a 2xx reply carrying `success: false`.
#[derive(Debug)]
pub struct ApiStatusError {
    endpoint: String,
    status: StatusCode,
    message: String,
    payload: Option<Value>,
}

impl ApiStatusError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }
}

impl fmt::Display for ApiStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed ({}): {}",
            self.endpoint, self.status, self.message
        )
    }
}

impl std::error::Error for ApiStatusError {}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String, token: Option<String>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let auth_value = format!("Bearer {token}");
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value).context("invalid authorization header")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("failed to build HTTP JSON client")?;

        Ok(Self { client, base_url })
    }

    pub fn start_processing(&self, user_id: &str) -> Result<StartResponse> {
        let request = self
            .client
            .post(self.url("/processing/start"))
            .json(&UserPayload { user_id });
        send_json(request, "processing/start")
    }

    pub fn countdown_status(
        &self,
        user_id: &str,
        timeout: Duration,
    ) -> Result<CountdownStatusResponse> {
        let request = self
            .client
            .get(self.user_url("/processing/status", user_id)?)
            .timeout(timeout);
        send_json(request, "processing/status/{userId}")
    }

    pub fn legacy_status(&self, user_id: &str, timeout: Duration) -> Result<LegacyStatusResponse> {
        let request = self
            .client
            .post(self.url("/processing/status"))
            .json(&UserPayload { user_id })
            .timeout(timeout);
        send_json(request, "processing/status")
    }

    pub fn accumulated(&self, user_id: &str, timeout: Duration) -> Result<AccumulatedResponse> {
        let request = self
            .client
            .get(self.user_url("/processing/accumulated", user_id)?)
            .timeout(timeout);
        send_json(request, "processing/accumulated")
    }

    pub fn save_completed(&self, user_id: &str, reward: f64) -> Result<SaveCompletedResponse> {
        let request = self
            .client
            .post(self.url("/processing/save-completed"))
            .json(&SaveCompletedPayload {
                user_id,
                completed_reward: round_reward(reward),
            });
        send_json(request, "processing/save-completed")
    }

    pub fn complete(&self, user_id: &str, reward: f64) -> Result<CompleteResponse> {
        let request = self
            .client
            .post(self.url("/processing/complete"))
            .json(&CompletePayload {
                user_id,
                final_reward: round_reward(reward),
            });
        send_json(request, "processing/complete")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Appends `user_id` as a single escaped path segment.
    fn user_url(&self, path: &str, user_id: &str) -> Result<Url> {
        let raw = self.url(path);
        let mut url = Url::parse(&raw).with_context(|| format!("invalid API URL {raw}"))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("API URL {raw} cannot carry a path"))?
            .push(user_id);
        Ok(url)
    }
}

pub fn api_status_error(err: &anyhow::Error) -> Option<&ApiStatusError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ApiStatusError>())
}

pub fn is_timeout_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(reqwest::Error::is_timeout)
    })
}

fn send_json<T: DeserializeOwned>(request: RequestBuilder, endpoint: &str) -> Result<T> {
    let resp = request
        .send()
        .with_context(|| format!("request to {endpoint} endpoint failed"))?;
    let status = resp.status();
    let body = resp
        .text()
        .with_context(|| format!("failed reading {endpoint} response body"))?;
    decode_json_body(status, &body, endpoint)
}

fn decode_json_body<T: DeserializeOwned>(status: StatusCode, body: &str, endpoint: &str) -> Result<T> {
    if status.is_success() {
        let value: Value = serde_json::from_str(body)
            .with_context(|| format!("failed to decode {endpoint} response JSON"))?;
        let envelope = ReplyEnvelope::deserialize(&value)
            .with_context(|| format!("unexpected {endpoint} response shape"))?;
        if !envelope.success {
            return Err(anyhow!(status_error(endpoint, status, body, Some(value))));
        }
        return serde_json::from_value(value)
            .with_context(|| format!("unexpected {endpoint} response shape"));
    }

    let payload = serde_json::from_str::<Value>(body).ok();
    Err(anyhow!(status_error(endpoint, status, body, payload)))
}

fn status_error(
    endpoint: &str,
    status: StatusCode,
    body: &str,
    payload: Option<Value>,
) -> ApiStatusError {
    let message = payload
        .as_ref()
        .and_then(|value| value.get("error").or_else(|| value.get("message")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.trim().to_string());

    ApiStatusError {
        endpoint: endpoint.to_string(),
        status,
        message,
        payload,
    }
}
