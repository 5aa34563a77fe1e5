//! Client for the matching HTTP API.
//!
//! Every call is a single POST with a bearer token and a JSON body. There are
//! no internal retries; callers decide what a failure means.

use callcore::error::CallError;
use callcore::net::{HttpClient, HttpRequest, HttpResponse};
use callcore::types::{MatchCriteria, MatchResponse};
use log::debug;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const MATCH_REQUEST_PATH: &str = "/match/request";
const MATCH_END_PATH: &str = "/match/end";
const FRIEND_ADD_PATH: &str = "/friends/add";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("no access token")]
    MissingToken,
    #[error("request failed with status {status}")]
    RequestFailed {
        status: u16,
        message: Option<String>,
    },
    #[error("server unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("failed to encode request body: {0}")]
    Encode(String),
}

impl From<MatchError> for CallError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::MissingToken => CallError::MissingToken,
            MatchError::RequestFailed { status, message } => {
                CallError::MatchRequestFailed { status, message }
            }
            MatchError::Unreachable(reason) => CallError::Unreachable { reason },
            MatchError::Timeout => CallError::Timeout,
            MatchError::InvalidResponse(reason) | MatchError::Encode(reason) => {
                CallError::InvalidResponse { reason }
            }
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EndSessionBody<'a> {
    session_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AddFriendBody {
    target_user_id: i64,
}

#[derive(Deserialize)]
struct AddFriendResponse {
    #[serde(default)]
    added: bool,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Clone)]
pub struct MatchClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    timeout: Duration,
}

impl MatchClient {
    pub fn new(http: Arc<dyn HttpClient>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Asks the server to pair the user with a random peer.
    pub async fn request_match(
        &self,
        criteria: &MatchCriteria,
        token: &str,
    ) -> Result<MatchResponse, MatchError> {
        let response = self.post(MATCH_REQUEST_PATH, criteria, token).await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| MatchError::InvalidResponse(e.to_string()))
    }

    /// Withdraws a pending match. The server uses the same endpoint as
    /// [`end_session`](Self::end_session).
    pub async fn cancel_match(&self, session_id: &str, token: &str) -> Result<(), MatchError> {
        self.end_session(session_id, token).await
    }

    pub async fn end_session(&self, session_id: &str, token: &str) -> Result<(), MatchError> {
        self.post(MATCH_END_PATH, &EndSessionBody { session_id }, token)
            .await
            .map(|_| ())
    }

    /// Sends a friend request to the matched peer. Returns whether the
    /// server recorded it.
    pub async fn add_friend(&self, target_user_id: i64, token: &str) -> Result<bool, MatchError> {
        let response = self
            .post(FRIEND_ADD_PATH, &AddFriendBody { target_user_id }, token)
            .await?;
        if response.body.is_empty() {
            return Ok(false);
        }
        serde_json::from_slice::<AddFriendResponse>(&response.body)
            .map(|r| r.added)
            .map_err(|e| MatchError::InvalidResponse(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        token: &str,
    ) -> Result<HttpResponse, MatchError> {
        if token.is_empty() {
            return Err(MatchError::MissingToken);
        }
        let body = serde_json::to_vec(body).map_err(|e| MatchError::Encode(e.to_string()))?;
        let url = format!("{}{}", self.base_url, path);
        debug!("POST {url}");

        let request = HttpRequest::post(url)
            .with_bearer(token)
            .with_json_body(body);

        let response = match tokio::time::timeout(self.timeout, self.http.execute(request)).await
        {
            Err(_) => return Err(MatchError::Timeout),
            Ok(Err(e)) => return Err(MatchError::Unreachable(e.to_string())),
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            return Err(MatchError::RequestFailed {
                status: response.status_code,
                message: error_message(&response.body),
            });
        }
        Ok(response)
    }
}

fn error_message(body: &[u8]) -> Option<String> {
    serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
}
