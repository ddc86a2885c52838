//! HTTP client for the credential endpoints.

use crate::error::ClientError;
use huddle_crypto::PublicKey;
use huddle_types::RoomId;
use serde::{Deserialize, Serialize};

/// A join token scoped to one room.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub token: String,
    pub room_id: RoomId,
}

#[derive(Debug, Serialize)]
struct LoginBody<'a> {
    name: &'a str,
    email: Option<&'a str>,
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: String,
    #[serde(default)]
    room_id: Option<RoomId>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Thin wrapper over the server's three credential endpoints.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// Create a client for a server base URL, e.g.
    /// `http://localhost:7070`.
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// `POST /api/login` — obtain a login token.
    pub async fn login(
        &self,
        name: &str,
        email: Option<&str>,
        public_key: &PublicKey,
    ) -> Result<String, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/login", self.base))
            .json(&LoginBody {
                name,
                email,
                public_key: public_key.to_b64(),
            })
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(expect_token(response).await?.token)
    }

    /// `POST /api/session` — open a fresh room as host, receiving its
    /// join token.
    pub async fn create_session(&self, login_token: &str) -> Result<SessionTicket, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/session", self.base))
            .bearer_auth(login_token)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let body = expect_token(response).await?;
        Ok(SessionTicket {
            token: body.token,
            room_id: body.room_id.ok_or(ClientError::Protocol(
                "session response without room id",
            ))?,
        })
    }

    /// `POST /api/session/{room_id}` — request a join token for an
    /// existing room.
    pub async fn join_session(
        &self,
        login_token: &str,
        room_id: &RoomId,
    ) -> Result<SessionTicket, ClientError> {
        let response = self
            .http
            .post(format!("{}/api/session/{room_id}", self.base))
            .bearer_auth(login_token)
            .send()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let body = expect_token(response).await?;
        Ok(SessionTicket {
            token: body.token,
            room_id: body.room_id.unwrap_or(*room_id),
        })
    }

    /// Websocket URL for `GET /api/session/join/{token}`.
    pub fn join_url(&self, join_token: &str) -> String {
        let base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base.clone()
        };
        format!("{base}/api/session/join/{join_token}")
    }
}

async fn expect_token(response: reqwest::Response) -> Result<TokenBody, ClientError> {
    let status = response.status();
    if status.is_success() {
        response
            .json::<TokenBody>()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))
    } else {
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_trimmed() {
        let api = ApiClient::new("http://localhost:7070/");
        assert_eq!(
            api.join_url("tok"),
            "ws://localhost:7070/api/session/join/tok"
        );
    }

    #[test]
    fn join_url_swaps_scheme() {
        let api = ApiClient::new("https://collab.example.com");
        assert_eq!(
            api.join_url("tok"),
            "wss://collab.example.com/api/session/join/tok"
        );
    }
}
