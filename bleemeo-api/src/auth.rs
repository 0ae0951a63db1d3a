//! JWT acquisition and the single-retry-on-401 refresh policy.

use tokio::sync::Mutex;

use bleemeo_core::{AgentIdentity, ConnectorError, Result};

/// Holds the current bearer token, re-authenticating lazily. A `Mutex`
/// (not `RwLock`) because acquiring a fresh token is itself an HTTP round
/// trip that must not run twice concurrently for the same identity.
pub struct TokenCache {
    client: reqwest::Client,
    base_url: String,
    token: Mutex<Option<String>>,
}

impl TokenCache {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into(), token: Mutex::new(None) }
    }

    /// The cached token, fetching one first if none is held yet.
    pub async fn token(&self, identity: &AgentIdentity) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let fresh = self.fetch(identity).await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Discard the cached token and fetch a new one. Called exactly once
    /// per request after a 401, never in a loop.
    pub async fn refresh(&self, identity: &AgentIdentity) -> Result<String> {
        let fresh = self.fetch(identity).await?;
        *self.token.lock().await = Some(fresh.clone());
        Ok(fresh)
    }

    /// `POST v1/jwt-auth/ {username, password}` → `{token}`. 5xx here is transient (surfaced as `ConnectorError::Api`, which
    /// `is_transient()` recognizes); only a 4xx response is folded into
    /// `AUTH_ERROR`, since the reconciler's backoff policy distinguishes
    /// "credentials are bad" from "the auth endpoint is briefly down".
    async fn fetch(&self, identity: &AgentIdentity) -> Result<String> {
        let username = identity
            .agent_username()
            .ok_or_else(|| ConnectorError::auth("agent is not yet registered; no agent_uuid"))?;
        let password = identity
            .password
            .as_deref()
            .ok_or_else(|| ConnectorError::auth("no password set; agent is not yet registered"))?;

        let url = format!("{}/v1/jwt-auth/", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&serde_json::json!({"username": username, "password": password}))
            .send()
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(ConnectorError::api(status.as_u16(), "v1/jwt-auth/", body));
            }
            return Err(ConnectorError::auth(format!(
                "token request rejected with status {status}: {body}"
            )));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|err| ConnectorError::Invariant(format!("jwt-auth response: {err}")))?;
        Ok(body.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_identity_cannot_authenticate() {
        // Exercised indirectly: `TokenCache::fetch` requires both
        // `agent_uuid` and `password`; `AgentIdentity::new` leaves both
        // `None`, so the very first call must short-circuit to AUTH_ERROR
        // instead of sending a request with an empty username.
        let identity = AgentIdentity::new("acct-1", "reg-xyz");
        assert!(identity.agent_username().is_none());
    }
}
