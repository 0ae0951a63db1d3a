//! The API client itself: request plumbing, pagination and the initial
//! registration call.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use bleemeo_core::{AgentIdentity, ConnectorError, Result};

use crate::auth::TokenCache;
use crate::pagination::Page;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const USER_AGENT: &str = concat!("bleemeo-connector/", env!("CARGO_PKG_VERSION"));

pub struct ApiClient {
    http: reqwest::Client,
    /// Redirect-disabled twin of `http`, used only for the account-config
    /// lookup that must follow exactly one 302
    /// instead of reqwest's default multi-hop redirect policy.
    no_redirect_http: reqwest::Client,
    base_url: String,
    tokens: TokenCache,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_tls_verification(base_url, true)
    }

    /// `verify_tls = false` disables certificate validation; only meant for on-prem/test
    /// deployments pointing at a self-signed API endpoint.
    pub fn with_tls_verification(base_url: impl Into<String>, verify_tls: bool) -> Result<Self> {
        let base_url = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;
        let no_redirect_http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .danger_accept_invalid_certs(!verify_tls)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;
        let tokens = TokenCache::new(http.clone(), base_url.clone());
        Ok(Self { http, no_redirect_http, base_url, tokens })
    }

    /// `POST v1/agent/` for initial registration: HTTP Basic auth is `{account_id}@bleemeo.com:{registration_key}`
    /// — not the account id alone — and the body carries the freshly
    /// generated local password the agent will reuse as its MQTT broker
    /// password. Expects 201 with `{id}`; any other status is an API
    /// error the caller retries with the connector's exponential backoff.
    pub async fn register_agent(
        &self,
        identity: &AgentIdentity,
        initial_password: &str,
        display_name: &str,
        fqdn: &str,
    ) -> Result<Value> {
        let url = format!("{}/v1/agent/", self.base_url);
        let basic_username = format!("{}@bleemeo.com", identity.account_id);
        let body = serde_json::json!({
            "account": identity.account_id,
            "initial_password": initial_password,
            "display_name": display_name,
            "fqdn": fqdn,
        });

        let response = self
            .http
            .post(&url)
            .basic_auth(&basic_username, Some(&identity.registration_key))
            .header("X-Requested-With", "XMLHttpRequest")
            .json(&body)
            .send()
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;

        Self::into_json(response, "v1/agent/").await
    }

    /// `GET` a single resource, authenticated, with one retry after a
    /// bearer-token refresh if the first attempt comes back 401. `path` may
    /// be a path relative to the configured base URL, or a fully-qualified
    /// URL as handed back in a listing's `next` field.
    pub async fn get(&self, identity: &AgentIdentity, path: &str) -> Result<Value> {
        let url = self.resolve(path);
        self.authenticated(identity, |token| {
            self.http.get(&url).bearer_auth(token).header("X-Requested-With", "XMLHttpRequest")
        })
        .await
    }

    /// `GET /v1/accountconfig/{id}/` with redirects disabled, following a
    /// bare 302 exactly once to `/v1/config/{id}/`.
    /// Any other non-2xx status is an ordinary API error.
    pub async fn get_account_config(&self, identity: &AgentIdentity, accountconfig_path: &str) -> Result<Value> {
        let url = self.resolve(accountconfig_path);
        let token = self.tokens.token(identity).await?;
        let response = self
            .no_redirect_http
            .get(&url)
            .bearer_auth(&token)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;

        if response.status().as_u16() == 302 {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ConnectorError::Invariant("302 with no Location header".to_string()))?
                .to_string();
            return self.get(identity, &location).await;
        }

        Self::into_json(response, accountconfig_path).await
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    pub async fn post(&self, identity: &AgentIdentity, path: &str, body: &Value) -> Result<Value> {
        let url = self.resolve(path);
        self.authenticated(identity, |token| {
            self.http.post(&url).bearer_auth(token).header("X-Requested-With", "XMLHttpRequest").json(body)
        })
        .await
    }

    pub async fn patch(&self, identity: &AgentIdentity, path: &str, body: &Value) -> Result<Value> {
        let url = self.resolve(path);
        self.authenticated(identity, |token| {
            self.http.patch(&url).bearer_auth(token).header("X-Requested-With", "XMLHttpRequest").json(body)
        })
        .await
    }

    pub async fn delete(&self, identity: &AgentIdentity, path: &str) -> Result<()> {
        let url = self.resolve(path);
        let token = self.tokens.token(identity).await?;
        let response = self
            .http
            .delete(&url)
            .bearer_auth(&token)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;

        if response.status().as_u16() == 401 {
            let token = self.tokens.refresh(identity).await?;
            let response = self
                .http
                .delete(&url)
                .bearer_auth(&token)
                .header("X-Requested-With", "XMLHttpRequest")
                .send()
                .await
                .map_err(|err| ConnectorError::Transport(err.to_string()))?;
            Self::check_status(&response, path)?;
            return Ok(());
        }

        Self::check_status(&response, path)?;
        Ok(())
    }

    /// Follow `next` links starting at `path` until the server returns one
    /// of: an empty/absent `next`, or a 404.
    pub async fn paginate<T: DeserializeOwned>(
        &self,
        identity: &AgentIdentity,
        path: &str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(path.to_string());

        while let Some(current) = next.take() {
            let value = match self.get(identity, &current).await {
                Ok(value) => value,
                Err(ConnectorError::NotFound { .. }) => break,
                Err(err) => return Err(err),
            };

            let page: Page<T> = serde_json::from_value(value)
                .map_err(|err| ConnectorError::Invariant(format!("unexpected page shape: {err}")))?;
            items.extend(page.results);
            next = page.next;
        }

        Ok(items)
    }

    async fn authenticated(
        &self,
        identity: &AgentIdentity,
        build: impl Fn(&str) -> reqwest::RequestBuilder,
    ) -> Result<Value> {
        let token = self.tokens.token(identity).await?;
        let response = build(&token)
            .send()
            .await
            .map_err(|err| ConnectorError::Transport(err.to_string()))?;

        if response.status().as_u16() == 401 {
            let token = self.tokens.refresh(identity).await?;
            let response = build(&token)
                .send()
                .await
                .map_err(|err| ConnectorError::Transport(err.to_string()))?;
            return Self::into_json(response, "").await;
        }

        Self::into_json(response, "").await
    }

    /// Consume `response`: parse the body as JSON on success, otherwise
    /// fold the status and body text into a [`ConnectorError`].
    async fn into_json(response: reqwest::Response, resource: &str) -> Result<Value> {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            return serde_json::from_str(&body)
                .map_err(|err| ConnectorError::Invariant(format!("malformed JSON body: {err}")));
        }
        Err(ConnectorError::api(status.as_u16(), resource, body))
    }

    fn check_status(response: &reqwest::Response, resource: &str) -> Result<()> {
        if response.status().is_success() {
            return Ok(());
        }
        Err(ConnectorError::api(response.status().as_u16(), resource, ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_keeps_absolute_next_links_untouched() {
        let client = ApiClient::new("https://api.bleemeo.com").unwrap();
        assert_eq!(client.resolve("/v1/metric/"), "https://api.bleemeo.com/v1/metric/");
        assert_eq!(
            client.resolve("https://api.bleemeo.com/v1/metric/?page=2"),
            "https://api.bleemeo.com/v1/metric/?page=2"
        );
    }
}
