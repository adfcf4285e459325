//! Credential-exchange HTTP calls.
//!
//! Every flavor but the two-factor path surfaces a proper [`AuthnError`] on failure; the
//! two-factor path instead returns an empty pair on a non-2xx response: the orchestrator
//! distinguishes "bad credentials" from "transport broke" by pair-emptiness there, not by error
//! type.

use crate::environment::Environment;
use crate::error::AuthnError;
use crate::token::store::TokenPair;
use serde::{Deserialize, Serialize};

/// Which two-factor challenge endpoint to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TwoFactorMethod {
    Tsd,
    Iam,
}

impl TwoFactorMethod {
    fn path_segment(self) -> &'static str {
        match self {
            TwoFactorMethod::Tsd => "tsd",
            TwoFactorMethod::Iam => "iam",
        }
    }
}

#[derive(Debug, Serialize)]
struct TwoFactorBody<'a> {
    user_name: &'a str,
    password: &'a str,
    otp: &'a str,
}

#[derive(Debug, Serialize)]
struct InstanceBody<'a> {
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_challenge: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Thin wrapper over a `reqwest::Client` dedicated to the four auth endpoints.
pub struct AuthClient {
    http: reqwest::Client,
    /// Overrides every environment's resolved base URL when set, mirroring
    /// `RuntimeConfig::base_url_override` - so a test can point this at a `wiremock` server
    /// without needing a `RuntimeConfig` threaded through every auth call.
    base_url_override: Option<String>,
}

impl AuthClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url_override: None,
        }
    }

    pub fn with_base_url_override(mut self, base: impl Into<String>) -> Self {
        self.base_url_override = Some(base.into());
        self
    }

    fn url(&self, env: Environment, tenant: &str, suffix: &str) -> String {
        let base = self
            .base_url_override
            .clone()
            .unwrap_or_else(|| env.api_base());
        format!("{base}/{tenant}{suffix}")
    }

    /// `POST /{pnum}/auth/basic/token?type={kind}` with `Authorization: Bearer <api_key>`.
    pub async fn basic_auth(
        &self,
        env: Environment,
        tenant: &str,
        kind: &str,
        api_key: &str,
    ) -> Result<TokenPair, AuthnError> {
        let url = self.url(env, tenant, &format!("/auth/basic/token?type={kind}"));
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthnError::NotAuthorizedFromIp);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthnError::Rejected(format!("{status}: {body}")));
        }
        let parsed: TokenResponse = response.json().await?;
        Ok(TokenPair {
            access: parsed.token,
            refresh: parsed.refresh_token,
        })
    }

    /// `POST /{pnum}/auth/tsd/token?type={kind}` or `.../iam/token`, body
    /// `{user_name, password, otp}`. Returns `Ok(None)` rather than an error on a non-2xx
    /// response, per the documented exception to the usual propagation policy.
    pub async fn two_factor_auth(
        &self,
        env: Environment,
        tenant: &str,
        kind: &str,
        method: TwoFactorMethod,
        user_name: &str,
        password: &str,
        otp: &str,
    ) -> Result<Option<TokenPair>, AuthnError> {
        let url = self.url(
            env,
            tenant,
            &format!("/auth/{}/token?type={kind}", method.path_segment()),
        );
        let response = self
            .http
            .post(&url)
            .json(&TwoFactorBody {
                user_name,
                password,
                otp,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            tracing::debug!(target: "token", status = %response.status(), "two-factor auth rejected");
            return Ok(None);
        }
        let parsed: TokenResponse = response.json().await?;
        Ok(Some(TokenPair {
            access: parsed.token,
            refresh: parsed.refresh_token,
        }))
    }

    /// `POST /{pnum}/auth/instances/token?type={kind}`, body `{id, secret_challenge?}`.
    pub async fn instance_auth(
        &self,
        env: Environment,
        tenant: &str,
        kind: &str,
        link_id: &str,
        secret_challenge: Option<&str>,
    ) -> Result<TokenPair, AuthnError> {
        let url = self.url(env, tenant, &format!("/auth/instances/token?type={kind}"));
        let response = self
            .http
            .post(&url)
            .json(&InstanceBody {
                id: link_id,
                secret_challenge,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthnError::Rejected(format!("{status}: {body}")));
        }
        let parsed: TokenResponse = response.json().await?;
        Ok(TokenPair {
            access: parsed.token,
            refresh: parsed.refresh_token,
        })
    }

    /// `POST /{pnum}/auth/refresh/token`, body `{refresh_token}`. May come back access-only when
    /// the refresh counter is exhausted.
    pub async fn refresh(
        &self,
        env: Environment,
        tenant: &str,
        refresh_token: &str,
    ) -> Result<TokenPair, AuthnError> {
        let url = self.url(env, tenant, "/auth/refresh/token");
        let response = self
            .http
            .post(&url)
            .json(&RefreshBody { refresh_token })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthnError::Rejected(format!("{status}: {body}")));
        }
        let parsed: TokenResponse = response.json().await?;
        Ok(TokenPair {
            access: parsed.token,
            refresh: parsed.refresh_token,
        })
    }
}
