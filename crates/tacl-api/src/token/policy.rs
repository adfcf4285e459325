//! The windowed refresh policy that decides whether a chunk/file/directory operation
//! should ask the server for a new access token before proceeding.

use crate::environment::Environment;
use crate::token::auth::AuthClient;
use crate::token::store::{SessionStore, TokenPair};
use std::time::Duration;

/// Result of a `maybe_refresh` call: the token pair the caller should use from here on, and
/// whether a network refresh actually happened (so callers can log/thread a new connection pool).
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access: Option<String>,
    pub refresh: Option<String>,
    pub refreshed: bool,
}

/// Decide whether to refresh and, if so, do it and persist the result.
///
/// - No refresh token: returns the existing access unchanged (possibly `None`).
/// - Outside `[refresh_target-before, refresh_target+after]` and not `force`: unchanged, no I/O.
/// - Inside the window or forced: calls the refresh endpoint. Both tokens back: overwrite the
///   session and return both. Access only (refresh counter exhausted): store access, drop refresh.
/// - On failure: return the caller's existing access unchanged; log at debug.
#[allow(clippy::too_many_arguments)]
pub async fn maybe_refresh(
    auth: &AuthClient,
    session: &SessionStore,
    env: Environment,
    tenant: &str,
    kind: &str,
    access: Option<&str>,
    refresh: Option<&str>,
    refresh_target: i64,
    now: i64,
    before: Duration,
    after: Duration,
    force: bool,
) -> RefreshOutcome {
    let Some(refresh_token) = refresh else {
        return RefreshOutcome {
            access: access.map(str::to_string),
            refresh: None,
            refreshed: false,
        };
    };

    let window_start = refresh_target - before.as_secs() as i64;
    let window_end = refresh_target + after.as_secs() as i64;
    let in_window = now >= window_start && now <= window_end;

    if !in_window && !force {
        return RefreshOutcome {
            access: access.map(str::to_string),
            refresh: Some(refresh_token.to_string()),
            refreshed: false,
        };
    }

    match auth.refresh(env, tenant, refresh_token).await {
        Ok(TokenPair {
            access: new_access,
            refresh: new_refresh,
        }) => {
            if let Err(err) = session.update(env, tenant, kind, &new_access, new_refresh.as_deref()) {
                tracing::debug!(target: "token", %err, "failed to persist refreshed session");
            }
            RefreshOutcome {
                access: Some(new_access),
                refresh: new_refresh,
                refreshed: true,
            }
        }
        Err(err) => {
            tracing::debug!(target: "token", %err, "token refresh failed, keeping existing access");
            RefreshOutcome {
                access: access.map(str::to_string),
                refresh: Some(refresh_token.to_string()),
                refreshed: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::store::SessionStore;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn no_refresh_token_returns_access_unchanged() {
        let dir = tempdir().unwrap();
        let session = SessionStore::new(dir.path().join("session"));
        let auth = AuthClient::new(reqwest::Client::new());

        let outcome = maybe_refresh(
            &auth,
            &session,
            Environment::Prod,
            "p11",
            "import",
            Some("access-1"),
            None,
            1000,
            1000,
            Duration::from_secs(300),
            Duration::from_secs(600),
            false,
        )
        .await;

        assert_eq!(outcome.access.as_deref(), Some("access-1"));
        assert!(!outcome.refreshed);
    }

    #[tokio::test]
    async fn outside_window_and_not_forced_is_a_no_op() {
        let dir = tempdir().unwrap();
        let session = SessionStore::new(dir.path().join("session"));
        let auth = AuthClient::new(reqwest::Client::new());

        // refresh_target=1000, window is [700, 1600]; now=100 is well outside it.
        let outcome = maybe_refresh(
            &auth,
            &session,
            Environment::Prod,
            "p11",
            "import",
            Some("access-1"),
            Some("refresh-1"),
            1000,
            100,
            Duration::from_secs(300),
            Duration::from_secs(600),
            false,
        )
        .await;

        assert_eq!(outcome.access.as_deref(), Some("access-1"));
        assert!(!outcome.refreshed);
        // Steady state must not mutate the session either.
        assert!(session.get(Environment::Prod, "p11", "import").unwrap().is_none());
    }

    /// Inside the window, a refresh that returns both tokens overwrites the persisted session
    /// with both and reports `refreshed: true`.
    #[tokio::test]
    async fn inside_window_with_both_tokens_back_persists_and_returns_both() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p11/auth/refresh/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "access-2",
                "refresh_token": "refresh-2"
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let session = SessionStore::new(dir.path().join("session"));
        let auth = AuthClient::new(reqwest::Client::new()).with_base_url_override(server.uri());

        let outcome = maybe_refresh(
            &auth,
            &session,
            Environment::Prod,
            "p11",
            "import",
            Some("access-1"),
            Some("refresh-1"),
            1000,
            1000,
            Duration::from_secs(300),
            Duration::from_secs(600),
            false,
        )
        .await;

        assert!(outcome.refreshed);
        assert_eq!(outcome.access.as_deref(), Some("access-2"));
        assert_eq!(outcome.refresh.as_deref(), Some("refresh-2"));
        let persisted = session.get(Environment::Prod, "p11", "import").unwrap().unwrap();
        assert_eq!(persisted.access, "access-2");
        assert_eq!(persisted.refresh.as_deref(), Some("refresh-2"));
    }

    /// Inside the window, a refresh that returns only a new access token (refresh counter
    /// exhausted) drops the refresh token from the outcome and the persisted session.
    #[tokio::test]
    async fn inside_window_with_access_only_back_drops_the_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p11/auth/refresh/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "access-2"})),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let session = SessionStore::new(dir.path().join("session"));
        session
            .update(Environment::Prod, "p11", "import", "access-1", Some("refresh-1"))
            .unwrap();
        let auth = AuthClient::new(reqwest::Client::new()).with_base_url_override(server.uri());

        let outcome = maybe_refresh(
            &auth,
            &session,
            Environment::Prod,
            "p11",
            "import",
            Some("access-1"),
            Some("refresh-1"),
            1000,
            1000,
            Duration::from_secs(300),
            Duration::from_secs(600),
            false,
        )
        .await;

        assert!(outcome.refreshed);
        assert_eq!(outcome.access.as_deref(), Some("access-2"));
        assert_eq!(outcome.refresh, None);
        let persisted = session.get(Environment::Prod, "p11", "import").unwrap().unwrap();
        assert_eq!(persisted.refresh, None);
    }

    /// A `force: true` call refreshes even outside the window.
    #[tokio::test]
    async fn forced_refresh_ignores_the_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p11/auth/refresh/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "access-2",
                "refresh_token": "refresh-2"
            })))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let session = SessionStore::new(dir.path().join("session"));
        let auth = AuthClient::new(reqwest::Client::new()).with_base_url_override(server.uri());

        // refresh_target=1000, window is [700, 1600]; now=100 is outside it, but force=true.
        let outcome = maybe_refresh(
            &auth,
            &session,
            Environment::Prod,
            "p11",
            "import",
            Some("access-1"),
            Some("refresh-1"),
            1000,
            100,
            Duration::from_secs(300),
            Duration::from_secs(600),
            true,
        )
        .await;

        assert!(outcome.refreshed);
        assert_eq!(outcome.access.as_deref(), Some("access-2"));
    }

    /// A rejected refresh keeps the existing access/refresh tokens unchanged and does not touch
    /// the persisted session.
    #[tokio::test]
    async fn failed_refresh_keeps_the_existing_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/p11/auth/refresh/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let session = SessionStore::new(dir.path().join("session"));
        let auth = AuthClient::new(reqwest::Client::new()).with_base_url_override(server.uri());

        let outcome = maybe_refresh(
            &auth,
            &session,
            Environment::Prod,
            "p11",
            "import",
            Some("access-1"),
            Some("refresh-1"),
            1000,
            1000,
            Duration::from_secs(300),
            Duration::from_secs(600),
            false,
        )
        .await;

        assert!(!outcome.refreshed);
        assert_eq!(outcome.access.as_deref(), Some("access-1"));
        assert_eq!(outcome.refresh.as_deref(), Some("refresh-1"));
        assert!(session.get(Environment::Prod, "p11", "import").unwrap().is_none());
    }
}
