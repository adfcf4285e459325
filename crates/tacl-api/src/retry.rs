//! The retry wrapper: bounded retries around one HTTP call, absorbing 500/504 and
//! connection-level failures, rebuilding the connection pool on the latter.

use crate::error::TaclError;
use crate::runtime_config::RuntimeConfig;
use std::time::Duration;

/// Outcome of a retried call: the final response and whether the connection pool was rebuilt
/// along the way (so the caller can keep using the rebuilt client for subsequent requests).
pub struct RetryOutcome {
    pub response: reqwest::Response,
    pub pool_rebuilt: bool,
}

/// Execute one logical HTTP call with up to `config.retry_attempts` network attempts.
///
/// `build` constructs a fresh `RequestBuilder` from the current client on every attempt - this
/// lets the caller recreate a streaming body that can't be replayed after a failed send. `client`
/// is mutated in place when a connection error forces a pool rebuild, so subsequent calls by the
/// same caller (e.g. later chunks of the same upload) reuse the healthy connection.
///
/// Status handling:
/// - 2xx: return immediately (success is the caller's job to interpret further).
/// - 4xx: return immediately (non-retryable; caller surfaces as [`TaclError::Http4xx`] or similar).
/// - 500/504: decrement the counter and retry; raise [`TaclError::RetriesExhausted`] at zero.
/// - connection error (no response at all): sleep, rebuild the pool, decrement, retry.
/// - anything else: returned as-is for the caller to interpret.
pub async fn execute<F>(
    client: &mut reqwest::Client,
    mut build: F,
    config: &RuntimeConfig,
) -> Result<RetryOutcome, TaclError>
where
    F: FnMut(&reqwest::Client) -> reqwest::RequestBuilder,
{
    let mut counter = config.retry_attempts;
    let mut pool_rebuilt = false;

    loop {
        let request = build(client);
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() == 500 || status.as_u16() == 504 {
                    counter = counter.saturating_sub(1);
                    if counter == 0 {
                        return Err(TaclError::RetriesExhausted {
                            status: status.as_u16(),
                        });
                    }
                    tracing::debug!(
                        target: "retry",
                        status = status.as_u16(),
                        remaining = counter,
                        "server error, retrying"
                    );
                    continue;
                }
                return Ok(RetryOutcome {
                    response,
                    pool_rebuilt,
                });
            }
            Err(err) if is_connection_failure(&err) => {
                counter = counter.saturating_sub(1);
                if counter == 0 {
                    return Err(TaclError::Other(format!(
                        "connection failed after exhausting retries: {err}"
                    )));
                }
                tracing::debug!(target: "retry", %err, remaining = counter, "connection failure, rebuilding pool");
                tokio::time::sleep(retry_sleep(config)).await;
                *client = reqwest::Client::builder()
                    .connect_timeout(config.connect_timeout)
                    .build()
                    .map_err(TaclError::Http)?;
                pool_rebuilt = true;
                continue;
            }
            Err(err) => return Err(TaclError::Http(err)),
        }
    }
}

fn is_connection_failure(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}

fn retry_sleep(config: &RuntimeConfig) -> Duration {
    config.retry_sleep
}

/// Inspect a successful-but-non-2xx response the caller already has in hand (i.e. after
/// [`execute`] returned a 4xx or an otherwise-unhandled status) and convert it into the matching
/// [`TaclError`] variant, consuming the body for the error message.
pub async fn into_error(response: reqwest::Response) -> TaclError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        TaclError::Http4xx {
            status: status.as_u16(),
            message: body,
        }
    } else {
        TaclError::Other(format!("unexpected status {status}: {body}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn returns_immediately_on_2xx() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut client = reqwest::Client::new();
        let config = RuntimeConfig::default();
        let url = format!("{}/ok", server.uri());
        let outcome = execute(&mut client, |c| c.get(&url), &config).await.unwrap();
        assert_eq!(outcome.response.status(), 200);
        assert!(!outcome.pool_rebuilt);
    }

    #[tokio::test]
    async fn returns_immediately_on_4xx_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = reqwest::Client::new();
        let config = RuntimeConfig::default();
        let url = format!("{}/bad", server.uri());
        let outcome = execute(&mut client, |c| c.get(&url), &config).await.unwrap();
        assert_eq!(outcome.response.status(), 404);
    }

    #[tokio::test]
    async fn exhausts_retries_on_persistent_500() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut client = reqwest::Client::new();
        let mut config = RuntimeConfig::default();
        config.retry_attempts = 3;
        let url = format!("{}/flaky", server.uri());
        let err = execute(&mut client, |c| c.get(&url), &config).await.unwrap_err();
        assert!(matches!(err, TaclError::RetriesExhausted { status: 500 }));
    }

    #[tokio::test]
    async fn succeeds_after_a_transient_500() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/recovering"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/recovering"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut client = reqwest::Client::new();
        let config = RuntimeConfig::default();
        let url = format!("{}/recovering", server.uri());
        let outcome = execute(&mut client, |c| c.get(&url), &config).await.unwrap();
        assert_eq!(outcome.response.status(), 200);
    }
}
