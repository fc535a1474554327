use dynasty_core::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::instrument;

const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) dynasty-import";

pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| Error::backend("build http client", e))
}

/// GET `url` and return the body.
///
/// Connectivity failures, timeouts, 429 and 5xx map to `SourceUnavailable` (retried);
/// other non-success statuses are fatal `InvalidInput`.
#[instrument(level = "debug", skip(client))]
pub async fn get_text(client: &Client, source_id: &str, url: &str) -> Result<String> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(source_id, url, e))?;

    let status = resp.status();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::source_unavailable(
            source_id,
            format!("GET {url} returned {status}"),
        ));
    }
    if !status.is_success() {
        return Err(Error::InvalidInput(format!(
            "{source_id}: GET {url} returned {status}"
        )));
    }

    resp.text()
        .await
        .map_err(|e| request_error(source_id, url, e))
}

#[instrument(level = "debug", skip(client))]
pub async fn get_json<T: DeserializeOwned>(
    client: &Client,
    source_id: &str,
    url: &str,
) -> Result<T> {
    let body = get_text(client, source_id, url).await?;
    serde_json::from_str(&body).map_err(|e| {
        Error::InvalidInput(format!("{source_id}: malformed JSON from {url}: {e}"))
    })
}

fn request_error(source_id: &str, url: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        Error::source_unavailable(source_id, format!("GET {url}: {e}"))
    } else {
        Error::backend(format!("{source_id}: GET {url}"), e)
    }
}
