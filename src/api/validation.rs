use std::time::Duration;

use reqwest::Url;

use crate::api::api_objects::{JobInput, TranslateRequest};
use crate::errors::GatewayError;

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Turns a `POST /translate` body into a [`JobInput`].
pub struct InputValidator {
    client: Option<reqwest::Client>,
}

impl InputValidator {
    /// With `check_reachability`, URL inputs are probed with a HEAD request.
    pub fn new(check_reachability: bool) -> Result<Self, reqwest::Error> {
        let client = if check_reachability {
            Some(
                reqwest::Client::builder()
                    .timeout(REACHABILITY_TIMEOUT)
                    .build()?,
            )
        } else {
            None
        };
        Ok(InputValidator { client })
    }

    pub async fn validate(&self, body: &[u8]) -> Result<JobInput, GatewayError> {
        let input = parse_input(body)?;
        if let (JobInput::Url(url), Some(client)) = (&input, &self.client) {
            probe_url(client, url).await?;
        }
        Ok(input)
    }
}

/// Syntactic checks only: JSON shape, exactly one non-empty field, URL scheme.
pub fn parse_input(body: &[u8]) -> Result<JobInput, GatewayError> {
    let request: TranslateRequest = serde_json::from_slice(body)
        .map_err(|e| GatewayError::bad_request(format!("invalid JSON body: {e}")))?;

    let text = request.text.filter(|t| !t.trim().is_empty());
    let url = request.url.map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
    match (text, url) {
        (Some(_), Some(_)) => Err(GatewayError::bad_request(
            "provide either `text` or `url`, not both",
        )),
        (None, None) => Err(GatewayError::bad_request(
            "a non-empty `text` or `url` field is required",
        )),
        (Some(text), None) => Ok(JobInput::Text(text)),
        (None, Some(url)) => {
            let parsed = Url::parse(&url)
                .map_err(|e| GatewayError::bad_request(format!("invalid URL {url:?}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err(GatewayError::bad_request(format!(
                    "URL must be an absolute http(s) URL, got {url:?}"
                )));
            }
            Ok(JobInput::Url(url))
        }
    }
}

async fn probe_url(client: &reqwest::Client, url: &str) -> Result<(), GatewayError> {
    match client.head(url).send().await {
        Ok(response) if response.status().is_server_error() => Err(GatewayError::bad_request(
            format!("URL {url} is unreachable: server answered {}", response.status()),
        )),
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::info!(url, error = %e, "url reachability probe failed");
            Err(GatewayError::bad_request(format!("URL {url} is unreachable: {e}")))
        }
    }
}
