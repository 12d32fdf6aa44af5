// src/ingest/providers/http.rs
use std::time::Duration;

use crate::error::ExtractionError;

const USER_AGENT: &str = concat!("crypto-market-etl/", env!("CARGO_PKG_VERSION"));

/// Shared `reqwest` client for the remote sources. Maps every failure onto
/// the transient/permanent split that drives retries.
#[derive(Debug, Clone)]
pub struct HttpClient {
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, ExtractionError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::permanent(format!("building http client: {e}")))?;
        Ok(Self { http })
    }

    /// GET `url` and return the body of a 2xx response.
    pub async fn get_text(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Result<String, ExtractionError> {
        let mut req = self.http.get(url).query(query);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }

        let resp = req.send().await.map_err(classify)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(ExtractionError::from_status(
                status.as_u16(),
                format!("GET {url} returned {status}: {snippet}"),
            ));
        }
        resp.text().await.map_err(classify)
    }
}

fn classify(e: reqwest::Error) -> ExtractionError {
    if e.is_builder() {
        return ExtractionError::permanent(format!("invalid request: {e}"));
    }
    if let Some(status) = e.status() {
        return ExtractionError::from_status(status.as_u16(), e.to_string());
    }
    // timeouts, refused/reset connections, truncated bodies
    ExtractionError::transient(e.to_string())
}
