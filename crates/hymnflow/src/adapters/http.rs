//! Streaming HTTP fetcher with range resume.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ByteFetcher, FetchOutcome, TransferObserver};
use crate::pipeline::error::StageError;
use crate::sanitize::redact_url;

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("hymnflow/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn classify(err: reqwest::Error) -> StageError {
    match err.status() {
        Some(status) if status.is_client_error() => {
            StageError::rejected(format!("server refused request: {}", status))
        }
        _ => StageError::transport(err.to_string()),
    }
}

#[async_trait]
impl ByteFetcher for HttpFetcher {
    async fn fetch(
        &self,
        locator: &str,
        mut retained: Vec<u8>,
        observer: &dyn TransferObserver,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome, StageError> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Interrupted(retained));
        }

        let mut request = self.client.get(locator);
        if !retained.is_empty() {
            request = request.header(RANGE, format!("bytes={}-", retained.len()));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(FetchOutcome::Interrupted(retained)),
            sent = request.send() => sent.map_err(classify)?,
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && !retained.is_empty() {
            // Everything was already received before the interruption.
            let len = retained.len() as u64;
            observer.on_progress(len, len);
            return Ok(FetchOutcome::Complete(retained));
        }
        let response = response.error_for_status().map_err(classify)?;
        if response.status() != StatusCode::PARTIAL_CONTENT && !retained.is_empty() {
            debug!(url = %redact_url(locator), "Range ignored, restarting transfer");
            retained.clear();
        }

        let offset = retained.len() as u64;
        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(0, |len| len + offset);

        let mut stream = response.bytes_stream();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(FetchOutcome::Interrupted(retained)),
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        retained.extend_from_slice(&bytes);
                        observer.on_progress(retained.len() as u64, total);
                    }
                    Some(Err(e)) => return Err(classify(e)),
                    None => break,
                },
            }
        }

        Ok(FetchOutcome::Complete(retained))
    }
}
