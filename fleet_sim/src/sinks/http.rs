//! HTTP publish-and-acknowledge sink.

use async_trait::async_trait;
use fleet_env::{EventSink, PublishOutcome, SinkError, SourceId, TelemetryEvent};
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

fn build_client(timeout: Duration) -> Result<Client, SinkError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| SinkError::transport(e.to_string()))
}

/// Run-wide HTTP producer: a validated endpoint and a shared client.
#[derive(Debug, Clone)]
pub struct HttpSinkFactory {
    url: Url,
    client: Client,
    timeout: Duration,
}

impl HttpSinkFactory {
    /// Validates the endpoint. Only `http` and `https` URLs are accepted.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SinkError> {
        let url = Url::parse(url).map_err(|e| SinkError::invalid_endpoint(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SinkError::invalid_endpoint(format!("unsupported scheme in {url}")));
        }
        Ok(Self {
            client: build_client(timeout)?,
            url,
            timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn create(&self, source: &SourceId) -> Result<Box<dyn EventSink>, SinkError> {
        debug!(source = %source, url = %self.url, "HTTP sink created");
        Ok(Box::new(HttpSink {
            url: self.url.clone(),
            client: self.client.clone(),
            timeout: self.timeout,
            closed: false,
        }))
    }
}

/// POSTs each batch as a JSON array.
///
/// 2xx is OK, any other status is NOT_OK, and a request that gets no
/// response is a transport error.
pub struct HttpSink {
    url: Url,
    client: Client,
    timeout: Duration,
    closed: bool,
}

#[async_trait]
impl EventSink for HttpSink {
    async fn publish(&mut self, events: &[TelemetryEvent]) -> PublishOutcome {
        if self.closed {
            return PublishOutcome::TransportError(SinkError::Closed);
        }

        let response = self.client.post(self.url.clone()).json(events).send().await;
        match response {
            Ok(response) if response.status().is_success() => PublishOutcome::Ok,
            Ok(response) => PublishOutcome::NotOk(format!("HTTP {}", response.status())),
            Err(e) if e.is_timeout() => {
                PublishOutcome::TransportError(SinkError::Timeout(self.timeout.as_millis() as u64))
            }
            Err(e) => PublishOutcome::TransportError(SinkError::transport(e.to_string())),
        }
    }

    async fn reconnect(&mut self) -> Result<(), SinkError> {
        self.client = build_client(self.timeout)?;
        self.closed = false;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
