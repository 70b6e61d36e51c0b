//! Request/response endpoint polled for inbound text.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::{ConnectionError, Result};

const KIND: &str = "http";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct HttpTransport {
    base: Url,
    send_path: String,
    poll_path: String,
    poll: Duration,
    client: Option<Client>,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| ConnectionError::InvalidConfig(format!("{}: {}", base_url, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConnectionError::InvalidConfig(format!(
                "http url must be http:// or https://, got {}",
                base
            )));
        }
        Ok(Self {
            base,
            send_path: "send".into(),
            poll_path: "poll".into(),
            poll: Duration::from_millis(500),
            client: None,
        })
    }

    pub fn with_paths(mut self, send_path: &str, poll_path: &str) -> Self {
        self.send_path = send_path.to_string();
        self.poll_path = poll_path.to_string();
        self
    }

    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn endpoint(&self) -> String {
        self.base.to_string()
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| ConnectionError::InvalidConfig(format!("{}: {}", path, e)))
    }

    fn client(&self) -> Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| ConnectionError::transport(KIND, "client not open"))
    }

    /// Builds the client and checks the base URL answers at all.
    pub async fn open(&mut self) -> Result<()> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ConnectionError::transport(KIND, e))?;
        let response = client
            .get(self.base.clone())
            .send()
            .await
            .map_err(|e| ConnectionError::transport(KIND, e))?;
        debug!(url = %self.base, status = %response.status(), "http endpoint reachable");
        self.client = Some(client);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }

    /// POSTs `{"content": data}` to the send path.
    pub async fn send(&mut self, data: &str) -> Result<()> {
        let url = self.url(&self.send_path)?;
        self.client()?
            .post(url)
            .json(&json!({ "content": data }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ConnectionError::transport(KIND, e))?;
        Ok(())
    }

    /// GETs the poll path until it returns a non-empty body.
    pub async fn receive(&mut self) -> Result<String> {
        let url = self.url(&self.poll_path)?;
        loop {
            let response = self
                .client()?
                .get(url.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| ConnectionError::transport(KIND, e))?;
            if response.status() != StatusCode::NO_CONTENT {
                let body = response
                    .text()
                    .await
                    .map_err(|e| ConnectionError::transport(KIND, e))?;
                if !body.trim().is_empty() {
                    return Ok(body);
                }
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_join_onto_base() {
        let http = HttpTransport::new("http://localhost:9000/bridge/")
            .unwrap()
            .with_paths("out", "in");
        assert_eq!(
            http.url(&http.send_path).unwrap().as_str(),
            "http://localhost:9000/bridge/out"
        );
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(HttpTransport::new("ftp://localhost/").is_err());
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let mut http = HttpTransport::new("http://localhost:9/").unwrap();
        assert!(http.send("x").await.is_err());
    }
}
