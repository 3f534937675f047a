//! Convenience client for the control API.
//!
//! One method per endpoint; test suites use it to preload queues, inspect
//! what reached an exchange, follow the delivery lifecycle and reset the
//! broker between tests.

use mq_common::{Message, QueuedMessage};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} for {url}")]
    UnexpectedStatus { status: u16, url: String },
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct MockClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl MockClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            http_client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn check(response: &reqwest::Response) -> Result<()> {
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ClientError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: response.url().to_string(),
            })
        }
    }

    pub async fn healthcheck(&self) -> Result<()> {
        let url = format!("{}/healthcheck", self.base_url);
        let response = self.http_client.get(url).send().await?;
        Self::check(&response)
    }

    /// Wipe all broker state.
    pub async fn reset(&self) -> Result<()> {
        let url = format!("{}/", self.base_url);
        let response = self.http_client.delete(url).send().await?;
        Self::check(&response)
    }

    /// Everything published to the exchange, newest first.
    pub async fn exchange_messages(&self, exchange: &str) -> Result<Vec<Message>> {
        let url = format!("{}/exchanges/{}/messages", self.base_url, exchange);
        let response = self.http_client.get(url).send().await?;
        Self::check(&response)?;
        Ok(response.json().await?)
    }

    pub async fn delete_exchange_messages(&self, exchange: &str) -> Result<()> {
        let url = format!("{}/exchanges/{}/messages", self.base_url, exchange);
        let response = self.http_client.delete(url).send().await?;
        Self::check(&response)
    }

    /// Enqueue directly into a queue, bypassing exchanges.
    pub async fn publish_message(&self, queue: &str, message: &Message) -> Result<()> {
        let url = format!("{}/queues/{}/messages", self.base_url, queue);
        let response = self.http_client.post(url).json(message).send().await?;
        Self::check(&response)
    }

    /// Delivery history for the queue, newest first.
    pub async fn queue_history(&self, queue: &str) -> Result<Vec<QueuedMessage>> {
        let url = format!("{}/queues/{}/messages/history", self.base_url, queue);
        let response = self.http_client.get(url).send().await?;
        Self::check(&response)?;
        Ok(response.json().await?)
    }
}
