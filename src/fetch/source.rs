// src/fetch/source.rs

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// What a remote answered for one URL.
#[derive(Debug)]
pub enum FetchResponse {
    Found(Vec<u8>),
    /// Any non-200, non-5xx status: the name does not resolve.
    NotFound(u16),
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Worth retrying: connection trouble, timeouts, 5xx.
    #[error("transient: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

/// Where archives and labor files come from.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn get(&self, url: &Url) -> Result<FetchResponse, SourceError>;
}

pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("brfss-pipeline/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn get(&self, url: &Url) -> Result<FetchResponse, SourceError> {
        let resp = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(|e| classify(&e))?;
        let status = resp.status();
        if status == StatusCode::OK {
            let bytes = resp.bytes().await.map_err(|e| classify(&e))?;
            Ok(FetchResponse::Found(bytes.to_vec()))
        } else if status.is_server_error() {
            Err(SourceError::Transient(format!("HTTP {status}")))
        } else {
            Ok(FetchResponse::NotFound(status.as_u16()))
        }
    }
}

fn classify(e: &reqwest::Error) -> SourceError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        SourceError::Transient(e.to_string())
    } else {
        SourceError::Fatal(e.to_string())
    }
}

/// In-memory remote for tests: serves registered payloads, 404s the rest and
/// records every URL requested.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemorySource {
        files: Mutex<HashMap<String, Vec<u8>>>,
        /// URL → number of transient failures still to serve
        flaky: Mutex<HashMap<String, usize>>,
        hits: Mutex<Vec<String>>,
    }

    impl MemorySource {
        pub(crate) fn with(self, url: &str, bytes: Vec<u8>) -> Self {
            self.files.lock().unwrap().insert(url.to_string(), bytes);
            self
        }

        pub(crate) fn flaky(self, url: &str, failures: usize) -> Self {
            self.flaky.lock().unwrap().insert(url.to_string(), failures);
            self
        }

        pub(crate) fn hits(&self) -> Vec<String> {
            self.hits.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteSource for MemorySource {
        async fn get(&self, url: &Url) -> Result<FetchResponse, SourceError> {
            let key = url.to_string();
            self.hits.lock().unwrap().push(key.clone());
            if let Some(left) = self.flaky.lock().unwrap().get_mut(&key) {
                if *left > 0 {
                    *left -= 1;
                    return Err(SourceError::Transient("simulated outage".into()));
                }
            }
            Ok(match self.files.lock().unwrap().get(&key) {
                Some(bytes) => FetchResponse::Found(bytes.clone()),
                None => FetchResponse::NotFound(404),
            })
        }
    }
}
