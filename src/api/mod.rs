/// API Client Module
///
/// Named HTTP clients for API sources. Each client owns a base URL and a
/// `reqwest::Client` configured with a request timeout; extractors refer to a
/// client by name and supply only a relative path.
use crate::error::{EtlError, EtlResult};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ApiClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    /// Create a new client for the given base URL
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> EtlResult<Self> {
        let name = name.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EtlError::Config(format!("failed to build HTTP client {}: {}", name, e)))?;

        Ok(Self { name, base_url: base_url.into(), http })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the base URL and a relative path with exactly one slash
    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// GET `path` and return the JSON body
    pub async fn get_json(&self, path: &str) -> EtlResult<serde_json::Value> {
        let url = self.url_for(path);
        tracing::debug!("GET {} via {}", url, self.name);

        let response = self.http.get(&url).send().await.map_err(|e| EtlError::unavailable(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EtlError::unavailable(&url, format!("HTTP {}", status)));
        }

        response.json::<serde_json::Value>().await.map_err(|e| EtlError::unavailable(&url, e))
    }
}

/// Registry of API clients by logical name
#[derive(Debug, Clone, Default)]
pub struct ApiClients {
    clients: HashMap<String, ApiClient>,
}

impl ApiClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, client: ApiClient) {
        self.clients.insert(client.name().to_string(), client);
    }

    pub fn get(&self, name: &str) -> EtlResult<&ApiClient> {
        self.clients.get(name).ok_or_else(|| EtlError::Config(format!("unknown API client '{}'", name)))
    }
}
