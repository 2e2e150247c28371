//! Thin HTTP client for the admin API, used by the `hastord` subcommands.

use anyhow::{bail, Result};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use serde_json::Value;

/// Admin API client.
#[derive(Debug, Clone)]
pub struct AdminClient {
    client: Client,
    server: String,
    token: Option<String>,
}

impl AdminClient {
    /// Client for `server`, authenticating with `token` when given.
    pub fn new(server: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            server: server.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server, path)
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// `GET path`.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.client.get(self.url(path))).await
    }

    /// `POST path` with an optional JSON body.
    pub async fn post<B: Serialize>(&self, path: &str, body: Option<&B>) -> Result<Value> {
        let mut request = self.client.post(self.url(path));
        if let Some(body) = body {
            request = request.json(body);
        }
        self.send(request).await
    }

    /// `PUT path` with a JSON body.
    pub async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<Value> {
        self.send(self.client.put(self.url(path)).json(body)).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value> {
        let response = self.authed(request).send().await?;
        let status = response.status();
        let text = response.text().await?;
        let body: Value = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            bail!("request failed: {}: {}", status, error_message(&body));
        }
        Ok(body)
    }
}

/// The `error` field of an error body, or the body itself.
fn error_message(body: &Value) -> String {
    match body.get("error").and_then(Value::as_str) {
        Some(msg) => {
            let name = body.get("errname").and_then(Value::as_str).unwrap_or("EFAULT");
            format!("[{name}] {msg}")
        }
        None => match body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_message_prefers_error_field() {
        let body = json!({"error": "job not found", "errno": 2, "errname": "ENOENT"});
        assert_eq!(error_message(&body), "[ENOENT] job not found");
        assert_eq!(error_message(&json!("Unauthorized")), "Unauthorized");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let client = AdminClient::new("http://127.0.0.1:8443/", None);
        assert_eq!(client.url("/ready"), "http://127.0.0.1:8443/ready");
    }
}
