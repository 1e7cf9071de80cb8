//! API client for the Shepherd server

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Error body returned by the server on non-2xx responses
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
}

pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            token,
        }
    }

    /// Build request with authentication header
    fn build_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.request(method, &url);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        request
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!(describe_failure(status, &text));
        }

        Ok(response.json().await?)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.build_request(reqwest::Method::GET, path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.build_request(reqwest::Method::POST, path).json(body))
            .await
    }

    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.build_request(reqwest::Method::POST, path)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(self.build_request(reqwest::Method::PUT, path).json(body))
            .await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.build_request(reqwest::Method::DELETE, path)).await
    }
}

/// Render a failed response as `code = <Code> desc = <message>`, falling
/// back to the raw body when the server did not send a structured error.
fn describe_failure(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(err) => format!("code = {} desc = {}", err.error, err.message),
        Err(_) if body.trim().is_empty() => format!("API request failed: {}", status),
        Err(_) => format!("API request failed: {} - {}", status, body.trim()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_error_is_rendered_verbatim() {
        let body = r#"{"status":403,"error":"PermissionDenied","message":"permission denied: clusters, delete, team/https://a.example.com","request_id":"x"}"#;
        assert_eq!(
            describe_failure(reqwest::StatusCode::FORBIDDEN, body),
            "code = PermissionDenied desc = permission denied: clusters, delete, team/https://a.example.com"
        );
    }

    #[test]
    fn test_unstructured_error_falls_back_to_status() {
        let message = describe_failure(reqwest::StatusCode::BAD_GATEWAY, "upstream gone");
        assert_eq!(message, "API request failed: 502 Bad Gateway - upstream gone");

        let message = describe_failure(reqwest::StatusCode::UNAUTHORIZED, "");
        assert_eq!(message, "API request failed: 401 Unauthorized");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ApiClient::new("http://localhost:8080/", None);
        assert_eq!(client.base_url, "http://localhost:8080");
    }
}
