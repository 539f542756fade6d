//! Native HTTP executor middleware built on reqwest.

use crate::context::HttpContext;
use crate::error::{Error, Result};
use crate::middleware::{Flow, Middleware};
use muxlink_config::Headers;
use reqwest::{Client, Method};
use serde_json::Value;

/// Performs the native request described by the context's URL, headers and
/// request-init, honoring the context's interrupt signal.
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Middleware for HttpExecutor {
    fn kind(&self) -> &str {
        "http"
    }

    async fn process(&self, ctx: &HttpContext, value: Value) -> Result<Flow> {
        let href = ctx.url().href()?;
        let init = ctx.request_init();
        let method_name = init.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| Error::Configure(format!("invalid HTTP method {}", method_name)))?;
        let sends_body = method != Method::GET && method != Method::HEAD && !value.is_null();

        let mut request = self.client.request(method, &href);
        for (name, header_value) in ctx.headers().entries() {
            request = request.header(name, header_value);
        }
        if sends_body {
            request = request.json(&value);
        }

        let sent = request.send();
        let response = match ctx.interrupt_signal() {
            Some(signal) => {
                tokio::select! {
                    response = sent => response,
                    _ = signal.wait() => return Err(ctx.interrupt_error()),
                }
            }
            None => sent.await,
        }
        .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, header_value) in response.headers() {
            if let Ok(text) = header_value.to_str() {
                headers.append(name.as_str(), text);
            }
        }
        ctx.set_response_meta(status, headers);

        if status >= 400 {
            return Err(Error::Status {
                status,
                body: response.text().await.ok(),
            });
        }

        let content_type = ctx
            .response_headers()
            .and_then(|h| h.get_first("content-type").map(str::to_string))
            .unwrap_or_default();
        let body = if content_type.contains("json") {
            response
                .json::<Value>()
                .await
                .map_err(|e| Error::Unpack(format!("response body: {}", e)))?
        } else {
            Value::String(
                response
                    .text()
                    .await
                    .map_err(|e| Error::Receive(e.to_string()))?,
            )
        };
        Ok(Flow::Next(body))
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::Timeout(error.to_string())
    } else if error.is_connect() {
        Error::Connection(error.to_string())
    } else {
        Error::Send(error.to_string())
    }
}
