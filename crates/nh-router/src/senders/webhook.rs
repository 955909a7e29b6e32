//! Generic HTTP webhook [`Sender`]: POSTs a JSON payload, optionally signed.
//!
//! Grounded directly on `fc-router::mediator::HttpMediator::mediate_once`
//! (build request, classify the response, decide retryability by status
//! code) and `sign_webhook` (HMAC-SHA256 over the raw body, hex-encoded into
//! a header).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use nh_common::model::{Message, PlatformResult, Target, TargetType};
use nh_common::{Error, ErrorCode};
use sha2::Sha256;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{WebhookAuth, WebhookConfig};
use crate::sender::{Capabilities, Sender};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "X-NotifyHub-Signature";

pub struct WebhookSender {
    config: WebhookConfig,
    client: reqwest::Client,
    breaker: CircuitBreaker,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Result<Self, Error> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::new(ErrorCode::InvalidConfig, format!("failed to build http client: {e}")))?;
        Ok(Self {
            config,
            client,
            breaker: CircuitBreaker::default(),
        })
    }

    fn target_url(&self, target: &Target) -> String {
        if target.value.is_empty() {
            self.config.url.clone()
        } else {
            target.value.clone()
        }
    }

    fn sign(&self, secret: &str, body: &[u8]) -> Result<String, Error> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::new(ErrorCode::InvalidConfig, format!("invalid hmac secret: {e}")))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn build_payload(&self, message: &Message, target: &Target) -> serde_json::Value {
        serde_json::json!({
            "id": message.id,
            "title": message.title,
            "body": message.body,
            "format": message.format,
            "target": target.value,
            "variables": message.variables,
        })
    }

    async fn send_one(&self, message: &Message, target: &Target) -> PlatformResult {
        let started = Instant::now();
        let url = self.target_url(target);
        let payload = self.build_payload(message, target);
        let body = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(e) => {
                return PlatformResult::failure(
                    self.name(),
                    target.canonical(),
                    format!("failed to serialize payload: {e}"),
                    started.elapsed(),
                );
            }
        };

        let mut request = self.client.post(&url).header("Content-Type", "application/json");
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        request = match self.config.auth {
            WebhookAuth::None => request,
            WebhookAuth::Bearer => {
                request.bearer_auth(self.config.auth_token.as_deref().unwrap_or_default())
            }
            WebhookAuth::Basic => {
                let token = self.config.auth_token.as_deref().unwrap_or_default();
                request.header("Authorization", format!("Basic {token}"))
            }
            WebhookAuth::Hmac => {
                let secret = self.config.hmac_secret.as_deref().unwrap_or_default();
                match self.sign(secret, &body) {
                    Ok(signature) => request.header(SIGNATURE_HEADER, signature),
                    Err(e) => {
                        return PlatformResult::failure(self.name(), target.canonical(), e.message, started.elapsed());
                    }
                }
            }
        };

        let response = request.body(body).send().await;
        let duration = started.elapsed();

        match response {
            Ok(resp) => classify_response(self.name(), target, resp, duration).await,
            Err(e) => {
                let text = if e.is_timeout() {
                    "request timeout contacting webhook".to_string()
                } else if e.is_connect() {
                    "connection refused contacting webhook".to_string()
                } else {
                    format!("network error: {e}")
                };
                PlatformResult::failure(self.name(), target.canonical(), text, duration)
            }
        }
    }
}

async fn classify_response(
    platform: &str,
    target: &Target,
    response: reqwest::Response,
    duration: Duration,
) -> PlatformResult {
    let status = response.status();
    if status.is_success() {
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        return PlatformResult::success(platform, target.canonical(), message_id, duration);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let text = match status.as_u16() {
        429 => format!(
            "too many requests (retry_after={}s)",
            retry_after.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into())
        ),
        500..=599 => format!("service unavailable: http {status}"),
        400 | 401 | 403 | 404 => format!("webhook rejected: http {status}"),
        _ => format!("unexpected http status {status}"),
    };
    PlatformResult::failure(platform, target.canonical(), text, duration)
}

#[async_trait]
impl Sender for WebhookSender {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, message: &Message, targets: &[Target]) -> Vec<PlatformResult> {
        if !self.breaker.allow_request() {
            let text = format!("[{}] circuit open", ErrorCode::ResourceExhausted.tag());
            return targets
                .iter()
                .map(|t| PlatformResult::failure(self.name(), t.canonical(), text.clone(), Duration::ZERO))
                .collect();
        }
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let result = self.send_one(message, target).await;
            if result.success {
                self.breaker.record_success();
            } else {
                self.breaker.record_failure();
            }
            results.push(result);
        }
        results
    }

    fn validate_target(&self, target: &Target) -> Result<(), Error> {
        if target.target_type != TargetType::Webhook {
            return Err(Error::new(
                ErrorCode::UnsupportedTarget,
                format!("webhook sender cannot handle target type {}", target.target_type),
            ));
        }
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supported_target_types: vec![TargetType::Webhook],
            supported_formats: vec![
                nh_common::Format::Text,
                nh_common::Format::Markdown,
                nh_common::Format::Html,
                nh_common::Format::Card,
            ],
            max_message_size: 1_000_000,
            supports_scheduling: false,
            supports_attachments: false,
            supports_mentions: false,
            required_settings: vec!["url".into()],
        }
    }

    async fn is_healthy(&self) -> Result<(), Error> {
        if self.breaker.allow_request() {
            Ok(())
        } else {
            Err(Error::new(ErrorCode::PlatformUnavailable, "webhook circuit open").with_platform(self.name()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> Message {
        Message::builder().title("hi").body("body").build().unwrap()
    }

    #[tokio::test]
    async fn successful_post_yields_success_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = WebhookConfig {
            url: format!("{}/hook", server.uri()),
            auth: WebhookAuth::None,
            auth_token: None,
            hmac_secret: None,
            headers: HashMap::new(),
            timeout_ms: 5000,
        };
        let sender = WebhookSender::new(config).unwrap();
        let target = Target::webhook("").unwrap();
        let results = sender.send(&message(), &[target]).await;
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn server_error_yields_retryable_sounding_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = WebhookConfig {
            url: format!("{}/hook", server.uri()),
            auth: WebhookAuth::None,
            auth_token: None,
            hmac_secret: None,
            headers: HashMap::new(),
            timeout_ms: 5000,
        };
        let sender = WebhookSender::new(config).unwrap();
        let target = Target::webhook("").unwrap();
        let results = sender.send(&message(), &[target]).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_ref().unwrap().contains("service unavailable"));
    }

    #[tokio::test]
    async fn not_found_yields_non_retryable_sounding_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = WebhookConfig {
            url: format!("{}/hook", server.uri()),
            auth: WebhookAuth::None,
            auth_token: None,
            hmac_secret: None,
            headers: HashMap::new(),
            timeout_ms: 5000,
        };
        let sender = WebhookSender::new(config).unwrap();
        let target = Target::webhook("").unwrap();
        let results = sender.send(&message(), &[target]).await;
        assert!(!results[0].success);
        assert!(results[0].error.as_ref().unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn hmac_auth_attaches_signature_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let config = WebhookConfig {
            url: format!("{}/hook", server.uri()),
            auth: WebhookAuth::Hmac,
            auth_token: None,
            hmac_secret: Some("s3cr3t".into()),
            headers: HashMap::new(),
            timeout_ms: 5000,
        };
        let sender = WebhookSender::new(config).unwrap();
        let target = Target::webhook("").unwrap();
        let results = sender.send(&message(), &[target]).await;
        assert!(results[0].success);
    }
}
