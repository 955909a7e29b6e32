//! Per-platform configuration contracts, matching spec.md §6's
//! Configuration table. Each struct is the `configMap` a [`SenderFactory`]
//! receives; `validate()` is called before a Sender is constructed so a bad
//! config fails at registration time, never on the first Send.

use std::collections::HashMap;
use std::time::Duration;

use nh_common::{Error, ErrorCode};
use serde::{Deserialize, Serialize};

fn require_non_empty(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::new(
            ErrorCode::InvalidConfig,
            format!("{field} must not be empty"),
        ));
    }
    Ok(())
}

fn require_port_in_range(field: &str, port: u16) -> Result<(), Error> {
    if port == 0 {
        return Err(Error::new(
            ErrorCode::InvalidConfig,
            format!("{field} must be in 1..=65535"),
        ));
    }
    Ok(())
}

/// Minimal structural check, not a full RFC-5322 grammar: exactly one `@`,
/// a non-empty local part, and a domain part containing at least one `.`
/// with no surrounding whitespace.
fn looks_like_rfc5322_address(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !address.chars().any(char::is_whitespace)
        && address.matches('@').count() == 1
}

fn require_rfc5322_address(field: &str, value: &str) -> Result<(), Error> {
    if !looks_like_rfc5322_address(value) {
        return Err(Error::new(
            ErrorCode::InvalidConfig,
            format!("{field} must be a valid RFC-5322 address, got {value:?}"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeishuConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl FeishuConfig {
    pub fn validate(&self) -> Result<(), Error> {
        require_non_empty("webhook_url", &self.webhook_url)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    #[serde(default)]
    pub use_tls: bool,
}

impl EmailConfig {
    pub fn validate(&self) -> Result<(), Error> {
        require_non_empty("smtp_host", &self.smtp_host)?;
        require_port_in_range("smtp_port", self.smtp_port)?;
        require_non_empty("username", &self.username)?;
        require_non_empty("from_address", &self.from_address)?;
        require_rfc5322_address("from_address", &self.from_address)?;
        if self.password.is_empty() {
            return Err(Error::new(ErrorCode::MissingCredentials, "password must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookAuth {
    None,
    Bearer,
    Basic,
    Hmac,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub auth: WebhookAuth,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub hmac_secret: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WebhookAuth {
    fn default() -> Self {
        WebhookAuth::None
    }
}

impl WebhookConfig {
    pub fn validate(&self) -> Result<(), Error> {
        require_non_empty("url", &self.url)?;
        match self.auth {
            WebhookAuth::None => {}
            WebhookAuth::Bearer | WebhookAuth::Basic => {
                if self.auth_token.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::new(
                        ErrorCode::MissingCredentials,
                        "auth_token is required for bearer/basic auth",
                    ));
                }
            }
            WebhookAuth::Hmac => {
                if self.hmac_secret.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::new(
                        ErrorCode::MissingCredentials,
                        "hmac_secret is required for hmac auth",
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmsConfig {
    pub provider: String,
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

impl SmsConfig {
    pub fn validate(&self) -> Result<(), Error> {
        require_non_empty("provider", &self.provider)?;
        require_non_empty("account_sid", &self.account_sid)?;
        require_non_empty("from_number", &self.from_number)?;
        if self.auth_token.is_empty() {
            return Err(Error::new(ErrorCode::MissingCredentials, "auth_token must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default)]
    pub default_channel: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl SlackConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let has_webhook_url = self.webhook_url.as_deref().is_some_and(|v| !v.is_empty());
        let has_bot_token = self.bot_token.as_deref().is_some_and(|v| !v.is_empty());
        if !has_webhook_url && !has_bot_token {
            return Err(Error::new(
                ErrorCode::MissingCredentials,
                "one of webhook_url or bot_token is required",
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_smtp_port() -> u16 {
    587
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_config_requires_token_for_bearer_auth() {
        let config = WebhookConfig {
            url: "https://example.com/hook".into(),
            auth: WebhookAuth::Bearer,
            auth_token: None,
            hmac_secret: None,
            headers: HashMap::new(),
            timeout_ms: 5000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn webhook_config_with_no_auth_is_valid_with_just_a_url() {
        let config = WebhookConfig {
            url: "https://example.com/hook".into(),
            auth: WebhookAuth::None,
            auth_token: None,
            hmac_secret: None,
            headers: HashMap::new(),
            timeout_ms: 5000,
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn email_config_requires_credentials() {
        let config = EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: "notify".into(),
            password: "".into(),
            from_address: "notify@example.com".into(),
            use_tls: true,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn email_config_rejects_port_zero() {
        let config = EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 0,
            username: "notify".into(),
            password: "secret".into(),
            from_address: "notify@example.com".into(),
            use_tls: true,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn email_config_rejects_malformed_from_address() {
        let config = EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: "notify".into(),
            password: "secret".into(),
            from_address: "not-an-email".into(),
            use_tls: true,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn slack_config_requires_webhook_url_or_bot_token() {
        let config = SlackConfig {
            webhook_url: None,
            bot_token: None,
            default_channel: None,
            timeout_ms: 5000,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn slack_config_is_valid_with_only_a_webhook_url() {
        let config = SlackConfig {
            webhook_url: Some("https://hooks.slack.com/services/x".into()),
            bot_token: None,
            default_channel: None,
            timeout_ms: 5000,
        };
        assert!(config.validate().is_ok());
    }
}
