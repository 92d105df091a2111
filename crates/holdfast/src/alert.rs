//! Alert fan-out for run failures and notable events.
//!
//! [`WebhookProvider`] is grounded directly on the teacher's
//! `webhook::WebhookClient`: same signed-POST-on-a-thread idiom, same
//! `X-*-Signature: sha256=<hex hmac>` header, renamed for this crate.
//! [`EmailProvider`] and [`SmsProvider`] are new, added because SPEC_FULL.md
//! §4.I names email and SMS alongside the chat webhook the teacher already
//! had a pattern for; each is as small as the interface allows.

use std::time::Duration;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use sha2::Sha256;
use tracing::warn;

use holdfast_types::{Alert, AlertSeverity};

use crate::config::AlertConfig;

type HmacSha256 = Hmac<Sha256>;

/// A destination an [`Alert`] can be sent to. `configured()` lets the
/// fan-out skip providers the operator never set up without treating that
/// as an error. `min_severity()` lets each provider suppress low-severity
/// alerts (e.g. SMS is typically configured to only fire on `Error`).
pub trait AlertProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn configured(&self) -> bool;
    fn min_severity(&self) -> AlertSeverity {
        AlertSeverity::Info
    }
    fn send(&self, alert: &Alert) -> Result<()>;
}

pub struct WebhookProvider {
    client: reqwest::blocking::Client,
    url: Option<String>,
    secret: Option<String>,
    min_severity: AlertSeverity,
}

impl WebhookProvider {
    pub fn new(config: &AlertConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            client,
            url: config.webhook_url.clone(),
            secret: config.webhook_secret.clone(),
            min_severity: config.webhook_min_severity.unwrap_or(AlertSeverity::Info),
        }
    }
}

impl AlertProvider for WebhookProvider {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn configured(&self) -> bool {
        self.url.is_some()
    }

    fn min_severity(&self) -> AlertSeverity {
        self.min_severity
    }

    fn send(&self, alert: &Alert) -> Result<()> {
        let url = self.url.as_ref().context("webhook provider has no url configured")?;
        let json = serde_json::to_string(alert).context("failed to serialize alert")?;

        let mut request = self.client.post(url).header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
            mac.update(json.as_bytes());
            let signature = hex::encode(mac.finalize().into_bytes());
            request = request.header("X-Holdfast-Signature", format!("sha256={signature}"));
        }

        let response = request.body(json).send().context("failed to send alert webhook")?;
        if !response.status().is_success() {
            anyhow::bail!("alert webhook returned status {}", response.status());
        }
        Ok(())
    }
}

pub struct EmailProvider {
    to: Option<String>,
    from: String,
    transport: Option<SmtpTransport>,
    min_severity: AlertSeverity,
}

impl EmailProvider {
    pub fn new(config: &AlertConfig) -> Self {
        let transport = std::env::var("HOLDFAST_SMTP_RELAY").ok().and_then(|relay| {
            let builder = SmtpTransport::relay(&relay).ok()?;
            let builder = match (std::env::var("HOLDFAST_SMTP_USER"), std::env::var("HOLDFAST_SMTP_PASSWORD")) {
                (Ok(user), Ok(password)) => builder.credentials(Credentials::new(user, password)),
                _ => builder,
            };
            Some(builder.build())
        });

        Self {
            to: config.email_to.clone(),
            from: std::env::var("HOLDFAST_SMTP_FROM").unwrap_or_else(|_| "holdfast@localhost".to_string()),
            transport,
            min_severity: config.email_min_severity.unwrap_or(AlertSeverity::Info),
        }
    }
}

impl AlertProvider for EmailProvider {
    fn name(&self) -> &'static str {
        "email"
    }

    fn configured(&self) -> bool {
        self.to.is_some() && self.transport.is_some()
    }

    fn min_severity(&self) -> AlertSeverity {
        self.min_severity
    }

    fn send(&self, alert: &Alert) -> Result<()> {
        let to = self.to.as_ref().context("email provider has no recipient configured")?;
        let transport = self.transport.as_ref().context("email provider has no SMTP transport configured")?;

        let message = Message::builder()
            .from(self.from.parse().context("invalid HOLDFAST_SMTP_FROM address")?)
            .to(to.parse().context("invalid alert.email_to address")?)
            .subject(format!("[holdfast] {}", alert.title))
            .body(alert.body.clone())
            .context("failed to build alert email")?;

        transport.send(&message).context("failed to send alert email")?;
        Ok(())
    }
}

pub struct SmsProvider {
    client: reqwest::blocking::Client,
    gateway_url: Option<String>,
    min_severity: AlertSeverity,
}

impl SmsProvider {
    pub fn new(config: &AlertConfig) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self { client, gateway_url: config.sms_url.clone(), min_severity: config.sms_min_severity }
    }
}

impl AlertProvider for SmsProvider {
    fn name(&self) -> &'static str {
        "sms"
    }

    fn configured(&self) -> bool {
        self.gateway_url.is_some()
    }

    fn min_severity(&self) -> AlertSeverity {
        self.min_severity
    }

    fn send(&self, alert: &Alert) -> Result<()> {
        let url = self.gateway_url.as_ref().context("sms provider has no gateway url configured")?;
        let body = format!("{}: {}", alert.title, alert.body);
        let response = self.client.post(url).body(body).send().context("failed to reach sms gateway")?;
        if !response.status().is_success() {
            anyhow::bail!("sms gateway returned status {}", response.status());
        }
        Ok(())
    }
}

/// Fan an alert out to every configured provider, each with its own
/// timeout-bounded thread, exactly as the teacher's webhook client ran its
/// POST on a dedicated thread so alerting never blocks a run. Provider
/// failures are logged, not propagated: a broken email relay should not
/// stop the chat webhook from firing.
pub fn fan_out(providers: &[Box<dyn AlertProvider>], alert: &Alert) {
    std::thread::scope(|scope| {
        for provider in providers {
            if !provider.configured() || alert.severity < provider.min_severity() {
                continue;
            }
            let provider = provider.as_ref();
            scope.spawn(move || {
                if let Err(e) = provider.send(alert) {
                    warn!(provider = provider.name(), error = %e, "alert delivery failed");
                }
            });
        }
    });
}
