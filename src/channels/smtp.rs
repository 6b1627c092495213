//! SMTP delivery transport over lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::SmtpConfig;
use crate::error::DeliveryError;
use crate::pipeline::delivery::DeliveryTransport;

/// Port that speaks TLS from the first byte; every other port upgrades with STARTTLS.
const IMPLICIT_TLS_PORT: u16 = 465;

/// Authenticated SMTP submission.
pub struct SmtpRelay {
    transport: SmtpTransport,
    host: String,
}

impl SmtpRelay {
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let builder = if config.port == IMPLICIT_TLS_PORT {
            SmtpTransport::relay(&config.host)
        } else {
            SmtpTransport::starttls_relay(&config.host)
        }
        .map_err(|e| DeliveryError::Transport(format!("SMTP relay error: {e}")))?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = builder
            .port(config.port)
            .credentials(creds)
            .timeout(Some(config.timeout))
            .build();

        Ok(Self {
            transport,
            host: config.host.clone(),
        })
    }
}

#[async_trait]
impl DeliveryTransport for SmtpRelay {
    async fn submit(&self, message: &lettre::Message) -> Result<(), DeliveryError> {
        let transport = self.transport.clone();
        let message = message.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| DeliveryError::Transport(format!("SMTP task failed: {e}")))?
            .map_err(|e| DeliveryError::Transport(format!("SMTP send failed: {e}")))?;

        debug!(host = %self.host, "SMTP submission accepted");
        Ok(())
    }
}

