use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use watch_core::{DeliveryError, Notifier};

use crate::message::alert_message;
use crate::{EmailConfig, SmtpTls};

/// Sends price alerts over SMTP. Construction fails fast on missing or
/// malformed credentials so no watch starts without a working sender.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    currency: String,
}

impl SmtpNotifier {
    pub fn new(config: &EmailConfig) -> Result<Self, DeliveryError> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| DeliveryError::Config("SMTP_HOST not set".into()))?;
        let from_addr = config
            .smtp_from
            .as_deref()
            .ok_or_else(|| DeliveryError::Config("SMTP_FROM_ADDRESS not set".into()))?;

        let from: Mailbox = from_addr
            .parse()
            .map_err(|e| DeliveryError::Config(format!("Invalid from address: {}", e)))?;

        let mut builder = match config.smtp_tls {
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host),
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host),
            SmtpTls::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                host,
            )),
        }
        .map_err(|e| DeliveryError::Transport(format!("SMTP transport error: {}", e)))?;

        builder = builder.port(config.smtp_port);

        if let (Some(user), Some(pass)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            currency: config.currency.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(
        &self,
        recipient: &str,
        ticker: &str,
        price: f64,
    ) -> Result<(), DeliveryError> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|e| DeliveryError::Rejected(format!("Invalid recipient: {}", e)))?;

        let (subject, body) = alert_message(ticker, &self.currency, price);

        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| DeliveryError::Rejected(format!("Failed to build email: {}", e)))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| DeliveryError::Transport(format!("Failed to send email: {}", e)))?;

        tracing::info!("Alert email for {} sent to {}", ticker, recipient);
        Ok(())
    }
}
