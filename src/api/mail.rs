use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationMail {
    pub to_email: String,
    pub code: String,
    pub valid_minutes: u64,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver a verification code or return an error so the caller can report it.
    async fn send_code(&self, mail: &VerificationMail) -> Result<()>;
}

/// Local dev mailer that logs the delivery instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_code(&self, mail: &VerificationMail) -> Result<()> {
        info!(
            to_email = %mail.to_email,
            valid_minutes = mail.valid_minutes,
            "verification code send stub"
        );
        Ok(())
    }
}
