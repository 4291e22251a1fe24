//! Help requests and feedback

use crate::error::BillingError;
use crate::models::{FeedbackTicket, HelpTicket};
use crate::services::backend::HttpBackend;

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, BillingError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BillingError::validation(format!("{} is required", field)));
    }
    Ok(value)
}

#[derive(Clone)]
pub struct SupportDesk {
    backend: HttpBackend,
}

impl SupportDesk {
    pub fn new(backend: HttpBackend) -> Self {
        Self { backend }
    }

    pub async fn submit_help(&self, subject: &str, message: &str) -> Result<(), BillingError> {
        let subject = required("Subject", subject)?;
        let message = required("Message", message)?;
        self.backend.submit_help(subject, message).await?;
        tracing::info!("Help request submitted: {}", subject);
        Ok(())
    }

    /// Requests filed by the logged-in user.
    pub async fn my_help_requests(&self) -> Result<Vec<HelpTicket>, BillingError> {
        self.backend.my_help_requests().await
    }

    /// Every user's requests; provider only.
    pub async fn help_requests(&self) -> Result<Vec<HelpTicket>, BillingError> {
        self.backend.help_requests().await
    }

    pub async fn submit_feedback(&self, feedback: &str) -> Result<(), BillingError> {
        let feedback = required("Feedback", feedback)?;
        self.backend.submit_feedback(feedback).await
    }

    pub async fn my_feedback(&self) -> Result<Vec<FeedbackTicket>, BillingError> {
        self.backend.feedback().await
    }

    pub async fn feedback_requests(&self) -> Result<Vec<FeedbackTicket>, BillingError> {
        self.backend.feedback_requests().await
    }

    pub async fn reply_feedback(&self, request_id: u64, reply: &str) -> Result<(), BillingError> {
        let reply = required("Reply", reply)?;
        self.backend.reply_feedback(request_id, reply).await?;
        tracing::info!("Replied to feedback {}", request_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_text_is_rejected() {
        assert!(matches!(required("Subject", "   "), Err(BillingError::ValidationError(_))));
        assert_eq!(required("Subject", " Slow WiFi ").unwrap(), "Slow WiFi");
    }
}
