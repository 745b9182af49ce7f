//! Email notifications. Best effort: a failed send is logged, never fatal.

use serde_json::json;

use crate::context::Context;

pub trait Notifier {
    fn send(&self, subject: &str, body: &str);
}

/// Sends through SES with `aws ses send-email`, from and to the same
/// address. Does nothing when no address is configured.
pub struct SesNotifier {
    ctx: Context,
    email: Option<String>,
}

impl SesNotifier {
    pub fn new(ctx: Context, email: Option<String>) -> Self {
        Self { ctx, email }
    }
}

impl Notifier for SesNotifier {
    fn send(&self, subject: &str, body: &str) {
        let Some(email) = &self.email else {
            tracing::info!(subject, "no email configured, not notifying");
            return;
        };

        let destination = json!({"ToAddresses": [email]}).to_string();
        let message = json!({
            "Subject": {"Data": subject},
            "Body": {"Text": {"Data": body}},
        })
        .to_string();

        let result = self
            .ctx
            .command("aws")
            .args(["ses", "send-email", "--from", email])
            .args(["--destination", &destination, "--message", &message])
            .output();

        match result {
            Ok(output) if output.status.success() => tracing::info!(subject, "notification sent"),
            Ok(output) => tracing::warn!(
                subject,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "notification failed"
            ),
            Err(e) => tracing::warn!(subject, error = %e, "could not run aws"),
        }
    }
}
