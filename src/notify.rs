//! Out-of-band notification seam.
//!
//! Alert fan-out goes through the [`Notifier`] trait so the orchestrator
//! never knows which provider is behind it. [`TwilioNotifier`] is the
//! production adapter (SMS and WhatsApp over Twilio's REST API);
//! [`RecordingNotifier`] is the in-process double used by tests.

use async_trait::async_trait;
use std::sync::Mutex;

/// Outbound message channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Sms,
    WhatsApp,
    Push,
}

/// Dispatch operations required by the alert orchestrator.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError>;
    async fn send_whatsapp(&self, to: &str, body: &str) -> Result<(), NotifyError>;
    async fn send_push(&self, token: &str, title: &str, body: &str) -> Result<(), NotifyError>;
}

/// Notifier error types.
#[derive(Debug)]
pub enum NotifyError {
    /// Network/HTTP failure before the provider answered
    Network(String),
    /// Provider rejected the message
    Provider { status: u16, message: String },
    /// The adapter has no transport for this channel
    Unsupported(&'static str),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Network(msg) => write!(f, "notifier network error: {msg}"),
            NotifyError::Provider { status, message } => {
                write!(f, "notifier provider error ({status}): {message}")
            }
            NotifyError::Unsupported(channel) => {
                write!(f, "notifier has no {channel} transport")
            }
        }
    }
}

impl std::error::Error for NotifyError {}

/// Twilio REST adapter for SMS and WhatsApp.
///
/// Push is not a Twilio capability; `send_push` reports it unsupported and
/// callers treat that as a logged no-op.
pub struct TwilioNotifier {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioNotifier {
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: impl Into<String>,
        from_number: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            account_sid: account_sid.into(),
            auth_token: auth_token.into(),
            from_number: from_number.into(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        )
    }

    async fn send_message(&self, to: &str, from: &str, body: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .send()
            .await
            .map_err(|e| NotifyError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(NotifyError::Provider {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for TwilioNotifier {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        self.send_message(to, &self.from_number, body).await
    }

    async fn send_whatsapp(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        let to = format!("whatsapp:{to}");
        let from = format!("whatsapp:{}", self.from_number);
        self.send_message(&to, &from, body).await
    }

    async fn send_push(&self, _token: &str, _title: &str, _body: &str) -> Result<(), NotifyError> {
        Err(NotifyError::Unsupported("push"))
    }
}

/// A delivered (or attempted) message captured by [`RecordingNotifier`].
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub channel: Channel,
    pub to: String,
    pub body: String,
}

/// Test double that records every dispatch instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<RecordedMessage>>,
    fail_sms_to: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make SMS delivery to the given phone fail with a provider error.
    pub fn fail_sms_to(&self, phone: impl Into<String>) {
        self.fail_sms_to.lock().unwrap().push(phone.into());
    }

    /// Everything dispatched so far.
    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.messages.lock().unwrap().clone()
    }

    /// Dispatches on one channel.
    pub fn sent_on(&self, channel: Channel) -> Vec<RecordedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.channel == channel)
            .collect()
    }

    fn record(&self, channel: Channel, to: &str, body: &str) {
        self.messages.lock().unwrap().push(RecordedMessage {
            channel,
            to: to.to_string(),
            body: body.to_string(),
        });
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_sms(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        if self.fail_sms_to.lock().unwrap().iter().any(|p| p == to) {
            return Err(NotifyError::Provider {
                status: 400,
                message: format!("undeliverable: {to}"),
            });
        }
        self.record(Channel::Sms, to, body);
        Ok(())
    }

    async fn send_whatsapp(&self, to: &str, body: &str) -> Result<(), NotifyError> {
        self.record(Channel::WhatsApp, to, body);
        Ok(())
    }

    async fn send_push(&self, token: &str, title: &str, body: &str) -> Result<(), NotifyError> {
        self.record(Channel::Push, token, &format!("{title}: {body}"));
        Ok(())
    }
}
