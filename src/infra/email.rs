//! SMTP alert delivery for repair events.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};

use crate::core::ManagerError;
use crate::infra::notify::{MessageSink, Notification};

/// SMTP connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// SMTP relay host.
    pub smtp_url: String,
    /// From address.
    pub sender: String,
    /// Login user; STARTTLS is used when credentials are present.
    #[serde(default)]
    pub username: Option<String>,
    /// Login password.
    #[serde(default)]
    pub password: Option<String>,
}

/// Build the repair alert for a job impacted by unhealthy nodes.
pub fn repair_alert_email(
    job_id: &str,
    node_names: &[String],
    job_link: &str,
    cluster_name: &str,
    reboot_enabled: bool,
    days_until_reboot: u32,
) -> (String, String) {
    let subject = format!("Repair Manager Alert [ECC ERROR] [{job_id}]");
    let mut body = format!(
        "<p>Uncorrectable ECC Error found in {cluster_name} cluster on following node(s):</p>\
         <table border=\"1\">"
    );
    for node in node_names {
        body.push_str(&format!("<tr><td>{node}</td></tr>"));
    }
    body.push_str(&format!(
        "</table><p>The node(s) will require reboot in order to repair. \
         The following job is impacted:</p> <a href=\"{job_link}\">{job_id}</a>\
         <p>Please save and end your job ASAP. "
    ));
    if reboot_enabled {
        body.push_str(&format!(
            "Node(s) will be rebooted in {days_until_reboot} days and all progress will be lost.</p>"
        ));
    } else {
        body.push_str("Node(s) will be rebooted soon for repair and all progress will be lost</p>");
    }
    (subject, body)
}

/// SMTP sender; also usable as a notification sink.
pub struct EmailSender {
    config: EmailConfig,
}

impl EmailSender {
    /// Sender over the given SMTP settings.
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    /// Send one HTML message.
    pub fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<(), ManagerError> {
        let message = Message::builder()
            .from(
                self.config
                    .sender
                    .parse()
                    .map_err(|e| ManagerError::Config(format!("sender address: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| ManagerError::Config(format!("recipient address: {e}")))?)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| ManagerError::Config(format!("message build: {e}")))?;

        let transport = match (&self.config.username, &self.config.password) {
            (Some(username), Some(password)) => {
                SmtpTransport::starttls_relay(&self.config.smtp_url)
                    .map_err(|e| ManagerError::Config(format!("smtp relay: {e}")))?
                    .credentials(Credentials::new(username.clone(), password.clone()))
                    .build()
            }
            _ => SmtpTransport::builder_dangerous(&self.config.smtp_url).build(),
        };

        transport
            .send(&message)
            .map(|_| ())
            .map_err(|e| ManagerError::Agent(format!("smtp send: {e}")))
    }
}

#[async_trait]
impl MessageSink for EmailSender {
    async fn deliver(&self, notification: &Notification) -> Result<(), ManagerError> {
        self.send(&notification.user, &notification.subject, &notification.body)
    }
}
