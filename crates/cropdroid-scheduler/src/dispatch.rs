//! Notification sinks: log, SMTP, HTTP webhook and an in-memory capture.

use std::sync::Mutex;

use async_trait::async_trait;
use cropdroid_core::config::{NotificationConfig, NotificationSink, SmtpConfig, WebhookConfig};
use cropdroid_core::error::{CropDroidError, Result};
use cropdroid_core::traits::Mailer;
use cropdroid_core::types::{Notification, NotifyPriority};
use cropdroid_security::{SecretKey, reveal};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use std::sync::Arc;

fn priority_emoji(priority: NotifyPriority) -> &'static str {
    match priority {
        NotifyPriority::Urgent => "🚨",
        NotifyPriority::High => "⚠️",
        NotifyPriority::Normal => "📢",
        NotifyPriority::Low => "ℹ️",
    }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        tracing::info!(
            "{} {}: {} ({})",
            priority_emoji(n.priority),
            n.title(),
            n.message,
            n.timestamp.format("%H:%M:%S UTC")
        );
        Ok(())
    }
}

/// Keeps everything it is sent.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    fn name(&self) -> &str {
        "memory"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).push(n.clone());
        Ok(())
    }
}

/// Plain-text mail over STARTTLS.
pub struct SmtpMailer {
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig, key: Option<&SecretKey>) -> Result<Self> {
        let parse = |addr: &str| {
            addr.parse::<Mailbox>()
                .map_err(|e| CropDroidError::Config(format!("invalid mail address '{addr}': {e}")))
        };
        let from = parse(&config.from)?;
        let to = config.to.iter().map(|a| parse(a)).collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            return Err(CropDroidError::Config("notification.smtp.to is empty".into()));
        }
        let password = reveal(&config.password, key)?;
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| CropDroidError::Config(format!("SMTP relay {}: {e}", config.host)))?
            .port(config.port)
            .credentials(Credentials::new(config.username.clone(), password))
            .build();
        Ok(Self { from, to, transport })
    }

    fn message(&self, n: &Notification) -> Result<LettreMessage> {
        let mut builder = LettreMessage::builder()
            .from(self.from.clone())
            .subject(n.title());
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(format!(
                "{}\n\nDevice: {}\nType: {}\nTime: {}\n",
                n.message,
                n.device,
                n.kind.code(),
                n.timestamp.to_rfc3339()
            ))
            .map_err(|e| CropDroidError::Notification(format!("Failed to build email: {e}")))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        let email = self.message(n)?;
        self.transport
            .send(email)
            .await
            .map_err(|e| CropDroidError::Notification(format!("SMTP send failed: {e}")))?;
        tracing::info!("✅ Email notification sent: {}", n.title());
        Ok(())
    }
}

/// JSON POST to an operator-supplied URL.
pub struct WebhookMailer {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookMailer {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, n: &Notification) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({
                "farm_id": n.farm_id,
                "device": n.device,
                "type": n.kind.code(),
                "priority": format!("{:?}", n.priority),
                "message": n.message,
                "timestamp": n.timestamp.to_rfc3339(),
            }))
            .timeout(std::time::Duration::from_secs(10));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CropDroidError::Notification(format!("Webhook send failed: {e}")))?;
        if resp.status().is_success() {
            tracing::info!("✅ Webhook notification sent to {}: {}", self.url, n.title());
            Ok(())
        } else {
            Err(CropDroidError::Notification(format!("Webhook error {}", resp.status())))
        }
    }
}

/// Build the configured sink.
pub fn build_mailer(config: &NotificationConfig, key: Option<&SecretKey>) -> Result<Arc<dyn Mailer>> {
    match config.sink {
        NotificationSink::Log => Ok(Arc::new(LogMailer)),
        NotificationSink::Smtp => {
            let smtp = config.smtp.as_ref().ok_or_else(|| {
                CropDroidError::Config("notification.sink = smtp needs [notification.smtp]".into())
            })?;
            Ok(Arc::new(SmtpMailer::new(smtp, key)?))
        }
        NotificationSink::Webhook => {
            let hook = config.webhook.as_ref().ok_or_else(|| {
                CropDroidError::Config("notification.sink = webhook needs [notification.webhook]".into())
            })?;
            Ok(Arc::new(WebhookMailer::new(hook)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use cropdroid_core::types::NotificationKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn note() -> Notification {
        Notification::new(3, "reservoir", NotificationKind::DeviceUnreachable, "no answer", Utc::now())
    }

    #[test]
    fn test_build_mailer_requires_section() {
        let mut config = NotificationConfig::default();
        assert_eq!(build_mailer(&config, None).unwrap().name(), "log");
        config.sink = NotificationSink::Smtp;
        assert!(build_mailer(&config, None).is_err());
        config.sink = NotificationSink::Webhook;
        assert!(build_mailer(&config, None).is_err());
    }

    #[tokio::test]
    async fn test_smtp_message_shape() {
        let mailer = SmtpMailer::new(
            &SmtpConfig {
                host: "localhost".into(),
                port: 2525,
                username: "ops".into(),
                password: "plain".into(),
                from: "CropDroid <alerts@example.com>".into(),
                to: vec!["grower@example.com".into()],
            },
            None,
        )
        .unwrap();
        let formatted = String::from_utf8(mailer.message(&note()).unwrap().formatted()).unwrap();
        assert!(formatted.contains("Subject: [3] reservoir device_unreachable"));
        assert!(formatted.contains("no answer"));
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        let mailer = WebhookMailer::new(&WebhookConfig {
            url: format!("http://{addr}/hook"),
            headers: vec![("x-farm".into(), "3".into())],
        });
        mailer.send(&note()).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("x-farm: 3"));
    }
}
