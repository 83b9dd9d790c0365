#![allow(dead_code)]

use anyhow::Result;

/// Helper utilities for interacting with GreenMail server during tests
pub struct GreenMailHelper {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct TestEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl GreenMailHelper {
    pub fn new() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn is_server_running(&self) -> bool {
        match self.client.get(&self.base_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Deliver a message through GreenMail's SMTP port.
    pub async fn send_test_email(&self, email: &TestEmail) -> Result<()> {
        use lettre::transport::smtp::client::Tls;
        use lettre::{Message, SmtpTransport, Transport};

        let message = Message::builder()
            .from(email.from.parse()?)
            .to(email.to.parse()?)
            .subject(&email.subject)
            .body(email.body.clone())?;

        let mailer = SmtpTransport::builder_dangerous("localhost")
            .port(3025)
            .tls(Tls::None)
            .build();

        mailer
            .send(&message)
            .map_err(|e| anyhow::anyhow!("Failed to send email via SMTP: {}", e))?;
        Ok(())
    }

    pub async fn reset_server(&self) -> Result<()> {
        // Purge is best effort; older GreenMail images lack the endpoint.
        let response = self
            .client
            .post(format!("{}/api/mail/purge", self.base_url))
            .send()
            .await;
        if let Ok(response) = response {
            if !response.status().is_success() {
                tracing::warn!("GreenMail purge returned HTTP {}", response.status());
            }
        }
        Ok(())
    }
}

/// Newsletter-shaped messages: two that the AI Weekly filter keeps, one it
/// excludes and one from another sender.
pub fn newsletter_emails() -> Vec<TestEmail> {
    let email = |from: &str, subject: &str, body: &str| TestEmail {
        from: from.to_string(),
        to: "test@localhost".to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
    };
    vec![
        email("news@x.com", "AI Weekly Update", "Large language models keep improving."),
        email("news@x.com", "Weekly data digest", "Kaggle competitions this week."),
        email("news@x.com", "AI Weekly - unsubscribe here", "Manage your subscription."),
        email("other@y.com", "AI Weekly from elsewhere", "Different sender."),
    ]
}

pub async fn wait_for_server_ready(timeout_seconds: u64) -> Result<()> {
    let helper = GreenMailHelper::new();
    let start = std::time::Instant::now();

    loop {
        if helper.is_server_running().await {
            return Ok(());
        }

        if start.elapsed().as_secs() > timeout_seconds {
            return Err(anyhow::anyhow!(
                "GreenMail server not ready after {} seconds. Make sure it's running with:\n\
                docker run -d --name greenmail-test \\\n\
                  -p 3025:3025 -p 3143:3143 -p 3993:3993 -p 8080:8080 \\\n\
                  -e GREENMAIL_OPTS=\"-Dgreenmail.setup.test.all -Dgreenmail.hostname=0.0.0.0 -Dgreenmail.auth.disabled\" \\\n\
                  greenmail/standalone:2.0.1",
                timeout_seconds
            ));
        }

        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    }
}
