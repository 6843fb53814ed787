use {
    crate::{
        config::MailerConfig,
        domain::{
            BoxFuture,
            dispatch::{ConfirmationEmail, ConfirmationMailer},
            error::PipelineError,
            payment::SideEffect,
        },
    },
    serde::Serialize,
    std::time::Duration,
};

/// Sends confirmation emails through a transactional mail HTTP API. The
/// payment id is used as the idempotency key so a retried send after a lost
/// response does not reach the payer twice.
pub struct HttpMailer {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(config: &MailerConfig, timeout: Duration) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| failed(format!("building HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}/emails", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            from: config.from.clone(),
        })
    }

    async fn send(&self, email: ConfirmationEmail) -> Result<(), PipelineError> {
        let body = EmailBody {
            from: &self.from,
            to: [email.to.as_str()],
            subject: format!("Pagamento confirmado: {}", email.course_name),
            html: render_confirmation(&email),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", format!("confirmation-{}", email.payment_id))
            .json(&body)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {status}: {text}")));
        }

        tracing::info!(payment_id = %email.payment_id, "confirmation email sent");
        Ok(())
    }
}

impl ConfirmationMailer for HttpMailer {
    fn send_confirmation(
        &self,
        email: ConfirmationEmail,
    ) -> BoxFuture<'_, Result<(), PipelineError>> {
        Box::pin(self.send(email))
    }
}

/// Stand-in used when no mail API is configured.
pub struct LogMailer;

impl ConfirmationMailer for LogMailer {
    fn send_confirmation(
        &self,
        email: ConfirmationEmail,
    ) -> BoxFuture<'_, Result<(), PipelineError>> {
        tracing::info!(
            to = %email.to,
            payment_id = %email.payment_id,
            course = %email.course_name,
            amount = %email.money,
            "mailer not configured, confirmation email logged only"
        );
        Box::pin(std::future::ready(Ok(())))
    }
}

fn failed(message: String) -> PipelineError {
    PipelineError::Dispatcher {
        effect: SideEffect::Email,
        message,
    }
}

pub fn render_confirmation(email: &ConfirmationEmail) -> String {
    format!(
        "<p>Olá {name},</p>\
         <p>Recebemos o pagamento de <strong>{money}</strong> referente ao curso \
         <strong>{course}</strong>. Seu acesso já está liberado.</p>\
         <p>Identificador do pagamento: {payment}</p>",
        name = html_escape(&email.name),
        money = email.money,
        course = html_escape(&email.course_name),
        payment = html_escape(&email.payment_id),
    )
}

fn html_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Serialize)]
struct EmailBody<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    html: String,
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::domain::money::{Money, MoneyAmount},
    };

    #[test]
    fn confirmation_escapes_user_supplied_text() {
        let email = ConfirmationEmail {
            to: "a@b.com".into(),
            name: "<script>".into(),
            payment_id: "123".into(),
            course_name: "Rust & Go".into(),
            money: Money::brl(MoneyAmount::new(4990).unwrap()),
        };
        let html = render_confirmation(&email);
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("Rust &amp; Go"));
        assert!(html.contains("49.90"));
        assert!(!html.contains("<script>"));
    }
}
