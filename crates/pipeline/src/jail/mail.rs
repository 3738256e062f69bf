//! mail jail — SMTP 경보 메일
//!
//! Date/Subject/From/To 헤더와 multipart/mixed 본문(base64 HTML 파트)을
//! 가진 메시지를 `tls`/`ssl`/`starttls` 연결로 전송합니다. 제목과
//! 본문에 `${name}` 전개가 적용됩니다.
//!
//! [`Mailer`]로 노출되는 `send_mail`은 체포와 무관한 연결 점검용입니다.

use std::time::Duration;

use lettre::message::header::{ContentTransferEncoding, ContentType};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls as SmtpTls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;

use go2jail_core::counters::{Counter, Counters};
use go2jail_core::types::Verdict;

use super::{Jail, Mailer, MaybeMailer};
use crate::error::PipelineError;
use crate::BoxFuture;

/// SMTP 왕복 제한 시간
const SMTP_TIMEOUT: Duration = Duration::from_secs(1);

/// 연결 암호화 방식
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encryption {
    /// 암묵적 TLS (기본값)
    #[default]
    Tls,
    /// `tls`와 동일한 래핑 연결
    Ssl,
    /// 평문 연결 후 STARTTLS 승급
    Starttls,
}

/// mail jail 설정
#[derive(Debug, Deserialize)]
pub struct MailJailConfig {
    pub id: String,
    #[serde(rename = "type", default)]
    pub type_tag: String,
    #[serde(default)]
    pub background: bool,
    /// `host:port` 형식의 SMTP 서버 주소
    pub host: String,
    pub from: String,
    /// 쉼표로 구분된 수신자 목록
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub encryption: Encryption,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password_file: String,
}

/// SMTP 경보 jail
pub struct MailJail {
    id: String,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject: String,
    body: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    success: Counter,
    fail: Counter,
}

impl MailJail {
    /// 설정으로 jail을 만듭니다. 주소/자격 증명/암호화 검증은 모두
    /// 설정 시점에 끝납니다.
    pub fn new(cfg: MailJailConfig) -> Result<Self, PipelineError> {
        let descriptor_err = |reason: String| PipelineError::Descriptor {
            kind: "jail",
            id: cfg.id.clone(),
            reason,
        };

        let from: Mailbox = cfg
            .from
            .parse()
            .map_err(|e| descriptor_err(format!("bad from: {e}, {}", cfg.from)))?;
        let mut to = Vec::new();
        for part in cfg.to.split(',') {
            let mailbox: Mailbox = part
                .trim()
                .parse()
                .map_err(|e| descriptor_err(format!("bad to: {e}, {part}")))?;
            to.push(mailbox);
        }
        if to.is_empty() {
            return Err(descriptor_err("to is empty".to_owned()));
        }

        let password = if cfg.password_file.is_empty() {
            cfg.password.clone()
        } else {
            std::fs::read_to_string(&cfg.password_file)
                .map_err(|e| descriptor_err(format!("read password file: {e}")))?
        };
        if cfg.username.is_empty() || password.is_empty() {
            return Err(descriptor_err("username or password is empty".to_owned()));
        }

        let (server_name, port) = cfg
            .host
            .rsplit_once(':')
            .and_then(|(host, port)| Some((host.to_owned(), port.parse::<u16>().ok()?)))
            .ok_or_else(|| descriptor_err(format!("bad host: {}", cfg.host)))?;

        let tls_params = TlsParameters::new(server_name.clone())
            .map_err(|e| descriptor_err(format!("tls parameters: {e}")))?;
        let tls = match cfg.encryption {
            Encryption::Tls | Encryption::Ssl => SmtpTls::Wrapper(tls_params),
            Encryption::Starttls => SmtpTls::Required(tls_params),
        };
        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(server_name.as_str())
            .port(port)
            .tls(tls)
            .credentials(Credentials::new(cfg.username.clone(), password))
            .timeout(Some(SMTP_TIMEOUT))
            .build();

        let counters = Counters::global();
        Ok(Self {
            success: counters.register("jail", &cfg.id, "success"),
            fail: counters.register("jail", &cfg.id, "fail"),
            id: cfg.id,
            from,
            to,
            subject: cfg.subject,
            body: cfg.body,
            transport,
        })
    }

    fn compose(&self, subject: &str, body: &str) -> Result<Message, PipelineError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .multipart(
                MultiPart::mixed().singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .header(ContentTransferEncoding::Base64)
                        .body(body.to_owned()),
                ),
            )
            .map_err(|e| PipelineError::Mail(format!("compose message: {e}")))
    }

    /// 메일을 조립해 전송합니다.
    pub async fn send_mail(&self, subject: &str, body: &str) -> Result<(), PipelineError> {
        let message = self.compose(subject, body)?;
        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::Mail(e.to_string()))
    }
}

impl Jail for MailJail {
    fn id(&self) -> &str {
        &self.id
    }

    async fn arrest(&self, verdict: &Verdict) -> Result<(), PipelineError> {
        let subject = verdict.expand(&self.subject);
        let body = verdict.expand(&self.body);
        match self.send_mail(&subject, &body).await {
            Ok(()) => {
                self.success.incr();
                Ok(())
            }
            Err(e) => {
                self.fail.incr();
                Err(PipelineError::Jail {
                    id: self.id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn close(&self) {}
}

impl Mailer for MailJail {
    fn send_mail<'a>(
        &'a self,
        subject: &'a str,
        body: &'a str,
    ) -> BoxFuture<'a, Result<(), PipelineError>> {
        Box::pin(MailJail::send_mail(self, subject, body))
    }
}

impl MaybeMailer for MailJail {
    fn as_mailer(&self) -> Option<&dyn Mailer> {
        Some(self)
    }
}
