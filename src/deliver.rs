use std::io::Write;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use failure::Error;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use reqwest::blocking::Client;

use crate::config::{MailSettings, Settings};
use crate::digest::Digest;
use crate::youtube_oauth::Credential;

pub const GMAIL_API_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

#[derive(Debug, Fail)]
pub enum DeliveryError {
    #[fail(display = "{} delivery needs a \"mail\" section in the settings", _0)]
    MissingMailSettings(&'static str),
    #[fail(display = "smtp delivery needs mail.smtp_host")]
    MissingSmtpHost,
    #[fail(display = "gmail delivery needs oauth credentials, not an api key")]
    GmailNeedsOauth,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryKind {
    Stdout,
    Gmail,
    Smtp,
}

impl FromStr for DeliveryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(DeliveryKind::Stdout),
            "gmail" => Ok(DeliveryKind::Gmail),
            "smtp" => Ok(DeliveryKind::Smtp),
            other => Err(format!("unknown delivery '{}', expected stdout, gmail or smtp", other)),
        }
    }
}

pub trait Deliver {
    fn send(&self, digest: &Digest) -> Result<(), Error>;
}

pub struct StdoutDelivery {
    pub html: bool,
}

fn write_digest<W: Write>(out: &mut W, digest: &Digest, html: bool) -> Result<(), Error> {
    out.write_all(digest.text.as_bytes())?;
    if html {
        writeln!(out)?;
        out.write_all(digest.html.as_bytes())?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

impl Deliver for StdoutDelivery {
    fn send(&self, digest: &Digest) -> Result<(), Error> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        write_digest(&mut handle, digest, self.html)
    }
}

/// Multipart/alternative message carrying both renderings.
pub fn build_message(mail: &MailSettings, digest: &Digest) -> Result<Message, Error> {
    let email = Message::builder()
        .from(mail.sender.parse::<Mailbox>()?)
        .to(mail.recipient().parse::<Mailbox>()?)
        .subject(digest.subject.clone())
        .multipart(MultiPart::alternative_plain_html(
            digest.text.clone(),
            digest.html.clone(),
        ))?;
    Ok(email)
}

pub struct GmailDelivery {
    pub client: Client,
    pub access_token: String,
    pub api_base_url: String,
    pub mail: MailSettings,
}

#[derive(Serialize)]
struct GmailRawMessage {
    raw: String,
}

impl Deliver for GmailDelivery {
    fn send(&self, digest: &Digest) -> Result<(), Error> {
        let email = build_message(&self.mail, digest)?;
        let body = GmailRawMessage {
            raw: URL_SAFE.encode(email.formatted()),
        };
        let url = format!(
            "{}/users/me/messages/send",
            self.api_base_url.trim_end_matches('/')
        );
        self.client
            .post(url.as_str())
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()?
            .error_for_status()?;
        info!("Sent digest of {} videos to {} via gmail", digest.count, self.mail.recipient());
        Ok(())
    }
}

pub struct SmtpDelivery {
    pub mail: MailSettings,
    pub host: String,
    /// plaintext session without TLS
    pub insecure: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmtpSecurity {
    StartTls,
    Plaintext,
}

impl SmtpDelivery {
    fn security(&self) -> SmtpSecurity {
        if self.insecure {
            SmtpSecurity::Plaintext
        } else {
            SmtpSecurity::StartTls
        }
    }

    /// Username and password; the username falls back to the sender address.
    fn login(&self) -> Option<(String, String)> {
        self.mail.smtp_password.as_ref().map(|password| {
            let user = self
                .mail
                .smtp_username
                .clone()
                .unwrap_or_else(|| self.mail.sender.clone());
            (user, password.clone())
        })
    }

    fn transport(&self) -> Result<SmtpTransport, Error> {
        let builder = match self.security() {
            SmtpSecurity::Plaintext => {
                warn!("Sending mail to {} without TLS", self.host);
                SmtpTransport::builder_dangerous(self.host.as_str())
            }
            SmtpSecurity::StartTls => SmtpTransport::starttls_relay(&self.host)?,
        };
        let builder = builder.port(self.mail.smtp_port);
        let builder = match self.login() {
            Some((user, password)) => builder.credentials(Credentials::new(user, password)),
            None => builder,
        };
        Ok(builder.build())
    }
}

impl Deliver for SmtpDelivery {
    fn send(&self, digest: &Digest) -> Result<(), Error> {
        let email = build_message(&self.mail, digest)?;
        self.transport()?.send(&email)?;
        info!("Sent digest of {} videos to {} via {}", digest.count, self.mail.recipient(), self.host);
        Ok(())
    }
}

fn mail_settings(settings: &Settings, kind: &'static str) -> Result<MailSettings, DeliveryError> {
    settings
        .mail
        .clone()
        .ok_or(DeliveryError::MissingMailSettings(kind))
}

fn smtp_delivery(settings: &Settings) -> Result<SmtpDelivery, DeliveryError> {
    let mail = mail_settings(settings, "smtp")?;
    let host = mail.smtp_host.clone().ok_or(DeliveryError::MissingSmtpHost)?;
    Ok(SmtpDelivery {
        mail,
        host,
        insecure: settings.insecure_transport,
    })
}

/// Picks the backend for `kind`, checking that the settings can support it.
pub fn delivery_for(
    kind: DeliveryKind,
    html: bool,
    settings: &Settings,
    credential: &Credential,
    client: &Client,
) -> Result<Box<dyn Deliver>, Error> {
    match kind {
        DeliveryKind::Stdout => Ok(Box::new(StdoutDelivery { html })),
        DeliveryKind::Gmail => {
            let mail = mail_settings(settings, "gmail")?;
            let access_token = match credential {
                Credential::Bearer(token) => token.clone(),
                Credential::ApiKey(_) => return Err(DeliveryError::GmailNeedsOauth.into()),
            };
            Ok(Box::new(GmailDelivery {
                client: client.clone(),
                access_token,
                api_base_url: GMAIL_API_BASE_URL.to_string(),
                mail,
            }))
        }
        DeliveryKind::Smtp => Ok(Box::new(smtp_delivery(settings)?)),
    }
}
