use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::format::{Item, StrftimeItems};
use chrono_tz::Tz;
use failure::Error;
use preferences::prefs_base_dir;
use serde_json as json;
use url::Url;

pub const APP_NAME: &str = "uploaddigest";
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const SETTINGS_FILE: &str = "settings.json";
const YOUTUBE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/youtube.readonly";
const GMAIL_SEND_SCOPE: &str = "https://www.googleapis.com/auth/gmail.send";

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "no configuration directory available, pass --config")]
    NoConfigDir,
    #[fail(display = "could not open settings {}: {}", path, reason)]
    Unreadable { path: String, reason: String },
    #[fail(display = "unknown time zone: {}", _0)]
    UnknownTimezone(String),
    #[fail(display = "invalid date format: {}", _0)]
    BadDateFormat(String),
    #[fail(display = "no channels configured")]
    NoChannels,
    #[fail(display = "invalid api_base_url {}: {}", _0, _1)]
    BadUrl(String, String),
    #[fail(display = "{} uses plain http, set insecure_transport to allow it", _0)]
    InsecureUrl(String),
}

/// Which lookback the digest covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Window {
    Week,
    PreviousMonth,
}

impl Default for Window {
    fn default() -> Self {
        Window::Week
    }
}

impl FromStr for Window {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "week" => Ok(Window::Week),
            "previous-month" => Ok(Window::PreviousMonth),
            other => Err(format!("unknown window '{}'", other)),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSettings {
    ApiKey(String),
    Oauth(OauthSettings),
}

#[derive(Clone, Debug, Deserialize)]
pub struct OauthSettings {
    pub client_secret: PathBuf,
    pub token_cache: PathBuf,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
}

fn default_scopes() -> Vec<String> {
    vec![YOUTUBE_READONLY_SCOPE.to_string(), GMAIL_SEND_SCOPE.to_string()]
}

fn default_redirect_port() -> u16 {
    8080
}

#[derive(Clone, Debug, Deserialize)]
pub struct MailSettings {
    pub sender: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
}

impl MailSettings {
    /// Digests go back to the sender unless someone else is named.
    pub fn recipient(&self) -> &str {
        self.recipient.as_deref().unwrap_or(&self.sender)
    }
}

fn default_subject() -> String {
    "New YouTube uploads".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    pub channels: BTreeMap<String, String>,
    pub credentials: CredentialSettings,
    #[serde(default)]
    pub mail: Option<MailSettings>,
    #[serde(default)]
    pub window: Window,
    #[serde(default = "default_date_format")]
    pub date_format: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub dated_text: bool,
    #[serde(default)]
    pub max_results: Option<u32>,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub insecure_transport: bool,
    #[serde(default = "default_true")]
    pub report_partial: bool,
}

fn default_date_format() -> String {
    "%m/%d/%y".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Settings {
    pub fn from_reader<R: std::io::Read>(r: R) -> Result<Settings, Error> {
        let settings: Settings = json::from_reader(r)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Settings, Error> {
        let f = File::open(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Settings::from_reader(f)
    }

    pub fn subject(&self) -> String {
        self.mail
            .as_ref()
            .map(|m| m.subject.clone())
            .unwrap_or_else(default_subject)
    }

    pub fn tz(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        self.tz()?;
        if StrftimeItems::new(&self.date_format).any(|i| i == Item::Error) {
            return Err(ConfigError::BadDateFormat(self.date_format.clone()));
        }
        let api_url = Url::parse(&self.api_base_url)
            .map_err(|e| ConfigError::BadUrl(self.api_base_url.clone(), e.to_string()))?;
        if !self.insecure_transport && api_url.scheme() == "http" {
            return Err(ConfigError::InsecureUrl(self.api_base_url.clone()));
        }
        Ok(())
    }
}

pub fn default_settings_path() -> Result<PathBuf, ConfigError> {
    let mut p = prefs_base_dir().ok_or(ConfigError::NoConfigDir)?;
    p.push(APP_NAME);
    p.push(SETTINGS_FILE);
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "channels": {"Foo": "UCfoo"},
        "credentials": {"api_key": "secret"}
    }"#;

    #[test]
    fn it_fills_defaults() {
        let settings = Settings::from_reader(MINIMAL.as_bytes()).unwrap();

        assert_eq!(settings.window, Window::Week);
        assert_eq!(settings.date_format, "%m/%d/%y");
        assert_eq!(settings.api_base_url, DEFAULT_API_BASE_URL);
        assert!(!settings.insecure_transport);
        assert!(settings.report_partial);
        assert!(!settings.dated_text);
        assert!(settings.mail.is_none());
        match settings.credentials {
            CredentialSettings::ApiKey(ref k) => assert_eq!(k, "secret"),
            _ => panic!("expected api key"),
        }
    }

    #[test]
    fn it_reads_oauth_and_mail() {
        let raw = r#"{
            "channels": {"Foo": "UCfoo", "Bar": "UCbar"},
            "credentials": {"oauth": {"client_secret": "cs.json", "token_cache": "tk.json"}},
            "mail": {"sender": "me@example.com", "smtp_host": "smtp.example.com"},
            "window": "previous-month",
            "timezone": "Europe/Berlin"
        }"#;
        let settings = Settings::from_reader(raw.as_bytes()).unwrap();

        assert_eq!(settings.window, Window::PreviousMonth);
        assert_eq!(settings.tz().unwrap(), chrono_tz::Europe::Berlin);
        let mail = settings.mail.unwrap();
        assert_eq!(mail.recipient(), "me@example.com");
        assert_eq!(mail.smtp_port, 587);
        match settings.credentials {
            CredentialSettings::Oauth(o) => {
                assert_eq!(o.redirect_port, 8080);
                assert_eq!(o.scopes.len(), 2);
            }
            _ => panic!("expected oauth"),
        }
    }

    #[test]
    fn it_rejects_plain_http_without_flag() {
        let raw = r#"{
            "channels": {"Foo": "UCfoo"},
            "credentials": {"api_key": "k"},
            "api_base_url": "http://localhost:1234"
        }"#;
        assert!(Settings::from_reader(raw.as_bytes()).is_err());

        let raw = raw.replace("\"api_key\": \"k\"}", "\"api_key\": \"k\"}, \"insecure_transport\": true");
        assert!(Settings::from_reader(raw.as_bytes()).is_ok());
    }

    #[test]
    fn it_rejects_plain_http_regardless_of_case() {
        let raw = r#"{
            "channels": {"Foo": "UCfoo"},
            "credentials": {"api_key": "k"},
            "api_base_url": "HTTP://localhost:1234"
        }"#;
        assert!(Settings::from_reader(raw.as_bytes()).is_err());

        let raw = raw.replace("HTTP://", "HTTPS://");
        assert!(Settings::from_reader(raw.as_bytes()).is_ok());

        let raw = raw.replace("HTTPS://localhost:1234", "not a url");
        assert!(Settings::from_reader(raw.as_bytes()).is_err());
    }

    #[test]
    fn it_rejects_empty_channels_and_bad_zone() {
        let raw = r#"{"channels": {}, "credentials": {"api_key": "k"}}"#;
        assert!(Settings::from_reader(raw.as_bytes()).is_err());

        let raw = r#"{"channels": {"A": "a"}, "credentials": {"api_key": "k"}, "timezone": "Mars/Base"}"#;
        assert!(Settings::from_reader(raw.as_bytes()).is_err());

        let raw = r#"{"channels": {"A": "a"}, "credentials": {"api_key": "k"}, "date_format": "%Q"}"#;
        assert!(Settings::from_reader(raw.as_bytes()).is_err());
    }

    #[test]
    fn it_parses_window_names() {
        assert_eq!("week".parse::<Window>(), Ok(Window::Week));
        assert_eq!("previous-month".parse::<Window>(), Ok(Window::PreviousMonth));
        assert!("fortnight".parse::<Window>().is_err());
    }
}
