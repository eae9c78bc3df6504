extern crate base64;
extern crate chrono;
extern crate chrono_tz;
extern crate clap;
extern crate env_logger;
#[macro_use]
extern crate failure;
extern crate handlebars;
extern crate lettre;
#[macro_use]
extern crate log;
extern crate oauth2;
extern crate preferences;
extern crate reqwest;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate url;

pub mod config;
pub mod deliver;
pub mod digest;
pub mod youtube_activity;
pub mod youtube_base;
pub mod youtube_oauth;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use failure::Error;
use reqwest::blocking::Client;

use crate::config::{default_settings_path, Settings, Window};
use crate::deliver::{delivery_for, DeliveryKind};
use crate::digest::{Digest, DigestRenderer};
use crate::youtube_activity::{cutoff, ActivityQuery, FetchOutcome};
use crate::youtube_oauth::{setup_credential, Credential};

/// Collects recent uploads from a list of YouTube channels into a digest
#[derive(Parser, Debug)]
#[command(name = "uploaddigest")]
#[command(about = "Reports recent uploads of configured YouTube channels")]
struct Cli {
    /// Settings file, defaults to the user's preferences directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Where the digest goes: stdout, gmail or smtp
    #[arg(short, long, default_value = "stdout")]
    delivery: DeliveryKind,

    /// Lookback window, overrides the settings: week or previous-month
    #[arg(short, long)]
    window: Option<Window>,

    /// Also print the HTML digest when delivering to stdout
    #[arg(long)]
    html: bool,
}

/// Fetches and renders; `None` when there is nothing worth sending.
fn collect_digest(
    settings: &Settings,
    window: Window,
    credential: &Credential,
    client: &Client,
    now: DateTime<Utc>,
) -> Result<Option<Digest>, Error> {
    let since = cutoff(window, now);
    let query = ActivityQuery {
        client,
        credential,
        api_base_url: &settings.api_base_url,
        max_results: settings.max_results,
    };

    let outcome = query.fetch(&settings.channels, since);
    info!(
        "Found {} uploads since {}, {} channels failed",
        outcome.records().len(),
        since.format("%Y-%m-%d %H:%M"),
        outcome.failures().len()
    );

    let (records, failures) = match outcome {
        FetchOutcome::Complete(records) => (records, Vec::new()),
        FetchOutcome::Partial { records, failures } => {
            if !settings.report_partial {
                bail!("{} of {} channels failed, not reporting a partial digest",
                      failures.len(), settings.channels.len());
            }
            (records, failures)
        }
        FetchOutcome::Failed(failures) => {
            bail!("fetching failed for all {} channels", failures.len());
        }
    };

    if records.is_empty() && failures.is_empty() {
        return Ok(None);
    }

    let renderer = DigestRenderer::new(settings.tz()?, &settings.date_format, settings.dated_text)?;
    let digest = renderer.render(&settings.subject(), &since, records, &failures)?;
    Ok(Some(digest))
}

fn run(cli: Cli) -> Result<(), Error> {
    let path = match cli.config {
        Some(p) => p,
        None => default_settings_path()?,
    };
    info!("Loading settings from {}", path.display());
    let settings = Settings::load(&path)?;
    let window = cli.window.unwrap_or(settings.window);

    let credential = setup_credential(&settings.credentials)
        .map_err(|e| format_err!("could not acquire credentials: {}", e))?;
    let client = Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .build()?;
    let delivery = delivery_for(cli.delivery, cli.html, &settings, &credential, &client)?;

    match collect_digest(&settings, window, &credential, &client, Utc::now())? {
        None => info!("No new uploads, nothing to report"),
        Some(digest) => {
            info!("Delivering digest with {} videos", digest.count);
            delivery.send(&digest)?;
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mockito::{mock, Matcher};

    const FOO_PAGE: &str = r#"{"items":[
        {"snippet":{"type":"upload","title":"Later","publishedAt":"2021-05-01T10:00:00+00:00"},"contentDetails":{"upload":{"videoId":"abc123"}}},
        {"snippet":{"type":"upload","title":"Earlier","publishedAt":"2021-04-25T10:00:00+00:00"},"contentDetails":{"upload":{"videoId":"def456"}}}
    ]}"#;

    fn settings(prefix: &str, extra: &str) -> Settings {
        let raw = format!(
            r#"{{
                "channels": {{"Foo": "UCfoo", "Bar": "UCbar"}},
                "credentials": {{"api_key": "k"}},
                "api_base_url": "{}{}",
                "insecure_transport": true{}
            }}"#,
            mockito::server_url(),
            prefix,
            extra
        );
        Settings::from_reader(raw.as_bytes()).unwrap()
    }

    fn mock_channel(prefix: &str, channel_id: &str, status: usize, body: &str) -> mockito::Mock {
        mock("GET", format!("{}/activities", prefix).as_str())
            .match_query(Matcher::UrlEncoded("channelId".into(), channel_id.into()))
            .with_status(status)
            .with_body(body)
            .create()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 5, 2, 0, 0, 0).unwrap()
    }

    fn collect(s: &Settings) -> Result<Option<Digest>, Error> {
        let credential = Credential::ApiKey("k".to_string());
        collect_digest(s, s.window, &credential, &Client::new(), now())
    }

    #[test]
    fn it_renders_sorted_digest() {
        let _foo = mock_channel("/run-ok", "UCfoo", 200, FOO_PAGE);
        let _bar = mock_channel("/run-ok", "UCbar", 200, r#"{"items":[]}"#);

        let digest = collect(&settings("/run-ok", "")).unwrap().unwrap();

        assert_eq!(digest.count, 2);
        assert!(digest.text.find("Earlier").unwrap() < digest.text.find("Later").unwrap());
        assert!(digest.html.contains("https://i.ytimg.com/vi/def456/maxresdefault.jpg"));
    }

    #[test]
    fn it_returns_nothing_without_uploads() {
        let _foo = mock_channel("/run-empty", "UCfoo", 200, r#"{"items":[]}"#);
        let _bar = mock_channel("/run-empty", "UCbar", 200, r#"{"items":[]}"#);

        assert!(collect(&settings("/run-empty", "")).unwrap().is_none());
    }

    #[test]
    fn it_reports_partial_digest_by_default() {
        let _foo = mock_channel("/run-partial", "UCfoo", 200, FOO_PAGE);
        let _bar = mock_channel("/run-partial", "UCbar", 500, "{}");

        let digest = collect(&settings("/run-partial", "")).unwrap().unwrap();

        assert_eq!(digest.count, 2);
        assert!(digest.text.contains("\tBar: "));
    }

    #[test]
    fn it_keeps_the_api_key_out_of_the_digest() {
        let _foo = mock_channel("/run-secret", "UCfoo", 200, FOO_PAGE);
        let _bar = mock_channel("/run-secret", "UCbar", 500, "{}");
        let s = settings("/run-secret", "");
        let credential = Credential::ApiKey("SUPERSECRETKEY".to_string());

        let digest = collect_digest(&s, s.window, &credential, &Client::new(), now())
            .unwrap()
            .unwrap();

        assert!(digest.text.contains("\tBar: "));
        assert!(!digest.text.contains("SUPERSECRETKEY"));
        assert!(!digest.html.contains("SUPERSECRETKEY"));
    }

    #[test]
    fn it_can_refuse_partial_digests() {
        let _foo = mock_channel("/run-strict", "UCfoo", 200, FOO_PAGE);
        let _bar = mock_channel("/run-strict", "UCbar", 500, "{}");

        let result = collect(&settings("/run-strict", r#", "report_partial": false"#));

        assert!(result.is_err());
    }

    #[test]
    fn it_fails_when_every_channel_fails() {
        let _foo = mock_channel("/run-down", "UCfoo", 503, "{}");
        let _bar = mock_channel("/run-down", "UCbar", 503, "{}");

        assert!(collect(&settings("/run-down", "")).is_err());
    }
}
