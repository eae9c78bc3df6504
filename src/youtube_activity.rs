use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use failure::Error;
use reqwest::blocking::Client;
use std::collections::BTreeMap;

use crate::config::Window;
use crate::youtube_base::{
    endpoint, query_simple_page, YoutubeActivityContentDetails, YoutubeActivitySnippet,
    YoutubeItem, YoutubeResult,
};
use crate::youtube_oauth::Credential;

const UPLOAD_TYPE: &str = "upload";
const PUBLISHED_AFTER_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub type ActivityItem = YoutubeItem<YoutubeActivitySnippet, YoutubeActivityContentDetails>;
pub type ActivityPage = YoutubeResult<YoutubeActivitySnippet, YoutubeActivityContentDetails>;

#[derive(Debug, Fail, PartialEq)]
pub enum ActivityError {
    #[fail(display = "upload activity without a video id")]
    MissingVideoId,
    #[fail(display = "activity without a snippet")]
    MissingSnippet,
    #[fail(display = "unparseable publish date {}: {}", date, reason)]
    BadDate { date: String, reason: String },
}

/// One detected upload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ActivityRecord {
    pub channel_name: String,
    pub channel_id: String,
    pub title: String,
    pub video_id: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelFailure {
    pub channel_name: String,
    pub reason: String,
}

/// What a fetch over all channels produced.
#[derive(Debug, PartialEq)]
pub enum FetchOutcome {
    Complete(Vec<ActivityRecord>),
    Partial {
        records: Vec<ActivityRecord>,
        failures: Vec<ChannelFailure>,
    },
    Failed(Vec<ChannelFailure>),
}

impl FetchOutcome {
    fn from_parts(records: Vec<ActivityRecord>, failures: Vec<ChannelFailure>, channels: usize) -> FetchOutcome {
        if failures.is_empty() {
            FetchOutcome::Complete(records)
        } else if failures.len() == channels {
            FetchOutcome::Failed(failures)
        } else {
            FetchOutcome::Partial { records, failures }
        }
    }

    pub fn records(&self) -> &[ActivityRecord] {
        match self {
            FetchOutcome::Complete(records) => records,
            FetchOutcome::Partial { records, .. } => records,
            FetchOutcome::Failed(_) => &[],
        }
    }

    pub fn failures(&self) -> &[ChannelFailure] {
        match self {
            FetchOutcome::Complete(_) => &[],
            FetchOutcome::Partial { failures, .. } => failures,
            FetchOutcome::Failed(failures) => failures,
        }
    }
}

/// Start of the lookback window ending at `now`.
pub fn cutoff(window: Window, now: DateTime<Utc>) -> DateTime<Utc> {
    match window {
        Window::Week => now - Duration::days(7),
        Window::PreviousMonth => {
            let (year, month) = if now.month() == 1 {
                (now.year() - 1, 12)
            } else {
                (now.year(), now.month() - 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .unwrap_or(now)
        }
    }
}

pub fn parse_published_at(s: &str) -> Result<DateTime<Utc>, ActivityError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ActivityError::BadDate {
            date: s.to_string(),
            reason: e.to_string(),
        })
}

/// Turns an activity item into a record; `Ok(None)` for anything that is not an upload.
pub fn construct_activity_record(
    channel_name: &str,
    channel_id: &str,
    item: &ActivityItem,
) -> Result<Option<ActivityRecord>, ActivityError> {
    let snippet = item.snippet.as_ref().ok_or(ActivityError::MissingSnippet)?;
    if snippet.activity_type != UPLOAD_TYPE {
        return Ok(None);
    }
    let video_id = item
        .content_details
        .as_ref()
        .and_then(|cd| cd.upload.as_ref())
        .map(|u| u.video_id.clone())
        .ok_or(ActivityError::MissingVideoId)?;

    Ok(Some(ActivityRecord {
        channel_name: channel_name.to_string(),
        channel_id: channel_id.to_string(),
        title: snippet.title.clone(),
        video_id,
        published_at: parse_published_at(&snippet.published_at)?,
    }))
}

pub fn records_from_page(
    channel_name: &str,
    channel_id: &str,
    page: &ActivityPage,
) -> Result<Vec<ActivityRecord>, ActivityError> {
    let mut records = Vec::new();
    for item in &page.items {
        if let Some(r) = construct_activity_record(channel_name, channel_id, item)? {
            records.push(r);
        }
    }
    Ok(records)
}

pub struct ActivityQuery<'a> {
    pub client: &'a Client,
    pub credential: &'a Credential,
    pub api_base_url: &'a str,
    pub max_results: Option<u32>,
}

impl<'a> ActivityQuery<'a> {
    fn query_channel(&self, channel_name: &str, channel_id: &str, published_after: &str) -> Result<Vec<ActivityRecord>, Error> {
        let max_results = self.max_results.map(|m| m.to_string());
        let mut params = vec![
            ("part", "snippet,contentDetails"),
            ("channelId", channel_id),
            ("publishedAfter", published_after),
        ];
        if let Some(ref m) = max_results {
            params.push(("maxResults", m.as_str()));
        }
        let url = endpoint(self.api_base_url, "activities", &params)?;
        let page: ActivityPage = query_simple_page(self.client, self.credential, url)?;
        if page.next_page_token.is_some() {
            let total = page.page_info.as_ref().map(|p| p.total_results).unwrap_or(0);
            info!("{} has more activity than one page ({} in total), only the first is read", channel_name, total);
        }

        let records = records_from_page(channel_name, channel_id, &page)?;
        Ok(records)
    }

    /// Queries every channel once; a failing channel is recorded and the rest carry on.
    pub fn fetch(&self, channels: &BTreeMap<String, String>, cutoff: DateTime<Utc>) -> FetchOutcome {
        let published_after = cutoff.format(PUBLISHED_AFTER_FORMAT).to_string();
        let mut records = Vec::new();
        let mut failures = Vec::new();

        for (channel_name, channel_id) in channels {
            match self.query_channel(channel_name, channel_id, &published_after) {
                Ok(mut found) => {
                    debug!("{}: {} uploads since {}", channel_name, found.len(), published_after);
                    records.append(&mut found);
                }
                Err(e) => {
                    warn!("Fetching activity for {} failed: {}", channel_name, e);
                    failures.push(ChannelFailure {
                        channel_name: channel_name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        FetchOutcome::from_parts(records, failures, channels.len())
    }
}
