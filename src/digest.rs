use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use failure::Error;
use handlebars::{handlebars_helper, Handlebars};

use crate::youtube_activity::{ActivityRecord, ChannelFailure};

const DIGEST_TEMPLATE: &str = "digest";

handlebars_helper!(watch_url: |video_id: str| make_youtube_url(video_id));
handlebars_helper!(thumbnail_url: |video_id: str| make_thumbnail_url(video_id));
handlebars_helper!(channel_url: |channel_id: str| make_channel_url(channel_id));

pub fn make_youtube_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

pub fn make_thumbnail_url(video_id: &str) -> String {
    format!("https://i.ytimg.com/vi/{}/maxresdefault.jpg", video_id)
}

pub fn make_channel_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/channel/{}", channel_id)
}

/// Orders records chronologically; records published at the same instant keep fetch order.
pub fn sort(records: &mut [ActivityRecord]) {
    records.sort_by_key(|r| r.published_at);
}

/// A rendered digest, ready for delivery.
#[derive(Debug, Clone)]
pub struct Digest {
    pub subject: String,
    pub text: String,
    pub html: String,
    pub count: usize,
}

#[derive(Serialize)]
struct ActivityView<'a> {
    channel_name: &'a str,
    channel_id: &'a str,
    title: &'a str,
    video_id: &'a str,
    date: String,
}

#[derive(Serialize)]
struct DigestView<'a> {
    subject: &'a str,
    since: String,
    activities: Vec<ActivityView<'a>>,
    failures: &'a [ChannelFailure],
}

pub struct DigestRenderer {
    hb: Handlebars<'static>,
    tz: Tz,
    date_format: String,
    dated_text: bool,
}

impl DigestRenderer {
    pub fn new(tz: Tz, date_format: &str, dated_text: bool) -> Result<DigestRenderer, Error> {
        let mut hb = Handlebars::new();
        hb.register_template_string(DIGEST_TEMPLATE, include_str!("../templates/digest.hbs"))?;
        hb.register_helper("watch_url", Box::new(watch_url));
        hb.register_helper("thumbnail_url", Box::new(thumbnail_url));
        hb.register_helper("channel_url", Box::new(channel_url));

        Ok(DigestRenderer {
            hb,
            tz,
            date_format: date_format.to_string(),
            dated_text,
        })
    }

    pub fn display_date(&self, d: &DateTime<Utc>) -> String {
        d.with_timezone(&self.tz).format(&self.date_format).to_string()
    }

    pub fn render_text(&self, records: &[ActivityRecord], failures: &[ChannelFailure]) -> String {
        let mut out = String::new();
        for r in records {
            if self.dated_text {
                out.push_str(&format!(
                    "New video by {} on {}: \"{}\"\n",
                    r.channel_name,
                    self.display_date(&r.published_at),
                    r.title
                ));
            } else {
                out.push_str(&format!("New video by {}: \"{}\"\n", r.channel_name, r.title));
            }
            out.push_str(&format!("\tLink: {}\n\n", make_youtube_url(&r.video_id)));
        }
        if !failures.is_empty() {
            out.push_str("Some channels could not be checked:\n");
            for f in failures {
                out.push_str(&format!("\t{}: {}\n", f.channel_name, f.reason));
            }
        }
        out
    }

    /// Titles and names are escaped by the template engine.
    pub fn render_html(
        &self,
        subject: &str,
        since: &DateTime<Utc>,
        records: &[ActivityRecord],
        failures: &[ChannelFailure],
    ) -> Result<String, Error> {
        let data = DigestView {
            subject,
            since: self.display_date(since),
            activities: records
                .iter()
                .map(|r| ActivityView {
                    channel_name: &r.channel_name,
                    channel_id: &r.channel_id,
                    title: &r.title,
                    video_id: &r.video_id,
                    date: self.display_date(&r.published_at),
                })
                .collect(),
            failures,
        };
        let html = self.hb.render(DIGEST_TEMPLATE, &data)?;
        Ok(html)
    }

    /// Sorts `records` and renders both bodies.
    pub fn render(
        &self,
        subject: &str,
        since: &DateTime<Utc>,
        mut records: Vec<ActivityRecord>,
        failures: &[ChannelFailure],
    ) -> Result<Digest, Error> {
        sort(&mut records);
        Ok(Digest {
            subject: subject.to_string(),
            text: self.render_text(&records, failures),
            html: self.render_html(subject, since, &records, failures)?,
            count: records.len(),
        })
    }
}
