use failure::Error;
use reqwest::blocking::Client;
use url::Url;

use crate::youtube_oauth::Credential;

#[derive(Debug, Deserialize)]
pub struct YoutubePageInfo {
    #[serde(rename = "totalResults")]
    pub total_results: i32,
}

#[derive(Debug, Deserialize)]
pub struct YoutubeResult<S, C> {
    #[serde(default = "Vec::new")]
    pub items: Vec<YoutubeItem<S, C>>,
    #[serde(rename = "pageInfo")]
    pub page_info: Option<YoutubePageInfo>,
    #[serde(rename = "nextPageToken")]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct YoutubeItem<S, C> {
    pub snippet: Option<S>,
    #[serde(rename = "contentDetails")]
    pub content_details: Option<C>,
}

#[derive(Debug, Deserialize)]
pub struct YoutubeActivitySnippet {
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(rename = "publishedAt")]
    pub published_at: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct YoutubeUpload {
    #[serde(rename = "videoId")]
    pub video_id: String,
}

#[derive(Debug, Deserialize)]
pub struct YoutubeActivityContentDetails {
    pub upload: Option<YoutubeUpload>,
}

/// Builds `{base}/{resource}` with the given query pairs.
pub fn endpoint(base: &str, resource: &str, params: &[(&str, &str)]) -> Result<Url, Error> {
    let mut q = String::from(base.trim_end_matches('/'));
    q.push('/');
    q.push_str(resource);
    let url = Url::parse_with_params(&q, params)?;
    Ok(url)
}

/// Fetches exactly one page; continuation tokens are left to the caller.
pub fn query_simple_page<S, C>(
    client: &Client,
    credential: &Credential,
    mut url: Url,
) -> Result<YoutubeResult<S, C>, Error>
where
    S: serde::de::DeserializeOwned,
    C: serde::de::DeserializeOwned,
{
    let request = match credential {
        Credential::ApiKey(key) => {
            url.query_pairs_mut().append_pair("key", key);
            client.get(url.as_str())
        }
        Credential::Bearer(token) => client.get(url.as_str()).bearer_auth(token),
    };
    debug!("query: {}", url.path());

    // reqwest errors carry the request url, and with it the api key
    let res = request
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| e.without_url())?;
    let page = res
        .json::<YoutubeResult<S, C>>()
        .map_err(|e| e.without_url())?;
    Ok(page)
}
