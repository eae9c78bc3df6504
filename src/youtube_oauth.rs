use chrono::{DateTime, Duration, Utc};
use failure::Error;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    Scope, TokenResponse, TokenUrl,
};
use serde_json as json;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::Path;
use url::Url;

use crate::config::{CredentialSettings, OauthSettings};

/// Seconds shaved off a token's lifetime so it is not used right at the edge.
const EXPIRY_SKEW_SECS: i64 = 60;

#[derive(Debug, Fail)]
pub enum OauthError {
    #[fail(display = "redirect did not carry an authorization code")]
    MissingCode,
    #[fail(display = "redirect state did not match the authorization request")]
    StateMismatch,
    #[fail(display = "malformed redirect request: {}", _0)]
    MalformedRedirect(String),
}

/// What API calls authenticate with.
#[derive(Clone, Debug, PartialEq)]
pub enum Credential {
    ApiKey(String),
    Bearer(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// lifetime in seconds, as reported by the token endpoint
    pub expires_in: Option<i64>,
    created: DateTime<Utc>,
}

impl Token {
    fn from_response(resp: &BasicTokenResponse, previous_refresh: Option<String>) -> Token {
        Token {
            access_token: resp.access_token().secret().clone(),
            refresh_token: resp
                .refresh_token()
                .map(|r| r.secret().clone())
                .or(previous_refresh),
            expires_in: resp.expires_in().map(|d| d.as_secs() as i64),
            created: Utc::now(),
        }
    }

    pub fn load(path: &Path) -> Result<Token, Error> {
        let f = File::open(path)?;
        let tk = json::from_reader(f)?;
        Ok(tk)
    }

    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let f = File::create(path)?;
        json::to_writer_pretty(f, self)?;
        Ok(())
    }
}

pub trait Expiring {
    fn expired_at(&self, now: DateTime<Utc>) -> bool;

    fn expired(&self) -> bool {
        self.expired_at(Utc::now())
    }
}

impl Expiring for Token {
    fn expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_in {
            // no lifetime reported, trust it until the API says otherwise
            None => false,
            Some(secs) => now >= self.created + Duration::seconds(secs - EXPIRY_SKEW_SECS),
        }
    }
}

#[derive(Deserialize)]
struct Installed {
    client_id: String,
    auth_uri: String,
    token_uri: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Installed,
}

fn oauth_client(settings: &OauthSettings) -> Result<BasicClient, Error> {
    let f = File::open(&settings.client_secret)?;
    let secret = json::from_reader::<File, ClientSecretFile>(f)?.installed;
    let client = BasicClient::new(
        ClientId::new(secret.client_id),
        Some(ClientSecret::new(secret.client_secret)),
        AuthUrl::new(secret.auth_uri)?,
        Some(TokenUrl::new(secret.token_uri)?),
    )
    .set_redirect_uri(RedirectUrl::new(format!(
        "http://localhost:{}",
        settings.redirect_port
    ))?);
    Ok(client)
}

/// Pulls `code` out of the request line the browser sends to the redirect listener.
fn code_from_request_line(request_line: &str, expected_state: &str) -> Result<String, Error> {
    let target = request_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| OauthError::MalformedRedirect(request_line.trim().to_string()))?;
    let url = Url::parse(&("http://localhost".to_string() + target))?;

    let state = url.query_pairs().find(|(key, _)| key == "state").map(|(_, v)| v.into_owned());
    if state.as_deref() != Some(expected_state) {
        return Err(OauthError::StateMismatch.into());
    }

    url.query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| OauthError::MissingCode.into())
}

fn authorize(client: &BasicClient, settings: &OauthSettings) -> Result<Token, Error> {
    let mut request = client
        .authorize_url(CsrfToken::new_random)
        .add_extra_param("access_type", "offline");
    for scope in &settings.scopes {
        request = request.add_scope(Scope::new(scope.clone()));
    }
    let (authorize_url, csrf_state) = request.url();
    println!("Open this URL in your browser:\n{}\n", authorize_url);

    // A very naive implementation of the redirect server.
    let listener = TcpListener::bind(("127.0.0.1", settings.redirect_port))?;
    let (mut stream, _) = listener.accept()?;
    let code = {
        let mut reader = BufReader::new(&stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line)?;
        code_from_request_line(&request_line, csrf_state.secret())?
    };
    let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nAuthorized, you can close this window.";
    stream.write_all(response.as_bytes())?;

    let resp = client
        .exchange_code(AuthorizationCode::new(code))
        .request(http_client)?;
    Ok(Token::from_response(&resp, None))
}

fn refresh(client: &BasicClient, tk: &Token) -> Result<Option<Token>, Error> {
    let refresh_token = match tk.refresh_token {
        Some(ref r) => r.clone(),
        None => return Ok(None),
    };
    let resp = client
        .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
        .request(http_client)?;
    Ok(Some(Token::from_response(&resp, Some(refresh_token))))
}

/// Returns a usable token, refreshing or logging in as needed and keeping the cache current.
pub fn setup_oauth(settings: &OauthSettings) -> Result<Token, Error> {
    let client = oauth_client(settings)?;
    let cached = match Token::load(&settings.token_cache) {
        Ok(tk) => Some(tk),
        Err(e) => {
            info!("No cached token at {}: {}", settings.token_cache.display(), e);
            None
        }
    };

    if let Some(tk) = cached {
        if !tk.expired() {
            return Ok(tk);
        }
        info!("Cached token expired, refreshing");
        match refresh(&client, &tk) {
            Ok(Some(fresh)) => {
                fresh.save(&settings.token_cache)?;
                return Ok(fresh);
            }
            Ok(None) => info!("Cached token has no refresh token"),
            Err(e) => warn!("Token refresh failed: {}", e),
        }
    }

    let tk = authorize(&client, settings)?;
    tk.save(&settings.token_cache)?;
    Ok(tk)
}

pub fn setup_credential(settings: &CredentialSettings) -> Result<Credential, Error> {
    match settings {
        CredentialSettings::ApiKey(key) => Ok(Credential::ApiKey(key.clone())),
        CredentialSettings::Oauth(o) => setup_oauth(o).map(|tk| Credential::Bearer(tk.access_token)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn token(expires_in: Option<i64>) -> Token {
        Token {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_in,
            created: Utc.with_ymd_and_hms(2021, 5, 1, 10, 0, 0).unwrap(),
        }
    }

    #[test]
    fn it_expires_after_lifetime_minus_skew() {
        let tk = token(Some(3600));
        let created = Utc.with_ymd_and_hms(2021, 5, 1, 10, 0, 0).unwrap();

        assert!(!tk.expired_at(created + Duration::seconds(3000)));
        assert!(tk.expired_at(created + Duration::seconds(3540)));
        assert!(tk.expired_at(created + Duration::days(1)));
    }

    #[test]
    fn it_never_expires_without_lifetime() {
        let tk = token(None);

        assert!(!tk.expired_at(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn it_round_trips_the_cache_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tk.json");
        let tk = token(Some(3600));

        tk.save(&path).unwrap();
        let loaded = Token::load(&path).unwrap();

        assert_eq!(loaded.access_token, "access");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(loaded.expires_in, Some(3600));
        assert_eq!(loaded.created, tk.created);
    }

    #[test]
    fn it_extracts_code_from_redirect() {
        let line = "GET /?state=xyz&code=4%2Fabc&scope=s HTTP/1.1\r\n";

        assert_eq!(code_from_request_line(line, "xyz").unwrap(), "4/abc");
    }

    #[test]
    fn it_rejects_foreign_state_and_missing_code() {
        assert!(code_from_request_line("GET /?state=other&code=c HTTP/1.1", "xyz").is_err());
        assert!(code_from_request_line("GET /?state=xyz HTTP/1.1", "xyz").is_err());
        assert!(code_from_request_line("", "xyz").is_err());
    }

    #[test]
    fn api_key_needs_no_login() {
        let cred = setup_credential(&CredentialSettings::ApiKey("k".to_string())).unwrap();

        assert_eq!(cred, Credential::ApiKey("k".to_string()));
    }
}
