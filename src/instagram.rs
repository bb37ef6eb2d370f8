use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://insta-back-sh0s.onrender.com/api/instagram";

/// Source of the bearer token attached to every authenticated request.
pub trait TokenProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Broad failure classes surfaced to the view layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Upstream,
    Authorization,
    Validation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Network => "network",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Validation => "validation",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("instagram: request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("instagram: api error {status}: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("instagram: unauthorized")]
    Unauthorized,
    #[error("instagram: decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("instagram: invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Unauthorized => ErrorKind::Authorization,
            ApiError::Upstream { .. } | ApiError::Decode { .. } => ErrorKind::Upstream,
            ApiError::Url(_) => ErrorKind::Validation,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized)
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub user_agent: String,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct Client {
    token_provider: Arc<dyn TokenProvider>,
    http: HttpClient,
    user_agent: String,
    base_url: Url,
}

impl Client {
    pub fn new(token_provider: Arc<dyn TokenProvider>, config: ClientConfig) -> ApiResult<Self> {
        let base = config
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let base_url = Url::parse(base.trim_end_matches('/'))?;
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()?,
        };
        let user_agent = if config.user_agent.trim().is_empty() {
            format!("instafeed/{}", crate::VERSION)
        } else {
            config.user_agent
        };

        Ok(Client {
            token_provider,
            http,
            user_agent,
            base_url,
        })
    }

    pub fn profile(&self) -> ApiResult<Profile> {
        let resp = self.send(Method::GET, &["profile"], None)?;
        decode(resp, "profile")
    }

    pub fn media(&self) -> ApiResult<Vec<MediaItem>> {
        let resp = self.send(Method::GET, &["media"], None)?;
        let page: DataPage<MediaItem> = decode(resp, "media")?;
        Ok(page.data)
    }

    pub fn comments(&self, media_id: &str) -> ApiResult<Vec<Comment>> {
        let resp = self.send(Method::GET, &["media", media_id, "comments"], None)?;
        let page: DataPage<Comment> = decode(resp, "comments")?;
        Ok(page.data)
    }

    pub fn replies(&self, comment_id: &str) -> ApiResult<Vec<Reply>> {
        let resp = self.send(Method::GET, &["comment", comment_id, "replies"], None)?;
        let page: DataPage<Reply> = decode(resp, "replies")?;
        Ok(page.data)
    }

    pub fn create_comment(&self, media_id: &str, message: &str) -> ApiResult<Comment> {
        let body = serde_json::json!({ "message": message });
        let resp = self.send(Method::POST, &["media", media_id, "comments"], Some(body))?;
        decode(resp, "created comment")
    }

    pub fn reply_to_comment(
        &self,
        media_id: &str,
        comment_id: &str,
        message: &str,
    ) -> ApiResult<Reply> {
        let body = serde_json::json!({ "commentId": comment_id, "message": message });
        let resp = self.send(
            Method::POST,
            &["media", media_id, "comment", "reply"],
            Some(body),
        )?;
        decode(resp, "created reply")
    }

    pub fn logout(&self) -> ApiResult<()> {
        self.send(Method::POST, &["logout"], None)?;
        Ok(())
    }

    fn endpoint(&self, segments: &[&str]) -> ApiResult<Url> {
        join_segments(&self.base_url, segments)
    }

    fn send(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> ApiResult<Response> {
        // A missing token never reaches the wire.
        let token = self
            .token_provider
            .bearer_token()
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?;
        let url = self.endpoint(segments)?;
        tracing::debug!(%method, path = url.path(), "instagram request");

        let mut req: RequestBuilder = self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", token));
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send()?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }
        let body = resp.text().unwrap_or_default();
        Err(ApiError::Upstream { status, body })
    }
}

/// Browser entry point of the delegated login. Needs no token.
pub fn login_url(base_url: &str) -> ApiResult<Url> {
    let base = Url::parse(base_url.trim_end_matches('/'))?;
    join_segments(&base, &["login"])
}

fn join_segments(base: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn decode<T: DeserializeOwned>(resp: Response, what: &'static str) -> ApiResult<T> {
    resp.json()
        .map_err(|source| ApiError::Decode { what, source })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct DataPage<T> {
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty")]
    data: Vec<T>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Graph API timestamps use `+0000` offsets, which RFC 3339 parsing rejects.
/// Unparseable values become `None` instead of failing the whole payload.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<FixedOffset>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| {
        DateTime::parse_from_rfc3339(&value)
            .or_else(|_| DateTime::parse_from_str(&value, "%Y-%m-%dT%H:%M:%S%z"))
            .ok()
    }))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub account_type: String,
    #[serde(default)]
    pub media_count: u64,
    #[serde(default)]
    pub followers_count: Option<u64>,
    #[serde(default)]
    pub follows_count: Option<u64>,
    #[serde(default)]
    pub biography: Option<String>,
    #[serde(default)]
    pub profile_picture_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    Image,
    Video,
    #[serde(alias = "CAROUSEL")]
    CarouselAlbum,
    #[serde(other)]
    Other,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Image => "IMAGE",
            MediaType::Video => "VIDEO",
            MediaType::CarouselAlbum => "CAROUSEL_ALBUM",
            MediaType::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub media_type: MediaType,
    #[serde(default)]
    pub media_url: String,
    #[serde(default)]
    pub caption: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<FixedOffset>>,
}
