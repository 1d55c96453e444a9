//! External image→offset breaking service.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::BreakerConfig;
use crate::config::secrets::ExposeSecret;
use crate::error::{Error, Result};

/// The two images a slider challenge is made of.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeImages {
    pub background: Vec<u8>,
    pub slider: Vec<u8>,
}

#[async_trait]
pub trait BreakingService: Send + Sync {
    /// Horizontal offset (px) the slider piece must travel.
    async fn locate(&self, images: &ChallengeImages) -> Result<f64>;
}

#[derive(Debug, Serialize)]
struct BreakRequest<'a> {
    #[serde(rename = "slideImageBase64")]
    slide_image: String,
    #[serde(rename = "backgroundImageBase64")]
    background_image: String,
    #[serde(rename = "credential")]
    token: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Deserialize)]
struct BreakResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    data: Value,
    #[serde(default, alias = "message")]
    msg: Option<String>,
}

/// Breaking service reached over HTTP with a JSON body.
#[derive(Debug)]
pub struct HttpBreaker {
    client: reqwest::Client,
    config: BreakerConfig,
}

impl HttpBreaker {
    pub fn new(config: BreakerConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl BreakingService for HttpBreaker {
    async fn locate(&self, images: &ChallengeImages) -> Result<f64> {
        let body = BreakRequest {
            slide_image: STANDARD.encode(&images.slider),
            background_image: STANDARD.encode(&images.background),
            token: self.config.credential.expose_secret(),
            kind: &self.config.kind,
        };
        let response = self
            .client
            .post(&self.config.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: BreakResponse = response.json().await?;
        tracing::debug!(code = parsed.code, data = %parsed.data, "breaker responded");
        parse_offset(parsed.code, &parsed.data, parsed.msg.as_deref())
    }
}

/// Pull the x offset out of a breaker reply. `data` may be a number, a
/// numeric string, an `"x,y"` string, an `{x, y}` object, or a list of any
/// of those (the first entry wins).
pub fn parse_offset(code: i64, data: &Value, msg: Option<&str>) -> Result<f64> {
    if code != 0 && code != 200 {
        return Err(Error::Breaker(format!(
            "code {code}: {}",
            msg.unwrap_or("no message")
        )));
    }
    offset_from(data).ok_or_else(|| Error::Breaker(format!("no coordinate in {data}")))
}

fn offset_from(data: &Value) -> Option<f64> {
    match data {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.split(',').next()?.trim().parse().ok(),
        Value::Array(items) => offset_from(items.first()?),
        Value::Object(map) => offset_from(map.get("x")?),
        _ => None,
    }
    .filter(|x| x.is_finite())
}
