//! Default transport: REST long-poll subscribe and publish over `reqwest`.

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::config::Config;
use crate::error::{Error, PublishError, TransportError};
use crate::protocol::{decode_publish, decode_subscribe, error_message};
use crate::transport::{PollRequest, PollResponse, PublishRequest, Transport};
use crate::types::Timetoken;

const AGENT_STRING: &str = "pubsub-session-rs/0.1";

/// [`Transport`] speaking the broker's REST surface.
///
/// The origin may carry an explicit `http://` or `https://` scheme; a bare
/// host is reached over HTTPS.
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
    subscribe_key: String,
    publish_key: Option<String>,
    uuid: String,
    max_publish_size: usize,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(AGENT_STRING)
            .build()?;
        Ok(Self {
            http,
            base: base_url(&config.origin)?,
            subscribe_key: config.subscribe_key.clone(),
            publish_key: config.publish_key.clone(),
            uuid: config.uuid.clone(),
            max_publish_size: config.max_publish_size,
        })
    }

    fn subscribe_url(&self, request: &PollRequest) -> Result<Url, TransportError> {
        // An empty channel list is spelled "," when only groups are polled.
        let channels = if request.channels.is_empty() {
            ",".to_string()
        } else {
            request.channels.join(",")
        };
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Network(format!("unusable origin: {}", self.base)))?
            .pop_if_empty()
            .extend([
                "v2",
                "subscribe",
                self.subscribe_key.as_str(),
                channels.as_str(),
                "0",
            ]);
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("tt", &request.cursor.to_string());
            q.append_pair("uuid", &self.uuid);
            if !request.groups.is_empty() {
                q.append_pair("channel-group", &request.groups.join(","));
            }
        }
        Ok(url)
    }

    fn publish_url(
        &self,
        publish_key: &str,
        request: &PublishRequest,
    ) -> Result<Url, PublishError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| PublishError::Network(format!("unusable origin: {}", self.base)))?;
            segments.pop_if_empty().extend([
                "publish",
                publish_key,
                self.subscribe_key.as_str(),
                "0",
                request.channel.as_str(),
                "0",
            ]);
            if !request.compressed {
                let payload = std::str::from_utf8(&request.payload)
                    .map_err(|e| PublishError::Encode(format!("payload is not UTF-8: {e}")))?;
                segments.push(payload);
            }
        }
        url.query_pairs_mut().append_pair("uuid", &self.uuid);
        Ok(url)
    }
}

fn base_url(origin: &str) -> Result<Url, Error> {
    if origin.starts_with("http://") || origin.starts_with("https://") {
        Ok(Url::parse(origin)?)
    } else {
        Ok(Url::parse(&format!("https://{origin}/"))?)
    }
}

/// 401/403, or a 400 that names the key, means the credentials are wrong.
fn is_auth_failure(status: StatusCode, message: &str) -> bool {
    status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || (status == StatusCode::BAD_REQUEST && message.to_ascii_lowercase().contains("key"))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn poll(&self, request: PollRequest) -> Result<PollResponse, TransportError> {
        let url = self.subscribe_url(&request)?;
        let resp = self.http.get(url).timeout(request.timeout).send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if status.is_success() {
            return decode_subscribe(&body);
        }
        let message = error_message(&body);
        if is_auth_failure(status, &message) {
            return Err(TransportError::Auth {
                status: status.as_u16(),
                message,
            });
        }
        Err(TransportError::Network(format!("HTTP {status}: {message}")))
    }

    async fn send(&self, request: &PublishRequest) -> Result<Timetoken, PublishError> {
        let Some(publish_key) = self.publish_key.as_deref() else {
            return Err(PublishError::InvalidKey(
                "publish key is not configured".to_string(),
            ));
        };
        let url = self.publish_url(publish_key, request)?;
        let builder = if request.compressed {
            self.http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(request.payload.clone())
        } else {
            self.http.get(url)
        };
        let resp = builder.send().await?;
        let status = resp.status();
        let body = resp.bytes().await?;

        if status.is_success() {
            return decode_publish(&body);
        }
        let message = error_message(&body);
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(PublishError::PayloadTooLarge {
                size: request.payload.len(),
                limit: self.max_publish_size,
            });
        }
        if is_auth_failure(status, &message) || status == StatusCode::BAD_REQUEST {
            return Err(PublishError::InvalidKey(message));
        }
        Err(PublishError::Network(format!("HTTP {status}: {message}")))
    }
}
