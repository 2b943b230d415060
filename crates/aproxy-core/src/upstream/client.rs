//! libcurl-backed upstream client.

use super::headers::{parse_headers, ResponseHeaders};
use super::{redirect_expiry, RangeResponse, ResolvedStream, Upstream, UpstreamError};
use crate::chunk::ByteRange;
use crate::config::UpstreamConfig;
use curl::easy::{Easy, List};
use std::str;
use std::time::Duration;

/// Upstream client performing one blocking curl transfer per call.
#[derive(Debug, Clone)]
pub struct CurlUpstream {
    oauth_token: Option<String>,
    user_agent: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl CurlUpstream {
    pub fn new(cfg: &UpstreamConfig) -> Self {
        Self {
            oauth_token: cfg.oauth_token.clone(),
            user_agent: cfg.user_agent(),
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            read_timeout: Duration::from_secs(cfg.read_timeout_secs),
        }
    }

    fn easy(&self, url: &str, authorized: bool) -> Result<Easy, curl::Error> {
        let mut easy = Easy::new();
        easy.url(url)?;
        easy.useragent(&self.user_agent)?;
        easy.connect_timeout(self.connect_timeout)?;
        // Abort when nothing arrives for the read timeout.
        easy.low_speed_limit(1)?;
        easy.low_speed_time(self.read_timeout)?;
        if authorized {
            if let Some(token) = &self.oauth_token {
                let mut list = List::new();
                list.append(&format!("Authorization: OAuth {}", token))?;
                easy.http_headers(list)?;
            }
        }
        Ok(easy)
    }

    /// HEAD `url`; returns the final status and parsed headers.
    fn head(
        &self,
        url: &str,
        follow: bool,
        authorized: bool,
    ) -> Result<(u16, ResponseHeaders), UpstreamError> {
        let mut lines: Vec<String> = Vec::new();
        let mut easy = self.easy(url, authorized)?;
        easy.nobody(true)?;
        easy.follow_location(follow)?;
        {
            let mut transfer = easy.transfer();
            transfer.header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    lines.push(s.trim_end().to_string());
                }
                true
            })?;
            transfer.perform()?;
        }
        let code = easy.response_code()? as u16;
        Ok((code, parse_headers(&lines)))
    }
}

impl Upstream for CurlUpstream {
    fn resolve(&self, url: &str, skip_play_logging: bool) -> Result<ResolvedStream, UpstreamError> {
        if !skip_play_logging {
            match self.log_playcount(url) {
                Ok(status) => tracing::debug!(url, status, "playcount logged during resolve"),
                Err(e) => tracing::warn!(url, "playcount during resolve failed: {}", e),
            }
        }

        let (status, headers) = self.head(url, false, true)?;
        let (redirect_url, headers) = match status {
            200..=299 => (url.to_string(), headers),
            300..=399 => {
                let location = headers.location.ok_or_else(|| {
                    UpstreamError::InvalidResponse(format!("HTTP {} without Location", status))
                })?;
                let redirect = url::Url::parse(url)
                    .and_then(|base| base.join(&location))
                    .map_err(|e| UpstreamError::InvalidResponse(format!("bad Location: {}", e)))?
                    .to_string();
                let (target_status, target) = self.head(&redirect, true, false)?;
                if !(200..300).contains(&target_status) {
                    return Err(UpstreamError::InvalidResponse(format!(
                        "redirect target returned HTTP {}",
                        target_status
                    )));
                }
                (redirect, target)
            }
            _ => return Err(UpstreamError::Resolver { status }),
        };

        let content_length = headers
            .content_length
            .filter(|&n| n > 0)
            .ok_or_else(|| UpstreamError::InvalidResponse("missing Content-Length".into()))?;

        Ok(ResolvedStream {
            expires: redirect_expiry(&redirect_url),
            redirect_url,
            content_length,
            etag: headers.etag,
            bitrate: headers.bitrate,
        })
    }

    fn range_get(&self, redirect_url: &str, range: ByteRange) -> Result<RangeResponse, UpstreamError> {
        let mut body: Vec<u8> = Vec::with_capacity(range.length as usize);
        let mut easy = self.easy(redirect_url, false)?;
        easy.follow_location(true)?;
        easy.range(&range.inclusive_span())?;
        {
            let mut transfer = easy.transfer();
            transfer.write_function(|data| {
                body.extend_from_slice(data);
                Ok(data.len())
            })?;
            transfer.perform()?;
        }
        let status = easy.response_code()? as u16;
        Ok(RangeResponse { status, body })
    }

    fn log_playcount(&self, url: &str) -> Result<u16, UpstreamError> {
        let mut easy = self.easy(url, true)?;
        easy.follow_location(false)?;
        easy.range("0-1")?;
        {
            let mut transfer = easy.transfer();
            transfer.write_function(|data| Ok(data.len()))?;
            transfer.perform()?;
        }
        Ok(easy.response_code()? as u16)
    }
}
