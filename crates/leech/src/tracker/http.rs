use std::net::{IpAddr, SocketAddr};

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use tracing::{debug, warn};

use crate::bencode::{self, Value};
use crate::config::EngineConfig;
use crate::error::TrackerError;
use crate::metainfo::TorrentMeta;
use crate::tracker::{parse_compact_peers, parse_compact_peers_v6, AnnounceRequest, TrackerResponse};

/// Everything but the RFC 3986 unreserved characters gets escaped.
const QUERY_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'.').remove(b'_').remove(b'~');

/// Build announce URL with query parameters
pub fn build_announce_url(base: &str, req: &AnnounceRequest) -> String {
    let mut url = String::from(base);
    if !url.contains('?') {
        url.push('?');
    } else if !url.ends_with('&') && !url.ends_with('?') {
        url.push('&');
    }

    // info_hash and peer_id are raw bytes, escaped one byte at a time
    url.push_str("info_hash=");
    url.push_str(&percent_encode(&req.info_hash, QUERY_SET).to_string());
    url.push_str("&peer_id=");
    url.push_str(&percent_encode(&req.peer_id, QUERY_SET).to_string());
    url.push_str(&format!(
        "&port={}&uploaded={}&downloaded={}&left={}&compact=1&no_peer_id=1",
        req.port, req.uploaded, req.downloaded, req.left
    ));
    if let Some(event) = req.event {
        url.push_str("&event=");
        url.push_str(event.as_str());
    }
    if let Some(id) = &req.tracker_id {
        url.push_str("&trackerid=");
        url.push_str(&percent_encode(id.as_bytes(), QUERY_SET).to_string());
    }
    url
}

/// Parse bencoded tracker response
pub fn parse_announce_response(bytes: &[u8]) -> Result<TrackerResponse, TrackerError> {
    let root = bencode::decode(bytes)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::Protocol("tracker response is not a dictionary".into()));
    }

    if let Some(reason) = root.get(b"failure reason") {
        let reason = reason.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned()).unwrap_or_default();
        return Err(TrackerError::Failure(reason));
    }

    let interval = match root.get(b"interval") {
        Some(value) => u32_field(value, "interval")?,
        None => return Err(TrackerError::Protocol("missing `interval`".into())),
    };
    let min_interval = root.get(b"min interval").map(|v| u32_field(v, "min interval")).transpose()?;
    let complete = root.get(b"complete").map(|v| u32_field(v, "complete")).transpose()?;
    let incomplete = root.get(b"incomplete").map(|v| u32_field(v, "incomplete")).transpose()?;
    let tracker_id = root.get(b"tracker id").map(|v| string_field(v, "tracker id")).transpose()?;
    let warning_message = root.get(b"warning message").map(|v| string_field(v, "warning message")).transpose()?;
    if let Some(msg) = &warning_message {
        warn!(warning = %msg, "tracker warning");
    }

    let mut peers = match root.get(b"peers") {
        Some(Value::Bytes(raw)) => parse_compact_peers(raw)?,
        Some(Value::List(entries)) => parse_dict_peers(entries)?,
        Some(_) => return Err(TrackerError::Protocol("`peers` has the wrong type".into())),
        None => Vec::new(),
    };
    if let Some(Value::Bytes(raw)) = root.get(b"peers6") {
        peers.extend(parse_compact_peers_v6(raw)?);
    }

    Ok(TrackerResponse {
        interval,
        min_interval,
        tracker_id,
        peers,
        complete,
        incomplete,
        warning_message,
    })
}

fn u32_field(value: &Value, field: &str) -> Result<u32, TrackerError> {
    value
        .as_int()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| TrackerError::Protocol(format!("`{}` is not a non-negative integer", field)))
}

fn string_field(value: &Value, field: &str) -> Result<String, TrackerError> {
    value
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| TrackerError::Protocol(format!("`{}` is not a string", field)))
}

fn parse_dict_peers(entries: &[Value]) -> Result<Vec<SocketAddr>, TrackerError> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let ip = entry
            .get(b"ip")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::Protocol("peer entry without `ip`".into()))?;
        let port = entry
            .get(b"port")
            .and_then(Value::as_int)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| TrackerError::Protocol("peer entry without a valid `port`".into()))?;
        match ip.parse::<IpAddr>() {
            Ok(addr) => out.push(SocketAddr::new(addr, port)),
            Err(_) => debug!(ip, "skipping peer with non-literal address"),
        }
    }
    Ok(out)
}

/// HTTP tracker client.
#[derive(Debug, Clone)]
pub struct TrackerClient {
    http: reqwest::Client,
    config: EngineConfig,
}

impl TrackerClient {
    pub fn new(config: &EngineConfig) -> Result<Self, TrackerError> {
        let http = reqwest::Client::builder().timeout(config.tracker_timeout).build()?;
        Ok(Self { http, config: config.clone() })
    }

    /// Perform one HTTP GET announce.
    pub async fn announce(&self, meta: &TorrentMeta, req: &AnnounceRequest) -> Result<TrackerResponse, TrackerError> {
        let base = url::Url::parse(&meta.announce)
            .map_err(|e| TrackerError::Protocol(format!("invalid announce url {}: {}", meta.announce, e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(TrackerError::Protocol(format!("unsupported tracker scheme `{}`", base.scheme())));
        }

        let url = build_announce_url(&meta.announce, req);
        debug!(%url, event = ?req.event, "announce");
        let resp = self.http.get(url).send().await?.error_for_status()?;
        let body = resp.bytes().await?;
        parse_announce_response(&body)
    }

    /// Announce, retrying network failures with jittered exponential backoff.
    pub async fn announce_with_retry(&self, meta: &TorrentMeta, req: &AnnounceRequest) -> Result<TrackerResponse, TrackerError> {
        let max_attempts = self.config.tracker_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.announce(meta, req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self
                        .config
                        .tracker_backoff_for(attempt)
                        .mul_f64(rand::thread_rng().gen_range(0.75..=1.25));
                    warn!(attempt, error = %e, ?delay, "announce failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
