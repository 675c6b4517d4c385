//! The orchestrator event feed.
//!
//! `GET /v1/events` is a server-sent event stream. Each event carries a
//! type name in its `event:` field and a JSON body in its `data:` lines.
//! Only `actual_lrp_changed` matters here; every other type is passed
//! through as [`FeedEvent::Other`] and ignored downstream.

use crate::prelude::*;
use crate::receptor::{ActualLrp, ReceptorClient, APP_LRP_DOMAIN};
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use coord::message::CRASH_REASON;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;

pub const ACTUAL_LRP_CHANGED: &str = "actual_lrp_changed";

pub type EventStream = BoxStream<'static, Result<FeedEvent>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    ActualLrpChanged { before: ActualLrp, after: ActualLrp },
    Other(String),
}

#[derive(Deserialize)]
struct ActualLrpChanged {
    actual_lrp_before: ActualLrp,
    actual_lrp_after: ActualLrp,
}

impl FeedEvent {
    pub fn from_frame(frame: &SseFrame) -> Result<Self> {
        match frame.event.as_str() {
            ACTUAL_LRP_CHANGED => {
                let changed: ActualLrpChanged = serde_json::from_str(&frame.data)
                    .with_context(|| format!("malformed {ACTUAL_LRP_CHANGED} event"))?;
                Ok(FeedEvent::ActualLrpChanged {
                    before: changed.actual_lrp_before,
                    after: changed.actual_lrp_after,
                })
            }
            other => Ok(FeedEvent::Other(other.to_string())),
        }
    }

    /// The crash this event reports, if any.
    pub fn crash(&self) -> Option<InstanceCrashEvent> {
        match self {
            FeedEvent::ActualLrpChanged { before, after } => crash_from_change(before, after, now_nanos()),
            FeedEvent::Other(_) => None,
        }
    }
}

/// A crash is a rise in crash count on an app instance. The instance guid
/// comes from the record before the change, since the crashed instance may
/// already have been replaced in the record after it. `now` stands in for a
/// missing crash time.
pub fn crash_from_change(before: &ActualLrp, after: &ActualLrp, now: i64) -> Option<InstanceCrashEvent> {
    if after.crash_count <= before.crash_count || after.domain != APP_LRP_DOMAIN {
        return None;
    }

    Some(InstanceCrashEvent {
        instance_guid: before.instance_guid.clone(),
        process_guid: after.process_guid.clone(),
        index: after.index,
        reason: CRASH_REASON.to_string(),
        exit_description: after.crash_reason.clone(),
        crash_count: after.crash_count,
        crash_timestamp: if after.since == 0 { now } else { after.since },
    })
}

pub(crate) fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[async_trait]
pub trait EventSource: Send + Sync + std::fmt::Debug {
    /// Opens a fresh subscription. The stream ends when the feed closes.
    async fn subscribe(&self) -> Result<EventStream>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Largest frame the decoder will buffer before giving up on the feed.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental server-sent event parser. Frames end on a blank line; a
/// partial frame stays buffered until the rest of it arrives, up to a
/// size limit.
#[derive(Debug)]
pub struct SseDecoder {
    buf: BytesMut,
    /// Bytes of `buf` already known to hold no newline.
    scanned: usize,
    current: SseFrame,
    frame_len: usize,
    has_data: bool,
    max_frame: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_frame(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn with_max_frame(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            current: SseFrame::default(),
            frame_len: 0,
            has_data: false,
            max_frame,
        }
    }

    /// Consumes a chunk and returns the frames it completed. Fails once a
    /// single frame grows past the limit.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(self.scanned + offset);
            self.buf.advance(1);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&line);
            let line = line.strip_suffix('\r').unwrap_or(&line);

            if line.is_empty() {
                if self.has_data || !self.current.event.is_empty() {
                    frames.push(std::mem::take(&mut self.current));
                }
                self.has_data = false;
                self.frame_len = 0;
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => {
                    self.frame_len = self.frame_len - self.current.event.len() + value.len();
                    self.current.event = value.to_string();
                }
                "data" => {
                    if self.has_data {
                        self.current.data.push('\n');
                    }
                    self.current.data.push_str(value);
                    self.frame_len += value.len() + 1;
                    self.has_data = true;
                }
                _ => {}
            }
            self.check_size(0)?;
        }

        self.scanned = self.buf.len();
        self.check_size(self.buf.len())?;
        Ok(frames)
    }

    fn check_size(&self, partial_line: usize) -> Result<()> {
        if self.frame_len + partial_line > self.max_frame {
            return Err(anyhow!("event frame exceeds {} bytes", self.max_frame));
        }
        Ok(())
    }
}

/// Subscribes to the receptor's event stream over HTTP.
#[derive(Debug, Clone)]
pub struct ReceptorEventSource {
    receptor: ReceptorClient,
}

impl ReceptorEventSource {
    pub fn new(receptor: ReceptorClient) -> Self {
        Self { receptor }
    }
}

#[async_trait]
impl EventSource for ReceptorEventSource {
    async fn subscribe(&self) -> Result<EventStream> {
        let url = self.receptor.endpoint(&["v1", "events"])?;
        let response = self
            .receptor
            .http()
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("subscribing to {url}"))?
            .error_for_status()?;

        info!(url = %url, "feed.subscribed");
        Ok(decode(response.bytes_stream()))
    }
}

/// Turns a byte stream into feed events. Frames that fail to parse are
/// logged and skipped; transport errors are passed on.
pub fn decode<S, E>(bytes: S) -> EventStream
where
    S: futures_util::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    decode_with(SseDecoder::default(), bytes)
}

/// Like [`decode`], with a caller-supplied decoder. An oversized frame is
/// reported as an error and ends the stream.
pub fn decode_with<S, E>(decoder: SseDecoder, bytes: S) -> EventStream
where
    S: futures_util::Stream<Item = std::result::Result<bytes::Bytes, E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let state = Some((Box::pin(bytes), decoder, VecDeque::new()));

    stream::unfold(state, |state| async move {
        let (mut bytes, mut decoder, mut pending) = state?;
        loop {
            if let Some(frame) = pending.pop_front() {
                match FeedEvent::from_frame(&frame) {
                    Ok(event) => return Some((Ok(event), Some((bytes, decoder, pending)))),
                    Err(e) => {
                        warn!(error = %format!("{e:#}"), "feed.skipped-event");
                        continue;
                    }
                }
            }

            match bytes.next().await {
                Some(Ok(chunk)) => match decoder.feed(&chunk) {
                    Ok(frames) => pending.extend(frames),
                    Err(e) => return Some((Err(e), None)),
                },
                Some(Err(e)) => return Some((Err(e.into()), Some((bytes, decoder, pending)))),
                None => return None,
            }
        }
    })
    .boxed()
}
