//! Camera access for the selfie gate and video calls
//!
//! The browser owns the physical device. It relays preview frames over HTTP,
//! and the session runtime treats the relay as a camera it can open, capture
//! from and stop.

use crate::runtime::{Camera, CameraStream};
use async_trait::async_trait;
use base64::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// A captured still, as a `data:` URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StillImage {
    pub data_uri: String,
}

impl StillImage {
    pub fn new(data_uri: impl Into<String>) -> Self {
        Self {
            data_uri: data_uri.into(),
        }
    }

    /// Media type declared in the URI header, `image/jpeg` when absent
    pub fn media_type(&self) -> &str {
        self.data_uri
            .strip_prefix("data:")
            .and_then(|rest| rest.split([';', ',']).next())
            .filter(|mime| !mime.is_empty())
            .unwrap_or("image/jpeg")
    }

    /// Base64 payload after the comma, if it is present and decodes
    pub fn base64_payload(&self) -> Option<&str> {
        let (_, payload) = self.data_uri.split_once(',')?;
        if payload.is_empty() {
            return None;
        }
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .ok()
            .map(|_| payload)
    }
}

/// Device errors. Terminal for the gate until the user retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{0}")]
    PermissionDenied(String),
    #[error("Camera stream is not open")]
    NotOpen,
    #[error("No camera frame available yet")]
    NoFrame,
}

/// What the browser has reported about its camera
#[derive(Debug, Clone, PartialEq, Eq)]
enum Feed {
    /// Waiting for permission or a first frame
    Waiting,
    Live(StillImage),
    Denied(String),
}

/// Camera fed by frames the client pushes.
///
/// A frame only counts as a live preview while at least one stream is open.
/// When the last stream stops the feed goes back to `Waiting`, so the next
/// open waits for the client to deliver a fresh frame.
#[derive(Debug)]
pub struct RelayCamera {
    feed: Arc<watch::Sender<Feed>>,
    /// Streams opened and not yet stopped
    live: Arc<AtomicUsize>,
}

impl Default for RelayCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayCamera {
    pub fn new() -> Self {
        let (feed, _) = watch::channel(Feed::Waiting);
        Self {
            feed: Arc::new(feed),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Store the latest preview frame
    pub fn push_frame(&self, image: StillImage) {
        self.feed.send_replace(Feed::Live(image));
    }

    /// The client could not get camera access
    pub fn deny(&self, reason: impl Into<String>) {
        self.feed.send_replace(Feed::Denied(reason.into()));
    }

    /// Whether a stream is currently held by the runtime
    pub fn is_streaming(&self) -> bool {
        self.live.load(Ordering::SeqCst) > 0
    }
}

#[async_trait]
impl Camera for RelayCamera {
    async fn open(&self) -> Result<Box<dyn CameraStream>, DeviceError> {
        let mut rx = self.feed.subscribe();
        let ready = rx
            .wait_for(|feed| !matches!(feed, Feed::Waiting))
            .await
            .map(|feed| feed.clone())
            .map_err(|_| DeviceError::NotOpen)?;

        match ready {
            Feed::Denied(reason) => {
                // Let the next open ask again
                self.feed.send_replace(Feed::Waiting);
                Err(DeviceError::PermissionDenied(reason))
            }
            Feed::Live(_) | Feed::Waiting => {
                self.live.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("Relay camera stream opened");
                Ok(Box::new(RelayStream {
                    feed: rx,
                    source: Arc::clone(&self.feed),
                    live: Arc::clone(&self.live),
                    stopped: false,
                }))
            }
        }
    }
}

/// Open handle on the relayed feed
struct RelayStream {
    feed: watch::Receiver<Feed>,
    source: Arc<watch::Sender<Feed>>,
    live: Arc<AtomicUsize>,
    stopped: bool,
}

impl CameraStream for RelayStream {
    fn capture_still(&mut self) -> Result<StillImage, DeviceError> {
        if self.stopped {
            return Err(DeviceError::NotOpen);
        }
        match &*self.feed.borrow() {
            Feed::Live(image) => Ok(image.clone()),
            Feed::Waiting | Feed::Denied(_) => Err(DeviceError::NoFrame),
        }
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            // Last frame belongs to the stream that just ended
            self.source.send_if_modified(|feed| {
                let live = matches!(feed, Feed::Live(_));
                if live {
                    *feed = Feed::Waiting;
                }
                live
            });
        }
        tracing::debug!("Relay camera stream stopped");
    }
}
