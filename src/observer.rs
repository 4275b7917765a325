//! FoilPics - Observer Surface
//!
//! The engine-to-UI contract: coalesced change signals, row frames,
//! per-row roles, the pixmap-cache hooks and the blocking image request.

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

use image::{DynamicImage, RgbaImage};

/// Per-row data roles reported through `data_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Url,
    Thumbnail,
    DecryptedData,
    Orientation,
    MimeType,
    Title,
    FileName,
    ImageWidth,
    ImageHeight,
}

/// Change notifications delivered on the engine thread. Every method has a
/// no-op default so observers implement only what they render.
pub trait VaultObserver {
    fn count_changed(&self) {}
    fn busy_changed(&self) {}
    fn key_available_changed(&self) {}
    fn foil_state_changed(&self) {}
    fn thumbnail_size_changed(&self) {}
    fn may_have_encrypted_pictures_changed(&self) {}

    fn begin_insert_rows(&self, _first: usize, _last: usize) {}
    fn end_insert_rows(&self) {}
    fn begin_remove_rows(&self, _first: usize, _last: usize) {}
    fn end_remove_rows(&self) {}
    fn data_changed(&self, _first: usize, _last: usize, _roles: &[Role]) {}
}

/// Default observer: nobody is watching.
pub struct NullObserver;

impl VaultObserver for NullObserver {}

/// Thumbnail pixmap cache exposed to the gallery. Keys are stored paths.
pub trait ThumbnailSink {
    fn publish(&self, _key: &str, _pixels: &RgbaImage) {}
    fn release(&self, _key: &str) {}
}

pub struct NullThumbnailSink;

impl ThumbnailSink for NullThumbnailSink {}

/// Hook run after an import consumed its source file, so the platform
/// media index can drop the original.
pub trait SourceCleanup {
    fn notify_source_deleted(&self, _path: &Path) {}
}

pub struct NullSourceCleanup;

impl SourceCleanup for NullSourceCleanup {}

/// One decrypted-image request from the gallery's pixmap reader.
///
/// The reader thread blocks on the paired [`ImageReplyHandle`] while the
/// engine routes the request through a worker. Exactly one reply is always
/// delivered: dropping an unanswered request sends the empty reply.
pub struct ImageRequest {
    tx: SyncSender<Option<DynamicImage>>,
    replied: bool,
}

impl ImageRequest {
    pub fn new() -> (ImageRequest, ImageReplyHandle) {
        let (tx, rx) = mpsc::sync_channel(1);
        (
            ImageRequest { tx, replied: false },
            ImageReplyHandle { rx },
        )
    }

    /// Replies with the decoded pixels, or with nothing.
    pub fn reply(mut self, image: Option<DynamicImage>) {
        self.replied = true;
        let _ = self.tx.try_send(image);
    }
}

impl Drop for ImageRequest {
    fn drop(&mut self) {
        if !self.replied {
            let _ = self.tx.try_send(None);
        }
    }
}

/// Blocking side of an [`ImageRequest`].
pub struct ImageReplyHandle {
    rx: Receiver<Option<DynamicImage>>,
}

impl ImageReplyHandle {
    /// Blocks until the engine side replies or disappears.
    pub fn wait(self) -> Option<DynamicImage> {
        self.rx.recv().ok().flatten()
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<Option<DynamicImage>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_unblocks_with_pixels() {
        let (req, handle) = ImageRequest::new();
        req.reply(Some(DynamicImage::new_rgb8(4, 4)));
        assert!(handle.wait().is_some());
    }

    #[test]
    fn dropped_request_sends_empty_reply() {
        let (req, handle) = ImageRequest::new();
        drop(req);
        assert!(handle.wait().is_none());
    }

    #[test]
    fn explicit_empty_reply_is_sent_once() {
        let (req, handle) = ImageRequest::new();
        req.reply(None);
        assert!(handle.wait().is_none());
    }
}
