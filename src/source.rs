//! The external byte-range source seam.

use std::io;

use futures::future::BoxFuture;

/// An HTTP-like origin that can serve arbitrary byte ranges of the torrent
/// payload, used by the windowed strategies as a fallback piece source.
///
/// A returned error is logged and treated as a failed attempt; the piece
/// stays wanted and is retried on a later scheduling pass.
pub trait ExternalSource: Send + Sync {
    /// Fetches `len` bytes starting at the absolute byte `offset` of the
    /// download.
    fn get_block(&self, offset: u64, len: u32) -> BoxFuture<'_, io::Result<Vec<u8>>>;

    /// Short human-readable name for log lines.
    fn describe(&self) -> &str {
        "external source"
    }
}
