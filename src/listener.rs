//! Download progress observation.

use crate::{ConnectionId, PieceIndex};

/// Observer for download lifecycle events, threaded through the coordinator
/// at construction. All methods default to no-ops so implementations only
/// override what they care about.
///
/// A `peer` of `None` denotes the external-source download path rather than
/// a wire peer.
pub trait Listener: Send + Sync {
    /// A piece was handed to a peer or the external source for download.
    fn piece_requested(&self, _peer: Option<ConnectionId>, _piece: PieceIndex) {}

    /// A piece completed download and passed hash verification.
    fn piece_downloaded(&self, _peer: Option<ConnectionId>, _piece: PieceIndex) {}

    /// Every piece has been downloaded and verified.
    fn download_complete(&self) {}

    /// An assembled piece failed hash verification and was dropped for
    /// redownload.
    fn piece_discarded(&self, _piece: PieceIndex) {}
}
