//! Song library: the scanned index and the playlist file.

pub mod index;
pub mod playlist;

pub use index::{normalize_playlist_label, SongEntry, SongIndex};
pub use playlist::{PendingEntry, PlaylistFile};
