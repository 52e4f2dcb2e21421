//! CinemaShield: encrypted shard distribution with time-boxed playback
//! authorization.
//!
//! A producer uploads a source asset, which is cut into segments, encrypted
//! and published with a hash manifest. A theatre presents the shard key inside
//! the manifest's playback window to receive a session token, then streams the
//! reassembled asset until the window closes.

pub mod error;
pub mod modules;
pub mod settings;
