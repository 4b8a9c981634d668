//! Link to an external server directory (lobby list).

use std::net::SocketAddr;
use tracing::debug;

/// What the broker publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAdvertisement {
    /// Server name.
    pub name: String,
    /// Connected (handshaken) players.
    pub player_count: usize,
    /// Bound address.
    pub internal_address: Option<SocketAddr>,
    /// Public address, when configured.
    pub external_address: Option<SocketAddr>,
}

/// Receives advertisements whenever the connected player count changes.
pub trait DirectoryLink: Send + Sync {
    /// Publish the current state.
    fn advertise(&self, advertisement: &ServerAdvertisement);
}

/// Link that publishes nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDirectory;

impl DirectoryLink for NullDirectory {
    fn advertise(&self, advertisement: &ServerAdvertisement) {
        debug!(
            players = advertisement.player_count,
            "Directory advertisement skipped"
        );
    }
}
