use crate::hub::Hub;
use crate::packet::PacketProtocol;

/// Shared application state passed to all handlers via axum State
/// extractor.
#[derive(Clone)]
pub struct AppState {
    /// The connection hub for this deployment's chat/notification class.
    pub hub: Hub,
    /// Frame codec shared by the dispatcher and any handler that needs
    /// to speak the wire protocol.
    pub protocol: PacketProtocol,
    /// Session-token signing secret (256-bit random key)
    pub session_secret: Vec<u8>,
}
