//! Caller-side protocol loop.
//!
//! The hub only moves bytes; decoding frames and answering them is
//! business logic. This dispatcher drains the hub's message channel,
//! decodes each request frame, and replies on the same line. Malformed or
//! badly signed frames are rejected per-frame — a single bad frame never
//! closes the line.

use tokio::sync::mpsc;

use crate::hub::{Hub, LineMessage};
use crate::packet::{PacketError, PacketProtocol};

/// Application message types.
pub const MSG_PING: u8 = 1;
pub const MSG_ECHO: u8 = 2;

/// Response status codes.
pub const STATUS_OK: u8 = 1;
pub const STATUS_BAD_REQUEST: u8 = 2;
pub const STATUS_UNSUPPORTED: u8 = 3;

/// Drain the hub message channel until it closes. Run this on its own
/// task alongside the server.
pub async fn run_dispatcher(
    hub: Hub,
    protocol: PacketProtocol,
    mut messages: mpsc::Receiver<LineMessage>,
) {
    while let Some(msg) = messages.recv().await {
        handle_frame(&hub, &protocol, msg);
    }
    tracing::info!("Dispatcher stopped: message channel closed");
}

fn handle_frame(hub: &Hub, protocol: &PacketProtocol, msg: LineMessage) {
    let packet = match protocol.decode_request(&msg.data) {
        Ok(packet) => packet,
        Err(PacketError::VerifyFailed) => {
            tracing::warn!(
                user_id = %msg.user_id,
                line_id = %msg.line_id,
                "Rejected frame with bad signature"
            );
            return;
        }
        Err(e) => {
            tracing::warn!(
                user_id = %msg.user_id,
                line_id = %msg.line_id,
                error = %e,
                "Rejected malformed frame"
            );
            return;
        }
    };

    let reply = match packet.meta.msg_type {
        MSG_PING => protocol.encode_response::<()>(
            MSG_PING,
            packet.meta.request_id,
            STATUS_OK,
            None,
        ),
        MSG_ECHO => match packet.payload::<serde_json::Value>() {
            Ok(value) => protocol.encode_response(
                MSG_ECHO,
                packet.meta.request_id,
                STATUS_OK,
                Some(&value),
            ),
            Err(e) => {
                tracing::debug!(
                    user_id = %msg.user_id,
                    error = %e,
                    "Echo payload failed to unmarshal"
                );
                protocol.encode_response(
                    MSG_ECHO,
                    packet.meta.request_id,
                    STATUS_BAD_REQUEST,
                    Some(&serde_json::json!({"error": "bad payload"})),
                )
            }
        },
        other => {
            tracing::debug!(
                user_id = %msg.user_id,
                msg_type = other,
                "Unsupported message type"
            );
            protocol.encode_response(
                other,
                packet.meta.request_id,
                STATUS_UNSUPPORTED,
                Some(&serde_json::json!({"error": "unsupported message type"})),
            )
        }
    };

    match reply {
        Ok(frame) => {
            // Reply on the line the request came in on; errors here mean
            // the hub is closed, which the dispatcher exits on anyway.
            if let Err(e) =
                hub.push_to_user_lines(msg.user_id.clone(), vec![msg.line_id.clone()], frame)
            {
                tracing::debug!(user_id = %msg.user_id, error = %e, "Reply not submitted");
            }
        }
        Err(e) => {
            tracing::warn!(user_id = %msg.user_id, error = %e, "Failed to encode reply");
        }
    }
}
