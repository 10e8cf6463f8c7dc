//! Binary frame protocol for hub lines.
//!
//! Request frame (client -> hub):
//!   `[1B msgType][4B requestId][4B timestamp][payload][signature]`
//! Response frame (hub -> client):
//!   `[1B msgType][4B requestId][4B timestamp][1B status][payload][signature]`
//!
//! `requestId` and `timestamp` travel as big-endian bytes and are read back
//! as signed 32-bit integers. The timestamp is seconds since the protocol
//! epoch (2025-01-01T00:00:00Z), not the Unix epoch, so four bytes cover
//! ~69 years of range.
//!
//! Outbound pipeline order is fixed: marshal -> encrypt -> sign. The
//! signature (when a signer is configured) covers everything before it and
//! is verified before decryption on the inbound path.

pub mod crypto;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub use crypto::{AesGcmCryptor, CryptoError, Cryptor, Ed25519Signer, HmacSha256Signer, Signer};

/// Protocol epoch: 2025-01-01T00:00:00Z as Unix seconds.
pub const PROTOCOL_EPOCH_UNIX: i64 = 1_735_689_600;

/// Fixed request/response header: msgType (1) + requestId (4) + timestamp (4).
pub const HEADER_LEN: usize = 9;

/// Errors from frame encode/decode.
#[derive(Debug)]
pub enum PacketError {
    /// Frame shorter than the 9-byte header.
    TooShort(usize),
    /// The signature boundary falls before the header or past the buffer.
    SignatureWindow { frame_len: usize, signature_len: usize },
    /// Signature present but did not verify.
    VerifyFailed,
    Marshal(String),
    Unmarshal(String),
    Encrypt(String),
    Decrypt(String),
}

impl std::fmt::Display for PacketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort(len) => {
                write!(f, "Frame too short: {} bytes (header is {})", len, HEADER_LEN)
            }
            Self::SignatureWindow {
                frame_len,
                signature_len,
            } => write!(
                f,
                "No room for a {}-byte signature in a {}-byte frame",
                signature_len, frame_len
            ),
            Self::VerifyFailed => write!(f, "Frame signature verification failed"),
            Self::Marshal(e) => write!(f, "Payload marshal error: {}", e),
            Self::Unmarshal(e) => write!(f, "Payload unmarshal error: {}", e),
            Self::Encrypt(e) => write!(f, "Payload encrypt error: {}", e),
            Self::Decrypt(e) => write!(f, "Payload decrypt error: {}", e),
        }
    }
}

impl std::error::Error for PacketError {}

/// Payload marshaling format. MessagePack on the wire by default; JSON is
/// kept for debuggability with browser clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marshaler {
    MessagePack,
    Json,
}

impl Marshaler {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "messagepack" | "msgpack" => Some(Self::MessagePack),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessagePack => "messagepack",
            Self::Json => "json",
        }
    }

    fn marshal<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, PacketError> {
        match self {
            Self::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| PacketError::Marshal(e.to_string()))
            }
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| PacketError::Marshal(e.to_string()))
            }
        }
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, PacketError> {
        match self {
            Self::MessagePack => {
                rmp_serde::from_slice(data).map_err(|e| PacketError::Unmarshal(e.to_string()))
            }
            Self::Json => {
                serde_json::from_slice(data).map_err(|e| PacketError::Unmarshal(e.to_string()))
            }
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub msg_type: u8,
    pub request_id: i32,
    /// Seconds since [`PROTOCOL_EPOCH_UNIX`].
    pub timestamp: i32,
}

impl PacketMeta {
    /// Frame timestamp converted back to Unix seconds.
    pub fn timestamp_unix(&self) -> i64 {
        PROTOCOL_EPOCH_UNIX + i64::from(self.timestamp)
    }
}

/// A decoded request frame. The payload has been signature-stripped and
/// decrypted; unmarshaling is deferred until the caller knows the type
/// for the message kind.
#[derive(Debug)]
pub struct RequestPacket {
    pub meta: PacketMeta,
    payload: Vec<u8>,
    marshaler: Option<Marshaler>,
}

impl RequestPacket {
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        match self.marshaler {
            Some(m) => m.unmarshal(&self.payload),
            None => Err(PacketError::Unmarshal(
                "no marshaler configured".to_string(),
            )),
        }
    }
}

/// A decoded response frame (client side of the protocol; used by tools
/// and tests that speak to a hub).
#[derive(Debug)]
pub struct ResponsePacket {
    pub meta: PacketMeta,
    pub status: u8,
    payload: Vec<u8>,
    marshaler: Option<Marshaler>,
}

impl ResponsePacket {
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, PacketError> {
        match self.marshaler {
            Some(m) => m.unmarshal(&self.payload),
            None => Err(PacketError::Unmarshal(
                "no marshaler configured".to_string(),
            )),
        }
    }
}

/// Stateless frame codec around an injected signer/cryptor pair.
///
/// Knows nothing about sockets: callers hand it byte slices and get byte
/// slices back.
#[derive(Clone, Default)]
pub struct PacketProtocol {
    marshaler: Option<Marshaler>,
    signer: Option<Arc<dyn Signer>>,
    cryptor: Option<Arc<dyn Cryptor>>,
}

impl PacketProtocol {
    pub fn new(marshaler: Option<Marshaler>) -> Self {
        Self {
            marshaler,
            signer: None,
            cryptor: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_cryptor(mut self, cryptor: Arc<dyn Cryptor>) -> Self {
        self.cryptor = Some(cryptor);
        self
    }

    /// Decode only the 9-byte header. Never touches the payload, so it is
    /// safe on unverified frames.
    pub fn get_meta(data: &[u8]) -> Result<PacketMeta, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::TooShort(data.len()));
        }
        let request_id = i32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let timestamp = i32::from_be_bytes([data[5], data[6], data[7], data[8]]);
        Ok(PacketMeta {
            msg_type: data[0],
            request_id,
            timestamp,
        })
    }

    /// Encode a response frame: header + status + (marshal -> encrypt)
    /// payload, then sign the whole thing.
    pub fn encode_response<T: Serialize>(
        &self,
        msg_type: u8,
        request_id: i32,
        status: u8,
        payload: Option<&T>,
    ) -> Result<Bytes, PacketError> {
        let body = self.outbound_body(payload)?;
        let mut frame = BytesMut::with_capacity(HEADER_LEN + 1 + body.len() + 64);
        frame.put_u8(msg_type);
        frame.put_i32(request_id);
        frame.put_i32(now_since_epoch());
        frame.put_u8(status);
        frame.extend_from_slice(&body);
        Ok(self.finish_frame(frame))
    }

    /// Encode a request frame (client side): header + payload, signed.
    pub fn encode_request<T: Serialize>(
        &self,
        msg_type: u8,
        request_id: i32,
        payload: Option<&T>,
    ) -> Result<Bytes, PacketError> {
        let body = self.outbound_body(payload)?;
        let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len() + 64);
        frame.put_u8(msg_type);
        frame.put_i32(request_id);
        frame.put_i32(now_since_epoch());
        frame.extend_from_slice(&body);
        Ok(self.finish_frame(frame))
    }

    /// Decode a request frame: verify the trailing signature, strip it,
    /// decrypt what remains after the header.
    pub fn decode_request(&self, data: &[u8]) -> Result<RequestPacket, PacketError> {
        let meta = Self::get_meta(data)?;
        let body = self.inbound_body(data, HEADER_LEN)?;
        Ok(RequestPacket {
            meta,
            payload: body,
            marshaler: self.marshaler,
        })
    }

    /// Decode a response frame (client side): same as requests plus the
    /// status byte after the header.
    pub fn decode_response(&self, data: &[u8]) -> Result<ResponsePacket, PacketError> {
        let meta = Self::get_meta(data)?;
        if data.len() < HEADER_LEN + 1 {
            return Err(PacketError::TooShort(data.len()));
        }
        let status = data[HEADER_LEN];
        let body = self.inbound_body(data, HEADER_LEN + 1)?;
        Ok(ResponsePacket {
            meta,
            status,
            payload: body,
            marshaler: self.marshaler,
        })
    }

    /// Marshal and encrypt an outbound payload.
    fn outbound_body<T: Serialize>(&self, payload: Option<&T>) -> Result<Vec<u8>, PacketError> {
        let marshaled = match (payload, self.marshaler) {
            (Some(value), Some(m)) => m.marshal(value)?,
            (Some(_), None) => {
                return Err(PacketError::Marshal("no marshaler configured".to_string()));
            }
            (None, _) => Vec::new(),
        };
        match (&self.cryptor, marshaled.is_empty()) {
            (Some(cryptor), false) => cryptor
                .encrypt(&marshaled)
                .map_err(|e| PacketError::Encrypt(e.to_string())),
            _ => Ok(marshaled),
        }
    }

    /// Append the signature over the frame built so far.
    fn finish_frame(&self, mut frame: BytesMut) -> Bytes {
        if let Some(signer) = &self.signer {
            let sig = signer.sign(&frame);
            frame.extend_from_slice(&sig);
        }
        frame.freeze()
    }

    /// Verify and strip the signature, then decrypt the body that starts
    /// at `body_start`. Verification happens before decryption.
    fn inbound_body(&self, data: &[u8], body_start: usize) -> Result<Vec<u8>, PacketError> {
        let body_end = match &self.signer {
            Some(signer) => {
                let sig_len = signer.signature_len();
                let boundary = data
                    .len()
                    .checked_sub(sig_len)
                    .filter(|b| *b >= body_start)
                    .ok_or(PacketError::SignatureWindow {
                        frame_len: data.len(),
                        signature_len: sig_len,
                    })?;
                if !signer.verify(&data[..boundary], &data[boundary..]) {
                    return Err(PacketError::VerifyFailed);
                }
                boundary
            }
            None => data.len(),
        };

        let body = &data[body_start..body_end];
        match (&self.cryptor, body.is_empty()) {
            (Some(cryptor), false) => cryptor
                .decrypt(body)
                .map_err(|e| PacketError::Decrypt(e.to_string())),
            _ => Ok(body.to_vec()),
        }
    }
}

/// Seconds since the protocol epoch, truncated to 32 bits.
fn now_since_epoch() -> i32 {
    (Utc::now().timestamp() - PROTOCOL_EPOCH_UNIX) as i32
}
