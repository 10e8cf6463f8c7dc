//! Frame codec tests: header layout, marshal/encrypt/sign ordering, and
//! the error taxonomy for short and tampered frames.

use std::sync::Arc;

use linehub::packet::{
    AesGcmCryptor, Ed25519Signer, HmacSha256Signer, Marshaler, PacketError, PacketProtocol,
    HEADER_LEN, PROTOCOL_EPOCH_UNIX,
};
use serde_json::json;

fn plain_msgpack() -> PacketProtocol {
    PacketProtocol::new(Some(Marshaler::MessagePack))
}

#[test]
fn test_get_meta_too_short() {
    let err = PacketProtocol::get_meta(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, PacketError::TooShort(3)));
}

#[test]
fn test_get_meta_reads_header_only() {
    // msgType=5, requestId=258, timestamp=7, then garbage payload bytes
    let mut frame = vec![5u8, 0, 0, 1, 2, 0, 0, 0, 7];
    frame.extend_from_slice(b"not a real payload");
    let meta = PacketProtocol::get_meta(&frame).unwrap();
    assert_eq!(meta.msg_type, 5);
    assert_eq!(meta.request_id, 258);
    assert_eq!(meta.timestamp, 7);
    assert_eq!(meta.timestamp_unix(), PROTOCOL_EPOCH_UNIX + 7);
}

#[test]
fn test_response_roundtrip_messagepack() {
    let protocol = plain_msgpack();
    let payload = json!({"text": "hello", "n": 42});
    let frame = protocol
        .encode_response(1, 42, 1, Some(&payload))
        .unwrap();

    let packet = protocol.decode_response(&frame).unwrap();
    assert_eq!(packet.meta.msg_type, 1);
    assert_eq!(packet.meta.request_id, 42);
    assert_eq!(packet.status, 1);
    assert_eq!(packet.payload::<serde_json::Value>().unwrap(), payload);
}

#[test]
fn test_request_roundtrip_json() {
    let protocol = PacketProtocol::new(Some(Marshaler::Json));
    let payload = json!(["a", "b", "c"]);
    let frame = protocol.encode_request(9, -3, Some(&payload)).unwrap();

    let packet = protocol.decode_request(&frame).unwrap();
    assert_eq!(packet.meta.msg_type, 9);
    // Negative ids survive the unsigned wire representation.
    assert_eq!(packet.meta.request_id, -3);
    assert_eq!(packet.payload::<serde_json::Value>().unwrap(), payload);
}

#[test]
fn test_empty_payload_roundtrip() {
    let protocol = plain_msgpack();
    let frame = protocol.encode_response::<()>(2, 1, 7, None).unwrap();
    assert_eq!(frame.len(), HEADER_LEN + 1);

    let packet = protocol.decode_response(&frame).unwrap();
    assert_eq!(packet.status, 7);
    assert!(packet.payload_bytes().is_empty());
}

#[test]
fn test_timestamp_is_epoch_relative() {
    let protocol = plain_msgpack();
    let frame = protocol.encode_request::<()>(1, 1, None).unwrap();
    let meta = PacketProtocol::get_meta(&frame).unwrap();

    let now = chrono::Utc::now().timestamp();
    assert!(meta.timestamp >= 0);
    assert!((meta.timestamp_unix() - now).abs() < 5);
}

#[test]
fn test_signed_roundtrip_hmac() {
    let signer = Arc::new(HmacSha256Signer::new(b"session-key".to_vec()));
    let protocol = plain_msgpack().with_signer(signer);

    let payload = json!({"k": "v"});
    let frame = protocol.encode_request(3, 10, Some(&payload)).unwrap();
    let packet = protocol.decode_request(&frame).unwrap();
    assert_eq!(packet.payload::<serde_json::Value>().unwrap(), payload);
}

#[test]
fn test_tampered_frame_fails_verification() {
    let signer = Arc::new(HmacSha256Signer::new(b"session-key".to_vec()));
    let protocol = plain_msgpack().with_signer(signer);

    let frame = protocol
        .encode_request(3, 10, Some(&json!({"k": "v"})))
        .unwrap();
    let mut tampered = frame.to_vec();
    tampered[HEADER_LEN] ^= 0xFF;

    assert!(matches!(
        protocol.decode_request(&tampered).unwrap_err(),
        PacketError::VerifyFailed
    ));
}

#[test]
fn test_wrong_key_fails_verification() {
    let alice = plain_msgpack().with_signer(Arc::new(HmacSha256Signer::new(b"key-a".to_vec())));
    let mallory = plain_msgpack().with_signer(Arc::new(HmacSha256Signer::new(b"key-b".to_vec())));

    let frame = mallory.encode_request::<()>(1, 1, None).unwrap();
    assert!(matches!(
        alice.decode_request(&frame).unwrap_err(),
        PacketError::VerifyFailed
    ));
}

#[test]
fn test_signature_window_out_of_bounds() {
    let signer = Arc::new(HmacSha256Signer::new(b"session-key".to_vec()));
    let protocol = plain_msgpack().with_signer(signer);

    // 9-byte header with no room for a 32-byte signature.
    let frame = vec![0u8; HEADER_LEN + 4];
    assert!(matches!(
        protocol.decode_request(&frame).unwrap_err(),
        PacketError::SignatureWindow { .. }
    ));
}

#[test]
fn test_signed_roundtrip_ed25519() {
    let signer = Arc::new(Ed25519Signer::from_seed(&[11u8; 32]));
    let protocol = plain_msgpack().with_signer(signer);

    let frame = protocol
        .encode_response(1, 5, 1, Some(&json!({"ok": true})))
        .unwrap();
    let packet = protocol.decode_response(&frame).unwrap();
    assert_eq!(
        packet.payload::<serde_json::Value>().unwrap(),
        json!({"ok": true})
    );
}

#[test]
fn test_encrypted_roundtrip() {
    let protocol = plain_msgpack().with_cryptor(Arc::new(AesGcmCryptor::new(&[9u8; 32])));

    let payload = json!({"secret": "payload"});
    let frame = protocol.encode_response(1, 1, 1, Some(&payload)).unwrap();

    // Ciphertext on the wire: naive decode of the body must not yield the
    // payload.
    let naive = PacketProtocol::new(Some(Marshaler::MessagePack))
        .decode_response(&frame)
        .unwrap();
    assert!(naive.payload::<serde_json::Value>().is_err());

    let packet = protocol.decode_response(&frame).unwrap();
    assert_eq!(packet.payload::<serde_json::Value>().unwrap(), payload);
}

#[test]
fn test_encrypted_and_signed_roundtrip() {
    let protocol = plain_msgpack()
        .with_signer(Arc::new(HmacSha256Signer::new(b"sign-key".to_vec())))
        .with_cryptor(Arc::new(AesGcmCryptor::new(&[1u8; 32])));

    let payload = json!({"n": 1});
    let frame = protocol.encode_request(4, 2, Some(&payload)).unwrap();
    let packet = protocol.decode_request(&frame).unwrap();
    assert_eq!(packet.meta.msg_type, 4);
    assert_eq!(packet.payload::<serde_json::Value>().unwrap(), payload);
}

#[test]
fn test_wrong_cryptor_key_is_decrypt_error() {
    let sender = plain_msgpack().with_cryptor(Arc::new(AesGcmCryptor::new(&[1u8; 32])));
    let receiver = plain_msgpack().with_cryptor(Arc::new(AesGcmCryptor::new(&[2u8; 32])));

    let frame = sender
        .encode_request(1, 1, Some(&json!({"x": 1})))
        .unwrap();
    assert!(matches!(
        receiver.decode_request(&frame).unwrap_err(),
        PacketError::Decrypt(_)
    ));
}
