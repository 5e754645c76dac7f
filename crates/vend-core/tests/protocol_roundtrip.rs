//! Integration tests for the vend-core frame codecs.
//!
//! These go through the crate's public re-exports only, the same way the
//! bridge crate uses them, and cover the round-trip guarantees both frame
//! layouts make.

use vend_core::{
    decode_control, decode_provisioning, encode_control, encode_provisioning,
    protocol::{FrameKind, CONTROL_FRAME_LEN, PROVISIONING_FRAME_LEN},
    EncodeError, Notification, Opcode,
};

fn control_opcodes() -> impl Iterator<Item = Opcode> {
    Opcode::ALL.into_iter().filter(|op| op.kind() == FrameKind::Control)
}

fn provisioning_opcodes() -> impl Iterator<Item = Opcode> {
    Opcode::ALL
        .into_iter()
        .filter(|op| op.kind() == FrameKind::Provisioning)
}

#[test]
fn test_control_roundtrip_at_field_boundaries() {
    let edges = [0u16, 1, 0x7F, 0x80, 0xFF, 0x100, 0x7FFF, 0x8000, u16::MAX];

    for op in control_opcodes() {
        for &value in &edges {
            let bytes = encode_control(op, value, value.rotate_left(3), !value).unwrap();
            assert_eq!(bytes.len(), CONTROL_FRAME_LEN);

            let frame = decode_control(&bytes).unwrap();

            assert_eq!(frame.opcode, op);
            assert_eq!(frame.price, value);
            assert_eq!(frame.item_number, value.rotate_left(3));
            assert_eq!(frame.nonce, !value);
        }
    }
}

#[test]
fn test_control_decode_ignores_any_padding_value() {
    let mut bytes = encode_control(Opcode::VendRequest, 150, 7, 42).unwrap();
    let reference = decode_control(&bytes).unwrap();

    for fill in [0x00u8, 0x01, 0x55, 0xAA, 0xFF] {
        bytes[7..].fill(fill);
        assert_eq!(decode_control(&bytes).unwrap(), reference);
    }
}

#[test]
fn test_provisioning_roundtrip_for_realistic_values() {
    let samples = [
        "",
        "000042",
        "s3cr3t",
        "Café Wi-Fi",
        "12345678901234567890",
        "ñandú-ñandú-ñan",
        "🙂🙂🙂🙂🙂",
    ];

    for op in provisioning_opcodes() {
        for text in samples {
            assert!(text.len() <= 20, "sample {text:?} must fit");
            let bytes = encode_provisioning(op, text).unwrap();
            assert_eq!(bytes.len(), PROVISIONING_FRAME_LEN);
            assert_eq!(decode_provisioning(&bytes).unwrap(), (op, text.to_string()));
        }
    }
}

#[test]
fn test_provisioning_rejects_over_twenty_bytes() {
    let long = "w".repeat(64);
    let too_long = ["123456789012345678901", "🙂🙂🙂🙂🙂x", long.as_str()];

    for text in too_long {
        assert!(
            matches!(
                encode_provisioning(Opcode::SetWifiPassword, text),
                Err(EncodeError::PayloadTooLong { max: 20, .. })
            ),
            "{text:?} must be rejected"
        );
    }
}

#[test]
fn test_register_frames_match_wire_capture() {
    let subdomain = encode_provisioning(Opcode::SetSubdomain, "000042").unwrap();
    let passkey = encode_provisioning(Opcode::SetPasskey, "s3cr3t").unwrap();

    let mut expected_subdomain = vec![0x00, b'0', b'0', b'0', b'0', b'4', b'2', 0x00];
    expected_subdomain.resize(22, 0);
    let mut expected_passkey = vec![0x01, b's', b'3', b'c', b'r', b'3', b't', 0x00];
    expected_passkey.resize(22, 0);

    assert_eq!(subdomain.to_vec(), expected_subdomain);
    assert_eq!(passkey.to_vec(), expected_passkey);
}

#[test]
fn test_notification_parse_agrees_with_codec() {
    let raw = encode_control(Opcode::VendRequest, 150, 7, 42).unwrap();

    let Notification::VendRequest { details, raw: kept } = Notification::parse(&raw).unwrap()
    else {
        panic!("expected a vend request");
    };

    let frame = decode_control(&raw).unwrap();
    assert_eq!(details.price, frame.price);
    assert_eq!(details.item_number, frame.item_number);
    assert_eq!(details.nonce, frame.nonce);
    assert_eq!(kept, raw.to_vec());
}
