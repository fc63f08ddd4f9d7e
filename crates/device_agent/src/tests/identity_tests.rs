use super::*;

#[test]
fn takes_first_six_hex_digits() {
    let id = device_id_from_machine_id("4F1C9A0b7e2d4c11a3f0\n").expect("id");
    assert_eq!(id.as_str(), "retrato_4f1c9a");
}

#[test]
fn skips_separators_in_uuid_style_ids() {
    let id = device_id_from_machine_id("4f1c-9a0b-7e2d").expect("id");
    assert_eq!(id.as_str(), "retrato_4f1c9a");
}

#[test]
fn rejects_short_identifiers() {
    assert!(matches!(
        device_id_from_machine_id("abc"),
        Err(ProtocolError::InvalidDeviceId(_))
    ));
}
