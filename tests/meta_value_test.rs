use bytes::Bytes;
use redkv::meta_value::{
    BaseMetaRecord, BaseMetaValue, DataType, ParsedBaseMetaValue, ParsedStringMetaValue,
    StringMetaValue, BASE_META_MIN_LENGTH, STRING_META_MIN_LENGTH,
};

#[test]
fn string_encode_exact_bytes() {
    let mut value = StringMetaValue::new(Bytes::from_static(b"hi"));
    value.set_ctime(10);
    value.set_etime(0);
    let encoded = value.encode();

    let mut expected = Vec::new();
    expected.push(0x01);
    expected.extend_from_slice(b"hi");
    expected.extend_from_slice(&[0u8; 16]);
    expected.extend_from_slice(&[0x0a, 0, 0, 0, 0, 0, 0, 0]);
    expected.extend_from_slice(&[0u8; 8]);
    assert_eq!(encoded.len(), 35, "unexpected encoded length");
    assert_eq!(encoded, &expected[..], "unexpected encoded bytes");
}

#[test]
fn container_roundtrip_field_for_field() {
    let mut value = BaseMetaValue::new(DataType::Hash);
    value.set_count(3);
    value.set_version(100);
    value.set_ctime(5);
    value.set_etime(0);
    let encoded = value.encode().to_vec();

    let parsed = ParsedBaseMetaValue::parse(&encoded).unwrap();
    assert!(parsed.is_type(DataType::Hash), "unexpected type byte");
    assert_eq!(parsed.count(), 3, "unexpected count");
    assert_eq!(parsed.user_value(), b"", "unexpected user value");
    assert_eq!(parsed.version(), 100, "unexpected version");
    assert_eq!(parsed.reserve(), &[0u8; 16], "unexpected reserve");
    assert_eq!(parsed.ctime(), 5, "unexpected ctime");
    assert_eq!(parsed.etime(), 0, "unexpected etime");
}

#[test]
fn container_suffix_is_45_bytes_past_payload() {
    for payload in [&b""[..], b"x", b"somewhat longer payload"] {
        let mut value =
            BaseMetaValue::with_user_value(DataType::Set, Bytes::copy_from_slice(payload));
        let encoded = value.encode().to_vec();
        let parsed = ParsedBaseMetaValue::parse(&encoded).unwrap();
        assert_eq!(
            parsed.user_value().len(),
            encoded.len() - 45,
            "type + count + trailer must total 45 bytes"
        );
        assert_eq!(parsed.user_value(), payload);
    }
}

#[test]
fn parser_borrows_payload_from_input() {
    let mut value =
        BaseMetaValue::with_user_value(DataType::ZSet, Bytes::from_static(b"payload"));
    let encoded = value.encode().to_vec();
    let parsed = ParsedBaseMetaValue::parse(&encoded).unwrap();
    let payload = parsed.user_value();
    assert_eq!(payload.as_ptr(), encoded[5..].as_ptr(), "payload must be a view, not a copy");
}

#[test]
fn staleness_scenarios() {
    let mut value = StringMetaValue::new(Bytes::from_static(b"v"));
    value.set_etime(50);
    let encoded = value.encode().to_vec();
    let parsed = ParsedStringMetaValue::parse(&encoded).unwrap();
    assert!(parsed.is_valid(49));
    assert!(parsed.is_stale(50));
    assert!(parsed.is_stale(51));

    let mut no_expiry = StringMetaValue::new(Bytes::from_static(b"v"));
    no_expiry.set_etime(0);
    let encoded = no_expiry.encode().to_vec();
    let parsed = ParsedStringMetaValue::parse(&encoded).unwrap();
    assert!(parsed.is_valid(1_000_000_000));
}

#[test]
fn container_validity_needs_nonzero_count() {
    let mut value = BaseMetaValue::new(DataType::Hash);
    value.set_version(10);
    let encoded = value.encode().to_vec();
    let parsed = ParsedBaseMetaValue::parse(&encoded).unwrap();
    assert!(!parsed.is_stale(100), "no etime, cannot be stale");
    assert!(!parsed.is_valid(100), "count 0 means logically nonexistent");
}

#[test]
fn version_bumps_twice_within_one_second() {
    let mut value = BaseMetaValue::new(DataType::Set);
    value.set_version(1_000);
    let mut record = BaseMetaRecord::from_bytes(value.encode().to_vec()).unwrap();
    assert_eq!(record.update_version(1_000), 1_001);
    assert_eq!(record.update_version(1_000), 1_002);
    // The bumped version is visible to a fresh parse of the same bytes.
    let parsed = ParsedBaseMetaValue::parse(record.as_bytes()).unwrap();
    assert_eq!(parsed.version(), 1_002);
}

#[test]
fn record_mutations_survive_reencode() {
    let mut value = BaseMetaValue::with_user_value(DataType::Hash, Bytes::from_static(b"hdr"));
    value.set_version(7);
    value.set_count(1);
    let mut record = BaseMetaRecord::from_bytes(value.encode().to_vec()).unwrap();

    record.modify_count(4).unwrap();
    record.set_etime(2_000);
    record.update_version(1_500);

    let parsed = ParsedBaseMetaValue::parse(record.as_bytes()).unwrap();
    assert_eq!(parsed.count(), 5);
    assert_eq!(parsed.etime(), 2_000);
    assert_eq!(parsed.version(), 1_500);
    assert_eq!(parsed.user_value(), b"hdr", "payload untouched by suffix mutators");
    assert_eq!(parsed.reserve(), &[0u8; 16], "reserve untouched by suffix mutators");
}

#[test]
fn short_records_fail_to_parse() {
    for len in 0..STRING_META_MIN_LENGTH {
        assert!(
            ParsedStringMetaValue::parse(&vec![1u8; len]).is_err(),
            "string parse must reject {} bytes",
            len
        );
    }
    for len in 0..BASE_META_MIN_LENGTH {
        assert!(
            ParsedBaseMetaValue::parse(&vec![2u8; len]).is_err(),
            "container parse must reject {} bytes",
            len
        );
    }
}
