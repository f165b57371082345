use hsm_cryptoki::{
    AttributeType as A, AttributeValue, MechanismType, Template, ValidationError,
    cryptoki_sys::{CK_ULONG, CKA_VENDOR_DEFINED, CKK_AES, CKO_SECRET_KEY},
};
use time::{Date, Month};

fn decode(template: &Template) -> Template {
    let flat = template.to_flat_array().expect("flatten");
    // SAFETY: `flat` owns every buffer its records point to.
    unsafe { Template::from_flat_array(flat.records()) }.expect("decode")
}

#[test]
fn key_template_survives_flattening() {
    let start = Date::from_calendar_date(2026, Month::March, 9).unwrap();
    let template = Template::new()
        .with(A::CLASS, CKO_SECRET_KEY)
        .with(A::KEY_TYPE, CKK_AES)
        .with(A::VALUE_LEN, 32 as CK_ULONG)
        .with(A::LABEL, "backup-kek")
        .with(A::START_DATE, start)
        .with(
            A::ALLOWED_MECHANISMS,
            AttributeValue::Mechanisms(vec![MechanismType::AES_CBC_PAD, MechanismType::AES_GCM]),
        )
        .with(
            A::UNWRAP_TEMPLATE,
            AttributeValue::Attributes(
                Template::new()
                    .with(A::SENSITIVE, true)
                    .with(A::EXTRACTABLE, false),
            ),
        );

    assert_eq!(decode(&template), template);
}

#[test]
fn vendor_attributes_are_carried_verbatim() {
    let vendor = A::new(CKA_VENDOR_DEFINED | 0x42);
    let template = Template::new()
        .with(vendor, vec![0xde, 0xad, 0xbe, 0xef])
        .with(A::TOKEN, false);

    let back = decode(&template);
    assert_eq!(back.get_bytes(vendor), Some([0xde, 0xad, 0xbe, 0xef].as_slice()));
    assert_eq!(back, template);
}

#[test]
fn absent_entries_never_reach_the_array() {
    let template = Template::new()
        .with(A::LABEL, "kept")
        .with(A::VALUE, AttributeValue::Absent);
    let flat = template.to_flat_array().unwrap();
    assert_eq!(flat.count(), 1);
    assert_eq!(flat.records()[0].type_, A::LABEL.raw());
}

#[test]
fn kind_errors_are_reported_before_flattening() {
    let template = Template::new().with(A::ENCRYPT, 1 as CK_ULONG);
    assert!(matches!(
        template.to_flat_array(),
        Err(ValidationError::KindMismatch { attribute: A::ENCRYPT, .. })
    ));
}
