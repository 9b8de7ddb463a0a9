use ipmi_sdr::Error;
use ipmi_sdr::field::{self, FieldObject, FieldSpec, Template};
use proptest::prelude::*;

// 64 bits, deliberately straddling byte boundaries.
const TMPL_MIXED: Template = Template::new(&[
    FieldSpec::required("a", 3),
    FieldSpec::required("b", 5),
    FieldSpec::required("c", 12),
    FieldSpec::required("d", 4),
    FieldSpec::required("e", 32),
    FieldSpec::required("f", 7),
    FieldSpec::required("g", 1),
]);

proptest! {
    #[test]
    fn values_survive_encode_and_decode(
        a in 0u64..(1 << 3),
        b in 0u64..(1 << 5),
        c in 0u64..(1 << 12),
        d in 0u64..(1 << 4),
        e in any::<u32>(),
        f in 0u64..(1 << 7),
        g in 0u64..2,
    ) {
        let values = [
            ("a", a),
            ("b", b),
            ("c", c),
            ("d", d),
            ("e", u64::from(e)),
            ("f", f),
            ("g", g),
        ];
        let bytes = field::encode(TMPL_MIXED, &values).expect("encode");
        prop_assert_eq!(bytes.len(), 8);

        let obj = field::decode(TMPL_MIXED, &bytes).expect("decode");
        for (name, value) in values {
            prop_assert_eq!(obj.get(name).expect("get"), value);
        }
    }

    #[test]
    fn any_buffer_decodes_and_reencodes_unchanged(bytes in prop::array::uniform8(any::<u8>())) {
        let obj = field::decode(TMPL_MIXED, &bytes).expect("decode");
        prop_assert_eq!(obj.to_bytes().expect("encode"), bytes.to_vec());
    }

    #[test]
    fn values_wider_than_the_field_are_rejected(value in (1u64 << 12)..) {
        let mut obj = FieldObject::new(TMPL_MIXED);
        let err = obj.set("c", value).unwrap_err();
        let is_overflow = matches!(err, Error::FieldOverflow { field: "c", bits: 12, .. });
        prop_assert!(is_overflow);
    }

    #[test]
    fn short_buffers_never_decode(len in 0usize..8) {
        let bytes = vec![0xA5; len];
        prop_assert!(field::decode(TMPL_MIXED, &bytes).is_err());
    }
}

#[test]
fn template_length() {
    assert_eq!(field::field_length_bytes(&TMPL_MIXED).expect("len"), 8);
    assert_eq!(TMPL_MIXED.field_offset_bits("e").expect("offset"), 24);
    assert!(matches!(
        TMPL_MIXED.field_len_bits("nope"),
        Err(Error::UnknownField(name)) if name == "nope"
    ));
}
