use arcade_resources::keys::{decode, decode_id, encode, encode_prefix, resource_key};
use proptest::prelude::*;

fn part() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.\\-]{0,12}"
}

proptest! {
    #[test]
    fn encode_decode_round_trip(prefix in "[a-z]{1,3}", parts in prop::collection::vec(part(), 0..5)) {
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let key = encode(&prefix, &refs);
        let mut expected = vec![prefix.as_str()];
        expected.extend(refs.iter().copied());
        prop_assert_eq!(decode(&key), expected);
        prop_assert!(key.starts_with(&encode_prefix(&prefix)) || refs.is_empty());
    }

    #[test]
    fn encoding_preserves_order_within_a_prefix(a in part(), b in part()) {
        let (ka, kb) = (encode("s", &[&a]), encode("s", &[&b]));
        prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
    }

    #[test]
    fn ids_with_delimiters_survive_decode_id(id in "[a-z0-9:]{1,16}") {
        let key = resource_key("g", &id);
        prop_assert_eq!(decode_id(&key), Some(id.as_str()));
    }
}
