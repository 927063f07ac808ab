//! Property tests for the mail codec and envelope parser

use crate::mail::codec::MailCodec;
use crate::mail::envelope::MailEnvelope;
use crate::mail::padding::MinSizePolicy;
use crate::tee::session::paired_sessions;
use proptest::prelude::*;

fn topic() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_.-]{1,40}"
}

fn policy() -> impl Strategy<Value = MinSizePolicy> {
    prop_oneof![
        (0usize..512).prop_map(|size| MinSizePolicy::Fixed { size }),
        Just(MinSizePolicy::LargestSeen),
        (1usize..8).prop_map(|window| MinSizePolicy::MovingAverage { window }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_seal_open_roundtrip(
        topic in topic(),
        ad in proptest::collection::vec(any::<u8>(), 0..64),
        bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..300), 1..6),
        policy in policy(),
    ) {
        let (mut host, mut enclave) = paired_sessions();
        let mut codec = MailCodec::new(policy);
        for (i, body) in bodies.iter().enumerate() {
            let env = codec.seal(&mut host, &topic, &ad, body).unwrap();
            prop_assert_eq!(env.sequence_number, i as u64);
            let parsed = MailEnvelope::from_bytes(&env.to_bytes()).unwrap();
            let opened = codec.open(&mut enclave, &parsed).unwrap();
            prop_assert_eq!(&opened, body);
        }
        prop_assert_eq!(enclave.peer_seq(), Some(bodies.len() as u64 - 1));
    }

    #[test]
    fn prop_tampering_never_accepted(
        body in proptest::collection::vec(any::<u8>(), 1..200),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let (mut host, mut enclave) = paired_sessions();
        let mut codec = MailCodec::default();
        let env = codec.seal(&mut host, "prop", b"ad", &body).unwrap();

        let mut bytes = env.to_bytes();
        let i = index.index(bytes.len());
        bytes[i] ^= flip;

        let result = MailEnvelope::from_bytes(&bytes).and_then(|e| codec.open(&mut enclave, &e));
        prop_assert!(result.is_err());
        prop_assert_eq!(enclave.peer_seq(), None);
    }

    #[test]
    fn prop_parser_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = MailEnvelope::from_bytes(&bytes);
    }
}
