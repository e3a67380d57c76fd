//! Property-based tests using proptest
//!
//! These tests check packet and membership invariants across randomly
//! generated inputs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;
use relaynet::core::codec::Framing;
use relaynet::core::sequence::SequenceAllocator;
use relaynet::{NetworkStack, OpCode, Packet, StackSnapshot};
use serde_json::Value;
use std::sync::Arc;

fn host() -> impl Strategy<Value = String> {
    "[a-z]{1,8}"
}

fn op() -> impl Strategy<Value = OpCode> {
    prop::sample::select(OpCode::ALL.to_vec())
}

// Property: sequence numbers are unique and increasing, whatever the interleaving
proptest! {
    #[test]
    fn prop_sequence_strictly_increasing(threads in 1usize..6, per_thread in 1usize..200) {
        let allocator = Arc::new(SequenceAllocator::new());
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..per_thread).map(|_| allocator.next()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let seqs = handle.join().unwrap();
            prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            all.extend(seqs);
        }
        all.sort_unstable();
        all.dedup();
        prop_assert_eq!(all.len(), threads * per_thread);
        prop_assert_eq!(all[0], 1);
    }
}

// Property: a packet expires exactly when its ttl has passed
proptest! {
    #[test]
    fn prop_expiry_matches_ttl(timestamp in 0u64..4_000_000_000, ttl in prop::option::of(0u64..100_000), later in 0u64..200_000) {
        let packet = Packet::builder(OpCode::Data)
            .author("alpha")
            .timestamp(timestamp)
            .ttl(ttl)
            .seq(1)
            .build();

        let now = timestamp + later;
        prop_assert_eq!(packet.expires(), ttl.is_some());
        match ttl {
            Some(ttl) => prop_assert_eq!(packet.expired_at(now), now >= timestamp + ttl),
            None => prop_assert!(!packet.expired_at(now)),
        }
    }
}

// Property: decoding arbitrary bytes never panics
proptest! {
    #[test]
    fn prop_decode_never_panics(body in prop::collection::vec(any::<u8>(), 0..2048)) {
        let _ = Packet::decode(&body);
        let _ = Framing::Fenced.unwrap(&body).map(Packet::decode);
    }
}

// Property: wire fields survive the relay
proptest! {
    #[test]
    fn prop_wire_fields_preserved(
        op in op(),
        author in host(),
        recipient in prop::option::of(host()),
        text in ".{0,64}",
        ttl in prop::option::of(1u64..10_000),
        seq in 1u64..u64::MAX / 2,
    ) {
        let packet = Packet::builder(op)
            .author(author.clone())
            .recipient(recipient.clone())
            .data(Value::String(text.clone()))
            .ttl(ttl)
            .seq(seq)
            .build();

        let decoded = Packet::decode(&packet.encode().unwrap()).unwrap();
        prop_assert_eq!(decoded.op(), op);
        prop_assert_eq!(decoded.author(), author.as_str());
        prop_assert_eq!(decoded.recipient(), recipient.as_deref());
        prop_assert_eq!(decoded.data(), &Value::String(text));
        prop_assert_eq!(decoded.ttl(), ttl);
        prop_assert_eq!(decoded.seq(), seq);
    }
}

// Property: joining hosts keep the list free of duplicates, in join order,
// with the newest host at the head
proptest! {
    #[test]
    fn prop_members_unique_and_ordered(first in host(), joiners in prop::collection::vec(host(), 0..20)) {
        let mut stack = NetworkStack::with_members([first.as_str()]);
        let mut last_new = first.clone();
        for joiner in &joiners {
            if stack.push_member(joiner) {
                last_new = joiner.clone();
            }
        }

        let members = stack.members();
        let mut unique = members.to_vec();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(unique.len(), members.len());
        prop_assert_eq!(members[0].as_str(), first.as_str());
        prop_assert_eq!(stack.head(), Some(last_new.as_str()));
    }
}

// Property: a Hello snapshot always yields a stack that contains the joiner
proptest! {
    #[test]
    fn prop_hello_includes_joiner(members in prop::collection::btree_set(host(), 0..10), local in host()) {
        let members: Vec<String> = members.into_iter().collect();
        let snapshot = StackSnapshot { members: members.clone(), backlog: Vec::new() };
        let mut stack = NetworkStack::new();
        stack.from_data(snapshot, &local);

        prop_assert!(stack.contains(&local));
        prop_assert_eq!(stack.members().iter().filter(|m| **m == local).count(), 1);
        prop_assert_eq!(&stack.members()[..members.len()], &members[..]);
        if !members.contains(&local) {
            prop_assert_eq!(stack.head(), Some(local.as_str()));
        }
    }
}
