//! Property-based tests using proptest.
//!
//! These tests verify invariants that should hold for all inputs,
//! helping catch edge cases that unit tests might miss.

mod common;

use common::*;
use firehose_mirror::resilience::RetryConfig;
use firehose_mirror::{parse_frame, CollectionConfig, Mirror, ResumeBoundary, Router};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

const OWNER: &str = "did:plc:owner";
const AUTHOR: &str = "did:plc:author";
const VOTER: &str = "did:plc:voter";

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

// =============================================================================
// Counter conservation
// =============================================================================

#[derive(Debug, Clone)]
enum PostOp {
    Create(u8),
    Delete(u8),
}

fn post_op() -> impl Strategy<Value = PostOp> {
    prop_oneof![
        (0u8..6).prop_map(PostOp::Create),
        (0u8..6).prop_map(PostOp::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// postCount always equals the number of live top-level posts, whatever
    /// mix of duplicate creates and repeated deletes arrives.
    #[test]
    fn post_count_conserved(ops in prop::collection::vec(post_op(), 1..40)) {
        let rt = runtime();
        let (count, rows, expected) = rt.block_on(async {
            let mirror = Mirror::open_in_memory().await.unwrap();
            let router = Router::from_collections(&CollectionConfig::default());
            let c1 = uri(OWNER, COMMUNITY, "c1");
            router
                .dispatch(&mirror, &envelope(&community_frame(OWNER, "c1", "Rust", 1)))
                .await
                .unwrap();

            let mut live = BTreeSet::new();
            for (i, op) in ops.iter().enumerate() {
                let t = 10 + i as i64;
                let frame = match op {
                    PostOp::Create(k) => {
                        live.insert(*k);
                        post_frame(AUTHOR, &format!("p{k}"), &c1, t)
                    }
                    PostOp::Delete(k) => {
                        live.remove(k);
                        delete_frame(AUTHOR, POST, &format!("p{k}"), t)
                    }
                };
                router.dispatch(&mirror, &envelope(&frame)).await.unwrap();
            }

            let community = mirror.community_by_uri(&c1).await.unwrap().unwrap();
            let rows = mirror.posts_in_community(community.id).await.unwrap().len();
            (community.post_count, rows, live.len())
        });

        prop_assert_eq!(count, expected as i64);
        prop_assert_eq!(rows, expected);
    }
}

// =============================================================================
// Vote exclusivity
// =============================================================================

#[derive(Debug, Clone)]
enum VoteOp {
    Create(u8, bool),
    Delete(u8),
}

fn vote_op() -> impl Strategy<Value = VoteOp> {
    prop_oneof![
        3 => (0u8..4, any::<bool>()).prop_map(|(k, up)| VoteOp::Create(k, up)),
        1 => (0u8..4).prop_map(VoteOp::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// One actor never holds more than one vote on a subject, and the
    /// score reflects only the latest one.
    #[test]
    fn one_vote_per_actor_and_subject(ops in prop::collection::vec(vote_op(), 1..30)) {
        let rt = runtime();
        let (score, rows, expected) = rt.block_on(async {
            let mirror = Mirror::open_in_memory().await.unwrap();
            let router = Router::from_collections(&CollectionConfig::default());
            let c1 = uri(OWNER, COMMUNITY, "c1");
            let p1 = uri(AUTHOR, POST, "p1");
            for frame in [community_frame(OWNER, "c1", "Rust", 1), post_frame(AUTHOR, "p1", &c1, 2)] {
                router.dispatch(&mirror, &envelope(&frame)).await.unwrap();
            }

            // Model: the single live vote, if any.
            let mut current: Option<(u8, bool)> = None;
            for (i, op) in ops.iter().enumerate() {
                let t = 10 + i as i64;
                let frame = match op {
                    VoteOp::Create(k, up) => {
                        current = Some((*k, *up));
                        let direction = if *up { "up" } else { "down" };
                        vote_frame(VOTER, &format!("v{k}"), &p1, direction, t)
                    }
                    VoteOp::Delete(k) => {
                        if current.map(|(live, _)| live) == Some(*k) {
                            current = None;
                        }
                        delete_frame(VOTER, VOTE, &format!("v{k}"), t)
                    }
                };
                router.dispatch(&mirror, &envelope(&frame)).await.unwrap();
            }

            let score = mirror.post_by_uri(&p1).await.unwrap().unwrap().vote_count;
            let rows = mirror.votes_by_actor_on(VOTER, &p1).await.unwrap().len();
            let expected = match current {
                Some((_, true)) => 1,
                Some((_, false)) => -1,
                None => 0,
            };
            (score, rows, (expected, usize::from(current.is_some())))
        });

        prop_assert_eq!(score, expected.0);
        prop_assert_eq!(rows, expected.1);
    }
}

// =============================================================================
// Resume boundary
// =============================================================================

proptest! {
    /// Inclusive admits exactly `t >= cursor`, exclusive exactly `t > cursor`.
    #[test]
    fn boundary_admits(t in 0i64..1_000_000, c in 0i64..1_000_000) {
        prop_assert_eq!(ResumeBoundary::Inclusive.admits(t, Some(c)), t >= c);
        prop_assert_eq!(ResumeBoundary::Exclusive.admits(t, Some(c)), t > c);
        prop_assert!(ResumeBoundary::Inclusive.admits(t, None));
        prop_assert!(ResumeBoundary::Exclusive.admits(t, None));
    }

    /// Nothing strictly older than the cursor is ever admitted.
    #[test]
    fn boundary_never_admits_older(c in 1i64..i64::MAX, back in 1i64..1_000) {
        let t = c.saturating_sub(back);
        prop_assert!(!ResumeBoundary::Inclusive.admits(t, Some(c)));
        prop_assert!(!ResumeBoundary::Exclusive.admits(t, Some(c)));
    }
}

// =============================================================================
// Frame parsing
// =============================================================================

proptest! {
    /// Arbitrary input never panics the parser.
    #[test]
    fn parse_frame_never_panics(text in ".{0,256}") {
        let _ = parse_frame(&text);
    }

    /// Well-formed commit frames with any key survive parsing intact.
    #[test]
    fn parse_frame_keeps_time(t in 0i64..i64::MAX, rkey in "[a-z0-9]{1,13}") {
        let frame = community_frame(OWNER, &rkey, "name", t);
        let env = parse_frame(&frame).unwrap().unwrap();
        prop_assert_eq!(env.time_us, t);
        prop_assert_eq!(env.record_key, rkey);
    }
}

// =============================================================================
// Backoff
// =============================================================================

proptest! {
    /// Backoff never decreases and never exceeds the cap.
    #[test]
    fn backoff_monotonic_and_capped(attempt in 1usize..200) {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        };
        let here = config.delay_for_attempt(attempt);
        let next = config.delay_for_attempt(attempt + 1);
        prop_assert!(next >= here);
        prop_assert!(here <= config.max_delay);
    }
}
