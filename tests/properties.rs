//! Property tests: fingerprint and classifier purity, whitespace
//! equivalence, and path resolution idempotence.

use lodestar::analysis::PathPolicy;
use lodestar::classify::classify;
use lodestar::fingerprint::fingerprint_text;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_fingerprint_is_pure(text in ".{0,300}") {
        let a = fingerprint_text(&text, false);
        let b = fingerprint_text(&text, false);
        prop_assert_eq!(a.hash.clone(), b.hash);
        prop_assert_eq!(a.domain, b.domain);
        prop_assert_eq!(a.question_type, b.question_type);
        prop_assert!(a.hash.len() <= 64);
    }

    #[test]
    fn prop_whitespace_normalization_preserves_fingerprint(
        words in proptest::collection::vec("[a-z]{1,8}", 1..20),
        seps in proptest::collection::vec(prop_oneof![Just(" "), Just("  "), Just("\t"), Just("\n")], 1..20),
    ) {
        let single: String = words.join(" ");
        let mut messy = String::new();
        for (index, word) in words.iter().enumerate() {
            if index > 0 {
                messy.push_str(seps[index % seps.len()]);
            }
            messy.push_str(word);
        }
        let a = fingerprint_text(&single, false);
        let b = fingerprint_text(&messy, false);
        prop_assert_eq!(a.domain, b.domain);
        prop_assert_eq!(a.question_type, b.question_type);
        prop_assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn prop_classifier_is_pure_and_bounded(text in ".{0,300}") {
        let a = classify(&text);
        let b = classify(&text);
        prop_assert_eq!(a.intent, b.intent);
        prop_assert!((a.score.as_f64() - b.score.as_f64()).abs() < f64::EPSILON);
        prop_assert!((0.0..=1.0).contains(&a.score.as_f64()));
    }

    #[test]
    fn prop_resolve_is_idempotent_when_accepted(
        segments in proptest::collection::vec("[a-zA-Z0-9_]{1,10}", 1..6),
    ) {
        let policy = PathPolicy::new("/workspace").unwrap();
        let input = format!("/workspace/{}", segments.join("/"));
        if let Ok(first) = policy.resolve(&input) {
            let second = policy.resolve(&first.display().to_string()).unwrap();
            prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn prop_traversal_outside_root_is_always_rejected(
        depth in 1usize..6,
        target in "[a-z]{1,10}",
    ) {
        // Climbing back into a directory literally named "workspace" would
        // legitimately resolve; that is not the case under test.
        prop_assume!(target != "workspace");
        let policy = PathPolicy::new("/workspace").unwrap();
        let escape = "../".repeat(depth);
        let input = format!("/workspace/{escape}{target}");
        // Climbing out of the workspace root must never resolve, however
        // deep the climb.
        prop_assert!(policy.resolve(&input).is_err());
    }
}
