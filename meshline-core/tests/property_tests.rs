use chrono::Duration;
use meshline_core::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
enum Step {
    /// Evaluate the windows this many seconds after the last heartbeat
    Evaluate(i64),
    Heartbeat,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0i64..600).prop_map(Step::Evaluate),
        1 => Just(Step::Heartbeat),
    ]
}

// ===== Sampling =====

proptest! {
    #[test]
    fn prop_sampling_is_deterministic(bytes in any::<[u8; 16]>(), rate in 0.0f64..=1.0) {
        let trace_id = TraceId::from_bytes(bytes);
        let first = SamplingDecider::decide(&trace_id, rate);
        for _ in 0..4 {
            prop_assert_eq!(SamplingDecider::decide(&trace_id, rate), first);
        }
    }

    #[test]
    fn prop_sampling_is_monotonic_in_rate(bytes in any::<[u8; 16]>(), low in 0.0f64..=1.0, high in 0.0f64..=1.0) {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        let trace_id = TraceId::from_bytes(bytes);
        if SamplingDecider::decide(&trace_id, low) {
            prop_assert!(SamplingDecider::decide(&trace_id, high));
        }
    }

    #[test]
    fn prop_fraction_is_in_unit_interval(key in ".{0,64}") {
        let fraction = SamplingDecider::fraction(key.as_bytes());
        prop_assert!((0.0..1.0).contains(&fraction));
    }
}

// ===== Partition Lifecycle =====

proptest! {
    #[test]
    fn prop_partition_never_skips_degraded(steps in prop::collection::vec(step(), 1..40)) {
        let degraded_after = Duration::seconds(30);
        let unavailable_after = Duration::seconds(90);
        let mut record = PartitionRecord::new("p-1", "orders", BTreeMap::new());

        for step in steps {
            let before = record.status;
            match step {
                Step::Evaluate(secs) => {
                    let now = record.last_heartbeat + Duration::seconds(secs);
                    let changed = record.evaluate(now, degraded_after, unavailable_after).unwrap();
                    if let Some(next) = changed {
                        prop_assert_eq!(next, record.status);
                    }
                }
                Step::Heartbeat => {
                    let now = record.last_heartbeat + Duration::seconds(1);
                    record.heartbeat(now).unwrap();
                    prop_assert_eq!(record.status, PartitionStatus::Active);
                }
            }

            prop_assert!(before.can_transition_to(record.status));
            prop_assert!(!(before == PartitionStatus::Active
                && record.status == PartitionStatus::Unavailable));
        }
    }
}

// ===== Identifiers =====

proptest! {
    #[test]
    fn prop_trace_id_hex_is_lowercase_and_parses(bytes in any::<[u8; 16]>()) {
        prop_assume!(bytes != [0u8; 16]);
        let trace_id = TraceId::from_bytes(bytes);
        let hex = trace_id.to_hex();

        prop_assert_eq!(hex.len(), 32);
        prop_assert!(hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        prop_assert_eq!(TraceId::from_hex(&hex).unwrap(), trace_id);
    }
}

#[test]
fn test_zero_ids_are_rejected() {
    assert!(TraceId::from_hex(&"0".repeat(32)).is_err());
    assert!(SpanId::from_hex(&"0".repeat(16)).is_err());
}

#[test]
fn test_child_context_inherits_trace() {
    let root = SpanContext::root(TraceId::new(), true).with_baggage("tenant", "acme");
    let child = root.child();

    assert_eq!(child.trace_id, root.trace_id);
    assert_eq!(child.parent_span_id, Some(root.span_id));
    assert_ne!(child.span_id, root.span_id);
    assert_eq!(child.baggage.get("tenant").map(String::as_str), Some("acme"));
    assert!(child.sampled);
}
