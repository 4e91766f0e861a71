//! Property-based tests for the per-entity revision gate.

use proptest::prelude::*;
use tabsync::channel::{gate, GateDecision};
use tabsync::types::Revision;

/// The gate's four outcomes partition the input space completely: exactly
/// next applies, equal is a duplicate, lower is stale, and any gap resyncs.
#[test]
fn test_gate_total_and_exclusive_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &(proptest::option::of(0u64..1000), 0u64..1000),
            |(local, incoming)| {
                let decision = gate(local.map(Revision), Revision(incoming));
                let local = local.unwrap_or(0);
                let expected = if incoming == local {
                    GateDecision::Duplicate
                } else if incoming < local {
                    GateDecision::Stale
                } else if incoming == local + 1 {
                    GateDecision::Apply
                } else {
                    GateDecision::Resync {
                        local: Revision(local),
                        incoming: Revision(incoming),
                    }
                };
                assert_eq!(decision, expected);
                Ok(())
            },
        )
        .unwrap();
}

/// Applying gated updates in sequence keeps the local revision monotonic:
/// no accepted update ever lowers it.
#[test]
fn test_gate_never_regresses_revision_property() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(
            &proptest::collection::vec(1u64..50, 1..40),
            |incoming_sequence| {
                let mut local: Option<Revision> = None;
                for incoming in incoming_sequence {
                    let incoming = Revision(incoming);
                    match gate(local, incoming) {
                        GateDecision::Apply => {
                            assert!(incoming > local.unwrap_or(Revision(0)));
                            local = Some(incoming);
                        }
                        GateDecision::Resync { .. } => {
                            // A resync adopts authoritative state; model it as
                            // jumping to the incoming revision.
                            assert!(incoming > local.unwrap_or(Revision(0)).next());
                            local = Some(incoming);
                        }
                        GateDecision::Duplicate | GateDecision::Stale => {
                            assert!(incoming <= local.unwrap_or(Revision(0)));
                        }
                    }
                }
                Ok(())
            },
        )
        .unwrap();
}
