//! End-to-end flows through the wired decision stack: sticky
//! allocation, conversion tracking, bandit learning, and the audit
//! trail that records it all.

use std::collections::HashMap;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uplift_bandit::ExperimentReport;
use uplift_core::types::ConversionStatus;
use uplift_integration_tests::{launch_experiment, test_stack};
use uplift_ledger::{export_trail, ExportFormat};

fn no_context() -> HashMap<String, String> {
    HashMap::new()
}

fn variant_stats<'a>(
    report: &'a ExperimentReport,
    name: &str,
) -> &'a uplift_bandit::VariantPosterior {
    report
        .variants
        .iter()
        .find(|v| v.name == name)
        .unwrap_or_else(|| panic!("variant {name} missing from report"))
}

#[test]
fn test_visitor_journey_allocate_convert_report() {
    let stack = test_stack();
    let experiment = launch_experiment(&stack, "Pricing banner", &["control", "treatment"]);

    let first = stack
        .coordinator
        .allocate(experiment.id, "visitor-1", &no_context())
        .unwrap();
    assert!(first.is_new_assignment);

    let replay = stack
        .coordinator
        .allocate(experiment.id, "visitor-1", &no_context())
        .unwrap();
    assert!(!replay.is_new_assignment);
    assert_eq!(replay.variant_id, first.variant_id);
    assert_eq!(replay.assignment_id, first.assignment_id);

    let conversion = stack
        .coordinator
        .record_outcome(experiment.id, "visitor-1", Some(19.99), None)
        .unwrap();
    assert_eq!(conversion.status, ConversionStatus::Recorded);

    let repeat = stack
        .coordinator
        .record_outcome(experiment.id, "visitor-1", Some(19.99), None)
        .unwrap();
    assert_eq!(repeat.status, ConversionStatus::AlreadyConverted);

    let report = stack
        .coordinator
        .posterior_report(experiment.id, "default")
        .unwrap();
    assert_eq!(report.total_allocations, 1);
    assert_eq!(report.total_conversions, 1);

    let verification = stack.ledger.verify_chain(experiment.id, None);
    assert!(verification.is_fair);
    assert_eq!(verification.total_records, 1);
}

#[test]
fn test_concurrent_first_touch_books_one_assignment() {
    let stack = test_stack();
    let experiment = launch_experiment(&stack, "Cart nudge", &["control", "treatment"]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = stack.coordinator.clone();
            let experiment_id = experiment.id;
            thread::spawn(move || {
                coordinator
                    .allocate(experiment_id, "visitor-7", &HashMap::new())
                    .unwrap()
            })
        })
        .collect();

    let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let new_count = outcomes.iter().filter(|o| o.is_new_assignment).count();
    assert_eq!(new_count, 1);
    assert!(outcomes
        .iter()
        .all(|o| o.assignment_id == outcomes[0].assignment_id));
    assert!(outcomes.iter().all(|o| o.variant_id == outcomes[0].variant_id));

    // One decision, one ledger record, one posterior increment.
    assert_eq!(stack.ledger.record_count(experiment.id), 1);
    let report = stack
        .coordinator
        .posterior_report(experiment.id, "default")
        .unwrap();
    assert_eq!(report.total_allocations, 1);
}

#[test]
fn test_bandit_shifts_traffic_to_the_better_variant() {
    let stack = test_stack();
    let experiment = launch_experiment(&stack, "Signup CTA", &["control", "challenger"]);
    let mut rng = StdRng::seed_from_u64(4242);

    // Simulated ground truth: the challenger converts at 30%, the
    // control at 10%. The sampler sees only recorded outcomes.
    let total = 5000usize;
    let mut challenger_late = 0u32;
    for i in 0..total {
        let visitor = format!("visitor-{i}");
        let outcome = stack
            .coordinator
            .allocate(experiment.id, &visitor, &no_context())
            .unwrap();

        let rate = if outcome.variant_name == "challenger" {
            0.30
        } else {
            0.10
        };
        if rng.gen::<f64>() < rate {
            stack
                .coordinator
                .record_outcome(experiment.id, &visitor, None, None)
                .unwrap();
        }
        if i >= total / 2 && outcome.variant_name == "challenger" {
            challenger_late += 1;
        }
    }

    let report = stack
        .coordinator
        .posterior_report(experiment.id, "default")
        .unwrap();
    assert_eq!(report.total_allocations, total as u64);

    let control = variant_stats(&report, "control");
    let challenger = variant_stats(&report, "challenger");
    assert!(challenger.posterior_mean > control.posterior_mean);
    assert!(challenger.is_leader);

    // The second half of traffic should flow mostly to the winner.
    let late_share = f64::from(challenger_late) / (total as f64 / 2.0);
    assert!(
        late_share > 0.7,
        "challenger got only {late_share:.2} of late traffic"
    );
}

#[test]
fn test_audit_trail_survives_traffic_and_exports() {
    let stack = test_stack();
    let experiment = launch_experiment(&stack, "Email subject", &["control", "treatment"]);

    for i in 0..25 {
        let visitor = format!("visitor-{i}");
        stack
            .coordinator
            .allocate(experiment.id, &visitor, &no_context())
            .unwrap();
    }
    stack
        .coordinator
        .record_outcome(experiment.id, "visitor-3", Some(5.0), None)
        .unwrap();

    let verification = stack.ledger.verify_chain(experiment.id, None);
    assert!(verification.chain_intact);
    assert!(verification.is_fair);
    assert_eq!(verification.total_records, 25);

    let records = stack.ledger.records(experiment.id);
    let csv = export_trail(&records, ExportFormat::Csv).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 26);
    assert!(lines[0].starts_with("sequence,user_id"));
    assert!(csv.contains("\"visitor-3\""));

    let json = export_trail(&records, ExportFormat::Json).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 25);
}

#[test]
fn test_conversion_before_decision_is_rejected_end_to_end() {
    let stack = test_stack();
    let experiment = launch_experiment(&stack, "Paywall copy", &["control", "treatment"]);

    let outcome = stack
        .coordinator
        .allocate(experiment.id, "visitor-9", &no_context())
        .unwrap();
    let before = outcome.assigned_at - chrono::Duration::seconds(30);
    let result = stack
        .coordinator
        .record_outcome(experiment.id, "visitor-9", None, Some(before));
    assert!(result.is_err());

    // The rejected conversion must leave the trail unannotated.
    let records = stack.ledger.records(experiment.id);
    assert!(records[0].converted_at.is_none());
    assert!(stack.ledger.verify_chain(experiment.id, None).is_fair);

    // A later, causally valid conversion still lands.
    let recovered = stack
        .coordinator
        .record_outcome(experiment.id, "visitor-9", None, None)
        .unwrap();
    assert_eq!(recovered.status, ConversionStatus::Recorded);
}
