use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::EvaluateArgs;
use crate::pipeline::evaluate::evaluate_directories;
use crate::pipeline::reports::EvaluationLedger;

pub fn run(args: EvaluateArgs) -> Result<()> {
    info!(
        reference_dir = %args.reference_dir.display(),
        candidate_dir = %args.candidate_dir.display(),
        "evaluating mask directories"
    );

    let mut ledger = match &args.ledger {
        Some(path) => Some(
            EvaluationLedger::create(path, &args.label)
                .with_context(|| format!("failed to start ledger {}", path.display()))?,
        ),
        None => None,
    };

    let batch = evaluate_directories(&args.reference_dir, &args.candidate_dir, ledger.as_mut())
        .context("failed to evaluate mask directories")?;

    for failure in batch.failures() {
        warn!(mask = %failure.name, reason = %failure.reason, "pair not scored");
    }
    if batch.pairs().is_empty() {
        bail!(
            "no mask pairs could be scored between {} and {}",
            args.reference_dir.display(),
            args.candidate_dir.display()
        );
    }

    for policy in args.policy.policies() {
        if let Some(score) = batch.summarize(*policy) {
            let percent = score.percent();
            info!(
                label = %args.label,
                policy = %policy,
                pairs = batch.pairs().len(),
                failed_pairs = batch.failures().len(),
                iou = %format!("{:.2}", percent.iou),
                acc = %format!("{:.2}", percent.accuracy),
                "mask agreement"
            );
        }
    }

    let totals = batch.meter().totals();
    info!(
        intersection = totals.intersection,
        union = totals.union,
        reference_area = totals.target,
        "pooled pixel counts"
    );

    if let Some(ledger) = &ledger {
        info!(path = %ledger.path().display(), "wrote evaluation ledger");
    }

    Ok(())
}
