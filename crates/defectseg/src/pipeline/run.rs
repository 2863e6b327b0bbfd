use std::path::PathBuf;
use std::time::Instant;

use super::result::{BatchJob, BatchReport, ItemOutcome, ItemStatus};
use crate::api::{SegmentError, Segmenter};
use crate::config::FailurePolicy;
use crate::engine::ComputeEngine;
use crate::image::io;

/// Output name used when no explicit path was given for input `index` (0-based).
pub fn default_output_name(index: usize) -> PathBuf {
    PathBuf::from(format!("defect_prediction{}.jpg", index + 1))
}

/// Pair inputs with outputs by position.
///
/// Inputs without an output get [`default_output_name`]; surplus outputs are
/// ignored.
pub fn pair_outputs(inputs: &[PathBuf], outputs: &[PathBuf]) -> Vec<BatchJob> {
    if outputs.len() > inputs.len() {
        tracing::warn!(
            inputs = inputs.len(),
            outputs = outputs.len(),
            "ignoring outputs without a matching input"
        );
    }
    inputs
        .iter()
        .enumerate()
        .map(|(i, input)| BatchJob {
            input: input.clone(),
            output: outputs
                .get(i)
                .cloned()
                .unwrap_or_else(|| default_output_name(i)),
        })
        .collect()
}

/// Decode, segment and encode one job; returns the mask coverage.
pub fn process_item<E: ComputeEngine>(
    segmenter: &Segmenter<E>,
    job: &BatchJob,
) -> Result<f64, SegmentError> {
    let image = io::load_rgb(&job.input)?;
    let mask = segmenter.segment(&image)?;
    io::save_jpeg(mask.buffer(), &job.output, segmenter.config().jpeg_quality)?;
    Ok(mask.coverage())
}

/// Run every job in order, one image at a time.
pub fn run_batch<E: ComputeEngine>(
    segmenter: &Segmenter<E>,
    jobs: &[BatchJob],
    policy: FailurePolicy,
) -> BatchReport {
    let wall = Instant::now();
    let mut items = Vec::with_capacity(jobs.len());
    let mut stopped = false;

    for job in jobs {
        if stopped {
            items.push(ItemOutcome::skipped(job));
            continue;
        }
        let t0 = Instant::now();
        let result = process_item(segmenter, job);
        let elapsed_ms = t0.elapsed().as_secs_f64() * 1e3;
        let outcome = match result {
            Ok(coverage) => {
                tracing::info!(
                    input = %job.input.display(),
                    output = %job.output.display(),
                    coverage,
                    elapsed_ms,
                    "mask written"
                );
                ItemOutcome {
                    input: job.input.clone(),
                    output: job.output.clone(),
                    status: ItemStatus::Segmented,
                    coverage: Some(coverage),
                    elapsed_ms,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(input = %job.input.display(), error = %e, "item failed");
                if policy == FailurePolicy::FailFast {
                    stopped = true;
                }
                ItemOutcome {
                    input: job.input.clone(),
                    output: job.output.clone(),
                    status: ItemStatus::Failed,
                    coverage: None,
                    elapsed_ms,
                    error: Some(e.to_string()),
                }
            }
        };
        items.push(outcome);
    }

    let report = BatchReport::from_items(items, wall.elapsed().as_secs_f64() * 1e3);
    tracing::info!(
        total = report.total(),
        segmented = report.segmented,
        failed = report.failed,
        skipped = report.skipped,
        wall_ms = report.wall_ms,
        "batch finished"
    );
    report
}
