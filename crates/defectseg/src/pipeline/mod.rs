//! Batch driver.
//!
//! Images are processed strictly one after another: decode, segment, encode.
//! Each job yields an [`ItemOutcome`]; the [`FailurePolicy`](crate::FailurePolicy)
//! decides whether a failed item stops the batch.

mod result;
mod run;

pub use result::{BatchJob, BatchReport, ItemOutcome, ItemStatus};
pub use run::{default_output_name, pair_outputs, process_item, run_batch};
