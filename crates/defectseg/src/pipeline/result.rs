use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One input image and the path its mask is written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Segmented,
    Failed,
    /// Not attempted because an earlier item failed under `fail_fast`.
    Skipped,
}

/// Result of a single job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub input: PathBuf,
    pub output: PathBuf,
    pub status: ItemStatus,
    /// Foreground fraction of the written mask.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    pub(crate) fn skipped(job: &BatchJob) -> Self {
        Self {
            input: job.input.clone(),
            output: job.output.clone(),
            status: ItemStatus::Skipped,
            coverage: None,
            elapsed_ms: 0.0,
            error: None,
        }
    }
}

/// Summary of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub items: Vec<ItemOutcome>,
    pub segmented: usize,
    pub failed: usize,
    pub skipped: usize,
    pub wall_ms: f64,
}

impl BatchReport {
    pub(crate) fn from_items(items: Vec<ItemOutcome>, wall_ms: f64) -> Self {
        let count = |s: ItemStatus| items.iter().filter(|i| i.status == s).count();
        Self {
            segmented: count(ItemStatus::Segmented),
            failed: count(ItemStatus::Failed),
            skipped: count(ItemStatus::Skipped),
            items,
            wall_ms,
        }
    }

    pub fn total(&self) -> usize {
        self.items.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    pub fn write_json(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: ItemStatus) -> ItemOutcome {
        ItemOutcome {
            input: PathBuf::from("a.png"),
            output: PathBuf::from("a.jpg"),
            status,
            coverage: (status == ItemStatus::Segmented).then_some(0.25),
            elapsed_ms: 1.0,
            error: (status == ItemStatus::Failed).then(|| "boom".to_string()),
        }
    }

    #[test]
    fn totals_count_each_status() {
        let report = BatchReport::from_items(
            vec![
                outcome(ItemStatus::Segmented),
                outcome(ItemStatus::Failed),
                outcome(ItemStatus::Skipped),
                outcome(ItemStatus::Segmented),
            ],
            12.0,
        );
        assert_eq!(report.total(), 4);
        assert_eq!(
            (report.segmented, report.failed, report.skipped),
            (2, 1, 1)
        );
        assert!(!report.all_succeeded());
    }

    #[test]
    fn json_omits_absent_fields() {
        let report = BatchReport::from_items(vec![outcome(ItemStatus::Skipped)], 0.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("report.json");
        report.write_json(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let item = &value["items"][0];
        assert_eq!(item["status"], "skipped");
        assert!(item.get("coverage").is_none());
        assert!(item.get("error").is_none());

        let back: BatchReport = serde_json::from_value(value).unwrap();
        assert_eq!(back, report);
    }
}
