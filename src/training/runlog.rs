/// Per-iteration CSV log of a training run
use chrono::{DateTime, Local};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use super::metrics::SegmentationScores;

/// Column names of `log.csv`
pub const LOG_HEADER: [&str; 13] = [
    "epoch",
    "iteration",
    "train/loss",
    "train/acc",
    "train/acc_cls",
    "train/mean_iu",
    "train/fwavacc",
    "valid/loss",
    "valid/acc",
    "valid/acc_cls",
    "valid/mean_iu",
    "valid/fwavacc",
    "elapsed_time",
];

/// Appends training and validation rows to a CSV file.
///
/// Training rows leave the validation columns empty and vice versa.
#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
    started: DateTime<Local>,
}

impl RunLog {
    /// Open `path` for appending, writing the header if the file is new.
    pub fn create<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            let mut w = csv::Writer::from_path(&path)?;
            w.write_record(LOG_HEADER)?;
            w.flush()?;
        }

        Ok(Self {
            path,
            started: Local::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn train_row(
        &self,
        epoch: usize,
        iteration: usize,
        loss: f64,
        scores: &SegmentationScores,
    ) -> crate::Result<()> {
        let mut record = vec![epoch.to_string(), iteration.to_string()];
        record.extend(score_fields(loss, scores));
        record.extend(std::iter::repeat(String::new()).take(5));
        record.push(self.elapsed());
        self.append(&record)
    }

    pub fn valid_row(
        &self,
        epoch: usize,
        iteration: usize,
        loss: f64,
        scores: &SegmentationScores,
    ) -> crate::Result<()> {
        let mut record = vec![epoch.to_string(), iteration.to_string()];
        record.extend(std::iter::repeat(String::new()).take(5));
        record.extend(score_fields(loss, scores));
        record.push(self.elapsed());
        self.append(&record)
    }

    fn elapsed(&self) -> String {
        let elapsed = Local::now() - self.started;
        format!("{:.3}", elapsed.num_milliseconds() as f64 / 1000.0)
    }

    fn append(&self, record: &[String]) -> crate::Result<()> {
        let mut w = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(OpenOptions::new().create(true).append(true).open(&self.path)?);
        w.write_record(record)?;
        w.flush()?;
        Ok(())
    }
}

fn score_fields(loss: f64, scores: &SegmentationScores) -> [String; 5] {
    [
        format!("{:.6}", loss),
        format!("{:.6}", scores.acc),
        format!("{:.6}", scores.acc_cls),
        format!("{:.6}", scores.mean_iu),
        format!("{:.6}", scores.fwavacc),
    ]
}
