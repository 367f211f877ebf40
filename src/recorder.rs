use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::analysis::{AnalysisResult, Visualizer};
use crate::drivers::AnalysisError;

/// Appends one CSV row per (trial, unit) as result snapshots arrive.
///
/// Snapshots are cumulative, so only trials newer than the last written one are emitted.
pub struct CsvVisualizer {
    writer: BufWriter<File>,
    path: PathBuf,
    precision: usize,
    last_trial: Option<usize>,
    rows: usize,
}

impl CsvVisualizer {
    pub const HEADER: &'static str = "analyzer,channel,trial,condition,unit,value";

    pub fn create(path: impl AsRef<Path>, precision: usize) -> Result<Self, AnalysisError> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", Self::HEADER)?;
        info!("recording results to {}", path.display());
        Ok(Self {
            writer,
            path,
            precision,
            last_trial: None,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> usize {
        self.rows
    }
}

impl Visualizer for CsvVisualizer {
    fn visualize(&mut self, result: &AnalysisResult) -> Result<(), AnalysisError> {
        let columns = result.trials.iter().zip(&result.conditions).enumerate();
        for (column, (&trial, &condition)) in columns {
            if matches!(self.last_trial, Some(last) if trial <= last) {
                continue;
            }
            for (unit, values) in &result.values {
                let Some(value) = values.get(column) else {
                    continue;
                };
                writeln!(
                    self.writer,
                    "{},{},{trial},{condition},{unit},{value:.prec$}",
                    result.analyzer.0,
                    result.signal.channel,
                    prec = self.precision
                )?;
                self.rows += 1;
            }
            self.last_trial = Some(trial);
        }
        self.writer.flush()?;
        Ok(())
    }

    fn reset(&mut self) {
        self.last_trial = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalyzerId, Signal};

    #[test]
    fn only_new_trials_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rates.csv");
        let mut csv = CsvVisualizer::create(&path, 1).unwrap();
        let mut result = AnalysisResult::new(AnalyzerId(7), Signal::spike(2));
        result.push_trial(0, 1, [(1, 12.0)]);
        csv.visualize(&result).unwrap();
        result.push_trial(1, 0, [(1, 4.24), (3, 8.0)]);
        csv.visualize(&result).unwrap();
        assert_eq!(csv.rows_written(), 3);

        let text = std::fs::read_to_string(csv.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                CsvVisualizer::HEADER,
                "7,2,0,1,1,12.0",
                "7,2,1,0,1,4.2",
                "7,2,1,0,3,8.0",
            ]
        );
    }

    #[test]
    fn reset_starts_over() {
        let dir = tempfile::tempdir().unwrap();
        let mut csv = CsvVisualizer::create(dir.path().join("lfp.csv"), 3).unwrap();
        let mut result = AnalysisResult::new(AnalyzerId(1), Signal::lfp(0));
        result.push_trial(0, 0, [(0, 0.5)]);
        csv.visualize(&result).unwrap();
        csv.visualize(&result).unwrap();
        assert_eq!(csv.rows_written(), 1);
        csv.reset();
        csv.visualize(&result).unwrap();
        assert_eq!(csv.rows_written(), 2);
    }
}
