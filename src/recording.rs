use eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use time::macros::format_description;
use time::OffsetDateTime;

/// Timestamps plus named series, stored as a flat JSON object:
/// `{"timestamps": [...], "read_position": [...], ...}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentLog {
    pub timestamps: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(flatten)]
    pub series: BTreeMap<String, Vec<f64>>,
}

impl ExperimentLog {
    pub fn new(timestamps: Vec<f64>) -> Self {
        Self {
            timestamps,
            run_id: None,
            series: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn duration(&self) -> f64 {
        match (self.timestamps.first(), self.timestamps.last()) {
            (Some(first), Some(last)) => last - first,
            _ => 0.0,
        }
    }

    /// Adds a series, which must have one value per timestamp.
    pub fn insert(&mut self, key: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.timestamps.len() {
            return Err(eyre!(
                "Series '{}' has {} values for {} timestamps",
                key,
                values.len(),
                self.timestamps.len()
            ));
        }
        self.series.insert(key.to_string(), values);
        Ok(())
    }

    pub fn series(&self, key: &str) -> Result<&[f64]> {
        if key == "timestamps" {
            return Ok(&self.timestamps);
        }
        self.series
            .get(key)
            .map(|values| values.as_slice())
            .ok_or_else(|| eyre!("Log has no series '{}'", key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.series.contains_key(key)
    }

    pub fn validate(&self) -> Result<()> {
        for (key, values) in &self.series {
            if values.len() != self.timestamps.len() {
                return Err(eyre!(
                    "Series '{}' has {} values for {} timestamps",
                    key,
                    values.len(),
                    self.timestamps.len()
                ));
            }
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).wrap_err_with(|| format!("opening {}", path.display()))?;
        let log: ExperimentLog = serde_json::from_reader(BufReader::new(file))
            .wrap_err_with(|| format!("parsing {}", path.display()))?;
        log.validate()
            .wrap_err_with(|| format!("validating {}", path.display()))?;
        Ok(log)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)?;
        tracing::info!("Data saved in {}", path.display());
        Ok(())
    }

    /// Writes `timestamps` and the selected series as CSV columns.
    pub fn write_csv(&self, path: &Path, keys: &[&str]) -> Result<()> {
        let mut columns = vec![self.timestamps.as_slice()];
        for key in keys {
            columns.push(self.series(key)?);
        }
        let mut header = vec!["timestamps"];
        header.extend_from_slice(keys);
        write_csv_columns(path, &header, &columns)
    }
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = File::create(path).wrap_err_with(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

/// Columns may differ in length; shorter ones leave empty cells.
pub fn write_csv_columns(path: &Path, header: &[&str], columns: &[&[f64]]) -> Result<()> {
    if header.len() != columns.len() {
        return Err(eyre!(
            "{} column names for {} columns",
            header.len(),
            columns.len()
        ));
    }
    let mut writer =
        csv::Writer::from_path(path).wrap_err_with(|| format!("creating {}", path.display()))?;
    writer.write_record(header)?;

    let rows = columns.iter().map(|c| c.len()).max().unwrap_or(0);
    for row in 0..rows {
        writer.write_record(
            columns
                .iter()
                .map(|column| column.get(row).map(|v| v.to_string()).unwrap_or_default()),
        )?;
    }
    writer.flush()?;
    Ok(())
}

/// `<prefix>_<day>-<hour>-<minute>.json`, in local time when available.
pub fn timestamped_name(prefix: &str) -> Result<String> {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let stamp = now.format(format_description!("[day]-[hour]-[minute]"))?;
    Ok(format!("{}_{}.json", prefix, stamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_log() -> ExperimentLog {
        let mut log = ExperimentLog::new(vec![0.0, 0.1, 0.2]);
        log.insert("read_position", vec![0.0, 0.5, 1.0]).unwrap();
        log.insert("goal_pwm", vec![10.0, 10.0, -5.0]).unwrap();
        log
    }

    #[test]
    fn json_layout_is_flat() {
        let log = sample_log();
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(value["timestamps"][1], 0.1);
        assert_eq!(value["read_position"][2], 1.0);
        assert!(value.get("run_id").is_none());
        assert!(value.get("series").is_none());
    }

    #[test]
    fn loads_files_without_run_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("R1_sinus.json");
        std::fs::write(
            &path,
            r#"{"timestamps": [0.0, 1.0], "read_velocity": [2.0, 3.0]}"#,
        )
        .unwrap();
        let log = ExperimentLog::load(&path).unwrap();
        assert_eq!(log.series("read_velocity").unwrap(), &[2.0, 3.0]);
        assert_eq!(log.run_id, None);
    }

    #[test]
    fn save_then_load_keeps_run_id() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.json");
        let mut log = sample_log();
        log.run_id = Some("abc".to_string());
        log.save(&path).unwrap();
        assert_eq!(ExperimentLog::load(&path).unwrap(), log);
    }

    #[test]
    fn missing_series_names_the_key() {
        let log = sample_log();
        let err = log.series("read_current").unwrap_err();
        assert!(err.to_string().contains("read_current"));
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut log = sample_log();
        assert!(log.insert("short", vec![1.0]).is_err());

        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"timestamps": [0.0, 1.0], "x": [2.0]}"#).unwrap();
        assert!(ExperimentLog::load(&path).is_err());
    }

    #[test]
    fn csv_has_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        sample_log().write_csv(&path, &["goal_pwm"]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamps,goal_pwm");
        assert_eq!(lines[3], "0.2,-5");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn csv_quotes_names_with_separators() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("quoted.csv");
        write_csv_columns(&path, &["a,b", "say \"hi\""], &[&[1.0, 2.0], &[3.0]]).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let header = reader.headers().unwrap().clone();
        assert_eq!(header.iter().collect::<Vec<_>>(), vec!["a,b", "say \"hi\""]);
        let rows: Vec<csv::StringRecord> = reader.records().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "3");
        assert_eq!(&rows[1][1], "");
    }

    #[test]
    fn timestamped_names_keep_prefix() {
        let name = timestamped_name("R1_random_pwm").unwrap();
        assert!(name.starts_with("R1_random_pwm_"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "R1_random_pwm_".len() + "dd-hh-mm.json".len());
    }
}
