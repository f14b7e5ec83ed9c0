//! Monthly streamflow records
//!
//! The dataset is read once from CSV, validated, sorted by `time` and then
//! only ever borrowed.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("row {row}: {message}")]
    InvalidRow { row: usize, message: String },

    #[error("duplicate time value {time} (rows {first} and {second})")]
    DuplicateTime { time: f64, first: usize, second: usize },

    #[error("dataset has no rows")]
    Empty,

    #[error("unknown column '{0}'")]
    UnknownColumn(String),
}

/// One month of the streamflow record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub month: String,
    pub flow: f64,
    pub rain: f64,
    #[serde(rename = "SOI")]
    pub soi: f64,
    pub moy: u32,
    pub time: f64,
    #[serde(default)]
    pub log_flow: Option<f64>,
}

impl Observation {
    fn validate(&mut self, row: usize) -> Result<(), DataError> {
        let invalid = |message: String| DataError::InvalidRow { row, message };

        for (name, value) in [
            ("flow", self.flow),
            ("rain", self.rain),
            ("SOI", self.soi),
            ("time", self.time),
        ] {
            if !value.is_finite() {
                return Err(invalid(format!("{} is not finite ({})", name, value)));
            }
        }
        if !(1..=12).contains(&self.moy) {
            return Err(invalid(format!("moy must be in 1..=12, got {}", self.moy)));
        }
        if self.flow <= 0.0 {
            return Err(invalid(format!("flow must be positive, got {}", self.flow)));
        }

        let expected = self.flow.ln();
        match self.log_flow {
            Some(log_flow) if !log_flow.is_finite() => {
                return Err(invalid(format!("log_flow is not finite ({})", log_flow)));
            }
            Some(log_flow) if (log_flow - expected).abs() > 1e-6 * expected.abs().max(1.0) => {
                return Err(invalid(format!(
                    "log_flow {} does not match ln(flow) = {}",
                    log_flow, expected
                )));
            }
            Some(_) => {}
            None => self.log_flow = Some(expected),
        }
        Ok(())
    }

    /// `log_flow`, always present once the observation is part of a `Dataset`
    pub fn log_flow(&self) -> f64 {
        self.log_flow.unwrap_or_else(|| self.flow.ln())
    }
}

/// Validated streamflow record sorted by time
#[derive(Debug, Clone)]
pub struct Dataset {
    observations: Vec<Observation>,
}

impl Dataset {
    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DataError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DataError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut observations = Vec::new();
        for record in csv_reader.deserialize() {
            let observation: Observation = record?;
            observations.push(observation);
        }
        Self::from_observations(observations)
    }

    /// Validate and sort already-parsed observations
    pub fn from_observations(mut observations: Vec<Observation>) -> Result<Self, DataError> {
        if observations.is_empty() {
            return Err(DataError::Empty);
        }
        // rows are numbered from 1 after the header, in file order
        for (i, obs) in observations.iter_mut().enumerate() {
            obs.validate(i + 1)?;
        }

        let mut order: Vec<usize> = (0..observations.len()).collect();
        order.sort_by(|&a, &b| observations[a].time.total_cmp(&observations[b].time));
        for pair in order.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if observations[a].time == observations[b].time {
                return Err(DataError::DuplicateTime {
                    time: observations[a].time,
                    first: a.min(b) + 1,
                    second: a.max(b) + 1,
                });
            }
        }

        let sorted = order.into_iter().map(|i| observations[i].clone()).collect();
        Ok(Self { observations: sorted })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// A numeric column as an array (`SOI` is also accepted as `soi`)
    pub fn column(&self, name: &str) -> Result<Array1<f64>, DataError> {
        let getter: fn(&Observation) -> f64 = match canonical_name(name) {
            "flow" => |o: &Observation| o.flow,
            "log_flow" => |o: &Observation| o.log_flow(),
            "rain" => |o: &Observation| o.rain,
            "SOI" => |o: &Observation| o.soi,
            "moy" => |o: &Observation| o.moy as f64,
            "time" => |o: &Observation| o.time,
            other => return Err(DataError::UnknownColumn(other.to_string())),
        };
        Ok(self.observations.iter().map(getter).collect())
    }

    /// Indices at which a new unit-step run starts (time step differs from 1)
    pub fn series_breaks(&self) -> Vec<usize> {
        let time: Vec<f64> = self.observations.iter().map(|o| o.time).collect();
        series_breaks(&time)
    }
}

/// The column a variable name refers to (`soi` is read as `SOI`)
pub fn canonical_name(name: &str) -> &str {
    match name {
        "soi" => "SOI",
        other => other,
    }
}

/// Indices `i > 0` where `time[i] - time[i-1]` is not 1.
pub fn series_breaks(time: &[f64]) -> Vec<usize> {
    (1..time.len())
        .filter(|&i| ((time[i] - time[i - 1]) - 1.0).abs() > 1e-8)
        .collect()
}
