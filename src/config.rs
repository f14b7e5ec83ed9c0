//! Analysis configuration
//!
//! The analysis is a list of stages, each one model fit with its commentary
//! and the figures to draw for it. Configuration is read from TOML:
//!
//! ```toml
//! [analysis]
//! title = "Streamflow GAMs"
//! acf_max_lag = 24
//! k_check_reps = 400
//! seed = 42
//!
//! [analysis.cyclic_periods]
//! moy = [0.5, 12.5]
//!
//! [[stage]]
//! name = "additive"
//! heading = "Additive smooths"
//! prose = "..."
//! formula = "log_flow ~ s(rain) + s(SOI) + s(time)"
//! figures = ["smooths", "residual_checks", "k_check"]
//! ```
//!
//! Without a configuration file the built-in sequence in
//! [`AnalysisConfig::default`] is used.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::formula::ModelFormula;
use crate::gam::FitOptions;
use crate::smooth::OptimizationMethod;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Figures and checks a stage can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Figure {
    /// Observed and fitted response over time
    Predictions,
    /// Residuals vs fitted, QQ, histogram, response vs fitted, plus Breusch–Pagan
    ResidualChecks,
    /// Partial effect of every smooth with a 95% band
    Smooths,
    /// Basis dimension check table
    KCheck,
    /// ACF and PACF of the residuals, plus Ljung–Box
    Acf,
    /// ACF of raw against normalized residuals (AR(1) stages)
    AcfComparison,
    /// Smooths of this stage against those of `compare_with`
    SmoothComparison,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    pub heading: String,
    #[serde(default)]
    pub prose: String,
    pub formula: String,
    #[serde(default)]
    pub method: OptimizationMethod,
    /// Model the residuals as AR(1)
    #[serde(default)]
    pub ar1: bool,
    #[serde(default)]
    pub figures: Vec<Figure>,
    /// Earlier stage whose smooths are drawn alongside this one's
    #[serde(default)]
    pub compare_with: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisSettings {
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default = "default_acf_max_lag")]
    pub acf_max_lag: usize,
    #[serde(default = "default_ljung_box_lags")]
    pub ljung_box_lags: usize,
    #[serde(default = "default_k_check_reps")]
    pub k_check_reps: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Period of cyclic smooths by variable (month-of-year spans 0.5 to 12.5);
    /// cyclic smooths of other variables wrap over their data range
    #[serde(default = "default_cyclic_periods")]
    pub cyclic_periods: BTreeMap<String, [f64; 2]>,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
}

fn default_title() -> String {
    "Modelling monthly streamflow with GAMs".to_string()
}

fn default_acf_max_lag() -> usize {
    24
}

fn default_ljung_box_lags() -> usize {
    12
}

fn default_k_check_reps() -> usize {
    400
}

fn default_seed() -> u64 {
    42
}

fn default_cyclic_periods() -> BTreeMap<String, [f64; 2]> {
    BTreeMap::from([("moy".to_string(), [0.5, 12.5])])
}

fn default_max_iter() -> usize {
    100
}

impl AnalysisSettings {
    /// Fit options for a stage fitted with `method`
    pub fn fit_options(&self, method: OptimizationMethod) -> FitOptions {
        let options = FitOptions {
            method,
            max_iter: self.max_iter,
            ..FitOptions::default()
        };
        self.cyclic_periods
            .iter()
            .fold(options, |o, (var, [lower, upper])| o.with_cyclic_period(var, *lower, *upper))
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            title: default_title(),
            acf_max_lag: default_acf_max_lag(),
            ljung_box_lags: default_ljung_box_lags(),
            k_check_reps: default_k_check_reps(),
            seed: default_seed(),
            cyclic_periods: default_cyclic_periods(),
            max_iter: default_max_iter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
}

impl AnalysisConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: AnalysisConfig = toml::from_str(text)?;
        if config.stages.is_empty() {
            config.stages = default_stages();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// The file's configuration when a path is given, the default otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.analysis;
        if settings.acf_max_lag == 0 {
            return Err(ConfigError::Invalid("acf_max_lag must be > 0".to_string()));
        }
        if settings.ljung_box_lags < 2 {
            return Err(ConfigError::Invalid("ljung_box_lags must be >= 2".to_string()));
        }
        for (var, &[lower, upper]) in &settings.cyclic_periods {
            if !(lower.is_finite() && upper.is_finite() && lower < upper) {
                return Err(ConfigError::Invalid(format!(
                    "cyclic period of '{}' [{}, {}] must be an increasing pair",
                    var, lower, upper
                )));
            }
        }
        if self.stages.is_empty() {
            return Err(ConfigError::Invalid("no stages configured".to_string()));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::Invalid("stage name cannot be empty".to_string()));
            }
            if let Some(other) = &stage.compare_with {
                if !seen.contains(other.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "stage '{}' compares with '{}', which is not an earlier stage",
                        stage.name, other
                    )));
                }
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "stage name '{}' is used twice",
                    stage.name
                )));
            }
            ModelFormula::parse(&stage.formula).map_err(|e| {
                ConfigError::Invalid(format!("stage '{}': {}", stage.name, e))
            })?;
            if stage.figures.contains(&Figure::AcfComparison) && !stage.ar1 {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' asks for acf_comparison but has no AR(1) term",
                    stage.name
                )));
            }
            if stage.figures.contains(&Figure::SmoothComparison) && stage.compare_with.is_none() {
                return Err(ConfigError::Invalid(format!(
                    "stage '{}' asks for smooth_comparison without compare_with",
                    stage.name
                )));
            }
        }
        Ok(())
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            analysis: AnalysisSettings::default(),
            stages: default_stages(),
        }
    }
}

fn stage(
    name: &str,
    heading: &str,
    prose: &str,
    formula: &str,
    ar1: bool,
    figures: &[Figure],
    compare_with: Option<&str>,
) -> StageConfig {
    StageConfig {
        name: name.to_string(),
        heading: heading.to_string(),
        prose: prose.to_string(),
        formula: formula.to_string(),
        method: OptimizationMethod::REML,
        ar1,
        figures: figures.to_vec(),
        compare_with: compare_with.map(str::to_string),
    }
}

/// Linear fit, log fit, additive smooths, cyclic seasonal smooth, larger
/// basis for the trend, AR(1) residuals
pub fn default_stages() -> Vec<StageConfig> {
    use Figure::*;
    vec![
        stage(
            "linear",
            "A linear model of flow",
            "We start with the simplest model: flow as a linear function of rainfall and the \
             Southern Oscillation Index. Streamflow is strictly positive and right skewed, and the \
             residuals of a linear fit spread out as the fitted flow grows.\n\n\
             The Breusch-Pagan test below checks the residual variance against the fitted values.",
            "flow ~ rain + SOI",
            false,
            &[Predictions, ResidualChecks],
            None,
        ),
        stage(
            "log_linear",
            "Log-transformed flow",
            "Modelling log flow turns the multiplicative errors into additive ones and stabilises \
             the variance. The relationship with the covariates is still forced to be a straight line.",
            "log_flow ~ rain + SOI",
            false,
            &[Predictions, ResidualChecks],
            None,
        ),
        stage(
            "additive",
            "Additive smooths",
            "Replacing the linear terms by penalized cubic regression splines lets the data decide \
             how wiggly each effect should be. Smoothing parameters are chosen by REML. A smooth of \
             time picks up the long-term trend.",
            "log_flow ~ s(rain) + s(SOI) + s(time)",
            false,
            &[Smooths, ResidualChecks, KCheck, Acf],
            None,
        ),
        stage(
            "seasonal",
            "A cyclic seasonal smooth",
            "Flow follows the seasons. Month of year is periodic: December is as close to January \
             as it is to November, so its smooth uses a cyclic basis whose ends match in value and \
             derivatives. The period runs from 0.5 to 12.5 so that December and January stay \
             distinct points.",
            "log_flow ~ s(rain) + s(SOI) + s(moy, bs=\"cc\", k=12) + s(time)",
            false,
            &[Smooths, ResidualChecks, KCheck, Acf],
            None,
        ),
        stage(
            "seasonal_large_k",
            "Checking the basis dimension",
            "A k-index well below one with a small p-value suggests the basis of a smooth may be too \
             small. Raising k for the trend lets it follow slower climatic swings, and the k-check \
             is revisited.",
            "log_flow ~ s(rain) + s(SOI) + s(moy, bs=\"cc\", k=12) + s(time, k=20)",
            false,
            &[Smooths, KCheck, Acf],
            None,
        ),
        stage(
            "ar1",
            "Autocorrelated residuals",
            "Monthly flows carry memory from one month to the next, which shows up as a large lag-one \
             autocorrelation in the residuals. Ignoring it makes the smooths too wiggly and their \
             confidence bands too narrow. Here the residuals follow an AR(1) process whose \
             correlation is estimated together with the smooths.\n\n\
             The normalized residuals should look like white noise; the trend smooth is compared \
             with the fit that ignores the correlation.",
            "log_flow ~ s(rain) + s(SOI) + s(moy, bs=\"cc\", k=12) + s(time, k=20)",
            true,
            &[Smooths, AcfComparison, SmoothComparison],
            Some("seasonal_large_k"),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AnalysisConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stages.len(), 6);
        assert!(config.stages[5].ar1);
        let options = config.analysis.fit_options(OptimizationMethod::REML);
        assert_eq!(options.cyclic_period("moy"), Some((0.5, 12.5)));
        assert_eq!(options.cyclic_period("time"), None);
    }

    #[test]
    fn test_parse_toml() {
        let config = AnalysisConfig::from_toml_str(
            r#"
            [analysis]
            title = "Test"
            k_check_reps = 50

            [[stage]]
            name = "a"
            heading = "A"
            formula = "log_flow ~ s(rain)"
            method = "gcv"
            figures = ["smooths", "k_check"]

            [[stage]]
            name = "b"
            heading = "B"
            formula = "log_flow ~ s(rain)"
            ar1 = true
            figures = ["acf_comparison", "smooth_comparison"]
            compare_with = "a"
            "#,
        )
        .unwrap();
        assert_eq!(config.analysis.title, "Test");
        assert_eq!(config.analysis.k_check_reps, 50);
        assert_eq!(config.analysis.acf_max_lag, 24);
        assert_eq!(config.stages[0].method, OptimizationMethod::GCV);
        assert_eq!(config.stages[0].figures, vec![Figure::Smooths, Figure::KCheck]);
    }

    #[test]
    fn test_cyclic_periods_table() {
        let config = AnalysisConfig::from_toml_str(
            "[analysis.cyclic_periods]\nmoy = [0.5, 12.5]\nangle = [0.0, 360.0]\n",
        )
        .unwrap();
        let options = config.analysis.fit_options(OptimizationMethod::GCV);
        assert_eq!(options.method, OptimizationMethod::GCV);
        assert_eq!(options.cyclic_period("angle"), Some((0.0, 360.0)));
        assert_eq!(options.cyclic_period("rain"), None);

        let reversed = "[analysis.cyclic_periods]\nmoy = [12.5, 0.5]\n";
        assert!(matches!(
            AnalysisConfig::from_toml_str(reversed),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_only_settings_uses_default_stages() {
        let config = AnalysisConfig::from_toml_str("[analysis]\nseed = 7\n").unwrap();
        assert_eq!(config.analysis.seed, 7);
        assert_eq!(config.stages, default_stages());
    }

    #[test]
    fn test_rejects_bad_config() {
        assert!(matches!(
            AnalysisConfig::from_toml_str("[analysis]\ncolour = \"red\"\n"),
            Err(ConfigError::Parse(_))
        ));
        let bad_formula = "[[stage]]\nname = \"a\"\nheading = \"A\"\nformula = \"log_flow s(rain)\"\n";
        assert!(matches!(
            AnalysisConfig::from_toml_str(bad_formula),
            Err(ConfigError::Invalid(_))
        ));
        let forward_ref = "[[stage]]\nname = \"a\"\nheading = \"A\"\nformula = \"y ~ x\"\ncompare_with = \"b\"\n";
        assert!(AnalysisConfig::from_toml_str(forward_ref).is_err());
        let duplicate = "[[stage]]\nname = \"a\"\nheading = \"A\"\nformula = \"y ~ x\"\n\
                         [[stage]]\nname = \"a\"\nheading = \"B\"\nformula = \"y ~ x\"\n";
        assert!(AnalysisConfig::from_toml_str(duplicate).is_err());
        assert!(matches!(
            AnalysisConfig::from_file("/nonexistent/flowgam.toml"),
            Err(ConfigError::Read { .. })
        ));
    }
}
