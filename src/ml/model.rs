use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to read model artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed model artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid model artifact: {0}")]
    Invalid(String),

    #[error("Model expects {expected} features, got {actual}")]
    FeatureCount { expected: usize, actual: usize },

    #[error("Feature columns {actual:?} do not match model features {expected:?}")]
    FeatureMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Classifier returned probability {0} outside [0, 1]")]
    InvalidProbability(f64),

    #[error("No feature rows to score")]
    NoRows,
}

pub(crate) fn read_artifact(path: &Path) -> Result<String, ModelError> {
    std::fs::read_to_string(path).map_err(|source| ModelError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Anything that turns one feature vector into an up-move probability.
#[cfg_attr(test, mockall::automock)]
pub trait Classifier: Send + Sync {
    fn num_features(&self) -> usize;

    fn predict_proba(&self, features: &[f64]) -> Result<f64, ModelError>;
}

/// Logistic regression over z-scored inputs, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticModel {
    coefficients: Vec<f64>,
    intercept: f64,
    feature_means: Vec<f64>,
    feature_stds: Vec<f64>,
}

impl LogisticModel {
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let model: LogisticModel = serde_json::from_str(json)?;
        model.validate()?;
        Ok(model)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        Self::from_json(&read_artifact(path)?)
    }

    fn validate(&self) -> Result<(), ModelError> {
        let n = self.coefficients.len();
        if n == 0 {
            return Err(ModelError::Invalid("no coefficients".to_string()));
        }
        if self.feature_means.len() != n || self.feature_stds.len() != n {
            return Err(ModelError::Invalid(format!(
                "{} coefficients but {} means and {} stds",
                n,
                self.feature_means.len(),
                self.feature_stds.len()
            )));
        }
        let all_finite = self
            .coefficients
            .iter()
            .chain(&self.feature_means)
            .chain(&self.feature_stds)
            .all(|v| v.is_finite());
        if !all_finite || !self.intercept.is_finite() {
            return Err(ModelError::Invalid("non-finite weight".to_string()));
        }
        Ok(())
    }
}

impl Classifier for LogisticModel {
    fn num_features(&self) -> usize {
        self.coefficients.len()
    }

    fn predict_proba(&self, features: &[f64]) -> Result<f64, ModelError> {
        if features.len() != self.coefficients.len() {
            return Err(ModelError::FeatureCount {
                expected: self.coefficients.len(),
                actual: features.len(),
            });
        }

        // Zero-variance columns contribute nothing
        let normalized: Array1<f64> = features
            .iter()
            .zip(&self.feature_means)
            .zip(&self.feature_stds)
            .map(|((x, mean), std)| if *std > 1e-10 { (x - mean) / std } else { 0.0 })
            .collect();

        let z = self.intercept + ArrayView1::from(&self.coefficients[..]).dot(&normalized);
        Ok(sigmoid(z))
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
