use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

use super::features::{FeatureKind, FeatureTable};
use super::model::{read_artifact, Classifier, LogisticModel, ModelError};

/// Feature list and decision threshold shipped next to the model weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub features: Vec<String>,
    pub chosen_threshold: f64,
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        let config: ModelConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ModelError> {
        Self::from_json(&read_artifact(path)?)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.features.is_empty() {
            return Err(ModelError::Invalid("empty feature list".to_string()));
        }
        if !(0.0..=1.0).contains(&self.chosen_threshold) {
            return Err(ModelError::Invalid(format!(
                "threshold {} outside [0, 1]",
                self.chosen_threshold
            )));
        }
        for name in &self.features {
            name.parse::<FeatureKind>()
                .map_err(|e| ModelError::Invalid(e.to_string()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalLabel {
    Buy,
    Hold,
}

impl fmt::Display for SignalLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalLabel::Buy => write!(f, "BUY"),
            SignalLabel::Hold => write!(f, "HOLD"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignalReading {
    pub probability: f64,
    pub threshold: f64,
    pub label: SignalLabel,
    pub as_of: DateTime<Utc>,
}

/// Classifier plus its config: scores the newest feature row.
pub struct SignalModel {
    classifier: Box<dyn Classifier>,
    config: ModelConfig,
}

impl SignalModel {
    pub fn new(classifier: Box<dyn Classifier>, config: ModelConfig) -> Result<Self, ModelError> {
        config.validate()?;
        if classifier.num_features() != config.features.len() {
            return Err(ModelError::FeatureCount {
                expected: classifier.num_features(),
                actual: config.features.len(),
            });
        }
        Ok(Self { classifier, config })
    }

    pub fn load(model_path: &Path, config_path: &Path) -> Result<Self, ModelError> {
        let model = LogisticModel::load(model_path)?;
        let config = ModelConfig::load(config_path)?;
        info!(
            "Loaded signal model with {} features, threshold {:.3}",
            config.features.len(),
            config.chosen_threshold
        );
        Self::new(Box::new(model), config)
    }

    pub fn features(&self) -> &[String] {
        &self.config.features
    }

    pub fn label_for(&self, probability: f64) -> SignalLabel {
        if probability >= self.config.chosen_threshold {
            SignalLabel::Buy
        } else {
            SignalLabel::Hold
        }
    }

    /// Score the most recent row of `table`.
    pub fn evaluate(&self, table: &FeatureTable) -> Result<SignalReading, ModelError> {
        if table.names() != self.config.features.as_slice() {
            return Err(ModelError::FeatureMismatch {
                expected: self.config.features.clone(),
                actual: table.names().to_vec(),
            });
        }

        let (as_of, row) = table.latest().ok_or(ModelError::NoRows)?;
        let probability = self.classifier.predict_proba(row)?;
        if !(0.0..=1.0).contains(&probability) {
            return Err(ModelError::InvalidProbability(probability));
        }

        let label = self.label_for(probability);
        debug!("Signal at {}: p={:.4} -> {}", as_of, probability, label);

        Ok(SignalReading {
            probability,
            threshold: self.config.chosen_threshold,
            label,
            as_of,
        })
    }
}
