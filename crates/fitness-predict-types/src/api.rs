// HTTP request/response bodies and input validation

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// JSON body returned for every error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            status: "error".to_string(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

/// Body of the tabular prediction endpoint. `features` stays untyped so a
/// wrong shape becomes a 400 with a useful message instead of a parse error.
#[derive(Debug, Default, Deserialize)]
pub struct TabularRequest {
    #[serde(default)]
    pub features: Option<Value>,
}

/// Caller-side input errors, rejected before any resource is acquired.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LaunchError {
    #[error("Features array is required")]
    MissingFeatures,
    #[error("Features must be an array of numbers")]
    InvalidFeatures,
    #[error("Image file is required")]
    MissingImage,
}

impl LaunchError {
    pub fn http_status(&self) -> u16 {
        400
    }
}

/// Check that `features` is present and is an array of numbers.
pub fn validate_features(features: Option<&Value>) -> Result<Vec<Number>, LaunchError> {
    let items = match features {
        None | Some(Value::Null) => return Err(LaunchError::MissingFeatures),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(LaunchError::InvalidFeatures),
    };

    items
        .iter()
        .map(|item| match item {
            Value::Number(n) => Ok(n.clone()),
            _ => Err(LaunchError::InvalidFeatures),
        })
        .collect()
}
