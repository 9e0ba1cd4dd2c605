use std::sync::LazyLock;

use regex::Regex;

use crate::emulation::model::{EmulationMode, EmulationRequest};
use crate::error::{DittoError, Result};

static TECHNIQUE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^T\d{4}$").expect("valid regex"));

/// Decides whether a string names a known technique.
pub trait TechniqueValidator: Send + Sync {
    fn is_valid(&self, technique_id: &str) -> bool;
}

/// Accepts anything shaped like a technique id (`T` followed by four digits)
/// without consulting a catalog.
#[derive(Debug, Clone)]
pub struct PatternTechniqueValidator {
    pattern: Regex,
}

impl Default for PatternTechniqueValidator {
    fn default() -> Self {
        Self {
            pattern: TECHNIQUE_ID.clone(),
        }
    }
}

impl PatternTechniqueValidator {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .map_err(|e| DittoError::Validation(format!("invalid technique pattern: {}", e)))?;
        Ok(Self { pattern })
    }
}

impl TechniqueValidator for PatternTechniqueValidator {
    fn is_valid(&self, technique_id: &str) -> bool {
        self.pattern.is_match(technique_id)
    }
}

/// Check the request shape before any job is created.
pub fn validate_request(
    request: &EmulationRequest,
    validator: &dyn TechniqueValidator,
) -> Result<()> {
    let target = request.target.trim();
    match request.mode {
        EmulationMode::Tactic => {
            if target.is_empty() {
                return Err(DittoError::Validation("tactic name is required".to_string()));
            }
        }
        EmulationMode::Technique => {
            if target.is_empty() {
                return Err(DittoError::Validation("technique ID is required".to_string()));
            }
            if !validator.is_valid(target) {
                return Err(DittoError::Validation(format!(
                    "invalid technique ID: {}",
                    target
                )));
            }
        }
        EmulationMode::Custom => {
            for technique in target.split(',').map(str::trim) {
                if !validator.is_valid(technique) {
                    return Err(DittoError::Validation(format!(
                        "invalid technique ID in chain: {}",
                        technique
                    )));
                }
            }
        }
    }

    if let Some(numbers) = &request.test_numbers {
        for number in numbers.split(',').map(str::trim) {
            if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
                return Err(DittoError::Validation(format!(
                    "invalid test number: {}",
                    number
                )));
            }
        }
    }
    Ok(())
}
