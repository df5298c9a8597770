//! Generation parameters shared by every backend, plus per-backend settings.
//!
//! Values start from defaults, are overridden by `MODEL_*` environment
//! variables, and finally by a `key=value,key=value` parameter string
//! supplied with a task.

use std::collections::BTreeMap;

use tracing::warn;

use crate::errors::ModelError;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_CLAUDE_MODEL: &str = "claude-3-5-sonnet-latest";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-pro";
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful assistant.";

#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    pub model: String,
    pub system_message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GeminiConfig {
    pub model: String,
    /// Harm category to block threshold, e.g. `harassment` → `block_low`.
    pub safety_settings: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelConfig {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub openai: BackendConfig,
    pub claude: BackendConfig,
    pub gemini: GeminiConfig,
    /// Backends tried after the primary. Empty selects the default chain.
    pub fallback_models: Vec<String>,
    /// Attempts per backend before moving down the chain.
    pub max_retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            openai: BackendConfig {
                model: DEFAULT_OPENAI_MODEL.to_string(),
                system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            },
            claude: BackendConfig {
                model: DEFAULT_CLAUDE_MODEL.to_string(),
                system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
            },
            gemini: GeminiConfig {
                model: DEFAULT_GEMINI_MODEL.to_string(),
                safety_settings: BTreeMap::new(),
            },
            fallback_models: Vec::new(),
            max_retries: 1,
        }
    }
}

impl ModelConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` yields. Out-of-range values
    /// are logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let numeric = [
            ("MODEL_TEMPERATURE", "temperature"),
            ("MODEL_MAX_TOKENS", "max_tokens"),
            ("MODEL_TOP_P", "top_p"),
            ("MODEL_FREQUENCY_PENALTY", "frequency_penalty"),
            ("MODEL_PRESENCE_PENALTY", "presence_penalty"),
            ("MODEL_MAX_RETRIES", "max_retries"),
        ];
        for (var, key) in numeric {
            if let Some(value) = get(var)
                && let Err(e) = config.apply(key, value.trim())
            {
                warn!(error = ?e, variable = var, "Ignoring invalid model setting");
            }
        }

        if let Some(value) = get("MODEL_FALLBACK_MODELS") {
            config.fallback_models = split_list(&value, ',');
        }
        if let Some(value) = get("OPENAI_MODEL") {
            config.openai.model = value;
        }
        if let Some(value) = get("OPENAI_SYSTEM_MESSAGE") {
            config.openai.system_message = value;
        }
        if let Some(value) = get("CLAUDE_MODEL") {
            config.claude.model = value;
        }
        if let Some(value) = get("CLAUDE_SYSTEM_MESSAGE") {
            config.claude.system_message = value;
        }
        if let Some(value) = get("GEMINI_MODEL") {
            config.gemini.model = value;
        }
        if let Some(value) = get("GEMINI_SAFETY_SETTINGS") {
            for setting in value.split(',') {
                if let Some((category, level)) = setting.split_once('=') {
                    config
                        .gemini
                        .safety_settings
                        .insert(category.trim().to_string(), level.trim().to_string());
                }
            }
        }

        config
    }

    /// Applies a `key=value,key=value` parameter string. Shared keys are
    /// applied before `<backend>.<key>` keys, so a backend-scoped value wins
    /// over a shared one regardless of order.
    pub fn apply_params(&mut self, params: &str) -> Result<(), ModelError> {
        let pairs = parse_model_params(params)?;
        let (scoped, shared): (Vec<_>, Vec<_>) =
            pairs.into_iter().partition(|(key, _)| key.contains('.'));

        for (key, value) in shared.iter().chain(scoped.iter()) {
            self.apply(key, value)?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ModelError> {
        match key {
            "temperature" => self.temperature = parse_in_range(key, value, 0.0, 1.0)?,
            "max_tokens" | "maxtokens" => {
                let tokens: u32 = value.parse().map_err(|_| invalid(key, value))?;
                if tokens == 0 {
                    return Err(ModelError::InvalidParameter {
                        key: key.to_string(),
                        details: "must be positive".to_string(),
                    });
                }
                self.max_tokens = tokens;
            }
            "top_p" | "topp" => self.top_p = parse_in_range(key, value, 0.0, 1.0)?,
            "frequency_penalty" | "frequencypenalty" => {
                self.frequency_penalty = parse_in_range(key, value, -2.0, 2.0)?
            }
            "presence_penalty" | "presencepenalty" => {
                self.presence_penalty = parse_in_range(key, value, -2.0, 2.0)?
            }
            "max_retries" | "maxretries" => {
                let retries: u32 = value.parse().map_err(|_| invalid(key, value))?;
                if retries == 0 {
                    return Err(ModelError::InvalidParameter {
                        key: key.to_string(),
                        details: "must be at least 1".to_string(),
                    });
                }
                self.max_retries = retries;
            }
            // Commas separate parameters, so the list uses `|` or `;`.
            "fallback_models" | "fallback" => {
                self.fallback_models = split_list(value, '|')
                    .into_iter()
                    .flat_map(|part| split_list(&part, ';'))
                    .collect();
            }
            "model" => {
                self.openai.model = value.to_string();
                self.claude.model = value.to_string();
                self.gemini.model = value.to_string();
            }
            "system_message" | "systemmessage" => {
                self.openai.system_message = value.to_string();
                self.claude.system_message = value.to_string();
            }
            "openai.model" => self.openai.model = value.to_string(),
            "openai.system_message" | "openai.systemmessage" => {
                self.openai.system_message = value.to_string()
            }
            "claude.model" => self.claude.model = value.to_string(),
            "claude.system_message" | "claude.systemmessage" => {
                self.claude.system_message = value.to_string()
            }
            "gemini.model" => self.gemini.model = value.to_string(),
            "gemini.safety_setting" | "gemini.safetysetting" => {
                let (category, level) = value.split_once('=').ok_or_else(|| {
                    ModelError::InvalidParameter {
                        key: key.to_string(),
                        details: format!("expected category=level, got {}", value),
                    }
                })?;
                self.gemini
                    .safety_settings
                    .insert(category.trim().to_string(), level.trim().to_string());
            }
            other => {
                return Err(ModelError::InvalidParameter {
                    key: other.to_string(),
                    details: "unrecognized parameter".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        check_range("temperature", self.temperature, 0.0, 1.0)?;
        check_range("top_p", self.top_p, 0.0, 1.0)?;
        check_range("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        check_range("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        if self.max_tokens == 0 {
            return Err(ModelError::InvalidParameter {
                key: "max_tokens".to_string(),
                details: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Splits `key=value,key=value` into trimmed pairs with lower-cased keys.
/// Only the first `=` separates, so `gemini.safety_setting=harassment=none`
/// keeps its nested assignment.
pub fn parse_model_params(params: &str) -> Result<Vec<(String, String)>, ModelError> {
    if params.trim().is_empty() {
        return Ok(Vec::new());
    }

    params
        .split(',')
        .map(|pair| {
            let (key, value) = pair.split_once('=').ok_or_else(|| ModelError::InvalidParameter {
                key: pair.trim().to_string(),
                details: "expected key=value".to_string(),
            })?;
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(ModelError::InvalidParameter {
                    key,
                    details: "empty parameter name".to_string(),
                });
            }
            Ok((key, value.trim().to_string()))
        })
        .collect()
}

fn parse_in_range(key: &str, value: &str, min: f64, max: f64) -> Result<f64, ModelError> {
    let parsed: f64 = value.parse().map_err(|_| invalid(key, value))?;
    check_range(key, parsed, min, max)?;
    Ok(parsed)
}

fn check_range(key: &str, value: f64, min: f64, max: f64) -> Result<(), ModelError> {
    if !(min..=max).contains(&value) {
        return Err(ModelError::InvalidParameter {
            key: key.to_string(),
            details: format!("must be between {} and {}, got {}", min, max, value),
        });
    }
    Ok(())
}

fn invalid(key: &str, value: &str) -> ModelError {
    ModelError::InvalidParameter {
        key: key.to_string(),
        details: format!("invalid value {:?}", value),
    }
}

fn split_list(value: &str, separator: char) -> Vec<String> {
    value
        .split(separator)
        .map(|part| part.trim().to_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_temperature_boundaries() {
        for ok in ["0.0", "1.0", "0.5"] {
            let mut config = ModelConfig::default();
            assert!(config.apply_params(&format!("temperature={}", ok)).is_ok(), "{}", ok);
        }
        for bad in ["-0.0001", "1.0001", "warm"] {
            let mut config = ModelConfig::default();
            assert!(config.apply_params(&format!("temperature={}", bad)).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_penalty_and_token_ranges() {
        let mut config = ModelConfig::default();
        config
            .apply_params("frequency_penalty=-2,presence_penalty=2.0,max_tokens=10,top_p=0")
            .unwrap();
        assert_eq!(config.frequency_penalty, -2.0);
        assert_eq!(config.max_tokens, 10);
        assert!(config.apply_params("presence_penalty=2.1").is_err());
        assert!(config.apply_params("max_tokens=0").is_err());
        assert!(config.apply_params("max_tokens=-5").is_err());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scoped_model_wins_over_shared() {
        let mut config = ModelConfig::default();
        config
            .apply_params("openai.model=gpt-4,model=generic-model")
            .unwrap();
        assert_eq!(config.openai.model, "gpt-4");
        assert_eq!(config.claude.model, "generic-model");
        assert_eq!(config.gemini.model, "generic-model");
    }

    #[test]
    fn test_safety_settings_accumulate() {
        let mut config = ModelConfig::default();
        config
            .apply_params(
                "gemini.safety_setting=harassment=block_low,gemini.safety_setting=hate_speech=none",
            )
            .unwrap();
        assert_eq!(config.gemini.safety_settings.len(), 2);
        assert_eq!(config.gemini.safety_settings["hate_speech"], "none");
        assert!(config.apply_params("gemini.safety_setting=oops").is_err());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_model_params("").unwrap().is_empty());
        assert!(parse_model_params("temperature").is_err());
        assert!(parse_model_params("=1").is_err());
        let mut config = ModelConfig::default();
        assert!(config.apply_params("mystery=1").is_err());
        assert!(config.apply_params("bard.model=x").is_err());
    }

    #[test]
    fn test_fallback_and_retries_params() {
        let mut config = ModelConfig::default();
        config
            .apply_params("fallback_models=Gemini|claude,max_retries=3")
            .unwrap();
        assert_eq!(config.fallback_models, vec!["gemini", "claude"]);
        assert_eq!(config.max_retries, 3);
        assert!(config.apply_params("max_retries=0").is_err());
    }

    #[test]
    fn test_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MODEL_TEMPERATURE", "0.2"),
            ("MODEL_TOP_P", "7"),
            ("OPENAI_MODEL", "gpt-4o"),
            ("CLAUDE_SYSTEM_MESSAGE", "Be terse."),
            ("GEMINI_SAFETY_SETTINGS", "harassment=block_low, violence = none"),
            ("MODEL_FALLBACK_MODELS", "gemini"),
        ]);
        let config = ModelConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.temperature, 0.2);
        // Out of range, ignored.
        assert_eq!(config.top_p, 1.0);
        assert_eq!(config.openai.model, "gpt-4o");
        assert_eq!(config.claude.system_message, "Be terse.");
        assert_eq!(config.gemini.safety_settings["violence"], "none");
        assert_eq!(config.fallback_models, vec!["gemini"]);
    }
}
