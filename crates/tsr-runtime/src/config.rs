use std::fmt;

use serde::{Deserialize, Serialize};

/// Tiling scheme names accepted by `default_tiling`.
pub const KNOWN_TILINGS: [&str; 3] = ["row", "column", "sym"];

const ENV_PREFIX: &str = "TESSERA_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub num_localities: usize,
    pub locality_id: usize,
    pub default_tiling: String,
    pub log_filter: String,
    pub random_seed: Option<u64>,
    pub evidence_capacity: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_localities: 1,
            locality_id: 0,
            default_tiling: "row".to_string(),
            log_filter: "info".to_string(),
            random_seed: None,
            evidence_capacity: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidJson { diagnostic: String },
    InvalidValue { key: String, value: String },
    NoLocalities,
    LocalityOutOfRange {
        locality_id: usize,
        num_localities: usize,
    },
    UnknownTiling { name: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidJson { diagnostic } => write!(f, "invalid config json: {diagnostic}"),
            Self::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: '{value}'")
            }
            Self::NoLocalities => write!(f, "num_localities must be at least 1"),
            Self::LocalityOutOfRange {
                locality_id,
                num_localities,
            } => write!(
                f,
                "locality_id {locality_id} out of range for {num_localities} localities"
            ),
            Self::UnknownTiling { name } => write!(
                f,
                "unknown tiling '{name}', expected one of {}",
                KNOWN_TILINGS.join("/")
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    pub fn from_json_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(input).map_err(|error| ConfigError::InvalidJson {
                diagnostic: error.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `TESSERA_*` keys through `lookup`; absent keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            let key = format!("{ENV_PREFIX}{key}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("NUM_LOCALITIES") {
            config.num_localities = parse_number(&key, &value)?;
        }
        if let Some((key, value)) = get("LOCALITY_ID") {
            config.locality_id = parse_number(&key, &value)?;
        }
        if let Some((_, value)) = get("DEFAULT_TILING") {
            config.default_tiling = value.trim().to_string();
        }
        if let Some((_, value)) = get("LOG_FILTER") {
            config.log_filter = value;
        }
        if let Some((key, value)) = get("RANDOM_SEED") {
            config.random_seed = Some(parse_number(&key, &value)?);
        }
        if let Some((key, value)) = get("EVIDENCE_CAPACITY") {
            config.evidence_capacity = Some(parse_number(&key, &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_localities == 0 {
            return Err(ConfigError::NoLocalities);
        }
        if self.locality_id >= self.num_localities {
            return Err(ConfigError::LocalityOutOfRange {
                locality_id: self.locality_id,
                num_localities: self.num_localities,
            });
        }
        if !KNOWN_TILINGS.contains(&self.default_tiling.as_str()) {
            return Err(ConfigError::UnknownTiling {
                name: self.default_tiling.clone(),
            });
        }
        Ok(())
    }

    /// Same settings for another locality of the same world.
    #[must_use]
    pub fn for_locality(&self, locality_id: usize, num_localities: usize) -> Self {
        Self {
            locality_id,
            num_localities,
            ..self.clone()
        }
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{ConfigError, EngineConfig};

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_single_locality_row_tiling() {
        let config = EngineConfig::default();
        assert_eq!(config.num_localities, 1);
        assert_eq!(config.locality_id, 0);
        assert_eq!(config.default_tiling, "row");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_json_str(r#"{"num_localities": 4, "locality_id": 3}"#)
            .expect("valid config");
        assert_eq!(config.num_localities, 4);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn json_rejects_unknown_fields() {
        let err = EngineConfig::from_json_str(r#"{"threads": 8}"#).expect_err("unknown field");
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn lookup_reads_prefixed_keys() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("TESSERA_NUM_LOCALITIES", "3"),
            ("TESSERA_LOCALITY_ID", "1"),
            ("TESSERA_DEFAULT_TILING", "sym"),
            ("TESSERA_RANDOM_SEED", "42"),
        ]))
        .expect("valid lookup");
        assert_eq!(config.num_localities, 3);
        assert_eq!(config.locality_id, 1);
        assert_eq!(config.default_tiling, "sym");
        assert_eq!(config.random_seed, Some(42));
        assert_eq!(config.evidence_capacity, None);
    }

    #[test]
    fn lookup_rejects_malformed_numbers() {
        let err = EngineConfig::from_lookup(lookup_from(&[("TESSERA_NUM_LOCALITIES", "many")]))
            .expect_err("non-numeric");
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: "TESSERA_NUM_LOCALITIES".to_string(),
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn validation_enforces_locality_range_and_tiling() {
        let err = EngineConfig::from_json_str(r#"{"num_localities": 0}"#).expect_err("zero");
        assert_eq!(err, ConfigError::NoLocalities);

        let err = EngineConfig::from_json_str(r#"{"num_localities": 2, "locality_id": 5}"#)
            .expect_err("out of range");
        assert!(matches!(err, ConfigError::LocalityOutOfRange { .. }));

        let err = EngineConfig::from_json_str(r#"{"default_tiling": "diagonal"}"#)
            .expect_err("unknown tiling");
        assert!(err.to_string().contains("row/column/sym"));
    }
}
