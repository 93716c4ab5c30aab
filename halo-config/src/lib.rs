use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

// --- Error Type ---
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

// --- Enums for Choices ---

/// Encoding used for payloads exchanged between nodes.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    Json,
    #[default]
    Binary,
}

/// Decomposition scheme used to distribute particles.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecompositionKind {
    /// One cell per node, ownership by particle id.
    #[default]
    Atom,
}

/// Where particles start out before the first resort.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Every particle starts on rank 0 and is migrated by the first resort.
    #[default]
    AllOnRoot,
    /// Every particle starts on its owning rank.
    Scattered,
}

// --- Configuration Sections ---

#[derive(Deserialize, Debug, Clone)]
pub struct ParticleSetup {
    pub count: u32,
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub placement: Placement,
    /// Every n-th particle is created fixed (0 disables).
    #[serde(default)]
    pub fixed_every: u32,
}

fn default_max_speed() -> f64 { 1.0 }

#[derive(Deserialize, Debug, Clone)]
pub struct ResortPolicy {
    /// Verlet skin; a global resort is triggered once any particle moved
    /// more than half of it.
    #[serde(default = "default_skin")]
    pub skin: f64,
    /// Force a global resort every n steps regardless of displacement.
    #[serde(default)]
    pub interval: Option<u64>,
}

fn default_skin() -> f64 { 0.4 }

impl Default for ResortPolicy {
    fn default() -> Self {
        Self {
            skin: default_skin(),
            interval: None,
        }
    }
}

// --- Top-Level Config Struct ---

#[derive(Deserialize, Debug, Clone)]
pub struct RunConfig {
    pub nodes: usize,
    pub box_length: [f64; 3],
    #[serde(default = "default_periodic")]
    pub periodic: [bool; 3],
    pub particles: ParticleSetup,
    pub steps: u64,
    pub time_step: f64,
    #[serde(default)]
    pub resort: ResortPolicy,
    #[serde(default)]
    pub interaction_cutoff: f64,
    #[serde(default)]
    pub codec: CodecKind,
    #[serde(default)]
    pub decomposition: DecompositionKind,
}

fn default_periodic() -> [bool; 3] { [true; 3] }

impl RunConfig {
    /// Checks every field for values the decomposition cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes == 0 {
            return Err(ConfigError::Validation("Node count must be at least 1.".to_string()));
        }

        if self.box_length.iter().any(|l| !l.is_finite() || *l <= 0.0) {
            return Err(ConfigError::Validation(format!(
                "Box lengths must be positive and finite, got {:?}.",
                self.box_length
            )));
        }

        if !self.time_step.is_finite() || self.time_step <= 0.0 {
            return Err(ConfigError::Validation("Time step must be positive.".to_string()));
        }

        if !self.particles.max_speed.is_finite() || self.particles.max_speed < 0.0 {
            return Err(ConfigError::Validation("Maximum speed cannot be negative.".to_string()));
        }

        if !self.resort.skin.is_finite() || self.resort.skin < 0.0 {
            return Err(ConfigError::Validation("Verlet skin cannot be negative.".to_string()));
        }

        if self.resort.interval == Some(0) {
            return Err(ConfigError::Validation("Resort interval cannot be zero.".to_string()));
        }

        if self.interaction_cutoff.is_nan() || self.interaction_cutoff < 0.0 {
            return Err(ConfigError::Validation("Interaction cutoff cannot be negative.".to_string()));
        }

        Ok(())
    }
}

// --- Loading Function ---

/// Loads and validates a run configuration. Files ending in `.toml` are
/// parsed as TOML, everything else as JSON.
pub fn load_config(path: &Path) -> Result<RunConfig, ConfigError> {
    let content = fs::read_to_string(path)?;

    let config: RunConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    const VALID_JSON: &str = r#"{
      "nodes": 3,
      "box_length": [10.0, 10.0, 10.0],
      "particles": { "count": 9 },
      "steps": 100,
      "time_step": 0.01
    }"#;

    fn write_temp(content: &str, suffix: &str) -> NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        write!(file, "{}", content).unwrap();
        file
    }

    #[test]
    fn load_valid_json_with_defaults() {
        let file = write_temp(VALID_JSON, ".json");
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.nodes, 3);
        assert_eq!(config.particles.count, 9);
        assert_eq!(config.particles.placement, Placement::AllOnRoot);
        assert_eq!(config.periodic, [true; 3]);
        assert_eq!(config.codec, CodecKind::Binary);
        assert_eq!(config.decomposition, DecompositionKind::Atom);
        assert_eq!(config.resort.interval, None);
        assert_eq!(config.resort.skin, 0.4);
    }

    #[test]
    fn load_valid_toml() {
        let content = r#"
            nodes = 2
            box_length = [4.0, 4.0, 4.0]
            steps = 10
            time_step = 0.005
            codec = "json"

            [particles]
            count = 16
            placement = "scattered"
            seed = 7

            [resort]
            skin = 0.2
            interval = 5
        "#;
        let file = write_temp(content, ".toml");
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.nodes, 2);
        assert_eq!(config.codec, CodecKind::Json);
        assert_eq!(config.particles.placement, Placement::Scattered);
        assert_eq!(config.particles.seed, Some(7));
        assert_eq!(config.resort.interval, Some(5));
    }

    #[test]
    fn zero_nodes_rejected() {
        let file = write_temp(&VALID_JSON.replace("\"nodes\": 3", "\"nodes\": 0"), ".json");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn negative_box_rejected() {
        let file = write_temp(
            &VALID_JSON.replace("[10.0, 10.0, 10.0]", "[10.0, -1.0, 10.0]"),
            ".json",
        );
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let file = write_temp("{ \"nodes\": ", ".json");
        let result = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::JsonParse(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = load_config(Path::new("/definitely/not/here.json"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
