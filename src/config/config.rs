use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DynamicsError, DynamicsResult};

/// Construction parameters for [`crate::LatentDynamicsModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicsConfig {
    /// Width of the latent observation vector.
    pub latent_state_dim: usize,
    /// Width of the one-hot action vector (size of the action space).
    pub action_dim: usize,
    /// Predict an offset added to the input latent instead of the absolute next latent.
    #[serde(default)]
    pub delta_mode: bool,
    /// Device spec (`cpu`, `cuda:0`, `metal`, ...). `None` picks the best available.
    #[serde(default)]
    pub device: Option<String>,
}

impl DynamicsConfig {
    pub fn new(latent_state_dim: usize, action_dim: usize) -> Self {
        Self {
            latent_state_dim,
            action_dim,
            delta_mode: false,
            device: None,
        }
    }

    pub fn with_delta_mode(mut self, delta_mode: bool) -> Self {
        self.delta_mode = delta_mode;
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Both dimensions must be positive.
    pub fn validate(&self) -> DynamicsResult<()> {
        if self.latent_state_dim == 0 {
            return Err(DynamicsError::invalid_config("latent_state_dim must be > 0"));
        }
        if self.action_dim == 0 {
            return Err(DynamicsError::invalid_config("action_dim must be > 0"));
        }
        Ok(())
    }

    pub fn from_json_str(text: &str) -> DynamicsResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> DynamicsResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parse `[latent_dim] [action_dim] ... [--delta] [--device <spec>] [--config <file.json>]`.
    ///
    /// A `--config` file provides the base values; positional dims and flags override it.
    /// Positionals after the two dims are returned untouched for the caller.
    pub fn from_args_after(args: &[String]) -> DynamicsResult<(Self, Vec<String>)> {
        let mut config_path = None;
        let mut device = None;
        let mut delta = false;
        let mut positional = Vec::new();
        let mut i = 0usize;
        while i < args.len() {
            match args[i].as_str() {
                "--delta" => {
                    delta = true;
                    i += 1;
                }
                "--device" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| DynamicsError::invalid_config("--device requires a value"))?;
                    device = Some(value.clone());
                    i += 2;
                }
                "--config" => {
                    let value = args
                        .get(i + 1)
                        .ok_or_else(|| DynamicsError::invalid_config("--config requires path"))?;
                    config_path = Some(PathBuf::from(value));
                    i += 2;
                }
                _ => {
                    positional.push(args[i].clone());
                    i += 1;
                }
            }
        }

        let mut config = match config_path {
            Some(ref p) => Self::from_json_file(p)?,
            None => Self::new(16, 4),
        };
        if let Some(v) = positional.first() {
            config.latent_state_dim = parse_dim(v, "latent_dim")?;
        }
        if let Some(v) = positional.get(1) {
            config.action_dim = parse_dim(v, "action_dim")?;
        }
        if delta {
            config.delta_mode = true;
        }
        if device.is_some() {
            config.device = device;
        }
        config.validate()?;
        let rest = positional.into_iter().skip(2).collect();
        Ok((config, rest))
    }
}

fn parse_dim(value: &str, name: &str) -> DynamicsResult<usize> {
    value
        .parse()
        .map_err(|_| DynamicsError::invalid_config(format!("{name} must be an integer, got {value:?}")))
}
