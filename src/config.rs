//! Runtime configuration for act-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Controller modes, host memory budget, codec and simulation knobs live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::codec::SUPPORTED_BITS;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "act-cache", about = "Compressed activation cache training simulator")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "act-cache.json")]
    pub config: PathBuf,

    /// Number of training steps to simulate (overrides the config file).
    #[arg(long)]
    pub steps: Option<usize>,

    /// Quantization bit width (overrides the config file).
    #[arg(long)]
    pub bits: Option<u8>,

    /// Park compressed activations in host memory.
    #[arg(long)]
    pub offload: bool,

    /// Prefetch the previous slot on restore (needs --offload).
    #[arg(long)]
    pub prefetch: bool,

    /// Compress every save independently, without caching.
    #[arg(long)]
    pub bypass: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported bit width {0} (expected one of 1, 2, 4, 8)")]
    UnsupportedBits(u8),

    #[error("Codec group size must be non-zero")]
    ZeroGroupSize,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Controller modes.
    pub controller: ControllerConfig,

    /// Host memory and transfer settings.
    pub transfer: TransferConfig,

    /// Reference codec settings.
    pub codec: CodecConfig,

    /// Synthetic training loop driven by the binary.
    pub simulation: SimulationConfig,
}

/// Construction-time modes of the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Quantization bit width.
    pub bits: u8,

    /// Move compressed payloads to host memory after saving.
    pub offload_to_host: bool,

    /// Compress every save independently, with no cache or dedup.
    pub bypass: bool,

    /// Prefetch the previous slot's payload on restore. Only meaningful
    /// together with `offload_to_host`.
    pub prefetch: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bits: 4,
            offload_to_host: false,
            bypass: false,
            prefetch: false,
        }
    }
}

/// Host memory settings for offloaded payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum bytes of host memory held by offloaded payloads.
    pub host_budget_bytes: usize,

    /// Request page-locked host buffers.
    pub pin_host_memory: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            host_budget_bytes: 8 * 1024 * 1024 * 1024, // 8 GB
            pin_host_memory: true,
        }
    }
}

/// Reference codec settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Elements sharing one min/step pair.
    pub group_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self { group_size: 256 }
    }
}

/// Shape of the synthetic training loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Training steps to run.
    pub steps: usize,

    /// Layers per forward pass; each saves its input.
    pub layers: usize,

    /// Activation shape: batch × channels × height × width.
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,

    /// Every n-th layer saves its input a second time (0 = never).
    pub reuse_every: usize,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            steps: 3,
            layers: 8,
            batch: 4,
            channels: 16,
            height: 8,
            width: 8,
            reuse_every: 2,
        }
    }
}

impl SimulationConfig {
    pub fn activation_shape(&self) -> Vec<usize> {
        vec![self.batch, self.channels, self.height, self.width]
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(steps) = cli.steps {
            self.simulation.steps = steps;
        }
        if let Some(bits) = cli.bits {
            self.controller.bits = bits;
        }
        self.controller.offload_to_host |= cli.offload;
        self.controller.prefetch |= cli.prefetch;
        self.controller.bypass |= cli.bypass;
    }

    /// Reject settings the controller cannot run with, and warn about ones
    /// that have no effect.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !SUPPORTED_BITS.contains(&self.controller.bits) {
            return Err(ConfigError::UnsupportedBits(self.controller.bits));
        }
        if self.codec.group_size == 0 {
            return Err(ConfigError::ZeroGroupSize);
        }
        if self.prefetch_ignored() {
            tracing::warn!("prefetch is set without offload_to_host and will be ignored");
        }
        Ok(())
    }

    /// Prefetch only applies to offloaded payloads.
    pub fn prefetch_ignored(&self) -> bool {
        self.controller.prefetch && !self.controller.offload_to_host
    }

    /// Bytes of one packed activation at the configured bit width.
    pub fn packed_activation_bytes(&self) -> usize {
        let numel: usize = self.simulation.activation_shape().iter().product();
        (numel * self.controller.bits as usize).div_ceil(8)
    }
}
