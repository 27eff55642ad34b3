//! Solver configuration: the `SpmvAlgorithm`/`SpmvStrategy` choices and CG
//! stopping criteria, loadable from a TOML file so a deployment doesn't
//! need a recompile to retune tolerances or switch overlap strategies.

use serde::{Deserialize, Serialize};

use crate::cg::CgOptions;
use crate::device::SpmvAlgorithm;
use crate::error::{Result, SolverError};

/// Which [`crate::spmv::SpmvStrategy`] the driver should construct.
/// Separate from [`SpmvAlgorithm`] (which picks the per-neighbour kernel
/// variant): this picks the overlap strategy across neighbours and the
/// subblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    GpuPackingCam,
    Split1,
    Split2,
    Split3,
}

impl Default for StrategyKind {
    fn default() -> Self {
        StrategyKind::Split1
    }
}

/// Which [`SpmvAlgorithm`] the local (self) block versus every other
/// neighbour block should use. Mirrors [`crate::device::default_algorithm`]
/// as the built-in default, expressed as data so it is configurable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(default = "default_local_algorithm")]
    pub local: AlgorithmChoice,
    #[serde(default = "default_remote_algorithm")]
    pub remote: AlgorithmChoice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmChoice {
    Adaptive,
    Stream,
}

impl From<AlgorithmChoice> for SpmvAlgorithm {
    fn from(choice: AlgorithmChoice) -> Self {
        match choice {
            AlgorithmChoice::Adaptive => SpmvAlgorithm::Adaptive,
            AlgorithmChoice::Stream => SpmvAlgorithm::Stream,
        }
    }
}

fn default_local_algorithm() -> AlgorithmChoice {
    AlgorithmChoice::Adaptive
}

fn default_remote_algorithm() -> AlgorithmChoice {
    AlgorithmChoice::Stream
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            local: default_local_algorithm(),
            remote: default_remote_algorithm(),
        }
    }
}

impl AlgorithmConfig {
    /// The `algorithm_for` closure input [`crate::matrix::DistributedMatrix::from_csr`]
    /// expects: slot 0 uses `local`, every other slot uses `remote`.
    pub fn algorithm_for(&self, neighbour_index: usize) -> SpmvAlgorithm {
        if neighbour_index == 0 {
            self.local.into()
        } else {
            self.remote.into()
        }
    }
}

/// Top-level solver configuration, deserializable from a TOML file with
/// sections `[cg]`, `[algorithm]`, and a top-level `strategy` key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    #[serde(default)]
    pub cg: CgConfig,
}

/// Mirrors [`CgOptions`] field-for-field; kept as a separate type so
/// `serde` derives stay independent of the hot-path struct's layout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CgConfig {
    #[serde(default = "default_relative_tolerance")]
    pub relative_tolerance: f64,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_relative_tolerance() -> f64 {
    1e-8
}

fn default_max_iterations() -> u32 {
    1000
}

impl Default for CgConfig {
    fn default() -> Self {
        Self {
            relative_tolerance: default_relative_tolerance(),
            max_iterations: default_max_iterations(),
        }
    }
}

impl From<CgConfig> for CgOptions {
    fn from(cfg: CgConfig) -> Self {
        CgOptions {
            relative_tolerance: cfg.relative_tolerance,
            max_iterations: cfg.max_iterations,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            algorithm: AlgorithmConfig::default(),
            cg: CgConfig::default(),
        }
    }
}

impl SolverConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SolverError::Configuration(format!("failed to parse solver configuration: {e}")))
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn cg_options(&self) -> CgOptions {
        self.cg.into()
    }
}
