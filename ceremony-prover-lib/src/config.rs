use crate::error::{Error, Result};
use crate::plan::{StagePlan, validate_name};
use crate::types::CircuitInfo;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Plan used when a run request does not name one.
pub const DEFAULT_PLAN: &str = "default";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 6 * 60 * 60;
const DEFAULT_PROOF_TIMEOUT_SECS: u64 = 10 * 60;

/// Service configuration, normally read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Root of the parameter store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// The snarkjs executable driven by the toolkit and prover.
    #[serde(default = "default_snarkjs_bin")]
    pub snarkjs_bin: PathBuf,
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_proof_timeout_secs")]
    pub proof_timeout_secs: u64,
    /// Concurrent prover invocations. Defaults to available parallelism.
    #[serde(default)]
    pub prover_workers: Option<usize>,
    /// Log entropy contributions verbatim. Off unless explicitly enabled.
    #[serde(default)]
    pub log_entropy: bool,
    /// Verify every proof against the circuit's verification key before returning it.
    #[serde(default = "default_true")]
    pub verify_proofs: bool,
    #[serde(default)]
    pub plans: BTreeMap<String, StagePlan>,
    #[serde(default)]
    pub circuits: Vec<CircuitInfo>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.to_string()
}

fn default_snarkjs_bin() -> PathBuf {
    PathBuf::from("snarkjs")
}

fn default_stage_timeout_secs() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

fn default_proof_timeout_secs() -> u64 {
    DEFAULT_PROOF_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bind_addr: default_bind_addr(),
            snarkjs_bin: default_snarkjs_bin(),
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            proof_timeout_secs: DEFAULT_PROOF_TIMEOUT_SECS,
            prover_workers: None,
            log_entropy: false,
            verify_proofs: true,
            plans: BTreeMap::new(),
            circuits: Vec::new(),
        }
    }
}

impl ServiceConfig {
    /// Reads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage_timeout_secs == 0 || self.proof_timeout_secs == 0 {
            return Err(Error::ConfigError("timeouts must be positive".to_string()));
        }
        if self.prover_workers == Some(0) {
            return Err(Error::ConfigError(
                "prover_workers must be at least 1".to_string(),
            ));
        }
        for (name, plan) in &self.plans {
            plan.validate()
                .map_err(|e| Error::ConfigError(format!("plan `{}`: {}", name, e)))?;
        }
        let mut names = HashSet::new();
        for circuit in &self.circuits {
            validate_name(&circuit.name)?;
            if !names.insert(circuit.name.as_str()) {
                return Err(Error::ConfigError(format!(
                    "circuit `{}` declared twice",
                    circuit.name
                )));
            }
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn proof_timeout(&self) -> Duration {
        Duration::from_secs(self.proof_timeout_secs)
    }

    pub fn prover_workers(&self) -> usize {
        self.prover_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn plan(&self, name: &str) -> Result<&StagePlan> {
        self.plans
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("stage plan `{}`", name)))
    }
}
