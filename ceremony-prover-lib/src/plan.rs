//! Declarative ceremony stage plans.
//!
//! A plan is configuration data: an ordered list of stages, each naming the
//! artifacts it consumes and the toolkit operation that produces its output.
//! Changing the shape of a ceremony means editing the plan, never the code.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Where a stage input comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    /// Output of an earlier stage of the same instance.
    Stage(String),
    /// Latest committed version of any store slot.
    Slot(String),
    /// A file on local disk, e.g. a compiled r1cs.
    File(PathBuf),
    /// A value from the run's `external_input` map.
    External(String),
}

impl std::fmt::Display for InputRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InputRef::Stage(s) => write!(f, "stage:{}", s),
            InputRef::Slot(s) => write!(f, "slot:{}", s),
            InputRef::File(p) => write!(f, "file:{}", p.display()),
            InputRef::External(k) => write!(f, "external:{}", k),
        }
    }
}

/// The toolkit operation a stage invokes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageOperation {
    /// Start a new powers-of-tau accumulator.
    PowersOfTauNew { curve: String, power: u32 },
    /// Mix an entropy contribution into the accumulator.
    PowersOfTauContribute { contributor: String },
    /// Turn the accumulator into phase-2 parameters.
    PreparePhase2,
    /// Circuit-specific setup. Inputs: r1cs, final ptau.
    Groth16Setup,
    /// Phase-2 contribution to a zkey.
    ZkeyContribute { contributor: String },
    /// Extract the verification key JSON from a zkey.
    ExportVerificationKey,
}

impl StageOperation {
    /// Number of inputs the operation consumes, in declared order.
    pub fn input_arity(&self) -> usize {
        match self {
            StageOperation::PowersOfTauNew { .. } => 0,
            StageOperation::PowersOfTauContribute { .. }
            | StageOperation::PreparePhase2
            | StageOperation::ZkeyContribute { .. }
            | StageOperation::ExportVerificationKey => 1,
            StageOperation::Groth16Setup => 2,
        }
    }

    pub fn takes_entropy(&self) -> bool {
        matches!(
            self,
            StageOperation::PowersOfTauContribute { .. } | StageOperation::ZkeyContribute { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            StageOperation::PowersOfTauNew { .. } => "powers_of_tau_new",
            StageOperation::PowersOfTauContribute { .. } => "powers_of_tau_contribute",
            StageOperation::PreparePhase2 => "prepare_phase2",
            StageOperation::Groth16Setup => "groth16_setup",
            StageOperation::ZkeyContribute { .. } => "zkey_contribute",
            StageOperation::ExportVerificationKey => "export_verification_key",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageSpec {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    /// Key into `external_input` holding this stage's entropy contribution.
    #[serde(default)]
    pub entropy: Option<String>,
    pub operation: StageOperation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StagePlan {
    pub stages: Vec<StageSpec>,
}

impl StagePlan {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self { stages }
    }

    /// Structural checks only. Whether a referenced artifact actually exists
    /// is decided when the stage runs.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(Error::InvalidPlan("plan has no stages".to_string()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            validate_name(&stage.name)?;
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::InvalidPlan(format!(
                    "duplicate stage name `{}`",
                    stage.name
                )));
            }
            let arity = stage.operation.input_arity();
            if stage.inputs.len() != arity {
                return Err(Error::InvalidPlan(format!(
                    "stage `{}` ({}) takes {} input(s), {} declared",
                    stage.name,
                    stage.operation.name(),
                    arity,
                    stage.inputs.len()
                )));
            }
            match (stage.operation.takes_entropy(), &stage.entropy) {
                (true, None) => {
                    return Err(Error::InvalidPlan(format!(
                        "stage `{}` contributes entropy but names no `entropy` key",
                        stage.name
                    )));
                }
                (false, Some(_)) => {
                    return Err(Error::InvalidPlan(format!(
                        "stage `{}` ({}) does not take entropy",
                        stage.name,
                        stage.operation.name()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn stage(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Store slot that holds a stage's output for a given instance.
pub fn stage_slot(instance_id: &str, stage: &str) -> String {
    format!("{}/{}", instance_id, stage)
}

/// Instance ids and stage names become path-like slot keys.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "`{}` must be 1-128 characters of [A-Za-z0-9._-]",
            name
        )))
    }
}
