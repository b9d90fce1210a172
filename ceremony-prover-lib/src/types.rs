use crate::plan::{InputRef, StageOperation, StagePlan};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use std::fmt;
use std::path::PathBuf;

// Identifier for one run of a ceremony pipeline
pub type InstanceId = String;

// Identifier for a registered circuit
pub type CircuitName = String;

/// Lifecycle of a ceremony instance.
///
/// `Pending -> InProgress -> {Complete | Failed}`. `Failed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CeremonyStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Done,
    Failed,
}

/// One step of a ceremony instance, as last recorded by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub name: String,
    pub input_refs: Vec<InputRef>,
    pub operation: StageOperation,
    /// External-input key the stage draws entropy from.
    pub entropy_key: Option<String>,
    pub output_ref: Option<ArtifactRef>,
    pub status: StageStatus,
    /// Failure message for a `Failed` stage.
    pub error: Option<String>,
}

/// One run of a stage plan, keyed by `instance_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CeremonyInstance {
    pub instance_id: InstanceId,
    pub plan: String,
    pub stages: Vec<StageRecord>,
    pub status: CeremonyStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl CeremonyInstance {
    /// Plans a fresh instance: every stage starts `NotStarted`.
    pub fn new(instance_id: InstanceId, plan_name: &str, plan: &StagePlan) -> Self {
        let now = unix_now();
        Self {
            instance_id,
            plan: plan_name.to_string(),
            stages: plan
                .stages
                .iter()
                .map(|spec| StageRecord {
                    name: spec.name.clone(),
                    input_refs: spec.inputs.clone(),
                    operation: spec.operation.clone(),
                    entropy_key: spec.entropy.clone(),
                    output_ref: None,
                    status: StageStatus::NotStarted,
                    error: None,
                })
                .collect(),
            status: CeremonyStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Names of stages whose output is committed, in plan order.
    pub fn completed_stages(&self) -> Vec<String> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Done)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = unix_now();
    }
}

/// Reference to one committed version of an artifact slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtifactRef {
    pub slot: String,
    pub version: u64,
    /// Hex SHA-256 of the artifact bytes.
    pub digest: String,
    pub size: u64,
}

/// Address an artifact either by slot (latest version) or by exact reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocator {
    Slot(String),
    Ref(ArtifactRef),
}

impl From<&str> for ArtifactLocator {
    fn from(slot: &str) -> Self {
        ArtifactLocator::Slot(slot.to_string())
    }
}

impl From<String> for ArtifactLocator {
    fn from(slot: String) -> Self {
        ArtifactLocator::Slot(slot)
    }
}

impl From<ArtifactRef> for ArtifactLocator {
    fn from(r: ArtifactRef) -> Self {
        ArtifactLocator::Ref(r)
    }
}

impl From<&ArtifactRef> for ArtifactLocator {
    fn from(r: &ArtifactRef) -> Self {
        ArtifactLocator::Ref(r.clone())
    }
}

// Information stored about a registered circuit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitInfo {
    pub name: CircuitName,
    #[serde(default)]
    pub description: Option<String>,
    // Store slot holding the finalized proving key (zkey)
    pub parameter_slot: String,
    // Ceremony instance that produces the proving key, if any
    #[serde(default)]
    pub ceremony_instance: Option<InstanceId>,
    // Compiled witness generator
    pub wasm_path: PathBuf,
    // Store slot holding the verification key JSON
    #[serde(default)]
    pub verification_key_slot: Option<String>,
}

/// Server-generated single-use value attached to every proof job.
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(#[serde_as(as = "Hex")] pub [u8; 24]);

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self)
    }
}

/// A caller's request for a proof. Carries no nonce: the service mints one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProofRequest {
    pub circuit_name: CircuitName,
    pub circuit_input: serde_json::Value,
    #[serde(default)]
    pub entropy_contribution: Option<String>,
}

// The generated proof and public inputs
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProofResult {
    pub circuit_name: CircuitName,
    pub nonce: Nonce,
    #[serde_as(as = "Hex")]
    pub proof_artifact: Vec<u8>,
    pub public_signals: Vec<String>,
}

/// Renders an entropy contribution for logs.
pub struct EntropyDisplay<'a> {
    value: &'a str,
    reveal: bool,
}

impl<'a> EntropyDisplay<'a> {
    pub fn new(value: &'a str, reveal: bool) -> Self {
        Self { value, reveal }
    }
}

impl fmt::Display for EntropyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reveal {
            write!(f, "{:?}", self.value)
        } else {
            write!(f, "<redacted {} bytes>", self.value.len())
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_serializes_as_hex() {
        let nonce = Nonce([0xab; 24]);
        let json = serde_json::to_string(&nonce).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(24)));
        let back: Nonce = serde_json::from_str(&json).unwrap();
        assert_eq!(back, nonce);
        assert!(serde_json::from_str::<Nonce>("\"abcd\"").is_err());
        let not_hex = format!("\"{}\"", "zz".repeat(24));
        assert!(serde_json::from_str::<Nonce>(&not_hex).is_err());
    }

    #[test]
    fn proof_request_rejects_caller_nonce() {
        let body = serde_json::json!({
            "circuit_name": "domain",
            "circuit_input": {"a": 1},
            "nonce": "00"
        });
        assert!(serde_json::from_value::<ProofRequest>(body).is_err());
    }

    #[test]
    fn entropy_is_redacted_unless_revealed() {
        assert_eq!(
            EntropyDisplay::new("secret words", false).to_string(),
            "<redacted 12 bytes>"
        );
        assert_eq!(EntropyDisplay::new("hi", true).to_string(), "\"hi\"");
    }
}
