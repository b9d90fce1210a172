//! Boundary to the external cryptographic toolkit.
//!
//! The orchestrator and the proof service only see the two traits below. The
//! snarkjs implementations drive the `snarkjs` CLI as a child process in a
//! private scratch directory; every exit status is checked, and dropping the
//! returned future kills the child.

use crate::error::{Error, Result};
use crate::plan::StageOperation;
use crate::types::{CircuitInfo, InstanceId, Nonce};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

const OUTPUT_TAIL_BYTES: usize = 512;

/// Everything a toolkit needs to run one ceremony stage.
#[derive(Debug, Clone)]
pub struct StageInvocation {
    pub instance_id: InstanceId,
    pub stage: String,
    pub operation: StageOperation,
    /// Input artifacts, in the order the stage declares them.
    pub inputs: Vec<Vec<u8>>,
    /// Untrusted caller entropy, forwarded verbatim.
    pub entropy: Option<String>,
}

#[async_trait]
pub trait CeremonyToolkit: Send + Sync {
    /// Runs one stage and returns its output artifact.
    ///
    /// May take minutes. Dropping the future must abort the work.
    async fn execute(&self, invocation: StageInvocation) -> Result<Vec<u8>>;
}

/// One proof job, with the service-generated nonce.
#[derive(Debug, Clone)]
pub struct ProveJob {
    pub nonce: Nonce,
    pub circuit: CircuitInfo,
    pub circuit_input: serde_json::Value,
    pub entropy: String,
    pub proving_key: Vec<u8>,
    pub verification_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofOutput {
    pub proof: Vec<u8>,
    pub public_signals: Vec<String>,
}

#[async_trait]
pub trait Prover: Send + Sync {
    async fn prove(&self, job: ProveJob) -> Result<ProofOutput>;
}

// --- snarkjs ---

/// Ceremony stages backed by `snarkjs powersoftau` / `groth16` / `zkey`.
#[derive(Debug, Clone)]
pub struct SnarkjsToolkit {
    bin: PathBuf,
    scratch_root: PathBuf,
}

impl SnarkjsToolkit {
    pub fn new(bin: PathBuf, scratch_root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&scratch_root)?;
        Ok(Self { bin, scratch_root })
    }
}

/// Input file names, output file name and CLI arguments for an operation.
fn stage_command(op: &StageOperation) -> (Vec<&'static str>, &'static str, Vec<String>) {
    match op {
        StageOperation::PowersOfTauNew { curve, power } => (
            vec![],
            "out.ptau",
            vec![
                "powersoftau".into(),
                "new".into(),
                curve.clone(),
                power.to_string(),
                "out.ptau".into(),
                "-v".into(),
            ],
        ),
        StageOperation::PowersOfTauContribute { contributor } => (
            vec!["in.ptau"],
            "out.ptau",
            vec![
                "powersoftau".into(),
                "contribute".into(),
                "in.ptau".into(),
                "out.ptau".into(),
                format!("--name={}", contributor),
                "-v".into(),
            ],
        ),
        StageOperation::PreparePhase2 => (
            vec!["in.ptau"],
            "out.ptau",
            strings(&["powersoftau", "prepare", "phase2", "in.ptau", "out.ptau", "-v"]),
        ),
        StageOperation::Groth16Setup => (
            vec!["circuit.r1cs", "in.ptau"],
            "out.zkey",
            strings(&["groth16", "setup", "circuit.r1cs", "in.ptau", "out.zkey"]),
        ),
        StageOperation::ZkeyContribute { contributor } => (
            vec!["in.zkey"],
            "out.zkey",
            vec![
                "zkey".into(),
                "contribute".into(),
                "in.zkey".into(),
                "out.zkey".into(),
                format!("--name={}", contributor),
                "-v".into(),
            ],
        ),
        StageOperation::ExportVerificationKey => (
            vec!["in.zkey"],
            "verification_key.json",
            strings(&["zkey", "export", "verificationkey", "in.zkey", "verification_key.json"]),
        ),
    }
}

#[async_trait]
impl CeremonyToolkit for SnarkjsToolkit {
    async fn execute(&self, invocation: StageInvocation) -> Result<Vec<u8>> {
        let stage = invocation.stage.clone();
        let failed = |reason: String| Error::StageExecutionFailed {
            stage: stage.clone(),
            reason,
        };

        let (input_names, output_name, args) = stage_command(&invocation.operation);
        if input_names.len() != invocation.inputs.len() {
            return Err(failed(format!(
                "expected {} input(s), got {}",
                input_names.len(),
                invocation.inputs.len()
            )));
        }

        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", invocation.instance_id, invocation.stage))
            .tempdir_in(&self.scratch_root)?;
        for (name, data) in input_names.iter().zip(&invocation.inputs) {
            tokio::fs::write(scratch.path().join(name), data).await?;
        }

        debug!(stage = %invocation.stage, operation = invocation.operation.name(), "Invoking snarkjs");
        run_snarkjs(&self.bin, &args, scratch.path(), invocation.entropy.as_deref())
            .await
            .map_err(&failed)?;

        let output = tokio::fs::read(scratch.path().join(output_name))
            .await
            .map_err(|e| failed(format!("snarkjs produced no {}: {}", output_name, e)))?;
        if output.is_empty() {
            return Err(failed(format!("snarkjs produced an empty {}", output_name)));
        }
        Ok(output)
    }
}

/// Groth16 proving via `snarkjs wtns calculate` + `groth16 prove` (+ `verify`).
#[derive(Debug, Clone)]
pub struct SnarkjsProver {
    bin: PathBuf,
    scratch_root: PathBuf,
    verify: bool,
}

impl SnarkjsProver {
    pub fn new(bin: PathBuf, scratch_root: PathBuf, verify: bool) -> Result<Self> {
        std::fs::create_dir_all(&scratch_root)?;
        Ok(Self {
            bin,
            scratch_root,
            verify,
        })
    }
}

#[async_trait]
impl Prover for SnarkjsProver {
    async fn prove(&self, job: ProveJob) -> Result<ProofOutput> {
        let scratch = tempfile::Builder::new()
            .prefix(&format!("proof-{}-", job.nonce))
            .tempdir_in(&self.scratch_root)?;
        let dir = scratch.path();
        let wasm = std::path::absolute(&job.circuit.wasm_path)?;

        tokio::fs::write(dir.join("input.json"), serde_json::to_vec(&job.circuit_input)?).await?;
        tokio::fs::write(dir.join("circuit.zkey"), &job.proving_key).await?;

        let wasm_arg = wasm.to_string_lossy().into_owned();
        run_snarkjs(
            &self.bin,
            &strings(&["wtns", "calculate", &wasm_arg, "input.json", "witness.wtns"]),
            dir,
            None,
        )
        .await
        .map_err(|e| Error::ProverExecutionFailed(format!("witness generation: {}", e)))?;

        run_snarkjs(
            &self.bin,
            &strings(&["groth16", "prove", "circuit.zkey", "witness.wtns", "proof.json", "public.json"]),
            dir,
            None,
        )
        .await
        .map_err(|e| Error::ProverExecutionFailed(format!("groth16 prove: {}", e)))?;

        if self.verify {
            if let Some(vkey) = &job.verification_key {
                tokio::fs::write(dir.join("verification_key.json"), vkey).await?;
                run_snarkjs(
                    &self.bin,
                    &strings(&["groth16", "verify", "verification_key.json", "public.json", "proof.json"]),
                    dir,
                    None,
                )
                .await
                .map_err(|e| Error::ProverExecutionFailed(format!("proof verification: {}", e)))?;
            }
        }

        let proof = tokio::fs::read(dir.join("proof.json"))
            .await
            .map_err(|e| Error::ProverExecutionFailed(format!("missing proof.json: {}", e)))?;
        let public = tokio::fs::read(dir.join("public.json"))
            .await
            .map_err(|e| Error::ProverExecutionFailed(format!("missing public.json: {}", e)))?;
        let public_signals: Vec<String> = serde_json::from_slice(&public)
            .map_err(|e| Error::ProverExecutionFailed(format!("malformed public.json: {}", e)))?;

        Ok(ProofOutput {
            proof,
            public_signals,
        })
    }
}

fn strings(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Runs snarkjs without a shell. `stdin_data` is written to the child's stdin.
async fn run_snarkjs(
    bin: &Path,
    args: &[String],
    cwd: &Path,
    stdin_data: Option<&str>,
) -> std::result::Result<(), String> {
    let mut child = Command::new(bin)
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn {}: {}", bin.display(), e))?;

    if let (Some(data), Some(mut stdin)) = (stdin_data, child.stdin.take()) {
        let write = async {
            stdin.write_all(data.as_bytes()).await?;
            stdin.write_all(b"\n").await
        };
        write
            .await
            .map_err(|e| format!("failed to write to {} stdin: {}", bin.display(), e))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("failed waiting on {}: {}", bin.display(), e))?;
    if output.status.success() {
        return Ok(());
    }
    let detail = if output.stderr.is_empty() {
        tail(&output.stdout)
    } else {
        tail(&output.stderr)
    };
    Err(format!(
        "`{} {}` exited with {}: {}",
        bin.display(),
        args.first().map(String::as_str).unwrap_or_default(),
        output.status,
        detail
    ))
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(OUTPUT_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// A stand-in `snarkjs` that records its argv and stdin.
    fn fake_snarkjs(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("snarkjs");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn invocation(operation: StageOperation, inputs: Vec<Vec<u8>>, entropy: Option<&str>) -> StageInvocation {
        StageInvocation {
            instance_id: "c1".into(),
            stage: "contribute".into(),
            operation,
            inputs,
            entropy: entropy.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn contribution_reads_entropy_from_stdin() {
        let dir = TempDir::new().unwrap();
        // Output = previous accumulator followed by the entropy line.
        let bin = fake_snarkjs(dir.path(), r#"cat "$3" > "$4"; cat >> "$4""#);
        let toolkit = SnarkjsToolkit::new(bin, dir.path().join("scratch")).unwrap();

        let entropy = "it's \"quoted\"; $(rm -rf /)";
        let out = toolkit
            .execute(invocation(
                StageOperation::PowersOfTauContribute {
                    contributor: "First contribution".into(),
                },
                vec![b"ptau0|".to_vec()],
                Some(entropy),
            ))
            .await
            .unwrap();
        assert_eq!(out, format!("ptau0|{}\n", entropy).into_bytes());
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_stage_failure() {
        let dir = TempDir::new().unwrap();
        let bin = fake_snarkjs(dir.path(), "echo 'bad header' >&2; exit 3");
        let toolkit = SnarkjsToolkit::new(bin, dir.path().join("scratch")).unwrap();

        let err = toolkit
            .execute(invocation(StageOperation::PreparePhase2, vec![b"x".to_vec()], None))
            .await
            .unwrap_err();
        match err {
            Error::StageExecutionFailed { stage, reason } => {
                assert_eq!(stage, "contribute");
                assert!(reason.contains("bad header"), "{}", reason);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn success_without_output_is_a_stage_failure() {
        let dir = TempDir::new().unwrap();
        let bin = fake_snarkjs(dir.path(), "exit 0");
        let toolkit = SnarkjsToolkit::new(bin, dir.path().join("scratch")).unwrap();

        let err = toolkit
            .execute(invocation(
                StageOperation::PowersOfTauNew {
                    curve: "bn128".into(),
                    power: 12,
                },
                vec![],
                None,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StageExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn prover_surfaces_failed_verification() {
        let dir = TempDir::new().unwrap();
        let bin = fake_snarkjs(
            dir.path(),
            r#"case "$1 $2" in
  "wtns calculate") touch "$5" ;;
  "groth16 prove") echo '{"pi_a":[]}' > "$5"; echo '["1","2"]' > "$6" ;;
  "groth16 verify") echo 'Invalid proof' >&2; exit 1 ;;
esac"#,
        );
        let circuit = CircuitInfo {
            name: "domain".into(),
            description: None,
            parameter_slot: "main/setup".into(),
            ceremony_instance: None,
            wasm_path: dir.path().join("domain.wasm"),
            verification_key_slot: Some("main/vkey".into()),
        };
        let job = ProveJob {
            nonce: Nonce([7; 24]),
            circuit,
            circuit_input: serde_json::json!({"a": 1}),
            entropy: "e".into(),
            proving_key: b"zkey".to_vec(),
            verification_key: Some(b"{}".to_vec()),
        };

        let unverified = SnarkjsProver::new(bin.clone(), dir.path().join("scratch"), false).unwrap();
        let output = unverified.prove(job.clone()).await.unwrap();
        assert_eq!(output.public_signals, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(output.proof, b"{\"pi_a\":[]}\n");

        let verifying = SnarkjsProver::new(bin, dir.path().join("scratch"), true).unwrap();
        let err = verifying.prove(job).await.unwrap_err();
        assert!(matches!(err, Error::ProverExecutionFailed(msg) if msg.contains("verification")));
    }
}
