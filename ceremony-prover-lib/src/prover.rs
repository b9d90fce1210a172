//! One-shot proof generation against finalized ceremony parameters.

use crate::error::{Error, Result};
use crate::plan::validate_name;
use crate::state::ParameterStore;
use crate::toolkit::{ProveJob, Prover};
use crate::types::{CeremonyStatus, CircuitInfo, EntropyDisplay, Nonce, ProofRequest, ProofResult};
use rand::RngCore;
use rand::rngs::OsRng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Mints nonces: an in-process counter followed by 16 random bytes.
///
/// The counter makes every nonce from one service distinct; the random tail
/// keeps them unpredictable and distinct across restarts.
#[derive(Debug, Default)]
pub struct NonceSource {
    counter: AtomicU64,
}

impl NonceSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Nonce {
        let mut bytes = [0u8; 24];
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        bytes[..8].copy_from_slice(&n.to_be_bytes());
        OsRng.fill_bytes(&mut bytes[8..]);
        Nonce(bytes)
    }
}

/// Serves proof requests. Holds no per-request state.
///
/// Each request invokes the prover exactly once, never retried here. The
/// number of concurrent prover invocations is bounded by `workers`.
pub struct ProofService {
    store: ParameterStore,
    prover: Arc<dyn Prover>,
    workers: Arc<Semaphore>,
    timeout: Duration,
    log_entropy: bool,
    nonces: NonceSource,
}

impl ProofService {
    pub fn new(
        store: ParameterStore,
        prover: Arc<dyn Prover>,
        workers: usize,
        timeout: Duration,
        log_entropy: bool,
    ) -> Self {
        Self {
            store,
            prover,
            workers: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
            log_entropy,
            nonces: NonceSource::new(),
        }
    }

    /// Registers (or replaces) a circuit.
    pub fn register_circuit(&self, info: &CircuitInfo) -> Result<()> {
        validate_name(&info.name)?;
        if info.parameter_slot.is_empty() {
            return Err(Error::InvalidInput("parameter_slot is empty".to_string()));
        }
        self.store.store_circuit(info)?;
        info!(circuit = %info.name, slot = %info.parameter_slot, "Circuit registered");
        Ok(())
    }

    pub fn circuits(&self) -> Result<Vec<CircuitInfo>> {
        self.store.list_circuits()
    }

    #[tracing::instrument(skip(self, request), fields(circuit = %request.circuit_name))]
    pub async fn handle(&self, request: ProofRequest) -> Result<ProofResult> {
        let circuit = self
            .store
            .get_circuit_info(&request.circuit_name)?
            .ok_or_else(|| Error::UnknownCircuit(request.circuit_name.clone()))?;

        let (proving_key, verification_key) = self.load_parameters(&circuit).await?;

        let nonce = self.nonces.next();
        let entropy = request
            .entropy_contribution
            .unwrap_or_else(generate_entropy);

        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Internal(format!("prover pool closed: {}", e)))?;

        info!(
            %nonce,
            entropy = %EntropyDisplay::new(&entropy, self.log_entropy),
            "Generating proof"
        );
        let job = ProveJob {
            nonce,
            circuit: circuit.clone(),
            circuit_input: request.circuit_input,
            entropy,
            proving_key,
            verification_key,
        };

        let output = match tokio::time::timeout(self.timeout, self.prover.prove(job)).await {
            Err(_elapsed) => {
                warn!(%nonce, "Prover timed out");
                return Err(Error::ProverExecutionFailed(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
            Ok(Err(e)) => {
                warn!(%nonce, error = %e, "Prover failed");
                return Err(match e {
                    e @ Error::ProverExecutionFailed(_) => e,
                    other => Error::ProverExecutionFailed(other.to_string()),
                });
            }
            Ok(Ok(output)) => output,
        };

        info!(%nonce, proof_size = output.proof.len(), "Proof generated");
        Ok(ProofResult {
            circuit_name: circuit.name,
            nonce,
            proof_artifact: output.proof,
            public_signals: output.public_signals,
        })
    }

    /// Proving (and optional verification) key, or `ParametersNotReady`.
    async fn load_parameters(&self, circuit: &CircuitInfo) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        let not_ready = || Error::ParametersNotReady(circuit.name.clone());

        if let Some(instance_id) = &circuit.ceremony_instance {
            let status = self.store.load_ceremony(instance_id)?.map(|i| i.status);
            if status != Some(CeremonyStatus::Complete) {
                debug!(%instance_id, ?status, "Ceremony not complete");
                return Err(not_ready());
            }
        }

        let proving_key = match self.store.get_async(circuit.parameter_slot.as_str()).await {
            Err(Error::NotFound(_)) => return Err(not_ready()),
            other => other?,
        };
        let verification_key = match &circuit.verification_key_slot {
            Some(slot) => match self.store.get_async(slot.as_str()).await {
                Err(Error::NotFound(_)) => return Err(not_ready()),
                other => Some(other?),
            },
            None => None,
        };
        Ok((proving_key, verification_key))
    }
}

/// Service-side entropy when the caller supplies none.
fn generate_entropy() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
