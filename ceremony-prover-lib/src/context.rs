use crate::ceremony::{CeremonyOrchestrator, ExternalInput};
use crate::config::{DEFAULT_PLAN, ServiceConfig};
use crate::error::{Error, Result};
use crate::prover::ProofService;
use crate::state::ParameterStore;
use crate::toolkit::{CeremonyToolkit, Prover, SnarkjsProver, SnarkjsToolkit};
use crate::types::CeremonyInstance;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const SCRATCH_SUBDIR: &str = "scratch";

/// Handles shared by every request: the store, the orchestrator and the
/// proof service. Cheap to clone.
#[derive(Clone)]
pub struct ServiceContext {
    config: Arc<ServiceConfig>,
    store: ParameterStore,
    orchestrator: Arc<CeremonyOrchestrator>,
    proof_service: Arc<ProofService>,
}

impl ServiceContext {
    /// Opens the store under `data_dir` and wires the snarkjs backends.
    pub fn new(config: ServiceConfig, shutdown: CancellationToken) -> Result<Self> {
        let store = ParameterStore::new(config.data_dir.clone())?;
        let scratch = config.data_dir.join(SCRATCH_SUBDIR);
        let toolkit = SnarkjsToolkit::new(config.snarkjs_bin.clone(), scratch.clone())?;
        let prover = SnarkjsProver::new(config.snarkjs_bin.clone(), scratch, config.verify_proofs)?;
        Self::with_backends(config, store, Arc::new(toolkit), Arc::new(prover), shutdown)
    }

    /// Builds a context around explicit backends. Circuits listed in the
    /// config are (re-)registered.
    pub fn with_backends(
        config: ServiceConfig,
        store: ParameterStore,
        toolkit: Arc<dyn CeremonyToolkit>,
        prover: Arc<dyn Prover>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let orchestrator = CeremonyOrchestrator::new(
            store.clone(),
            toolkit,
            config.stage_timeout(),
            config.log_entropy,
            shutdown,
        );
        let proof_service = ProofService::new(
            store.clone(),
            prover,
            config.prover_workers(),
            config.proof_timeout(),
            config.log_entropy,
        );
        for circuit in &config.circuits {
            proof_service.register_circuit(circuit)?;
        }
        info!(
            plans = config.plans.len(),
            circuits = config.circuits.len(),
            prover_workers = config.prover_workers(),
            "Service context ready"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            orchestrator: Arc::new(orchestrator),
            proof_service: Arc::new(proof_service),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<CeremonyOrchestrator> {
        &self.orchestrator
    }

    pub fn proof_service(&self) -> &Arc<ProofService> {
        &self.proof_service
    }

    /// Runs a configured plan for `instance_id` on its own task, so a
    /// caller that goes away does not abort a stage half-way.
    pub async fn run_ceremony(
        &self,
        instance_id: String,
        plan_name: Option<String>,
        external_input: ExternalInput,
    ) -> Result<CeremonyInstance> {
        let plan_name = plan_name.unwrap_or_else(|| DEFAULT_PLAN.to_string());
        let plan = self.config.plan(&plan_name)?.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator
                .run(&instance_id, &plan_name, &plan, &external_input)
                .await
        })
        .await
        .map_err(|e| Error::Internal(format!("ceremony task failed: {}", e)))?
    }
}
