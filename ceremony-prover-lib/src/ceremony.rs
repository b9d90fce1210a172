//! Ceremony orchestration: runs a stage plan exactly once per instance.

use crate::error::{Error, Result};
use crate::plan::{InputRef, StagePlan, StageSpec, stage_slot, validate_name};
use crate::state::ParameterStore;
use crate::toolkit::{CeremonyToolkit, StageInvocation};
use crate::types::{CeremonyInstance, CeremonyStatus, EntropyDisplay, InstanceId, StageStatus};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Named values supplied with a run, e.g. an entropy contribution.
pub type ExternalInput = BTreeMap<String, String>;

/// Drives ceremony stage plans against the [`ParameterStore`].
///
/// Stage completion is always re-derived from the store: a stage whose slot
/// holds a committed artifact is done, whatever the instance record says.
/// Runs of the same `instance_id` are serialized; different instances run
/// independently.
pub struct CeremonyOrchestrator {
    store: ParameterStore,
    toolkit: Arc<dyn CeremonyToolkit>,
    stage_timeout: Duration,
    log_entropy: bool,
    shutdown: CancellationToken,
    instance_locks: Mutex<HashMap<InstanceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CeremonyOrchestrator {
    pub fn new(
        store: ParameterStore,
        toolkit: Arc<dyn CeremonyToolkit>,
        stage_timeout: Duration,
        log_entropy: bool,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            toolkit,
            stage_timeout,
            log_entropy,
            shutdown,
            instance_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Stored record for an instance.
    pub fn instance(&self, instance_id: &str) -> Result<CeremonyInstance> {
        self.store
            .load_ceremony(instance_id)?
            .ok_or_else(|| Error::NotFound(format!("ceremony instance `{}`", instance_id)))
    }

    /// Runs (or resumes) `instance_id` through `plan`.
    ///
    /// Stage failures are recorded on the instance, which becomes `Failed`,
    /// and returned as the error. A `Failed` instance is never run again.
    #[tracing::instrument(skip(self, plan, external_input), fields(stages = plan.stages.len()))]
    pub async fn run(
        &self,
        instance_id: &str,
        plan_name: &str,
        plan: &StagePlan,
        external_input: &ExternalInput,
    ) -> Result<CeremonyInstance> {
        validate_name(instance_id)?;
        plan.validate()?;

        let lock = {
            let mut locks = self.instance_locks.lock()?;
            locks.entry(instance_id.to_string()).or_default().clone()
        };
        let result = {
            let _guard = lock.lock().await;
            self.run_exclusive(instance_id, plan_name, plan, external_input)
                .await
        };

        let mut locks = self.instance_locks.lock()?;
        // Ours plus the map's: nobody else is waiting
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(instance_id);
        }
        result
    }

    async fn run_exclusive(
        &self,
        instance_id: &str,
        plan_name: &str,
        plan: &StagePlan,
        external_input: &ExternalInput,
    ) -> Result<CeremonyInstance> {
        let mut instance = match self.store.load_ceremony(instance_id)? {
            Some(existing) => {
                if existing.status == CeremonyStatus::Failed {
                    return Err(Error::CeremonyFailed(instance_id.to_string()));
                }
                check_same_plan(&existing, plan_name, plan)?;
                if existing.status == CeremonyStatus::Complete {
                    return self.verify_complete(existing);
                }
                info!(status = ?existing.status, "Resuming ceremony instance");
                existing
            }
            None => {
                info!(plan = plan_name, "Starting ceremony instance");
                CeremonyInstance::new(instance_id.to_string(), plan_name, plan)
            }
        };
        instance.status = CeremonyStatus::InProgress;
        self.save(&mut instance)?;

        for (index, spec) in plan.stages.iter().enumerate() {
            let slot = stage_slot(instance_id, &spec.name);
            if let Some(artifact) = self.store.latest(&slot)? {
                debug!(stage = %spec.name, version = artifact.version, "Stage already committed");
                let record = &mut instance.stages[index];
                record.status = StageStatus::Done;
                record.output_ref = Some(artifact);
                record.error = None;
                continue;
            }

            let invocation = match self.gather(instance_id, plan, index, spec, external_input).await {
                Ok(invocation) => invocation,
                Err(e) => return Err(self.fail(&mut instance, index, e)),
            };

            instance.stages[index].status = StageStatus::Running;
            self.save(&mut instance)?;
            info!(
                stage = %spec.name,
                operation = spec.operation.name(),
                entropy = %invocation
                    .entropy
                    .as_deref()
                    .map(|e| EntropyDisplay::new(e, self.log_entropy).to_string())
                    .unwrap_or_else(|| "none".to_string()),
                "Running stage"
            );

            let output = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    // Nothing was committed; the stage runs again on resume.
                    warn!(stage = %spec.name, "Stage cancelled");
                    instance.stages[index].status = StageStatus::NotStarted;
                    self.save(&mut instance)?;
                    return Err(Error::Cancelled(format!(
                        "stage `{}` of `{}`",
                        spec.name, instance_id
                    )));
                }
                res = tokio::time::timeout(self.stage_timeout, self.toolkit.execute(invocation)) => res,
            };

            let committed = match output {
                Err(_elapsed) => Err(Error::StageExecutionFailed {
                    stage: spec.name.clone(),
                    reason: format!("timed out after {:?}", self.stage_timeout),
                }),
                Ok(Err(e)) => Err(as_stage_failure(&spec.name, e)),
                Ok(Ok(bytes)) => self
                    .store
                    .put_async(&slot, bytes)
                    .await
                    .map_err(|e| as_stage_failure(&spec.name, e)),
            };
            match committed {
                Ok(artifact) => {
                    info!(stage = %spec.name, version = artifact.version, size = artifact.size, "Stage committed");
                    let record = &mut instance.stages[index];
                    record.status = StageStatus::Done;
                    record.output_ref = Some(artifact);
                    record.error = None;
                    self.save(&mut instance)?;
                }
                Err(e) => return Err(self.fail(&mut instance, index, e)),
            }
        }

        instance.status = CeremonyStatus::Complete;
        self.save(&mut instance)?;
        info!("Ceremony complete");
        Ok(instance)
    }

    /// A finished instance is returned as stored, never re-saved, once every
    /// stage output is confirmed committed.
    fn verify_complete(&self, instance: CeremonyInstance) -> Result<CeremonyInstance> {
        for record in &instance.stages {
            let slot = stage_slot(&instance.instance_id, &record.name);
            if self.store.latest(&slot)?.is_none() {
                return Err(Error::StateError(format!(
                    "complete instance `{}` has no committed output for stage `{}`",
                    instance.instance_id, record.name
                )));
            }
        }
        debug!("Ceremony already complete");
        Ok(instance)
    }

    /// Reads every declared input. Any absent input is `MissingInput`.
    async fn gather(
        &self,
        instance_id: &str,
        plan: &StagePlan,
        index: usize,
        spec: &StageSpec,
        external_input: &ExternalInput,
    ) -> Result<StageInvocation> {
        let missing = |input: String| Error::MissingInput {
            stage: spec.name.clone(),
            input,
        };

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for input in &spec.inputs {
            let bytes = match input {
                InputRef::Stage(name) => {
                    let is_predecessor = plan.stages[..index].iter().any(|s| &s.name == name);
                    if !is_predecessor {
                        return Err(missing(format!("{} (not an earlier stage)", input)));
                    }
                    self.read_slot(&stage_slot(instance_id, name), || missing(input.to_string()))
                        .await?
                }
                InputRef::Slot(slot) => {
                    self.read_slot(slot, || missing(input.to_string())).await?
                }
                InputRef::File(path) => tokio::fs::read(path)
                    .await
                    .map_err(|e| missing(format!("{} ({})", input, e)))?,
                InputRef::External(key) => external_input
                    .get(key)
                    .ok_or_else(|| missing(input.to_string()))?
                    .clone()
                    .into_bytes(),
            };
            inputs.push(bytes);
        }

        let entropy = match &spec.entropy {
            Some(key) => Some(
                external_input
                    .get(key)
                    .ok_or_else(|| missing(format!("external:{} (entropy)", key)))?
                    .clone(),
            ),
            None => None,
        };

        Ok(StageInvocation {
            instance_id: instance_id.to_string(),
            stage: spec.name.clone(),
            operation: spec.operation.clone(),
            inputs,
            entropy,
        })
    }

    /// An uncommitted slot is a missing input; other store errors pass through.
    async fn read_slot(&self, slot: &str, missing: impl FnOnce() -> Error) -> Result<Vec<u8>> {
        match self.store.get_async(slot).await {
            Err(Error::NotFound(_)) => Err(missing()),
            other => other,
        }
    }

    /// Marks stage and instance failed. Returns the error for the caller.
    fn fail(&self, instance: &mut CeremonyInstance, index: usize, error: Error) -> Error {
        warn!(stage = %instance.stages[index].name, %error, "Stage failed; ceremony aborted");
        let record = &mut instance.stages[index];
        record.status = StageStatus::Failed;
        record.error = Some(error.to_string());
        instance.status = CeremonyStatus::Failed;
        if let Err(e) = self.save(instance) {
            warn!(error = %e, "Could not record ceremony failure");
        }
        error
    }

    fn save(&self, instance: &mut CeremonyInstance) -> Result<()> {
        instance.touch();
        self.store.save_ceremony(instance)
    }
}

fn check_same_plan(existing: &CeremonyInstance, plan_name: &str, plan: &StagePlan) -> Result<()> {
    let same_stages = existing.stages.len() == plan.stages.len()
        && existing
            .stages
            .iter()
            .zip(&plan.stages)
            .all(|(record, spec)| {
                record.name == spec.name
                    && record.input_refs == spec.inputs
                    && record.operation == spec.operation
                    && record.entropy_key == spec.entropy
            });
    if existing.plan != plan_name || !same_stages {
        return Err(Error::InvalidPlan(format!(
            "instance `{}` was started with a different plan (`{}`)",
            existing.instance_id, existing.plan
        )));
    }
    Ok(())
}

fn as_stage_failure(stage: &str, error: Error) -> Error {
    match error {
        e @ Error::StageExecutionFailed { .. } => e,
        other => Error::StageExecutionFailed {
            stage: stage.to_string(),
            reason: other.to_string(),
        },
    }
}
