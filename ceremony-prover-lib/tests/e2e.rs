#![cfg(test)]
use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use ceremony_prover_lib::{
    api,
    config::ServiceConfig,
    context::ServiceContext,
    error::{Error, Result},
    state::ParameterStore,
    toolkit::{CeremonyToolkit, ProofOutput, ProveJob, Prover, StageInvocation},
};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// --- Test Setup ---

/// Output is `op(inputs)[entropy]`, so every artifact records its lineage.
#[derive(Default)]
struct ScriptedToolkit {
    fail_on: Option<&'static str>,
    /// Stages of this instance never return.
    hang_instance: Option<&'static str>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CeremonyToolkit for ScriptedToolkit {
    async fn execute(&self, inv: StageInvocation) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(inv.stage.clone());
        if self.hang_instance == Some(inv.instance_id.as_str()) {
            std::future::pending::<()>().await;
        }
        if self.fail_on == Some(inv.stage.as_str()) {
            return Err(Error::StageExecutionFailed {
                stage: inv.stage,
                reason: "snarkjs exited with status 1".into(),
            });
        }
        let inputs: Vec<String> = inv
            .inputs
            .iter()
            .map(|i| String::from_utf8_lossy(i).into_owned())
            .collect();
        Ok(format!(
            "{}({})[{}]",
            inv.operation.name(),
            inputs.join("+"),
            inv.entropy.unwrap_or_default()
        )
        .into_bytes())
    }
}

/// Echoes the proving key it was handed, plus the nonce as the only signal.
struct EchoProver;

#[async_trait]
impl Prover for EchoProver {
    async fn prove(&self, job: ProveJob) -> Result<ProofOutput> {
        Ok(ProofOutput {
            proof: job.proving_key,
            public_signals: vec![job.nonce.to_string()],
        })
    }
}

struct Harness {
    _dir: TempDir,
    app: Router,
    toolkit: Arc<ScriptedToolkit>,
}

fn harness(toolkit: ScriptedToolkit) -> Harness {
    let dir = TempDir::new().unwrap();
    let r1cs = dir.path().join("coinbase.r1cs");
    std::fs::write(&r1cs, b"r1cs").unwrap();

    let config = ServiceConfig::from_toml_str(&format!(
        r#"
        data_dir = '{data_dir}'
        prover_workers = 2

        [[plans.default.stages]]
        name = "init"
        operation = {{ kind = "powers_of_tau_new", curve = "bn128", power = 12 }}

        [[plans.default.stages]]
        name = "contribute"
        inputs = [{{ stage = "init" }}]
        entropy = "contribution"
        operation = {{ kind = "powers_of_tau_contribute", contributor = "First contribution" }}

        [[plans.default.stages]]
        name = "prepare_phase2"
        inputs = [{{ stage = "contribute" }}]
        operation = {{ kind = "prepare_phase2" }}

        [[plans.default.stages]]
        name = "setup"
        inputs = [{{ file = '{r1cs}' }}, {{ stage = "prepare_phase2" }}]
        operation = {{ kind = "groth16_setup" }}
        "#,
        data_dir = dir.path().join("data").display(),
        r1cs = r1cs.display(),
    ))
    .unwrap();

    let store = ParameterStore::new(config.data_dir.clone()).unwrap();
    let toolkit = Arc::new(toolkit);
    let ctx = ServiceContext::with_backends(
        config,
        store,
        toolkit.clone(),
        Arc::new(EchoProver),
        CancellationToken::new(),
    )
    .unwrap();

    Harness {
        _dir: dir,
        app: api::router(ctx),
        toolkit,
    }
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn coinbase_circuit() -> Value {
    json!({
        "name": "coinbase",
        "parameter_slot": "c1/setup",
        "ceremony_instance": "c1",
        "wasm_path": "coinbase.wasm",
    })
}

// --- E2E Tests ---

#[tokio::test]
async fn ceremony_then_proofs_over_http() {
    let h = harness(ScriptedToolkit::default());

    let (status, _) = call(&h.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&h.app, Method::POST, "/circuit/register", Some(coinbase_circuit())).await;
    assert_eq!(status, StatusCode::CREATED);

    // Registered, but its ceremony has not run yet.
    let proof_request = json!({ "circuit_name": "coinbase", "circuit_input": { "a": 3 } });
    let (status, body) = call(&h.app, Method::POST, "/proof/generate", Some(proof_request.clone())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "PARAMETERS_NOT_READY");

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/ceremony/run",
        Some(json!({ "instance_id": "c1", "external_input": { "contribution": "abc" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["status"], "COMPLETE");
    assert_eq!(
        body["completed_stages"],
        json!(["init", "contribute", "prepare_phase2", "setup"])
    );

    let (status, record) = call(&h.app, Method::GET, "/ceremony/c1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["plan"], "default");
    assert_eq!(record["stages"][3]["status"], "DONE");

    let requests = (0..4).map(|_| call(&h.app, Method::POST, "/proof/generate", Some(proof_request.clone())));
    let results = futures::future::join_all(requests).await;
    let mut nonces = HashSet::new();
    let expected_key = hex::encode(b"groth16_setup(r1cs+prepare_phase2(powers_of_tau_contribute(powers_of_tau_new()[])[abc])[])[]");
    for (status, body) in results {
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["proof_artifact"], expected_key.as_str());
        assert_eq!(body["public_signals"][0], body["nonce"]);
        nonces.insert(body["nonce"].as_str().unwrap().to_string());
    }
    assert_eq!(nonces.len(), 4);

    let (status, circuits) = call(&h.app, Method::GET, "/circuits", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(circuits[0]["name"], "coinbase");
}

#[tokio::test]
async fn failed_stage_is_reported_and_terminal() {
    let h = harness(ScriptedToolkit {
        fail_on: Some("setup"),
        ..Default::default()
    });
    let run = json!({ "instance_id": "c1", "external_input": { "contribution": "abc" } });

    let (status, body) = call(&h.app, Method::POST, "/ceremony/run", Some(run.clone())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["code"], "STAGE_EXECUTION_FAILED");

    let (_, record) = call(&h.app, Method::GET, "/ceremony/c1", None).await;
    assert_eq!(record["status"], "FAILED");
    assert_eq!(record["stages"][2]["status"], "DONE");
    assert_eq!(record["stages"][3]["status"], "FAILED");

    let (status, body) = call(&h.app, Method::POST, "/ceremony/run", Some(run)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CEREMONY_FAILED");
    assert_eq!(h.toolkit.calls.lock().unwrap().len(), 4);

    // Proofs stay unavailable for the failed ceremony.
    call(&h.app, Method::POST, "/circuit/register", Some(coinbase_circuit())).await;
    let (status, _) = call(
        &h.app,
        Method::POST,
        "/proof/generate",
        Some(json!({ "circuit_name": "coinbase", "circuit_input": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn missing_entropy_is_unprocessable() {
    let h = harness(ScriptedToolkit::default());
    let (status, body) = call(
        &h.app,
        Method::POST,
        "/ceremony/run",
        Some(json!({ "instance_id": "c2" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "MISSING_INPUT");
    assert_eq!(*h.toolkit.calls.lock().unwrap(), vec!["init".to_string()]);
}

#[tokio::test]
async fn rejects_bad_requests() {
    let h = harness(ScriptedToolkit::default());

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/proof/generate",
        Some(json!({ "circuit_name": "nope", "circuit_input": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "UNKNOWN_CIRCUIT");

    // Nonces are minted by the service, never accepted from callers.
    let (status, _) = call(
        &h.app,
        Method::POST,
        "/proof/generate",
        Some(json!({ "circuit_name": "nope", "circuit_input": {}, "nonce": "00" })),
    )
    .await;
    assert!(status.is_client_error());

    let (status, body) = call(
        &h.app,
        Method::POST,
        "/ceremony/run",
        Some(json!({ "instance_id": "../etc", "external_input": { "contribution": "x" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");

    let (status, _) = call(
        &h.app,
        Method::POST,
        "/ceremony/run",
        Some(json!({ "instance_id": "c3", "plan": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h.app, Method::GET, "/ceremony/never-ran", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn running_stage_does_not_block_proofs() {
    let h = harness(ScriptedToolkit {
        hang_instance: Some("slow"),
        ..Default::default()
    });
    call(&h.app, Method::POST, "/circuit/register", Some(coinbase_circuit())).await;
    let (status, _) = call(
        &h.app,
        Method::POST,
        "/ceremony/run",
        Some(json!({ "instance_id": "c1", "external_input": { "contribution": "abc" } })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let app = h.app.clone();
    let slow = tokio::spawn(async move {
        call(
            &app,
            Method::POST,
            "/ceremony/run",
            Some(json!({ "instance_id": "slow", "external_input": { "contribution": "x" } })),
        )
        .await
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (status, record) = call(&h.app, Method::GET, "/ceremony/slow", None).await;
            if status == StatusCode::OK && record["stages"][0]["status"] == "RUNNING" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slow instance never started its first stage");

    let (status, body) = tokio::time::timeout(
        Duration::from_secs(5),
        call(
            &h.app,
            Method::POST,
            "/proof/generate",
            Some(json!({ "circuit_name": "coinbase", "circuit_input": { "a": 1 } })),
        ),
    )
    .await
    .expect("proof waited on the running stage");
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(!slow.is_finished());
    slow.abort();
}
