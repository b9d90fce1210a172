//! ceremony-prover-lib
//! Trusted-setup ceremony orchestration, a durable parameter store, and a
//! proof generation service for Groth16 circuits.

// Modules
pub mod api;
pub mod ceremony;
pub mod config;
pub mod context;
pub mod error;
pub mod plan;
pub mod prover;
pub mod state;
pub mod toolkit;
pub mod types;

// Re-exports for convenience
pub use ceremony::{CeremonyOrchestrator, ExternalInput};
pub use config::ServiceConfig;
pub use context::ServiceContext;
pub use error::{Error, Result};
pub use plan::{InputRef, StageOperation, StagePlan, StageSpec};
pub use prover::ProofService;
pub use state::ParameterStore;
pub use toolkit::{CeremonyToolkit, Prover};
pub use types::{
    ArtifactRef, CeremonyInstance, CeremonyStatus, CircuitInfo, Nonce, ProofRequest, ProofResult,
    StageStatus,
};
