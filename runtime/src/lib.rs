//! Orchestration for the cradle runtime: the state machine behind each OCI
//! verb, the persisted container state, and the host-side collaborators
//! (hypervisor, network namespace, shim) it sequences.

pub mod bundle;
pub mod config;
pub mod error;
pub mod hooks;
pub mod hypervisor;
pub mod netns;
pub mod orchestrator;
pub mod shim;
pub mod state;

pub use bundle::Bundle;
pub use config::RuntimeConfig;
pub use error::RuntimeError;
pub use orchestrator::{parse_signal, FullContainerState, Orchestrator};
pub use state::{ContainerState, HypervisorAssets, StateStore, Status};
