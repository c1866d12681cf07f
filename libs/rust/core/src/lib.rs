//! Core of the federated round coordinator: parameter sets, FedAvg aggregation, participant
//! selection, client sessions and the round state machine.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod aggregator;
pub mod bootstrap;
pub mod client_proxy;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod history;
pub mod metrics;
pub mod parameters;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod trainer;

#[cfg(test)]
mod testing;

pub use aggregator::{aggregate_evaluate, aggregate_fit, AggregatedMetrics, EvaluateAggregate};
pub use bootstrap::{load_initial_parameters, InitialSource, ModelSpec};
pub use client_proxy::{ClientProxy, LocalClientProxy, RemoteClientProxy};
pub use config::{Device, ServerConfig, TrainConfig};
pub use coordinator::{Coordinator, CoordinatorHandle};
pub use error::{AbortReason, ClientError, FlError, Phase};
pub use history::{RoundRecord, RunSummary};
pub use parameters::{DType, ParameterSet, Tensor, TensorData};
pub use protocol::ClientId;
pub use state::CoordinatorState;
pub use trainer::{EvaluateOutput, FitOutput, LocalTrainer};

static TRACING_INIT: OnceCell<()> = OnceCell::new();
static LIVENESS: AtomicBool = AtomicBool::new(true);
static READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() {
    READINESS.store(true, Ordering::SeqCst);
}

pub fn clear_ready() {
    READINESS.store(false, Ordering::SeqCst);
}

pub fn mark_not_live() {
    LIVENESS.store(false, Ordering::SeqCst);
}

pub fn is_live() -> bool {
    LIVENESS.load(Ordering::SeqCst)
}

pub fn is_ready() -> bool {
    READINESS.load(Ordering::SeqCst)
}

/// `RUST_LOG` filter (default `info`); JSON lines when `FEDROUND_JSON_LOG` is `1` or `true`.
/// Safe to call more than once.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("FEDROUND_JSON_LOG")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer().json().flatten_event(true).with_current_span(true).with_span_list(false))
                .try_init()?;
        } else {
            registry.with(tracing_subscriber::fmt::layer().with_target(true).with_line_number(true)).try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing_initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_flags_toggle() {
        mark_ready();
        assert!(is_ready());
        clear_ready();
        assert!(!is_ready());
        assert!(is_live());
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing("test").unwrap();
        init_tracing("test").unwrap();
    }
}
