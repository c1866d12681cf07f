//! Round engine.
//!
//! One loop owns the state machine and the session registry and walks every round through
//! WaitingForClients -> Fitting -> Aggregating -> Evaluating -> AggregatingEval. Connects and
//! disconnects arrive as `SessionEvent`s from `CoordinatorHandle`s and are applied between
//! and during phases. The global parameters sit behind an `ArcSwap`: broadcasts clone the
//! `Arc`, aggregation swaps in a new set.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use fedround_resilience::RetryConfig;
use futures::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregator::{aggregate_evaluate, aggregate_fit, aggregate_fit_metrics};
use crate::client_proxy::ClientProxy;
use crate::config::ServerConfig;
use crate::error::{AbortReason, ClientError, FlError, Phase, Result};
use crate::history::{RoundRecord, RunSummary};
use crate::metrics::ROUND_METRICS;
use crate::parameters::ParameterSet;
use crate::protocol::{
    ClientId, EvaluateIns, EvaluateResult, FitIns, FitResult, SessionAck, ShutdownNotice, StatusResponse,
};
use crate::scheduler::{check_availability, select_participants, SelectionPolicy};
use crate::session::{Admission, SessionRegistry, SessionStatus};
use crate::state::{CoordinatorState, StateMachine};

const EVENT_QUEUE: usize = 256;
const SHUTDOWN_NOTICE_TIMEOUT: Duration = Duration::from_secs(5);
const NOT_ACCEPTING: &str = "coordinator is no longer accepting clients";

pub enum SessionEvent {
    Connect { proxy: Arc<dyn ClientProxy>, reply: oneshot::Sender<SessionAck> },
    Disconnect { client_id: ClientId, reason: String },
}

/// Cheap, cloneable entry point for transports.
#[derive(Clone)]
pub struct CoordinatorHandle {
    events: mpsc::Sender<SessionEvent>,
    global: Arc<ArcSwap<ParameterSet>>,
    status: Arc<RwLock<StatusResponse>>,
}

impl CoordinatorHandle {
    /// Pull the client's parameters, check them against the global layout, then ask the
    /// loop to admit the session.
    pub async fn connect(&self, proxy: Arc<dyn ClientProxy>) -> SessionAck {
        let client_id = proxy.client_id().clone();
        let round = self.status.read().round;
        let theirs = match proxy.get_parameters().await {
            Ok(p) => p,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "connect_handshake_failed");
                return SessionAck::rejected(client_id, round, format!("parameter handshake failed: {e}"));
            }
        };
        if let Err(e) = self.global.load().ensure_same_layout(&theirs) {
            warn!(client_id = %client_id, error = %e, "connect_layout_mismatch");
            return SessionAck::rejected(client_id, round, format!("model layout differs from the global parameters: {e}"));
        }
        let (reply, ack) = oneshot::channel();
        if self.events.send(SessionEvent::Connect { proxy, reply }).await.is_err() {
            return SessionAck::rejected(client_id, round, NOT_ACCEPTING);
        }
        ack.await.unwrap_or_else(|_| SessionAck::rejected(client_id, round, NOT_ACCEPTING))
    }

    /// False once the coordinator loop has exited.
    pub async fn disconnect(&self, client_id: ClientId, reason: impl Into<String>) -> bool {
        self.events.send(SessionEvent::Disconnect { client_id, reason: reason.into() }).await.is_ok()
    }

    pub fn parameters(&self) -> Arc<ParameterSet> {
        self.global.load_full()
    }

    pub fn status(&self) -> StatusResponse {
        self.status.read().clone()
    }
}

/// Successful responses of one phase attempt, plus how many selected clients failed.
struct PhaseOutcome<R> {
    participants: Vec<ClientId>,
    results: Vec<R>,
    failed: usize,
}

struct Collector<R> {
    phase: Phase,
    broadcast: Arc<ParameterSet>,
    accepted: BTreeMap<ClientId, R>,
    failed: usize,
}

trait PhaseResult: Send + 'static {
    fn num_examples(&self) -> u64;

    /// `Protocol` for a malformed result. Anything fatal ends the run.
    fn check(&self, expected: &ClientId, broadcast: &ParameterSet) -> Result<()>;
}

impl PhaseResult for FitResult {
    fn num_examples(&self) -> u64 {
        self.num_examples
    }

    fn check(&self, expected: &ClientId, broadcast: &ParameterSet) -> Result<()> {
        self.validate(expected).map_err(|reason| FlError::Protocol { client: expected.to_string(), reason })?;
        broadcast.ensure_same_layout(&self.parameters)
    }
}

impl PhaseResult for EvaluateResult {
    fn num_examples(&self) -> u64 {
        self.num_examples
    }

    fn check(&self, expected: &ClientId, _broadcast: &ParameterSet) -> Result<()> {
        self.validate(expected).map_err(|reason| FlError::Protocol { client: expected.to_string(), reason })
    }
}

pub struct Coordinator {
    config: ServerConfig,
    machine: StateMachine,
    sessions: SessionRegistry,
    global: Arc<ArcSwap<ParameterSet>>,
    digest: String,
    events: mpsc::Receiver<SessionEvent>,
    events_open: bool,
    status: Arc<RwLock<StatusResponse>>,
    policy: SelectionPolicy,
    round: u64,
    rounds_completed: u64,
    history: Vec<RoundRecord>,
}

impl Coordinator {
    pub fn new(config: ServerConfig, initial: ParameterSet) -> Result<(Self, CoordinatorHandle)> {
        config.validate()?;
        if initial.is_empty() {
            return Err(FlError::config("initial parameter set has no tensors"));
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let digest = initial.digest();
        let status = Arc::new(RwLock::new(StatusResponse {
            state: CoordinatorState::Idle,
            round: config.start_round,
            rounds_completed: 0,
            num_rounds: config.num_rounds,
            connected_clients: 0,
            parameters_digest: digest.clone(),
        }));
        let global = Arc::new(ArcSwap::from_pointee(initial));
        let handle = CoordinatorHandle { events: tx, global: Arc::clone(&global), status: Arc::clone(&status) };
        let coordinator = Self {
            policy: SelectionPolicy::from_seed(config.selection_seed),
            round: config.start_round,
            config,
            machine: StateMachine::new(),
            sessions: SessionRegistry::new(),
            global,
            digest,
            events: rx,
            events_open: true,
            status,
            rounds_completed: 0,
            history: Vec::new(),
        };
        Ok((coordinator, handle))
    }

    /// Drive every configured round, then notify and release all clients.
    pub async fn run(mut self) -> RunSummary {
        info!(
            num_rounds = self.config.num_rounds,
            start_round = self.config.start_round,
            min_available = self.config.min_available_clients,
            "coordinator_started"
        );
        let abort = match self.drive().await {
            Ok(()) => None,
            Err(reason) => {
                error!(round = reason.round, phase = ?reason.phase, error = %reason.error, "run_aborted");
                if let Err(e) = self.machine.transition(CoordinatorState::AbortedFatal) {
                    warn!(error = %e, "abort_transition_rejected");
                }
                Some(reason)
            }
        };
        self.publish_status();
        self.release_sessions(abort.as_ref()).await;
        RunSummary {
            state: self.machine.state(),
            round: self.round,
            rounds_completed: self.rounds_completed,
            history: self.history,
            abort,
            final_parameters: self.global.load_full(),
        }
    }

    async fn drive(&mut self) -> Result<(), AbortReason> {
        self.enter(CoordinatorState::WaitingForClients, None)?;
        loop {
            ROUND_METRICS.current_round.set(self.round as i64);
            let span = info_span!("round", round = self.round);
            let record = self.run_round().instrument(span).await?;
            info!(
                round = record.round,
                loss = ?record.loss(),
                fit_accepted = record.fit_accepted,
                duration_ms = record.duration.as_millis() as u64,
                "round_completed"
            );
            self.history.push(record);
            self.rounds_completed += 1;
            ROUND_METRICS.rounds_completed.inc();
            if self.round >= self.config.last_round() {
                self.enter(CoordinatorState::Finished, None)?;
                info!(round = self.round, rounds_completed = self.rounds_completed, "run_finished");
                return Ok(());
            }
            self.round += 1;
            self.enter(CoordinatorState::WaitingForClients, None)?;
        }
    }

    async fn run_round(&mut self) -> Result<RoundRecord, AbortReason> {
        let started = Instant::now();
        let (fit, retries) = self.fit_with_retries().await?;

        self.enter(CoordinatorState::Aggregating, Some(Phase::Fit))?;
        let aggregation_started = Instant::now();
        let aggregated = aggregate_fit(&fit.results).map_err(|e| self.abort(Some(Phase::Fit), e))?;
        ROUND_METRICS.aggregation_latency_ms.observe(aggregation_started.elapsed().as_secs_f64() * 1e3);
        let fit_metrics = aggregate_fit_metrics(&fit.results);
        self.install(aggregated);
        info!(accepted = fit.results.len(), failed = fit.failed, "fit_aggregated");

        let (evaluation, eval_accepted, eval_failed) = if self.config.fraction_evaluate > 0.0 {
            self.enter(CoordinatorState::Evaluating, Some(Phase::Evaluate))?;
            let outcome = self.evaluate_with_retries().await?;
            self.enter(CoordinatorState::AggregatingEval, Some(Phase::Evaluate))?;
            let aggregate = aggregate_evaluate(&outcome.results).map_err(|e| self.abort(Some(Phase::Evaluate), e))?;
            info!(loss = aggregate.loss, num_examples = aggregate.num_examples, "evaluate_aggregated");
            (Some(aggregate), outcome.results.len(), outcome.failed)
        } else {
            debug!("evaluation_skipped");
            (None, 0, 0)
        };

        Ok(RoundRecord {
            round: self.round,
            fit_participants: fit.participants,
            fit_accepted: fit.results.len(),
            fit_failed: fit.failed,
            fit_metrics,
            evaluation,
            eval_accepted,
            eval_failed,
            retries,
            duration: started.elapsed(),
            completed_at: Utc::now(),
        })
    }

    /// Failed attempts fall back to WaitingForClients for the same round.
    async fn fit_with_retries(&mut self) -> Result<(PhaseOutcome<FitResult>, u32), AbortReason> {
        let retry = self.config.round_retry();
        let required = self.config.min_fit_clients.max(1);
        let mut attempt = 0u32;
        loop {
            self.wait_for_clients(Phase::Fit).await?;
            self.enter(CoordinatorState::Fitting, Some(Phase::Fit))?;
            let outcome = self.fit_phase().await.map_err(|e| self.abort(Some(Phase::Fit), e))?;
            if outcome.results.len() >= required {
                return Ok((outcome, attempt));
            }
            let delay = self.backoff_or_abort(Phase::Fit, &retry, attempt, outcome.results.len(), required)?;
            attempt += 1;
            self.enter(CoordinatorState::WaitingForClients, Some(Phase::Fit))?;
            self.serve_events_until(Instant::now() + delay, false).await;
        }
    }

    /// Failed attempts stay in Evaluating and re-select.
    async fn evaluate_with_retries(&mut self) -> Result<PhaseOutcome<EvaluateResult>, AbortReason> {
        let retry = self.config.round_retry();
        let required = self.config.min_evaluate_clients.max(1);
        let mut attempt = 0u32;
        loop {
            self.wait_for_clients(Phase::Evaluate).await?;
            let outcome = self.evaluate_phase().await.map_err(|e| self.abort(Some(Phase::Evaluate), e))?;
            if outcome.results.len() >= required {
                return Ok(outcome);
            }
            let delay = self.backoff_or_abort(Phase::Evaluate, &retry, attempt, outcome.results.len(), required)?;
            attempt += 1;
            self.serve_events_until(Instant::now() + delay, false).await;
        }
    }

    fn backoff_or_abort(
        &self,
        phase: Phase,
        retry: &RetryConfig,
        attempt: u32,
        received: usize,
        required: usize,
    ) -> Result<Duration, AbortReason> {
        if attempt as usize >= retry.max_retries {
            let error = FlError::InsufficientClientsFatal { phase, round: self.round, received, required };
            return Err(self.abort(Some(phase), error));
        }
        let delay = retry.backoff(attempt as usize);
        warn!(
            phase = %phase,
            received,
            required,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "phase_below_minimum_retrying"
        );
        ROUND_METRICS.round_retries.inc();
        Ok(delay)
    }

    /// Block until `min_available_clients` sessions are live, serving session events meanwhile.
    async fn wait_for_clients(&mut self, phase: Phase) -> Result<(), AbortReason> {
        let started = Instant::now();
        let required = self.config.min_available_clients;
        let limit = self.config.client_wait_timeout();
        let mut reported = None;
        loop {
            let available = self.sessions.live_count();
            let Err(e) = check_availability(available, required) else {
                return Ok(());
            };
            if reported != Some(available) {
                info!(phase = %phase, %e, "waiting_for_clients");
                reported = Some(available);
            }
            let mut until = Instant::now() + self.config.poll_interval();
            if let Some(limit) = limit {
                if started.elapsed() >= limit {
                    let error = FlError::InsufficientClientsFatal { phase, round: self.round, received: available, required };
                    return Err(self.abort(Some(phase), error));
                }
                until = until.min(started + limit);
            }
            self.serve_events_until(until, true).await;
        }
    }

    async fn serve_events_until(&mut self, until: Instant, wake_on_event: bool) {
        let deadline = tokio::time::Instant::from_std(until);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                event = self.events.recv(), if self.events_open => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => self.events_open = false,
                    }
                    if wake_on_event {
                        return;
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connect { proxy, reply } => {
                let client_id = proxy.client_id().clone();
                let ack = match self.sessions.connect(client_id.clone(), proxy) {
                    Admission::Admitted(connection_id) => SessionAck {
                        client_id,
                        accepted: true,
                        connection_id: Some(connection_id),
                        round: self.round,
                        message: "connected".into(),
                    },
                    Admission::AlreadyConnected => {
                        warn!(client_id = %client_id, "duplicate_connect_rejected");
                        SessionAck::rejected(client_id, self.round, "client id already has a live session")
                    }
                };
                if reply.send(ack).is_err() {
                    debug!("connect_reply_dropped");
                }
            }
            SessionEvent::Disconnect { client_id, reason } => {
                if !self.sessions.disconnect(&client_id, &reason) {
                    debug!(client_id = %client_id, "disconnect_for_unknown_session");
                }
            }
        }
        self.publish_status();
    }

    fn select(&self, phase: Phase) -> Vec<ClientId> {
        let (fraction, minimum) = match phase {
            Phase::Fit => (self.config.fraction_fit, self.config.min_fit_clients),
            Phase::Evaluate => (self.config.fraction_evaluate, self.config.min_evaluate_clients),
        };
        let available = self.sessions.available();
        let picked = select_participants(&available, fraction, minimum, self.policy, self.round);
        info!(phase = %phase, selected = picked.len(), available = available.len(), "participants_selected");
        picked
    }

    async fn fit_phase(&mut self) -> Result<PhaseOutcome<FitResult>> {
        let participants = self.select(Phase::Fit);
        let ins = FitIns { round: self.round, parameters: self.global.load_full(), config: self.config.fit_config.clone() };
        let timeout = self.config.fit_timeout();
        self.fan_out(Phase::Fit, participants, timeout, move |proxy| {
            let ins = ins.clone();
            async move { proxy.fit(ins).await }
        })
        .await
    }

    async fn evaluate_phase(&mut self) -> Result<PhaseOutcome<EvaluateResult>> {
        let participants = self.select(Phase::Evaluate);
        let ins =
            EvaluateIns { round: self.round, parameters: self.global.load_full(), config: self.config.evaluate_config.clone() };
        let timeout = self.config.evaluate_timeout();
        self.fan_out(Phase::Evaluate, participants, timeout, move |proxy| {
            let ins = ins.clone();
            async move { proxy.evaluate(ins).await }
        })
        .await
    }

    /// Issue every request before awaiting any, then collect until all answered or the
    /// deadline passes. Only fatal result errors are returned; everything else is per client.
    async fn fan_out<R, F, Fut>(
        &mut self,
        phase: Phase,
        participants: Vec<ClientId>,
        timeout: Duration,
        call: F,
    ) -> Result<PhaseOutcome<R>>
    where
        R: PhaseResult,
        F: Fn(Arc<dyn ClientProxy>) -> Fut,
        Fut: Future<Output = std::result::Result<R, ClientError>> + Send + 'static,
    {
        let deadline = Instant::now() + timeout;
        let busy = match phase {
            Phase::Fit => SessionStatus::Fitting,
            Phase::Evaluate => SessionStatus::Evaluating,
        };
        let mut collector =
            Collector { phase, broadcast: self.global.load_full(), accepted: BTreeMap::new(), failed: 0 };
        let mut pending: BTreeMap<ClientId, Uuid> = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for id in &participants {
            let Some(session) = self.sessions.get(id) else { continue };
            let Some(proxy) = session.proxy() else { continue };
            let connection_id = session.connection_id;
            self.sessions.set_status(id, busy, Some(deadline));
            pending.insert(id.clone(), connection_id);
            let request = call(proxy);
            let id = id.clone();
            tasks.spawn(async move { (id, connection_id, request.await) });
        }
        debug!(phase = %phase, in_flight = pending.len(), timeout_ms = timeout.as_millis() as u64, "phase_started");

        let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline));
        tokio::pin!(sleep);
        while !pending.is_empty() {
            tokio::select! {
                _ = &mut sleep => {
                    for id in std::mem::take(&mut pending).into_keys() {
                        let err = FlError::ClientTimeout { client: id.to_string() };
                        warn!(phase = %phase, client_id = %id, error = %err, "client_timed_out");
                        self.client_failed(phase, &id, &ClientError::Timeout);
                        collector.failed += 1;
                    }
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((id, connection_id, outcome))) => {
                        pending.remove(&id);
                        self.collect(&mut collector, &id, connection_id, outcome)?;
                    }
                    Some(Err(e)) => warn!(phase = %phase, error = %e, "client_task_failed"),
                    None => break,
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => self.events_open = false,
                },
            }
        }
        // calls whose task panicked never reported back
        for id in pending.into_keys() {
            self.client_failed(phase, &id, &ClientError::Remote("client call aborted".into()));
            collector.failed += 1;
        }
        tasks.abort_all();

        Ok(PhaseOutcome { participants, results: collector.accepted.into_values().collect(), failed: collector.failed })
    }

    fn collect<R: PhaseResult>(
        &mut self,
        collector: &mut Collector<R>,
        id: &ClientId,
        connection_id: Uuid,
        outcome: std::result::Result<R, ClientError>,
    ) -> Result<()> {
        let phase = collector.phase;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(phase = %phase, client_id = %id, error = %e, "client_call_failed");
                self.client_failed(phase, id, &e);
                collector.failed += 1;
                return Ok(());
            }
        };
        if !self.sessions.is_current(id, connection_id) {
            info!(phase = %phase, client_id = %id, "stale_result_dropped");
            ROUND_METRICS.dropped_results.with_label_values(&[phase.as_str(), "stale"]).inc();
            collector.failed += 1;
            return Ok(());
        }
        if collector.accepted.contains_key(id) {
            info!(phase = %phase, client_id = %id, "duplicate_result_dropped");
            ROUND_METRICS.dropped_results.with_label_values(&[phase.as_str(), "duplicate"]).inc();
            return Ok(());
        }
        match result.check(id, &collector.broadcast) {
            Ok(()) => {
                debug!(phase = %phase, client_id = %id, num_examples = result.num_examples(), "result_accepted");
                ROUND_METRICS.results_accepted.with_label_values(&[phase.as_str()]).inc();
                if let Some(session) = self.sessions.get_mut(id) {
                    session.last_num_examples = Some(result.num_examples());
                }
                self.sessions.set_status(id, SessionStatus::Idle, None);
                collector.accepted.insert(id.clone(), result);
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                error!(phase = %phase, client_id = %id, error = %e, "fatal_result");
                Err(e)
            }
            Err(e) => {
                warn!(phase = %phase, client_id = %id, error = %e, "malformed_result_dropped");
                self.client_failed(phase, id, &ClientError::Protocol(e.to_string()));
                collector.failed += 1;
                Ok(())
            }
        }
    }

    fn client_failed(&mut self, phase: Phase, id: &ClientId, err: &ClientError) {
        ROUND_METRICS.client_failures.with_label_values(&[phase.as_str(), err.kind()]).inc();
        if err.disconnects() {
            self.sessions.disconnect(id, &err.to_string());
            self.publish_status();
        } else {
            if let Some(session) = self.sessions.get_mut(id) {
                session.failures += 1;
            }
            self.sessions.set_status(id, SessionStatus::Idle, None);
        }
    }

    fn enter(&mut self, next: CoordinatorState, phase: Option<Phase>) -> Result<(), AbortReason> {
        self.machine.transition(next).map_err(|e| self.abort(phase, e))?;
        self.publish_status();
        Ok(())
    }

    fn abort(&self, phase: Option<Phase>, error: FlError) -> AbortReason {
        AbortReason { phase, round: self.round, error }
    }

    fn install(&mut self, parameters: ParameterSet) {
        self.digest = parameters.digest();
        self.global.store(Arc::new(parameters));
        self.publish_status();
    }

    fn publish_status(&self) {
        let connected = self.sessions.live_count();
        let mut status = self.status.write();
        status.state = self.machine.state();
        status.round = self.round;
        status.rounds_completed = self.rounds_completed;
        status.connected_clients = connected;
        status.parameters_digest.clone_from(&self.digest);
        ROUND_METRICS.connected_clients.set(connected as i64);
    }

    /// Refuse queued connects, then send every live client a best-effort shutdown notice.
    async fn release_sessions(&mut self, abort: Option<&AbortReason>) {
        self.events.close();
        while let Ok(event) = self.events.try_recv() {
            if let SessionEvent::Connect { proxy, reply } = event {
                let _ = reply.send(SessionAck::rejected(proxy.client_id().clone(), self.round, NOT_ACCEPTING));
            }
        }
        let notice = ShutdownNotice {
            reason: abort.map(ToString::to_string).unwrap_or_else(|| "training finished".into()),
            state: self.machine.state(),
        };
        let sends = self.sessions.drain().into_iter().map(|(id, proxy)| {
            let notice = notice.clone();
            async move {
                match tokio::time::timeout(SHUTDOWN_NOTICE_TIMEOUT, proxy.shutdown(notice)).await {
                    Ok(Ok(())) => debug!(client_id = %id, "shutdown_notice_sent"),
                    Ok(Err(e)) => warn!(client_id = %id, error = %e, "shutdown_notice_failed"),
                    Err(_) => warn!(client_id = %id, "shutdown_notice_timed_out"),
                }
            }
        });
        join_all(sends).await;
        self.publish_status();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_proxy::LocalClientProxy;
    use crate::parameters::{Tensor, TensorData};
    use crate::testing::ConstantTrainer;

    fn local(id: &str, values: &[f32]) -> Arc<dyn ClientProxy> {
        Arc::new(LocalClientProxy::new(ClientId::from(id), ConstantTrainer::new(values, 1)))
    }

    fn initial() -> ParameterSet {
        ParameterSet::new(vec![Tensor::new("w", vec![2], TensorData::F32(vec![0.0, 0.0])).unwrap()])
    }

    #[test]
    fn invalid_config_is_rejected_before_start() {
        let config = ServerConfig { min_fit_clients: 4, min_available_clients: 2, ..ServerConfig::default() };
        assert!(matches!(Coordinator::new(config, initial()), Err(FlError::Configuration(_))));
        assert!(matches!(
            Coordinator::new(ServerConfig::default(), ParameterSet::default()),
            Err(FlError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn handshake_rejects_layout_mismatch() {
        let (coordinator, handle) = Coordinator::new(ServerConfig::default(), initial()).unwrap();
        let ack = handle.connect(local("a", &[1.0, 2.0, 3.0])).await;
        assert!(!ack.accepted);
        assert!(ack.message.contains("layout"));
        drop(coordinator);
    }

    #[tokio::test]
    async fn duplicate_connect_is_rejected_while_live() {
        let config = ServerConfig { num_rounds: 1, min_available_clients: 3, min_fit_clients: 1, poll_interval_ms: 10, ..ServerConfig::default() };
        let (coordinator, handle) = Coordinator::new(config, initial()).unwrap();
        let run = tokio::spawn(coordinator.run());

        let first = handle.connect(local("a", &[0.0, 0.0])).await;
        assert!(first.accepted);
        assert!(first.connection_id.is_some());
        let second = handle.connect(local("a", &[0.0, 0.0])).await;
        assert!(!second.accepted);

        assert!(handle.disconnect("a".into(), "test").await);
        let again = handle.connect(local("a", &[0.0, 0.0])).await;
        assert!(again.accepted);
        assert_ne!(again.connection_id, first.connection_id);
        assert_eq!(handle.status().state, CoordinatorState::WaitingForClients);
        run.abort();
    }

    #[tokio::test]
    async fn single_client_run_finishes() {
        let config = ServerConfig { num_rounds: 2, poll_interval_ms: 10, ..ServerConfig::default() };
        let (coordinator, handle) = Coordinator::new(config, initial()).unwrap();
        let run = tokio::spawn(coordinator.run());
        assert!(handle.connect(local("a", &[0.0, 0.0])).await.accepted);
        let summary = run.await.unwrap();
        assert_eq!(summary.state, CoordinatorState::Finished);
        assert_eq!(summary.round, 2);
        assert_eq!(summary.rounds_completed, 2);
        assert_eq!(summary.losses(), vec![(1, 1.0), (2, 1.0)]);
        assert!(!handle.connect(local("b", &[0.0, 0.0])).await.accepted);
    }
}
