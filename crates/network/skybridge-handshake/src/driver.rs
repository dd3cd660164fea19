//! The handshake state machine and driver.
//!
//! One driver owns one handshake. It drives MessageA/B and the FINISHED
//! exchange, enforces timeouts on a monotonic clock, registers replay ids,
//! and funnels every failure through a single path that zeroizes the
//! context, records metrics, emits the `handshake_failed` event and resolves
//! the pending result slot.
//!
//! Two load-bearing behaviors live here:
//!
//! - **Single-resume invariant.** Peer messages, the timeout task and
//!   cancellation race to complete the caller. A take-once result slot
//!   (`Empty → Waiter/EarlyResult → Consumed`) guarantees exactly one
//!   completion, and an answer that arrives before the caller installs its
//!   waiter is parked as an early result.
//! - **MessageB re-entrancy guard.** Each MessageB processing pass tags the
//!   state with a fresh epoch; when the state moved on while the async
//!   crypto ran (cancellation, timeout), the stale result is discarded
//!   without touching the current session.

use crate::config::HandshakeConfig;
use crate::context::HandshakeContext;
use crate::error::{HandshakeError, Result};
use crate::keyschedule::SessionKeys;
use crate::messages::{
    FinishedDirection, HandshakeFinished, HandshakeMessageA, HandshakeMessageB,
};
use crate::metrics::HandshakeMetrics;
use crate::negotiation::{signature_algorithm_for_offer, OfferedSuites};
use crate::pinning::IdentityValidator;
use crate::replay::ReplayCache;
use crate::transport::{FrameTransport, InboundHandler};
use async_trait::async_trait;
use skybridge_identity::TrustRecordUpdate;
use parking_lot::Mutex;
use skybridge_core::{DeviceId, EventSink, Role, SecurityEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Observable state of a driver, for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStateKind {
    /// Nothing has happened yet.
    Idle,
    /// MessageA is being built/sent.
    SendingA,
    /// Waiting for MessageB.
    WaitingB,
    /// MessageA is being processed (responder).
    ProcessingA,
    /// MessageB is being processed (initiator).
    ProcessingB,
    /// MessageB is being sent (responder).
    SendingB,
    /// Keys derived; waiting for the peer's FINISHED.
    WaitingFinished,
    /// Session established.
    Established,
    /// Terminal failure.
    Failed,
}

enum DriverState {
    Idle,
    SendingA,
    WaitingB,
    ProcessingA,
    ProcessingB { epoch: u64 },
    SendingB,
    WaitingFinished { expecting: FinishedDirection },
    Established,
    Failed { reason: &'static str },
}

impl DriverState {
    fn kind(&self) -> DriverStateKind {
        match self {
            Self::Idle => DriverStateKind::Idle,
            Self::SendingA => DriverStateKind::SendingA,
            Self::WaitingB => DriverStateKind::WaitingB,
            Self::ProcessingA => DriverStateKind::ProcessingA,
            Self::ProcessingB { .. } => DriverStateKind::ProcessingB,
            Self::SendingB => DriverStateKind::SendingB,
            Self::WaitingFinished { .. } => DriverStateKind::WaitingFinished,
            Self::Established => DriverStateKind::Established,
            Self::Failed { .. } => DriverStateKind::Failed,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Established | Self::Failed { .. })
    }
}

type Outcome = Result<SessionKeys>;

enum SlotState {
    Empty,
    Waiter(oneshot::Sender<Outcome>),
    EarlyResult(Outcome),
    Consumed,
}

/// Take-once completion cell.
struct ResultSlot {
    state: Mutex<SlotState>,
}

enum Installed {
    Immediate(Outcome),
    Wait(oneshot::Receiver<Outcome>),
    Busy,
}

impl ResultSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
        }
    }

    /// Delivers an outcome. The first delivery wins; later ones are dropped.
    fn complete(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Consumed) {
            SlotState::Empty => *state = SlotState::EarlyResult(outcome),
            SlotState::Waiter(tx) => {
                // Receiver may have been dropped; the outcome is consumed
                // either way.
                let _ = tx.send(outcome);
            }
            early @ SlotState::EarlyResult(_) => *state = early,
            SlotState::Consumed => {}
        }
    }

    /// Installs a waiter, draining an early result when one is parked.
    fn install(&self) -> Installed {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Consumed) {
            SlotState::Empty => {
                let (tx, rx) = oneshot::channel();
                *state = SlotState::Waiter(tx);
                Installed::Wait(rx)
            }
            SlotState::EarlyResult(outcome) => Installed::Immediate(outcome),
            waiter @ SlotState::Waiter(_) => {
                *state = waiter;
                Installed::Busy
            }
            SlotState::Consumed => Installed::Busy,
        }
    }
}

struct DriverCore {
    state: DriverState,
    context: Option<HandshakeContext>,
    session: Option<SessionKeys>,
    pending_finished: Option<HandshakeFinished>,
    trust_update: Option<TrustRecordUpdate>,
    timeout_task: Option<JoinHandle<()>>,
    started_at: Instant,
}

struct DriverInner {
    role: Role,
    peer: DeviceId,
    config: HandshakeConfig,
    transport: Arc<dyn FrameTransport>,
    validator: Arc<dyn IdentityValidator>,
    events: Arc<dyn EventSink>,
    metrics: Arc<HandshakeMetrics>,
    replay: Arc<ReplayCache>,
    slot: ResultSlot,
    epoch: AtomicU64,
    state: tokio::sync::Mutex<DriverCore>,
}

impl DriverInner {
    /// The single failure funnel: zeroizes, records metrics, emits the
    /// security event and resolves the pending result slot. Idempotent once
    /// the state is terminal.
    fn fail_locked(&self, core: &mut DriverCore, err: HandshakeError) {
        if core.state.is_terminal() {
            return;
        }
        if let Some(handle) = core.timeout_task.take() {
            handle.abort();
        }
        if let Some(mut context) = core.context.take() {
            context.zeroize();
        }
        core.session = None;
        core.pending_finished = None;
        core.trust_update = None;

        let reason = err.reason_code();
        core.state = DriverState::Failed { reason };
        self.metrics.record_failure(reason, err.failure_class());
        self.events
            .emit(SecurityEvent::handshake_failed(reason, &self.peer));
        tracing::debug!(peer = %self.peer, reason, "handshake failed");
        self.slot.complete(Err(err));
    }
}

/// Collaborators a driver is wired to.
pub struct DriverParams {
    /// Outbound frame transport.
    pub transport: Arc<dyn FrameTransport>,

    /// Post-signature identity validation hook.
    pub validator: Arc<dyn IdentityValidator>,

    /// Driver tunables.
    pub config: HandshakeConfig,

    /// Security-event sink.
    pub events: Arc<dyn EventSink>,

    /// Metrics collector.
    pub metrics: Arc<HandshakeMetrics>,

    /// Replay cache (process-global by default).
    pub replay: Arc<ReplayCache>,
}

/// Drives one handshake from `idle` to `established` or `failed`.
pub struct HandshakeDriver {
    inner: Arc<DriverInner>,
    offered: Option<OfferedSuites>,
}

impl HandshakeDriver {
    /// Creates an initiator driver.
    ///
    /// Validates the offer (non-empty, homogeneous) and that the context's
    /// signer produces the algorithm the offer requires.
    pub fn initiator(
        peer: DeviceId,
        context: HandshakeContext,
        offered: OfferedSuites,
        params: DriverParams,
    ) -> Result<Self> {
        params.config.validate()?;
        if offered.is_empty() {
            return Err(offered.empty_error());
        }
        let required = signature_algorithm_for_offer(&offered.suites)?;
        match context.signer_algorithm() {
            Some(actual) if actual == required => {}
            Some(actual) => {
                return Err(HandshakeError::ProviderAlgorithmMismatch {
                    expected: required,
                    actual,
                })
            }
            None => {
                return Err(HandshakeError::InvalidProviderType(
                    "initiator context has no signer".into(),
                ))
            }
        }
        Ok(Self::build(Role::Initiator, peer, context, Some(offered), params))
    }

    /// Creates a responder driver.
    pub fn responder(
        peer: DeviceId,
        context: HandshakeContext,
        params: DriverParams,
    ) -> Result<Self> {
        params.config.validate()?;
        Ok(Self::build(Role::Responder, peer, context, None, params))
    }

    fn build(
        role: Role,
        peer: DeviceId,
        context: HandshakeContext,
        offered: Option<OfferedSuites>,
        params: DriverParams,
    ) -> Self {
        Self {
            inner: Arc::new(DriverInner {
                role,
                peer,
                config: params.config,
                transport: params.transport,
                validator: params.validator,
                events: params.events,
                metrics: params.metrics,
                replay: params.replay,
                slot: ResultSlot::new(),
                epoch: AtomicU64::new(0),
                state: tokio::sync::Mutex::new(DriverCore {
                    state: DriverState::Idle,
                    context: Some(context),
                    session: None,
                    pending_finished: None,
                    trust_update: None,
                    timeout_task: None,
                    started_at: Instant::now(),
                }),
            }),
            offered,
        }
    }

    /// Current state, for tests and diagnostics.
    pub async fn state(&self) -> DriverStateKind {
        self.inner.state.lock().await.state.kind()
    }

    /// The metrics collector this driver records to.
    pub fn metrics(&self) -> Arc<HandshakeMetrics> {
        self.inner.metrics.clone()
    }

    /// First-contact trust recommendation, once the handshake verified the
    /// peer. The pairing flow decides whether to commit it.
    pub async fn recommended_trust_update(&self) -> Option<TrustRecordUpdate> {
        self.inner.state.lock().await.trust_update.clone()
    }

    /// Starts the handshake (initiator role) and waits for the outcome.
    pub async fn initiate_handshake(&self) -> Result<SessionKeys> {
        let offered = self
            .offered
            .as_ref()
            .ok_or_else(|| HandshakeError::InvalidProviderType(
                "initiate_handshake on a responder driver".into(),
            ))?;

        let message_bytes = {
            let mut core = self.inner.state.lock().await;
            if !matches!(core.state, DriverState::Idle) {
                return Err(HandshakeError::AlreadyInProgress);
            }
            core.state = DriverState::SendingA;
            core.started_at = Instant::now();

            let context = core.context.as_mut().expect("context present while idle");
            match context.build_message_a(offered) {
                Ok(message) => {
                    self.inner.metrics.record_initiated();
                    self.inner.metrics.record_message_a();
                    core.state = DriverState::WaitingB;
                    core.timeout_task = Some(self.spawn_timeout());
                    message.encode()
                }
                Err(err) => {
                    self.inner.fail_locked(&mut core, err);
                    drop(core);
                    return self.completed().await;
                }
            }
        };

        if let Err(err) = self
            .inner
            .transport
            .send(&self.inner.peer, message_bytes)
            .await
        {
            let mut core = self.inner.state.lock().await;
            self.inner.fail_locked(&mut core, err);
        }

        self.completed().await
    }

    /// Waits for the single outcome of this handshake.
    ///
    /// If the outcome arrived before the waiter was installed it is
    /// delivered immediately from the early-result field.
    pub async fn completed(&self) -> Result<SessionKeys> {
        match self.inner.slot.install() {
            Installed::Immediate(outcome) => outcome,
            Installed::Wait(rx) => rx.await.map_err(|_| HandshakeError::Cancelled)?,
            Installed::Busy => Err(HandshakeError::AlreadyInProgress),
        }
    }

    /// Cancels the handshake. A no-op once the state is terminal.
    pub async fn cancel(&self) -> Result<()> {
        let mut core = self.inner.state.lock().await;
        if core.state.is_terminal() {
            return Ok(());
        }
        self.inner.fail_locked(&mut core, HandshakeError::Cancelled);
        Ok(())
    }

    /// Dispatches an inbound frame by current state.
    ///
    /// All failures are funneled (zeroize, event, slot resolution) before
    /// returning; the return value is informational for the adapter.
    pub async fn handle_message(&self, bytes: &[u8], from: &DeviceId) -> Result<()> {
        if HandshakeFinished::is_finished_frame(bytes) {
            let finished = match HandshakeFinished::decode(bytes) {
                Ok(finished) => finished,
                Err(err) => {
                    let mut core = self.inner.state.lock().await;
                    self.inner.fail_locked(&mut core, err);
                    return Ok(());
                }
            };
            return self.handle_finished(finished).await;
        }

        let mut core = self.inner.state.lock().await;
        match core.state {
            DriverState::Idle if self.inner.role == Role::Responder => {
                let message = match HandshakeMessageA::decode(bytes) {
                    Ok(message) => message,
                    Err(err) => {
                        self.inner.fail_locked(&mut core, err);
                        return Ok(());
                    }
                };
                core.state = DriverState::ProcessingA;
                core.started_at = Instant::now();
                self.inner.metrics.record_initiated();
                let context = core.context.take().expect("context present while idle");
                drop(core);
                self.process_message_a(context, message, from).await
            }
            DriverState::WaitingB => {
                let message = match HandshakeMessageB::decode(bytes) {
                    Ok(message) => message,
                    Err(err) => {
                        self.inner.fail_locked(&mut core, err);
                        return Ok(());
                    }
                };
                let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                core.state = DriverState::ProcessingB { epoch };
                let mut context = core.context.take().expect("context present while waiting");
                drop(core);

                let result = context
                    .process_message_b(&message, self.inner.validator.as_ref(), &self.inner.replay, from)
                    .await;
                self.finish_message_b(context, result, epoch).await
            }
            _ => {
                tracing::debug!(
                    peer = %from,
                    state = ?core.state.kind(),
                    "dropping frame not expected in this state"
                );
                Ok(())
            }
        }
    }

    /// Responder path: process MessageA, answer with MessageB and the R→I
    /// FINISHED, then wait for the I→R FINISHED.
    async fn process_message_a(
        &self,
        mut context: HandshakeContext,
        message: HandshakeMessageA,
        from: &DeviceId,
    ) -> Result<()> {
        let result = async {
            context
                .process_message_a(&message, self.inner.validator.as_ref(), &self.inner.replay, from)
                .await?;
            let (message_b, shared_secret) = context.build_message_b().await?;
            let keys = context.derive_keys(shared_secret)?;
            let finished = HandshakeFinished {
                direction: FinishedDirection::ResponderToInitiator,
                mac: keys.finished_mac(FinishedDirection::ResponderToInitiator)?,
            };
            Ok::<_, HandshakeError>((message_b.encode(), finished.encode(), keys))
        }
        .await;
        let trust_update = context.take_recommended_trust_update();
        context.zeroize();

        let mut core = self.inner.state.lock().await;
        if !matches!(core.state, DriverState::ProcessingA) {
            // Cancelled or timed out while the crypto ran; the result is
            // obsolete.
            return Ok(());
        }

        match result {
            Ok((b_bytes, finished_bytes, keys)) => {
                core.state = DriverState::SendingB;
                core.session = Some(keys);
                core.trust_update = trust_update;
                core.state = DriverState::WaitingFinished {
                    expecting: FinishedDirection::InitiatorToResponder,
                };
                core.timeout_task = Some(self.spawn_timeout());
                drop(core);

                for bytes in [b_bytes, finished_bytes] {
                    if let Err(err) = self.inner.transport.send(&self.inner.peer, bytes).await {
                        let mut core = self.inner.state.lock().await;
                        self.inner.fail_locked(&mut core, err);
                        return Ok(());
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.inner.fail_locked(&mut core, err);
                Ok(())
            }
        }
    }

    /// Initiator path: land the result of an async MessageB processing pass,
    /// unless the epoch shows the state moved on.
    async fn finish_message_b(
        &self,
        mut context: HandshakeContext,
        result: Result<SessionKeys>,
        epoch: u64,
    ) -> Result<()> {
        let mut core = self.inner.state.lock().await;
        let still_current = matches!(core.state, DriverState::ProcessingB { epoch: e } if e == epoch);
        if !still_current {
            context.zeroize();
            tracing::debug!(epoch, "discarding obsolete MessageB result");
            return Ok(());
        }

        match result {
            Ok(keys) => {
                core.trust_update = context.take_recommended_trust_update();
                context.zeroize();
                core.session = Some(keys);
                core.state = DriverState::WaitingFinished {
                    expecting: FinishedDirection::ResponderToInitiator,
                };
                if let Some(finished) = core.pending_finished.take() {
                    // The responder's FINISHED arrived while MessageB was
                    // still being processed.
                    drop(core);
                    return self.handle_finished(finished).await;
                }
                Ok(())
            }
            Err(err) => {
                context.zeroize();
                self.inner.fail_locked(&mut core, err);
                Ok(())
            }
        }
    }

    async fn handle_finished(&self, finished: HandshakeFinished) -> Result<()> {
        let mut core = self.inner.state.lock().await;
        match core.state {
            DriverState::WaitingB | DriverState::ProcessingB { .. } => {
                // Early arrival: the peer confirmed before we finished
                // processing its MessageB. Buffer one FINISHED.
                core.pending_finished = Some(finished);
                Ok(())
            }
            DriverState::WaitingFinished { expecting } => {
                if finished.direction != expecting {
                    self.inner.fail_locked(
                        &mut core,
                        HandshakeError::InvalidMessageFormat(format!(
                            "unexpected FINISHED direction {:?}",
                            finished.direction
                        )),
                    );
                    return Ok(());
                }
                let keys = core.session.as_ref().expect("session set before waiting");
                if let Err(err) = keys.verify_finished_mac(finished.direction, &finished.mac) {
                    self.inner.fail_locked(&mut core, err);
                    return Ok(());
                }

                let keys = core.session.take().expect("session set before waiting");
                let reply = if self.inner.role == Role::Initiator {
                    match keys.finished_mac(FinishedDirection::InitiatorToResponder) {
                        Ok(mac) => Some(
                            HandshakeFinished {
                                direction: FinishedDirection::InitiatorToResponder,
                                mac,
                            }
                            .encode(),
                        ),
                        Err(err) => {
                            self.inner.fail_locked(&mut core, err);
                            return Ok(());
                        }
                    }
                } else {
                    None
                };

                if let Some(handle) = core.timeout_task.take() {
                    handle.abort();
                }
                if let Some(mut context) = core.context.take() {
                    context.zeroize();
                }
                core.state = DriverState::Established;
                self.inner
                    .metrics
                    .record_established(core.started_at.elapsed());
                self.inner.slot.complete(Ok(keys.clone()));
                drop(core);

                if let Some(bytes) = reply {
                    if let Err(err) = self.inner.transport.send(&self.inner.peer, bytes).await {
                        // The session is already delivered locally; the peer
                        // will time out and retry if this loss matters.
                        tracing::warn!(error = %err, "failed to send FINISHED reply");
                    }
                }
                Ok(())
            }
            DriverState::Established | DriverState::Failed { .. } => Ok(()),
            _ => {
                tracing::debug!("dropping FINISHED in pre-key state");
                Ok(())
            }
        }
    }

    fn spawn_timeout(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let timeout = self.inner.config.effective_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut core = inner.state.lock().await;
            if core.state.is_terminal() {
                // A timeout after establishment (or failure) is a no-op.
                return;
            }
            inner.fail_locked(&mut core, HandshakeError::Timeout);
        })
    }
}

#[async_trait]
impl InboundHandler for HandshakeDriver {
    async fn on_frame(&self, from: &DeviceId, payload: Vec<u8>) {
        if let Err(err) = self.handle_message(&payload, from).await {
            tracing::debug!(peer = %from, error = %err, "inbound frame rejected");
        }
    }
}
