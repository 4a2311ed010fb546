//! The turn-taking actor.
//!
//! One task owns the turn context, the voter, the floor and every timer.
//! Recognizer output, speech progress, peer traffic and user commands all
//! arrive as messages, so state transitions never race.

use std::sync::Arc;

use parking_lot::Mutex;
use parley_engine::{
    AudioSessionError, Engines, RecognizerError, RecognizerErrorKind, RecognizerEvent,
    RecognizerMessage, RecognizerSink, RetryDecision, RetryPolicy, StopBoundary, TranscriptUpdate,
    TransportEvent,
};
use parley_events::{
    emit, topics, CaptureResumeEvent, CommitReason, EventBusRef, LanguageDecisionEvent,
    NoticeEvent, PartialUpdateEvent, PeerDisconnectedEvent, PeerReorderedEvent, PhraseCommitEvent,
    QueueDepthAlertEvent, SpeechEndEvent, SpeechStartEvent, TurnMetrics, TurnMetricsSnapshot,
    UtteranceStartEvent,
};
use parley_floor::{
    AudioLease, AudioRoute, AudioSession, FloorController, FloorReason, FloorSnapshot, FloorState,
};
use parley_lang::{Language, LanguageDecision, LanguageVoter, RetargetTracker};
use parley_peer::{
    epoch_seconds, Delivery, DeliveryOrder, OutboundSequencer, Outbox, PeerSequencer, WireError,
    WireMessage,
};
use parley_purity::PurityGuard;
use parley_queue::{phrase_queue, PhraseCommit, PhraseOrigin, PhraseProducer};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ParleyConfig;
use crate::context::{strip_word_prefix, TurnContext};
use crate::drain::{DrainDeps, DrainEvent, SpeechDrain};
use crate::echo::EchoFilter;
use crate::error::{CoordinatorError, Result};
use crate::timers::{sleep_until, TimerBank, TimerKind};

/// Coarse coordinator state, derived from the floor and capture flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Capturing,
    Speaking,
    Grace,
    Paused,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorSnapshot {
    pub state: TurnState,
    pub pending_timers: Vec<TimerKind>,
    pub queue_depth: usize,
    pub floor: FloorSnapshot,
    pub capture_active: bool,
    pub locale: Language,
    pub utterance: u64,
    pub utterance_chars: usize,
    pub locked: Option<Language>,
    pub transport_frozen: bool,
    pub outbox_pending: usize,
    pub peers_buffered: usize,
}

enum Command {
    Start(oneshot::Sender<Result<()>>),
    Pause,
    Resume,
    SetRoute(AudioRoute),
    SetLowPower(bool),
    RestartTransport,
    Transport(TransportEvent),
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Start the same pipeline again, keeping the utterance.
    Restart,
    /// Start a new pipeline with a fresh utterance.
    Rotate,
    /// Tear everything down and rebuild from scratch.
    Reboot,
}

pub struct TurnCoordinator;

impl TurnCoordinator {
    /// Validate the config and start the actor with its speech drain and
    /// peer outbox. Capture begins with [`CoordinatorHandle::start`].
    pub fn spawn(
        config: ParleyConfig,
        engines: Engines,
        bus: EventBusRef,
    ) -> Result<CoordinatorHandle> {
        config.validate()?;

        let metrics = Arc::new(TurnMetrics::new());
        let cancel = CancellationToken::new();
        let (producer, consumer) = phrase_queue(config.queue.clone());
        let (hold_tx, hold_rx) = watch::channel(false);
        let (drain_tx, drain_rx) = mpsc::unbounded_channel();
        let (recognizer_tx, recognizer_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();

        let drain = SpeechDrain::spawn(
            DrainDeps {
                translator: Arc::clone(&engines.translator),
                synthesizer: Arc::clone(&engines.synthesizer),
                guard: PurityGuard::new(Arc::clone(&engines.translator), config.purity.clone()),
                voices: config.voices.clone(),
                queue: config.queue.clone(),
                bus: Arc::clone(&bus),
                metrics: Arc::clone(&metrics),
            },
            consumer,
            drain_tx,
            hold_rx,
            cancel.child_token(),
        );
        let outbox = Outbox::spawn(
            Arc::clone(&engines.transport),
            RetryPolicy::transport(&config.retry),
            Arc::clone(&bus),
            cancel.child_token(),
        );

        let actor = Actor {
            voter: LanguageVoter::new(config.languages.clone(), config.voter.clone()),
            retarget: RetargetTracker::new(config.retarget.clone()),
            floor: FloorController::new(config.floor.clone()),
            inbound: PeerSequencer::new(config.peer.clone()),
            locale: config.languages.local.clone(),
            audio: AudioSession::new(Arc::clone(&engines.audio_device)),
            timers: TimerBank::new(Arc::clone(&metrics)),
            ctx: TurnContext::new(1),
            next_utterance: 2,
            echo: EchoFilter::new(),
            expected_next: None,
            baseline: String::new(),
            last_raw: String::new(),
            producer,
            hold: hold_tx,
            outbound: OutboundSequencer::new(),
            outbox: Some(outbox),
            drain: Some(drain),
            capture_lease: None,
            speech_lease: None,
            recognizer_tx,
            epoch: 0,
            capture_active: false,
            started: false,
            paused: false,
            resume_pending: false,
            low_power: false,
            failures: 0,
            recovery: None,
            rebooting: false,
            config,
            engines,
            bus,
            metrics: Arc::clone(&metrics),
            cancel,
        };
        let task = tokio::spawn(actor.run(rx, recognizer_rx, drain_rx));
        tracing::debug!("turn coordinator spawned");

        Ok(CoordinatorHandle {
            tx,
            metrics,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

/// Cheap, cloneable access to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    metrics: Arc<TurnMetrics>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CoordinatorHandle {
    /// Start capture. Fails only when recognition cannot run at all.
    pub async fn start(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Start(ack))?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }

    /// Stop capture, drop the floor and cancel every timer.
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    /// Resume after the route's grace interval with a fresh utterance.
    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    pub fn set_route(&self, route: AudioRoute) -> Result<()> {
        self.send(Command::SetRoute(route))
    }

    pub fn set_low_power(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetLowPower(enabled))
    }

    /// User-initiated restart of frozen peer delivery.
    pub fn restart_transport(&self) -> Result<()> {
        self.send(Command::RestartTransport)
    }

    /// Inbound side of the transport: connections and received payloads.
    pub fn transport_event(&self, event: TransportEvent) -> Result<()> {
        self.send(Command::Transport(event))
    }

    pub async fn snapshot(&self) -> Result<CoordinatorSnapshot> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Snapshot(ack))?;
        rx.await.map_err(|_| CoordinatorError::Stopped)
    }

    pub fn metrics(&self) -> TurnMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop all timers and tasks. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "turn coordinator task failed");
            }
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| CoordinatorError::Stopped)
    }
}

struct Actor {
    config: ParleyConfig,
    engines: Engines,
    bus: EventBusRef,
    metrics: Arc<TurnMetrics>,
    cancel: CancellationToken,

    timers: TimerBank,
    floor: FloorController,
    voter: LanguageVoter,
    retarget: RetargetTracker,
    ctx: TurnContext,
    next_utterance: u64,
    echo: EchoFilter,
    /// Listener of the last spoken phrase, biased at the next utterance.
    expected_next: Option<Language>,
    /// Raw recognizer text already consumed by a commit in this segment.
    baseline: String,
    last_raw: String,

    producer: PhraseProducer,
    hold: watch::Sender<bool>,
    drain: Option<SpeechDrain>,

    outbound: OutboundSequencer,
    inbound: PeerSequencer,
    outbox: Option<Outbox>,

    audio: AudioSession,
    capture_lease: Option<AudioLease>,
    speech_lease: Option<AudioLease>,

    recognizer_tx: mpsc::UnboundedSender<RecognizerMessage>,
    epoch: u64,
    locale: Language,
    capture_active: bool,
    started: bool,
    paused: bool,
    resume_pending: bool,
    low_power: bool,
    failures: u32,
    recovery: Option<Recovery>,
    rebooting: bool,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut recognizer: mpsc::UnboundedReceiver<RecognizerMessage>,
        mut drain: mpsc::UnboundedReceiver<DrainEvent>,
    ) {
        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        self.teardown().await;
                        let _ = ack.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        return;
                    }
                },
                Some(message) = recognizer.recv() => self.handle_recognizer(message).await,
                Some(event) = drain.recv() => self.handle_drain(event),
                _ = sleep_until(deadline) => self.fire_timers().await,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Start(ack) => {
                let result = self.start(now).await;
                let _ = ack.send(result);
            }
            Command::Pause => self.pause().await,
            Command::Resume => self.resume(now),
            Command::SetRoute(route) => self.floor.set_route(route),
            Command::SetLowPower(enabled) => self.set_low_power(enabled),
            Command::RestartTransport => {
                if let Some(outbox) = &self.outbox {
                    outbox.restart();
                }
            }
            Command::Transport(event) => self.handle_transport(event, now),
            Command::Snapshot(ack) => {
                let _ = ack.send(self.snapshot(now));
            }
            // Handled by the run loop.
            Command::Shutdown(_) => {}
        }
    }

    // Lifecycle

    async fn start(&mut self, now: Instant) -> Result<()> {
        if self.started && (self.capture_active || self.paused) {
            return Ok(());
        }
        self.started = true;
        self.outbound.reset();
        tracing::info!(
            local = %self.config.languages.local,
            remote = %self.config.languages.remote,
            delivery = ?self.config.delivery,
            "conversation session started"
        );
        match self.start_capture(now).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => {
                self.fatal(&e);
                Err(CoordinatorError::Fatal(e))
            }
            Err(e) => {
                self.on_recognizer_error(e, now).await;
                Ok(())
            }
        }
    }

    async fn pause(&mut self) {
        if self.paused && !self.resume_pending {
            tracing::debug!("already paused");
            return;
        }
        self.paused = true;
        self.resume_pending = false;
        self.timers.cancel_all();
        self.recovery = None;
        self.rebooting = false;
        self.hold.send_replace(true);
        if matches!(self.floor.state(), FloorState::Held { .. }) {
            self.engines.synthesizer.stop(StopBoundary::Immediate);
        }
        self.floor.force_release();
        self.stop_capture().await;
        self.reset_context();
        self.baseline.clear();
        self.last_raw.clear();
        self.echo.clear();
        tracing::info!("turn coordination paused");
    }

    fn resume(&mut self, now: Instant) {
        if !self.paused || self.resume_pending {
            tracing::debug!("resume ignored, not paused or already resuming");
            return;
        }
        self.resume_pending = true;
        let grace = self.floor.grace();
        self.timers.arm(TimerKind::Grace, now + grace);
        self.sync_reorder_timer();
        tracing::debug!(grace_ms = grace.as_millis() as u64, "resume scheduled");
    }

    fn set_low_power(&mut self, enabled: bool) {
        if self.low_power == enabled {
            return;
        }
        self.low_power = enabled;
        tracing::debug!(low_power = enabled, "utterance cap changed");
        if let Some(started) = self.ctx.started_at() {
            if self.timers.is_armed(TimerKind::HardCap) {
                let cap = self.config.commit.max_utterance(enabled);
                self.timers.arm(TimerKind::HardCap, started + cap);
            }
        }
    }

    async fn teardown(&mut self) {
        self.timers.cancel_all();
        self.recovery = None;
        self.stop_capture().await;
        if self.floor.force_release() {
            self.engines.synthesizer.stop(StopBoundary::Immediate);
        }
        self.producer.close();
        self.cancel.cancel();
        if let Some(drain) = self.drain.take() {
            drain.join().await;
        }
        if let Some(outbox) = self.outbox.take() {
            outbox.shutdown().await;
        }
        self.speech_lease = None;
        tracing::info!("turn coordinator stopped");
    }

    fn snapshot(&self, now: Instant) -> CoordinatorSnapshot {
        let state = if self.paused {
            TurnState::Paused
        } else {
            match self.floor.state() {
                FloorState::Held { .. } => TurnState::Speaking,
                FloorState::Releasing { .. } => TurnState::Grace,
                FloorState::Free if self.started => TurnState::Capturing,
                FloorState::Free => TurnState::Idle,
            }
        };
        CoordinatorSnapshot {
            state,
            pending_timers: self.timers.pending(),
            queue_depth: self.producer.depth(),
            floor: self.floor.snapshot(now),
            capture_active: self.capture_active,
            locale: self.locale.clone(),
            utterance: self.ctx.utterance(),
            utterance_chars: self.ctx.text().chars().count(),
            locked: self.ctx.locked_language().cloned(),
            transport_frozen: self.outbox.as_ref().is_some_and(Outbox::is_frozen),
            outbox_pending: self.outbox.as_ref().map_or(0, Outbox::pending),
            peers_buffered: self.inbound.buffered(),
        }
    }

    // Capture

    async fn start_capture(&mut self, now: Instant) -> std::result::Result<(), RecognizerError> {
        if self.capture_active {
            return Ok(());
        }
        if self.capture_lease.is_none() {
            let lease = self.audio.acquire("capture").map_err(|e| match e {
                AudioSessionError::Busy => RecognizerError::Busy,
                AudioSessionError::Unavailable(_) => RecognizerError::Unavailable,
            })?;
            self.capture_lease = Some(lease);
        }

        self.epoch += 1;
        let sink = RecognizerSink::new(self.epoch, self.recognizer_tx.clone());
        if let Err(e) = self.engines.recognizer.start(&self.locale, sink).await {
            self.capture_lease = None;
            return Err(e);
        }
        self.capture_active = true;
        self.timers
            .arm(TimerKind::NoGrowth, now + self.config.commit.no_growth());
        tracing::info!(
            recognizer = self.engines.recognizer.name(),
            locale = %self.locale,
            epoch = self.epoch,
            "capture started"
        );
        Ok(())
    }

    async fn stop_capture(&mut self) {
        if !self.capture_active && self.capture_lease.is_none() {
            return;
        }
        // Events still in flight from the old run carry a stale epoch.
        self.epoch += 1;
        self.engines.recognizer.stop().await;
        self.capture_active = false;
        self.capture_lease = None;
        self.timers.cancel(TimerKind::NoGrowth);
        tracing::debug!("capture stopped");
    }

    async fn handle_recognizer(&mut self, message: RecognizerMessage) {
        if message.epoch != self.epoch || !self.capture_active {
            tracing::trace!(epoch = message.epoch, current = self.epoch, "stale recognizer event");
            return;
        }
        let now = Instant::now();
        match message.event {
            RecognizerEvent::Update(update) => self.on_update(update, now).await,
            RecognizerEvent::Error(error) => self.on_recognizer_error(error, now).await,
        }
    }

    async fn on_update(&mut self, update: TranscriptUpdate, now: Instant) {
        self.failures = 0;
        self.timers
            .arm(TimerKind::NoGrowth, now + self.config.commit.no_growth());

        let raw = update.text.trim().to_string();
        let segment = strip_word_prefix(&raw, &self.baseline).to_string();
        self.last_raw = raw;

        let was_started = self.ctx.is_started();
        let grew = self.ctx.absorb(&segment, now);
        if !was_started && self.ctx.is_started() {
            self.begin_utterance(now);
        }
        emit(
            self.bus.as_ref(),
            topics::PARTIAL_UPDATE,
            &PartialUpdateEvent {
                utterance: self.ctx.utterance(),
                text_len: self.ctx.text().len(),
                is_final: update.is_final,
            },
        );

        if grew {
            self.voter.observe(
                now,
                self.ctx.text(),
                update.language.as_ref(),
                update.confidence,
            );
            self.timers.arm(
                TimerKind::StableCutoff,
                now + self.config.commit.stable_cutoff(),
            );
            self.check_retarget(now).await;
            self.stream_early(now);
        }

        if update.is_final {
            if self.emit_path_open() {
                if self.ctx.is_started() {
                    self.commit(now, CommitReason::Final);
                } else {
                    self.baseline.clear();
                }
            } else {
                // The segment is over; keep its words for the next one and
                // decide at capture resume.
                self.ctx.carry_segment();
                self.baseline.clear();
                self.last_raw.clear();
            }
        } else if grew {
            self.evaluate_commit(now);
        }
    }

    fn begin_utterance(&mut self, now: Instant) {
        let expected = self.expected_next.clone();
        self.voter.begin_utterance(now, expected.as_ref());
        self.retarget.begin(now);
        let cap = self.config.commit.max_utterance(self.low_power);
        self.timers.arm(TimerKind::HardCap, now + cap);
        emit(
            self.bus.as_ref(),
            topics::UTTERANCE_START,
            &UtteranceStartEvent {
                utterance: self.ctx.utterance(),
                locale: self.locale.to_string(),
            },
        );
        tracing::debug!(
            utterance = self.ctx.utterance(),
            locale = %self.locale,
            expected_next = expected.as_ref().map(Language::as_str),
            "utterance started"
        );
    }

    async fn check_retarget(&mut self, now: Instant) {
        // Text heard while our own speech plays may be that speech.
        if self.floor.is_held() {
            self.timers.cancel(TimerKind::Retarget);
            return;
        }
        let (leader, margin) = self.voter.leader(now);
        if let Some(locale) = self.retarget.observe(now, &leader, margin, &self.locale) {
            self.timers.cancel(TimerKind::Retarget);
            self.flip_locale(locale, now).await;
            return;
        }
        match self.retarget.candidate_deadline() {
            Some(due) if self.timers.deadline(TimerKind::Retarget) != Some(due) => {
                self.timers.arm(TimerKind::Retarget, due);
            }
            Some(_) => {}
            None => {
                self.timers.cancel(TimerKind::Retarget);
            }
        }
    }

    async fn flip_locale(&mut self, locale: Language, now: Instant) {
        self.metrics.record_language_flip();
        tracing::info!(
            utterance = self.ctx.utterance(),
            from = %self.locale,
            to = %locale,
            "retargeting recognition locale"
        );
        self.locale = locale;
        self.ctx.carry_segment();
        self.baseline.clear();
        self.last_raw.clear();
        self.stop_capture().await;
        if let Err(e) = self.start_capture(now).await {
            self.on_recognizer_error(e, now).await;
        }
    }

    async fn on_recognizer_error(&mut self, error: RecognizerError, now: Instant) {
        let policy = RetryPolicy::for_recognizer(&error, &self.config.retry);
        if policy == RetryPolicy::HardReboot && self.rebooting {
            tracing::debug!(error = %error, "recognizer reboot already in progress");
            return;
        }
        self.failures += 1;
        let decision = policy.decide(self.failures);
        tracing::warn!(
            error = %error,
            category = ?error.category(),
            attempt = self.failures,
            decision = ?decision,
            "recognizer error"
        );
        self.stop_capture().await;

        match decision {
            RetryDecision::GiveUp => self.fatal(&error),
            RetryDecision::RetryAfter(delay) => self.schedule_recovery(Recovery::Restart, now + delay),
            RetryDecision::Rotate => {
                self.failures = 0;
                self.schedule_recovery(Recovery::Rotate, now);
            }
            RetryDecision::HardReboot => {
                self.failures = 0;
                self.rebooting = true;
                self.schedule_recovery(Recovery::Reboot, now);
            }
        }
    }

    fn schedule_recovery(&mut self, action: Recovery, at: Instant) {
        self.recovery = Some(action);
        self.timers.arm(TimerKind::Recovery, at);
    }

    async fn recover(&mut self, now: Instant) {
        let Some(action) = self.recovery.take() else {
            return;
        };
        if self.paused || !self.started {
            self.rebooting = false;
            return;
        }
        match action {
            Recovery::Restart => {
                self.ctx.carry_segment();
            }
            Recovery::Rotate => {
                self.reset_context();
            }
            Recovery::Reboot => {
                self.reset_context();
                self.retarget = RetargetTracker::new(self.config.retarget.clone());
                self.echo.clear();
            }
        }
        self.baseline.clear();
        self.last_raw.clear();
        tracing::info!(action = ?action, "restarting recognition");

        let result = self.start_capture(now).await;
        if action == Recovery::Reboot {
            self.rebooting = false;
        }
        if let Err(e) = result {
            self.on_recognizer_error(e, now).await;
        }
    }

    fn fatal(&mut self, error: &RecognizerError) {
        tracing::error!(error = %error, "speech recognition cannot run, session stopped");
        for kind in [
            TimerKind::StableCutoff,
            TimerKind::HardCap,
            TimerKind::NoGrowth,
            TimerKind::Retarget,
            TimerKind::Recovery,
        ] {
            self.timers.cancel(kind);
        }
        self.recovery = None;
        self.started = false;
        self.reset_context();
        let kind = match error.category() {
            RecognizerErrorKind::PermissionDenied => "permission_denied",
            _ => "recognizer_unavailable",
        };
        emit(
            self.bus.as_ref(),
            topics::NOTICE_FATAL,
            &NoticeEvent {
                kind: kind.to_string(),
                message: error.to_string(),
                phrase_id: None,
            },
        );
    }

    // Commit

    /// Closed while the floor is held, including its grace period.
    fn emit_path_open(&self) -> bool {
        self.started && !self.paused && !self.floor.is_held()
    }

    fn evaluate_commit(&mut self, now: Instant) {
        if !self.emit_path_open() {
            return;
        }
        let cutoff = self.config.commit.stable_cutoff();
        let cap = self.config.commit.max_utterance(self.low_power);
        let Some(reason) = self.ctx.boundary(now, cutoff, cap) else {
            self.rearm_commit_timers(now);
            return;
        };

        if matches!(reason, CommitReason::Punctuation | CommitReason::StablePause) {
            let language = match self.ctx.locked_language() {
                Some(language) => language.clone(),
                None => self.voter.leader(now).0,
            };
            if self.ctx.defer_for_filler(&language) {
                tracing::debug!(
                    utterance = self.ctx.utterance(),
                    "trailing filler, deferring commit"
                );
                self.timers.arm(TimerKind::StableCutoff, now + cutoff);
                return;
            }
        }
        self.commit(now, reason);
    }

    /// Make sure a started utterance has its stable-cutoff and hard-cap
    /// timers, e.g. after they fired while the floor was held.
    fn rearm_commit_timers(&mut self, now: Instant) {
        let (Some(started), Some(growth)) = (self.ctx.started_at(), self.ctx.last_growth()) else {
            return;
        };
        if !self.timers.is_armed(TimerKind::StableCutoff) {
            let due = (growth + self.config.commit.stable_cutoff()).max(now);
            self.timers.arm(TimerKind::StableCutoff, due);
        }
        if !self.timers.is_armed(TimerKind::HardCap) {
            let due = started + self.config.commit.max_utterance(self.low_power);
            self.timers.arm(TimerKind::HardCap, due.max(now));
        }
    }

    fn lock_language(&mut self, now: Instant) -> LanguageDecision {
        if let Some(decision) = self.ctx.locked() {
            return decision.clone();
        }
        let decision = self.voter.decide(now);
        emit(
            self.bus.as_ref(),
            topics::LANGUAGE_DECISION,
            &LanguageDecisionEvent {
                utterance: self.ctx.utterance(),
                language: decision.language.to_string(),
                margin: decision.margin,
                confidence: decision.confidence,
                fell_back: decision.fell_back,
            },
        );
        self.ctx.lock(decision).clone()
    }

    fn commit(&mut self, now: Instant, reason: CommitReason) {
        let text = self.ctx.text().trim().to_string();
        let chars = text.chars().count();
        if chars < self.config.commit.min_fragment_chars {
            self.metrics.record_fragment_discarded();
            tracing::debug!(utterance = self.ctx.utterance(), chars, "fragment discarded");
            self.finish_utterance(reason);
            return;
        }

        let decision = self.lock_language(now);
        self.expected_next = None;
        let source = decision.language.clone();
        let target = self.config.languages.other(&source).clone();
        let id = Uuid::new_v4();
        let duration = self.ctx.elapsed(now);

        if self.config.delivery.speaks_locally() {
            self.enqueue(PhraseCommit {
                id,
                source: source.clone(),
                target: target.clone(),
                text: text.clone(),
                decided_at: now,
                timestamp: epoch_seconds(),
                confidence: decision.confidence,
                origin: PhraseOrigin::Local,
            });
        }
        if self.config.delivery.sends_to_peers() {
            let tail = self.ctx.unsent_tail().to_string();
            let message = self
                .outbound
                .message(id.to_string(), tail, source.clone(), true);
            self.send_to_peers(message);
        }

        self.ctx.mark_committed();
        self.metrics.record_phrase_committed();
        emit(
            self.bus.as_ref(),
            topics::PHRASE_COMMIT,
            &PhraseCommitEvent {
                phrase_id: id,
                utterance: self.ctx.utterance(),
                reason,
                source: source.to_string(),
                target: target.to_string(),
                text_len: text.len(),
                duration_ms: duration.as_millis() as u64,
            },
        );
        tracing::info!(
            phrase_id = %id,
            utterance = self.ctx.utterance(),
            reason = ?reason,
            source = %source,
            target = %target,
            text_len = text.len(),
            duration_ms = duration.as_millis() as u64,
            "phrase committed"
        );
        self.finish_utterance(reason);
    }

    /// Drop the current utterance and remember what the recognizer has
    /// already said in this segment.
    fn finish_utterance(&mut self, reason: CommitReason) {
        if reason == CommitReason::Final {
            self.baseline.clear();
        } else {
            self.baseline = self.last_raw.clone();
        }
        self.reset_context();
    }

    fn reset_context(&mut self) {
        for kind in [
            TimerKind::StableCutoff,
            TimerKind::HardCap,
            TimerKind::Retarget,
        ] {
            self.timers.cancel(kind);
        }
        self.retarget.close();
        self.ctx = TurnContext::new(self.next_utterance);
        self.next_utterance += 1;
    }

    fn enqueue(&mut self, phrase: PhraseCommit) {
        match self.producer.enqueue(phrase) {
            Ok(enqueued) => {
                self.metrics.set_queue_depth(enqueued.depth);
                if enqueued.alert {
                    emit(
                        self.bus.as_ref(),
                        topics::QUEUE_DEPTH_ALERT,
                        &QueueDepthAlertEvent {
                            depth: enqueued.depth,
                            threshold: self.config.queue.alert_depth,
                        },
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "phrase dropped"),
        }
    }

    fn stream_early(&mut self, now: Instant) {
        let commit = &self.config.commit;
        if !commit.early_streaming
            || !self.config.delivery.sends_to_peers()
            || !self.emit_path_open()
            || !self.ctx.early_stream_ready(commit.early_stream_min_words)
        {
            return;
        }
        let decision = self.lock_language(now);
        let tail = self.ctx.unsent_tail().to_string();
        let message =
            self.outbound
                .message(Uuid::new_v4().to_string(), tail, decision.language, false);
        tracing::debug!(
            utterance = self.ctx.utterance(),
            seq = message.seq,
            "early stream checkpoint"
        );
        self.send_to_peers(message);
        self.ctx.mark_streamed();
    }

    fn send_to_peers(&self, message: WireMessage) {
        if let Some(outbox) = &self.outbox {
            outbox.send(message);
        }
    }

    // Speech output and floor

    fn handle_drain(&mut self, event: DrainEvent) {
        let now = Instant::now();
        match event {
            DrainEvent::Started {
                phrase_id,
                language,
                spoken_text,
                backlog,
                latency,
            } => {
                if self.paused {
                    // Raced with pause; the drain is held after this phrase.
                    self.engines.synthesizer.stop(StopBoundary::Immediate);
                    return;
                }
                let was_free = self.floor.acquire(FloorReason::Speaking(phrase_id));
                if was_free {
                    self.metrics.record_floor_acquisition();
                } else if !self.resume_pending {
                    self.timers.cancel(TimerKind::Grace);
                }
                if self.speech_lease.is_none() {
                    match self.audio.acquire("speech") {
                        Ok(lease) => self.speech_lease = Some(lease),
                        Err(e) => tracing::warn!(error = %e, "audio session unavailable for speech"),
                    }
                }
                self.echo.record(&spoken_text);
                emit(
                    self.bus.as_ref(),
                    topics::SPEECH_START,
                    &SpeechStartEvent {
                        phrase_id,
                        language: language.to_string(),
                        queue_depth: backlog,
                        latency_ms: latency.as_millis() as u64,
                    },
                );
            }
            DrainEvent::Finished {
                phrase_id,
                heard_by,
                interrupted,
                duration,
            } => {
                emit(
                    self.bus.as_ref(),
                    topics::SPEECH_END,
                    &SpeechEndEvent {
                        phrase_id,
                        interrupted,
                        duration_ms: duration.as_millis() as u64,
                    },
                );
                self.expected_next = Some(heard_by);
                self.speech_lease = None;
                if let Some(deadline) = self.floor.begin_release(now) {
                    self.timers.arm(TimerKind::Grace, deadline);
                }
            }
        }
    }

    async fn on_grace(&mut self, now: Instant) {
        if self.floor.complete_release(now) {
            self.capture_resumed();
            self.screen_echo();
            self.evaluate_commit(now);
        }
        if self.resume_pending {
            self.resume_pending = false;
            self.paused = false;
            self.hold.send_replace(false);
            self.reset_context();
            self.baseline.clear();
            self.last_raw.clear();
            self.sync_reorder_timer();
            if self.started {
                match self.start_capture(now).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => self.fatal(&e),
                    Err(e) => self.on_recognizer_error(e, now).await,
                }
            }
            self.capture_resumed();
        }
    }

    fn capture_resumed(&mut self) {
        self.metrics.record_capture_resume();
        let grace = self.floor.grace();
        emit(
            self.bus.as_ref(),
            topics::CAPTURE_RESUME,
            &CaptureResumeEvent {
                route: self.floor.route().as_str().to_string(),
                grace_ms: grace.as_millis() as u64,
            },
        );
        tracing::debug!(route = self.floor.route().as_str(), "capture resumed");
    }

    /// Drop text heard during the floor if it is mostly our own output.
    fn screen_echo(&mut self) {
        if self.ctx.is_started() && self.echo.is_echo(self.ctx.text(), self.config.commit.echo_overlap)
        {
            tracing::debug!(
                utterance = self.ctx.utterance(),
                overlap = self.echo.overlap(self.ctx.text()),
                "discarding echo of speech output"
            );
            self.baseline = self.last_raw.clone();
            self.reset_context();
        }
        self.echo.clear();
    }

    // Timers

    async fn fire_timers(&mut self) {
        let now = Instant::now();
        for kind in self.timers.take_expired(now) {
            tracing::trace!(timer = kind.as_str(), "timer fired");
            match kind {
                TimerKind::StableCutoff | TimerKind::HardCap => self.evaluate_commit(now),
                TimerKind::NoGrowth => {
                    if self.capture_active && !self.paused {
                        tracing::info!("no transcript updates, rotating recognition");
                        self.stop_capture().await;
                        self.schedule_recovery(Recovery::Rotate, now);
                    }
                }
                TimerKind::Retarget => self.check_retarget(now).await,
                TimerKind::Grace => self.on_grace(now).await,
                TimerKind::ReorderBuffer => {
                    for delivery in self.inbound.expire(now) {
                        self.deliver(delivery, now);
                    }
                    self.sync_reorder_timer();
                }
                TimerKind::Recovery => self.recover(now).await,
            }
        }
    }

    // Peers

    fn handle_transport(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Connected(peer) => {
                self.inbound.connect(&peer);
                tracing::info!(peer = %peer, "peer connected");
            }
            TransportEvent::Disconnected(peer) => {
                let dropped = self.inbound.disconnect(&peer);
                tracing::warn!(peer = %peer, dropped, "peer disconnected, rediscovering");
                emit(
                    self.bus.as_ref(),
                    topics::PEER_DISCONNECTED,
                    &PeerDisconnectedEvent {
                        peer: peer.to_string(),
                    },
                );
                let transport = Arc::clone(&self.engines.transport);
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {}
                        _ = transport.rediscover() => {}
                    }
                });
                self.sync_reorder_timer();
            }
            TransportEvent::Message { from, payload } => match WireMessage::decode(&payload) {
                Ok(message) => {
                    let received = self.inbound.receive(&from, message, now);
                    if received.duplicate {
                        self.metrics.record_duplicate_dropped();
                    }
                    for delivery in received.deliveries {
                        self.deliver(delivery, now);
                    }
                    self.sync_reorder_timer();
                }
                Err(WireError::Superseded) => {
                    tracing::warn!(peer = %from, "dropping message in superseded turnId shape");
                }
                Err(e) => {
                    tracing::warn!(peer = %from, bytes = payload.len(), error = %e, "dropping peer message");
                }
            },
        }
    }

    fn deliver(&mut self, delivery: Delivery, now: Instant) {
        let Delivery {
            from,
            message,
            order,
            expected,
        } = delivery;
        if order != DeliveryOrder::InOrder {
            emit(
                self.bus.as_ref(),
                topics::PEER_REORDERED,
                &PeerReorderedEvent {
                    peer: from.to_string(),
                    seq: message.seq,
                    expected,
                    order: order.as_str().to_string(),
                },
            );
        }
        let text = message.text.trim();
        if text.is_empty() {
            return;
        }
        let source = message.source_lang.clone();
        let target = self.config.languages.other(&source).clone();
        let id = phrase_id_for(&message.id);
        tracing::debug!(
            peer = %from,
            seq = message.seq,
            wire_id = %message.id,
            phrase_id = %id,
            is_final = message.is_final,
            text_len = text.len(),
            "peer phrase received"
        );
        self.enqueue(PhraseCommit {
            id,
            source,
            target,
            text: text.to_string(),
            decided_at: now,
            timestamp: message.timestamp,
            confidence: 1.0,
            origin: PhraseOrigin::Remote(from),
        });
    }

    fn sync_reorder_timer(&mut self) {
        match self.inbound.next_deadline() {
            Some(due) if self.timers.deadline(TimerKind::ReorderBuffer) != Some(due) => {
                self.timers.arm(TimerKind::ReorderBuffer, due);
            }
            Some(_) => {}
            None => {
                self.timers.cancel(TimerKind::ReorderBuffer);
            }
        }
    }
}

/// Local phrase id for a wire id. Ids that are not UUIDs map to a
/// name-based UUID, so the same wire id always yields the same phrase id.
fn phrase_id_for(wire_id: &str) -> Uuid {
    Uuid::parse_str(wire_id)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_OID, wire_id.as_bytes()))
}
