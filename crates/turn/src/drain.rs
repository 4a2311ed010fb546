//! Speech output: dequeue, translate, guard, speak.
//!
//! Two stages joined by a one-slot channel. The preparer translates and
//! guards the next phrase while the speaker is still talking, so the gap
//! between consecutive phrases is only the hand-over.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parley_engine::{SpeechOutcome, StopBoundary, Synthesizer, Translator, VoiceSettings};
use parley_events::{
    emit, topics, EventBusRef, NoticeEvent, TranscriptDisplayEvent, TranscriptRevisedEvent,
    TurnMetrics,
};
use parley_lang::Language;
use parley_purity::{PurityGuard, RepairOutcome};
use parley_queue::{DepthPolicy, PhraseCommit, PhraseConsumer, QueueSettings};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Prefix on transcript text shown when translation failed.
pub const UNTRANSLATED_MARKER: &str = "[untranslated]";

/// Reported to the coordinator, which owns the floor.
#[derive(Debug)]
pub(crate) enum DrainEvent {
    Started {
        phrase_id: Uuid,
        language: Language,
        /// What is being said, for echo detection.
        spoken_text: String,
        backlog: usize,
        latency: Duration,
    },
    Finished {
        phrase_id: Uuid,
        /// Language of the listener who just heard the phrase.
        heard_by: Language,
        interrupted: bool,
        duration: Duration,
    },
}

#[derive(Debug)]
struct Prepared {
    commit: PhraseCommit,
    speak_text: String,
    speak_language: Language,
    display_text: String,
    untranslated: bool,
}

pub(crate) struct DrainDeps {
    pub translator: Arc<dyn Translator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub guard: PurityGuard,
    pub voices: VoiceSettings,
    pub queue: QueueSettings,
    pub bus: EventBusRef,
    pub metrics: Arc<TurnMetrics>,
}

pub(crate) struct SpeechDrain {
    preparer: JoinHandle<()>,
    speaker: JoinHandle<()>,
}

impl SpeechDrain {
    /// `hold` pauses output between phrases while it is true.
    pub fn spawn(
        deps: DrainDeps,
        consumer: PhraseConsumer,
        events: mpsc::UnboundedSender<DrainEvent>,
        hold: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        let deps = Arc::new(deps);
        let (tx, rx) = mpsc::channel(1);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let depth = consumer.watch_depth();

        let preparer = tokio::spawn(run_preparer(
            Arc::clone(&deps),
            consumer,
            tx,
            Arc::clone(&in_flight),
            cancel.clone(),
        ));
        let speaker = tokio::spawn(
            Speaker {
                deps,
                rx,
                events,
                hold,
                depth,
                in_flight,
                cancel,
            }
            .run(),
        );
        Self { preparer, speaker }
    }

    pub async fn join(self) {
        for (name, task) in [("preparer", self.preparer), ("speaker", self.speaker)] {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "speech drain task failed");
            }
        }
    }
}

async fn run_preparer(
    deps: Arc<DrainDeps>,
    mut consumer: PhraseConsumer,
    tx: mpsc::Sender<Prepared>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let commit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            commit = consumer.next() => commit,
        };
        let Some(commit) = commit else {
            break;
        };
        in_flight.fetch_add(1, Ordering::AcqRel);

        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            prepared = prepare(&deps, commit, &cancel) => prepared,
        };
        if tx.send(prepared).await.is_err() {
            break;
        }
    }
    tracing::debug!("speech preparer stopped");
}

async fn prepare(deps: &DrainDeps, commit: PhraseCommit, cancel: &CancellationToken) -> Prepared {
    if commit.source.same_primary(&commit.target) {
        return Prepared {
            speak_text: commit.text.clone(),
            speak_language: commit.target.clone(),
            display_text: commit.text.clone(),
            untranslated: false,
            commit,
        };
    }

    let translated = deps
        .translator
        .translate(&commit.text, &commit.source, &commit.target)
        .await;
    let translated = match translated {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(
                phrase_id = %commit.id,
                source = %commit.source,
                target = %commit.target,
                error = %e,
                "translation failed, speaking source text"
            );
            emit(
                deps.bus.as_ref(),
                topics::NOTICE_UNTRANSLATED,
                &NoticeEvent {
                    kind: "untranslated".to_string(),
                    message: "Translation unavailable; showing the original.".to_string(),
                    phrase_id: Some(commit.id),
                },
            );
            return Prepared {
                speak_text: commit.text.clone(),
                speak_language: commit.source.clone(),
                display_text: format!("{UNTRANSLATED_MARKER} {}", commit.text),
                untranslated: true,
                commit,
            };
        }
    };

    let deadline = commit.decided_at + deps.guard.settings().latency_budget();
    let guarded = deps
        .guard
        .guard(&commit.text, &translated, &commit.source, &commit.target, deadline)
        .await;
    let report = guarded.report;

    match guarded.pending {
        Some(pending) => {
            let bus = Arc::clone(&deps.bus);
            let metrics = Arc::clone(&deps.metrics);
            let cancel = cancel.clone();
            let phrase_id = commit.id;
            tokio::spawn(async move {
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    joined = pending => joined,
                };
                match joined {
                    Ok(late) => {
                        metrics.record_repair(late.selective_passes, late.full_retries);
                        tracing::debug!(
                            %phrase_id,
                            purity = late.purity,
                            "late purity repair finished"
                        );
                        emit(
                            bus.as_ref(),
                            topics::TRANSCRIPT_REVISED,
                            &TranscriptRevisedEvent {
                                phrase_id,
                                text: late.text,
                                purity: late.purity,
                            },
                        );
                    }
                    Err(e) => tracing::warn!(%phrase_id, error = %e, "late purity repair failed"),
                }
            });
        }
        None if report.outcome != RepairOutcome::Clean => {
            deps.metrics
                .record_repair(report.selective_passes, report.full_retries);
        }
        None => {}
    }

    Prepared {
        speak_text: report.text.clone(),
        speak_language: commit.target.clone(),
        display_text: report.text,
        untranslated: false,
        commit,
    }
}

struct Speaker {
    deps: Arc<DrainDeps>,
    rx: mpsc::Receiver<Prepared>,
    events: mpsc::UnboundedSender<DrainEvent>,
    hold: watch::Receiver<bool>,
    depth: watch::Receiver<usize>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Speaker {
    async fn run(mut self) {
        // End of the previous phrase, when another was already waiting.
        let mut handover: Option<Instant> = None;
        loop {
            let prepared = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                prepared = self.rx.recv() => prepared,
            };
            let Some(prepared) = prepared else {
                break;
            };
            if self.wait_for_release().await {
                handover = None;
            }
            if self.cancel.is_cancelled() {
                break;
            }
            self.in_flight.fetch_sub(1, Ordering::AcqRel);

            if let Some(ended) = handover.take() {
                let gap = ended.elapsed();
                if gap > self.deps.queue.max_gap() {
                    self.deps.metrics.record_gap_overrun();
                    tracing::warn!(
                        gap_ms = gap.as_millis() as u64,
                        max_gap_ms = self.deps.queue.max_gap_ms,
                        "gap between phrases over bound"
                    );
                }
            }

            if !self.speak(prepared).await {
                break;
            }
            if self.backlog() > 0 {
                handover = Some(Instant::now());
            }
        }
        tracing::debug!("speaker stopped");
    }

    /// Block while output is held. Returns true if it had to wait.
    async fn wait_for_release(&mut self) -> bool {
        let mut waited = false;
        while *self.hold.borrow_and_update() {
            waited = true;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return waited,
                changed = self.hold.changed() => {
                    if changed.is_err() {
                        return waited;
                    }
                }
            }
        }
        waited
    }

    /// Phrases queued or prepared behind the one being spoken.
    fn backlog(&self) -> usize {
        *self.depth.borrow() + self.in_flight.load(Ordering::Acquire)
    }

    /// Returns false when cancelled.
    async fn speak(&mut self, prepared: Prepared) -> bool {
        let Prepared {
            commit,
            speak_text,
            speak_language,
            display_text,
            untranslated,
        } = prepared;
        let backlog = self.backlog();
        self.deps.metrics.set_queue_depth(backlog);

        let synthesizer = Arc::clone(&self.deps.synthesizer);
        let voice = self
            .deps
            .voices
            .resolve(&speak_language, &synthesizer.voices(&speak_language));
        let latency = commit.decided_at.elapsed();

        let _ = self.events.send(DrainEvent::Started {
            phrase_id: commit.id,
            language: speak_language.clone(),
            spoken_text: speak_text.clone(),
            backlog,
            latency,
        });
        emit(
            self.deps.bus.as_ref(),
            topics::TRANSCRIPT_DISPLAY,
            &TranscriptDisplayEvent {
                phrase_id: commit.id,
                source_text: commit.text.clone(),
                display_text,
                language: speak_language.to_string(),
                untranslated,
            },
        );
        tracing::debug!(
            phrase_id = %commit.id,
            language = %speak_language,
            voice = voice.as_ref().map(|v| v.0.as_str()),
            backlog,
            latency_ms = latency.as_millis() as u64,
            "speaking phrase"
        );

        let barge_in = self.deps.queue.policy == DepthPolicy::BargeIn;
        let mut stop_requested = false;
        let mut watching = barge_in;
        // Stopping only affects speech in progress, so a backlog that is
        // already there is handled after `speak` has been polled once.
        let mut backlog_at_start = barge_in && backlog > 1;
        let mut holding = false;

        let started = Instant::now();
        let speak = synthesizer.speak(&speak_text, &speak_language, voice.as_ref());
        tokio::pin!(speak);
        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    synthesizer.stop(StopBoundary::Immediate);
                    return false;
                }
                result = &mut speak => break result,
                _ = std::future::ready(()), if backlog_at_start => {
                    backlog_at_start = false;
                    tracing::debug!(phrase_id = %commit.id, backlog, "barge-in on queued backlog");
                    synthesizer.stop(StopBoundary::Word);
                    stop_requested = true;
                }
                changed = self.hold.changed(), if !holding => {
                    holding = changed.is_err() || *self.hold.borrow_and_update();
                    if holding && changed.is_ok() {
                        tracing::debug!(phrase_id = %commit.id, "output held, stopping speech");
                        synthesizer.stop(StopBoundary::Immediate);
                    }
                }
                changed = self.depth.changed(), if watching && !stop_requested => {
                    if changed.is_err() {
                        watching = false;
                    } else if self.backlog() > 1 {
                        tracing::debug!(phrase_id = %commit.id, "barge-in at next word");
                        synthesizer.stop(StopBoundary::Word);
                        stop_requested = true;
                    }
                }
            }
        };

        let interrupted = match result {
            Ok(SpeechOutcome::Completed) => false,
            Ok(SpeechOutcome::Interrupted) => true,
            Err(e) => {
                tracing::warn!(phrase_id = %commit.id, error = %e, "speech output failed");
                false
            }
        };
        let _ = self.events.send(DrainEvent::Finished {
            phrase_id: commit.id,
            heard_by: commit.target,
            interrupted,
            duration: started.elapsed(),
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use parley_engine::{SynthesisError, TranslateError, VoiceId};
    use parley_events::InMemoryEventBus;
    use parley_purity::PuritySettings;
    use parley_queue::{phrase_queue, PhraseOrigin, PhraseProducer};

    use super::*;

    struct EchoTranslator {
        fail: bool,
    }

    #[async_trait]
    impl Translator for EchoTranslator {
        async fn translate(
            &self,
            text: &str,
            _source: &Language,
            target: &Language,
        ) -> Result<String, TranslateError> {
            if self.fail {
                return Err(TranslateError::Unavailable("offline".into()));
            }
            Ok(match (text, target.primary()) {
                ("good morning", "es") => "buenos días".to_string(),
                ("thank you", "es") => "gracias".to_string(),
                (other, _) => other.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct SlowSynth {
        spoken: Mutex<Vec<(String, Language, Option<VoiceId>)>>,
        stops: Mutex<Vec<StopBoundary>>,
        stop_signal: tokio::sync::Notify,
    }

    #[async_trait]
    impl Synthesizer for SlowSynth {
        async fn speak(
            &self,
            text: &str,
            language: &Language,
            voice: Option<&VoiceId>,
        ) -> Result<SpeechOutcome, SynthesisError> {
            self.spoken
                .lock()
                .push((text.to_string(), language.clone(), voice.cloned()));
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(800)) => Ok(SpeechOutcome::Completed),
                _ = self.stop_signal.notified() => Ok(SpeechOutcome::Interrupted),
            }
        }

        fn stop(&self, boundary: StopBoundary) {
            self.stops.lock().push(boundary);
            self.stop_signal.notify_waiters();
        }

        fn voices(&self, language: &Language) -> Vec<VoiceId> {
            vec![VoiceId::new(format!("{}-default", language.primary()))]
        }
    }

    struct Harness {
        producer: PhraseProducer,
        events: mpsc::UnboundedReceiver<DrainEvent>,
        synth: Arc<SlowSynth>,
        bus: Arc<InMemoryEventBus>,
        metrics: Arc<TurnMetrics>,
        hold: watch::Sender<bool>,
        cancel: CancellationToken,
        drain: SpeechDrain,
    }

    fn harness(policy: DepthPolicy, fail_translation: bool) -> Harness {
        let queue = QueueSettings {
            policy,
            ..QueueSettings::default()
        };
        let (producer, consumer) = phrase_queue(queue.clone());
        let translator: Arc<dyn Translator> = Arc::new(EchoTranslator {
            fail: fail_translation,
        });
        let synth = Arc::new(SlowSynth::default());
        let bus = Arc::new(InMemoryEventBus::new());
        let metrics = Arc::new(TurnMetrics::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (hold, hold_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let drain = SpeechDrain::spawn(
            DrainDeps {
                translator: Arc::clone(&translator),
                synthesizer: synth.clone(),
                guard: PurityGuard::new(translator, PuritySettings::default()),
                voices: VoiceSettings::default(),
                queue,
                bus: bus.clone(),
                metrics: Arc::clone(&metrics),
            },
            consumer,
            events_tx,
            hold_rx,
            cancel.clone(),
        );
        Harness {
            producer,
            events,
            synth,
            bus,
            metrics,
            hold,
            cancel,
            drain,
        }
    }

    fn commit(text: &str) -> PhraseCommit {
        PhraseCommit {
            id: Uuid::new_v4(),
            source: Language::english(),
            target: Language::spanish(),
            text: text.to_string(),
            decided_at: Instant::now(),
            timestamp: 0.0,
            confidence: 0.9,
            origin: PhraseOrigin::Local,
        }
    }

    fn started_ids(events: &mut mpsc::UnboundedReceiver<DrainEvent>) -> Vec<Uuid> {
        let mut ids = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let DrainEvent::Started { phrase_id, .. } = event {
                ids.push(phrase_id);
            }
        }
        ids
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaks_translations_in_commit_order() {
        let mut h = harness(DepthPolicy::MaxGap, false);
        let first = commit("good morning");
        let second = commit("thank you");
        let ids = vec![first.id, second.id];
        h.producer.enqueue(first).unwrap();
        h.producer.enqueue(second).unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let spoken: Vec<String> = h.synth.spoken.lock().iter().map(|s| s.0.clone()).collect();
        assert_eq!(spoken, vec!["buenos días", "gracias"]);
        assert_eq!(h.synth.spoken.lock()[0].2, Some(VoiceId::new("es-default")));
        assert_eq!(started_ids(&mut h.events), ids);
        assert_eq!(h.metrics.snapshot().gap_overruns, 0);
        assert_eq!(h.bus.count(topics::TRANSCRIPT_DISPLAY), 2);

        h.cancel.cancel();
        h.drain.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_translation_failure_speaks_source_with_marker() {
        let mut h = harness(DepthPolicy::MaxGap, true);
        h.producer.enqueue(commit("good morning")).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let spoken = h.synth.spoken.lock().clone();
        assert_eq!(spoken[0].0, "good morning");
        assert_eq!(spoken[0].1, Language::english());
        assert_eq!(h.bus.count(topics::NOTICE_UNTRANSLATED), 1);
        let display = &h.bus.events_for(topics::TRANSCRIPT_DISPLAY)[0].payload;
        assert_eq!(display["display_text"], "[untranslated] good morning");
        assert_eq!(display["untranslated"], true);
        assert!(!started_ids(&mut h.events).is_empty());

        h.cancel.cancel();
        h.drain.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_when_backlog_builds() {
        let mut h = harness(DepthPolicy::BargeIn, false);
        h.producer.enqueue(commit("good morning")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.synth.stops.lock().is_empty());

        h.producer.enqueue(commit("thank you")).unwrap();
        h.producer.enqueue(commit("good morning")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*h.synth.stops.lock(), vec![StopBoundary::Word]);

        h.cancel.cancel();
        h.drain.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_barge_in_when_backlog_precedes_speech() {
        let mut h = harness(DepthPolicy::BargeIn, false);
        for text in ["good morning", "thank you", "good morning", "thank you"] {
            h.producer.enqueue(commit(text)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let mut finished = Vec::new();
        let mut started = 0;
        while let Ok(event) = h.events.try_recv() {
            match event {
                DrainEvent::Started { .. } => started += 1,
                DrainEvent::Finished {
                    interrupted,
                    duration,
                    ..
                } => finished.push((interrupted, duration)),
            }
        }
        // Cut while three and then two phrases waited; the rest play out.
        assert_eq!(started, 4);
        assert_eq!(finished.len(), 3);
        assert!(finished[0].0 && finished[0].1 < Duration::from_millis(50));
        assert!(finished[1].0 && finished[1].1 < Duration::from_millis(50));
        assert!(!finished[2].0);
        assert_eq!(
            *h.synth.stops.lock(),
            vec![StopBoundary::Word, StopBoundary::Word]
        );

        h.cancel.cancel();
        h.drain.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_stops_phrase_in_progress() {
        let mut h = harness(DepthPolicy::MaxGap, false);
        h.producer.enqueue(commit("thank you")).unwrap();
        h.producer.enqueue(commit("good morning")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.hold.send_replace(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(*h.synth.stops.lock(), vec![StopBoundary::Immediate]);
        assert_eq!(h.synth.spoken.lock().len(), 1);
        let interrupted = std::iter::from_fn(|| h.events.try_recv().ok()).any(|event| {
            matches!(event, DrainEvent::Finished { interrupted: true, .. })
        });
        assert!(interrupted);

        h.hold.send_replace(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.synth.spoken.lock().len(), 2);

        h.cancel.cancel();
        h.drain.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_delays_next_phrase() {
        let mut h = harness(DepthPolicy::MaxGap, false);
        h.hold.send_replace(true);
        h.producer.enqueue(commit("thank you")).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(h.synth.spoken.lock().is_empty());

        h.hold.send_replace(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.synth.spoken.lock().len(), 1);

        h.cancel.cancel();
        h.drain.join().await;
    }
}
