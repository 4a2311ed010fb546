use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parley_engine::{RetryDecision, RetryPolicy, Transport, TransportError};
use parley_events::{emit, topics, EventBusRef, NoticeEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::wire::WireMessage;

enum Command {
    Send(WireMessage),
    Restart,
}

/// Ordered delivery of outgoing messages with backoff.
///
/// After the retry policy gives up, delivery freezes: messages keep queueing
/// but nothing is sent until `restart` is called from a user action.
pub struct Outbox {
    tx: mpsc::UnboundedSender<Command>,
    frozen: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Outbox {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        bus: EventBusRef,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let frozen = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = Worker {
            transport,
            policy,
            bus,
            cancel: cancel.clone(),
            frozen: Arc::clone(&frozen),
            pending: Arc::clone(&pending),
            queue: VecDeque::new(),
            failures: 0,
        };
        let task = tokio::spawn(worker.run(rx));
        Self {
            tx,
            frozen,
            pending,
            cancel,
            task,
        }
    }

    pub fn send(&self, message: WireMessage) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(Command::Send(message)).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!("outbox stopped, message dropped");
        }
    }

    /// Leave the frozen state and retry everything still queued.
    pub fn restart(&self) {
        let _ = self.tx.send(Command::Restart);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Messages accepted but not yet sent.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "outbox task failed");
        }
    }
}

struct Worker {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    bus: EventBusRef,
    cancel: CancellationToken,
    frozen: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    queue: VecDeque<WireMessage>,
    failures: u32,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!("outbox started");
        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = rx.recv() => command,
            };
            match command {
                Some(command) => self.handle(command),
                None => break,
            }
            // Pick up everything already waiting before sending.
            while let Ok(command) = rx.try_recv() {
                self.handle(command);
            }
            if !self.flush().await {
                break;
            }
        }
        tracing::debug!(unsent = self.queue.len(), "outbox stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Send(message) => self.queue.push_back(message),
            Command::Restart => {
                if self.frozen.swap(false, Ordering::AcqRel) {
                    tracing::info!(queued = self.queue.len(), "peer delivery restarted");
                }
                self.failures = 0;
            }
        }
    }

    /// Send queued messages in order. Returns false when cancelled.
    async fn flush(&mut self) -> bool {
        while !self.frozen.load(Ordering::Acquire) {
            let Some(message) = self.queue.front() else {
                break;
            };
            let bytes = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(seq = message.seq, error = %e, "dropping unencodable message");
                    self.pop();
                    continue;
                }
            };
            let seq = message.seq;
            let reliable = message.is_final;

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                result = self.transport.send(&bytes, reliable) => result,
            };

            match result {
                Ok(()) => {
                    tracing::trace!(seq, bytes = bytes.len(), "message sent");
                    self.failures = 0;
                    self.pop();
                }
                Err(TransportError::NoPeers) => {
                    tracing::debug!(seq, "no peers connected, message dropped");
                    self.pop();
                }
                Err(e) => {
                    self.failures += 1;
                    match self.policy.decide(self.failures) {
                        RetryDecision::RetryAfter(delay) => {
                            tracing::debug!(
                                seq,
                                failures = self.failures,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "send failed, backing off"
                            );
                            tokio::select! {
                                biased;
                                _ = self.cancel.cancelled() => return false,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        _ => {
                            tracing::warn!(
                                failures = self.failures,
                                queued = self.queue.len(),
                                error = %e,
                                "peer delivery frozen"
                            );
                            self.frozen.store(true, Ordering::Release);
                            emit(
                                self.bus.as_ref(),
                                topics::NOTICE_TRANSPORT_FROZEN,
                                &NoticeEvent {
                                    kind: "transport_frozen".to_string(),
                                    message: "Sending to the other device failed. Tap to retry."
                                        .to_string(),
                                    phrase_id: None,
                                },
                            );
                        }
                    }
                }
            }
        }
        true
    }

    fn pop(&mut self) {
        if self.queue.pop_front().is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use parley_engine::{PeerId, RetrySettings};
    use parley_events::InMemoryEventBus;
    use parley_lang::Language;

    use super::*;

    #[derive(Default)]
    struct FlakyTransport {
        fail_next: Mutex<u32>,
        sent: Mutex<Vec<(u64, bool)>>,
        attempts: Mutex<u32>,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, payload: &[u8], reliable: bool) -> Result<(), TransportError> {
            *self.attempts.lock() += 1;
            {
                let mut fail = self.fail_next.lock();
                if *fail > 0 {
                    *fail -= 1;
                    return Err(TransportError::Send("link down".into()));
                }
            }
            let message = WireMessage::decode(payload).unwrap();
            self.sent.lock().push((message.seq, reliable));
            Ok(())
        }

        fn peers(&self) -> Vec<PeerId> {
            vec![PeerId::new("peer")]
        }

        async fn rediscover(&self) {}
    }

    fn message(seq: u64, is_final: bool) -> WireMessage {
        WireMessage {
            id: format!("m{seq}"),
            seq,
            text: "hola".into(),
            source_lang: Language::spanish(),
            is_final,
            timestamp: seq as f64,
        }
    }

    fn outbox(transport: Arc<FlakyTransport>, bus: Arc<InMemoryEventBus>) -> Outbox {
        Outbox::spawn(
            transport,
            RetryPolicy::transport(&RetrySettings::default()),
            bus,
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_in_order_with_reliability_flag() {
        let transport = Arc::new(FlakyTransport::default());
        let outbox = outbox(transport.clone(), Arc::new(InMemoryEventBus::new()));
        outbox.send(message(0, false));
        outbox.send(message(1, true));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*transport.sent.lock(), vec![(0, false), (1, true)]);
        assert_eq!(outbox.pending(), 0);
        outbox.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_then_success() {
        let transport = Arc::new(FlakyTransport::default());
        *transport.fail_next.lock() = 1;
        let outbox = outbox(transport.clone(), Arc::new(InMemoryEventBus::new()));
        outbox.send(message(0, true));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(transport.sent.lock().is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*transport.sent.lock(), vec![(0, true)]);
        assert!(!outbox.is_frozen());
        outbox.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_freezes_after_repeated_failures_until_restart() {
        let transport = Arc::new(FlakyTransport::default());
        *transport.fail_next.lock() = 3;
        let bus = Arc::new(InMemoryEventBus::new());
        let outbox = outbox(transport.clone(), bus.clone());
        outbox.send(message(0, true));
        outbox.send(message(1, true));

        // 500ms + 1s of backoff, then the third failure freezes.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(outbox.is_frozen());
        assert_eq!(*transport.attempts.lock(), 3);
        assert_eq!(bus.count(topics::NOTICE_TRANSPORT_FROZEN), 1);
        assert_eq!(outbox.pending(), 2);

        outbox.restart();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!outbox.is_frozen());
        assert_eq!(*transport.sent.lock(), vec![(0, true), (1, true)]);
        outbox.shutdown().await;
    }
}
