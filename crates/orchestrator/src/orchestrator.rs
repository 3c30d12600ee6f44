//! Session orchestrator
//!
//! Owns, per session, a FIFO task queue, at most one running turn, an event
//! bus, and the sticky runtime binding (resolved roster plus scheduler
//! state). Sessions are independent; within a session everything is
//! serialized through one worker task. Bindings are evicted after an idle
//! timeout and rebuilt on the next message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, watch};

use parley_agent::SchedulerState;
use parley_core::{ChatEvent, Error, Message, Persona, Session, SessionId};
use parley_config::constants::timeouts;
use parley_persistence::{ConversationStore, PersonaStore};
use parley_rag::RetrievalEngine;

use crate::bus::EventBus;
use crate::factory::BackendFactory;
use crate::turn::{TurnRunner, TurnTask};

/// Queued tasks per session before enqueue awaits.
const QUEUE_DEPTH: usize = 64;

/// Operational knobs, sourced from `Settings`.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub llm_timeout: Duration,
    pub idle_eviction: Duration,
    pub event_buffer: usize,
    pub max_history: u32,
}

/// One session's live binding.
struct SessionSlot {
    queue_tx: mpsc::Sender<TurnTask>,
    bus: EventBus,
    cancel_tx: watch::Sender<bool>,
    last_activity: Mutex<Instant>,
}

impl SessionSlot {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Process-wide orchestrator; cheap to clone via `Arc`.
pub struct SessionOrchestrator {
    conversations: ConversationStore,
    personas: PersonaStore,
    factory: Arc<dyn BackendFactory>,
    engine: Arc<RetrievalEngine>,
    config: OrchestratorConfig,
    slots: DashMap<String, Arc<SessionSlot>>,
}

impl SessionOrchestrator {
    pub fn new(
        conversations: ConversationStore,
        personas: PersonaStore,
        factory: Arc<dyn BackendFactory>,
        engine: Arc<RetrievalEngine>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            conversations,
            personas,
            factory,
            engine,
            config,
            slots: DashMap::new(),
        }
    }

    /// Commit a user message and queue a turn for it. Returns once the
    /// message is durable and the task is queued; generation happens
    /// asynchronously on the session's worker.
    pub async fn enqueue(
        &self,
        session_id: &SessionId,
        content: &str,
        targets: Option<Vec<String>>,
    ) -> Result<Message, Error> {
        let session = self
            .conversations
            .get_session(session_id)
            .await
            .map_err(Error::from)?;

        let message = self
            .conversations
            .append_message(session_id, session.effective_user_handle(), content)
            .await
            .map_err(Error::from)?;
        metrics::counter!("parley_messages_enqueued_total").increment(1);

        let slot = self.bind(&session).await?;
        slot.bus.publish(ChatEvent::MessageNew {
            message_id: message.id.clone(),
            sender: message.sender.clone(),
            content: message.content.clone(),
        });

        let task = TurnTask {
            message: message.clone(),
            targets,
            seed: rand::thread_rng().gen(),
        };
        slot.queue_tx
            .send(task)
            .await
            .map_err(|_| Error::Internal("session worker unavailable".to_string()))?;
        slot.touch();

        Ok(message)
    }

    /// Subscribe to a session's live events.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<broadcast::Receiver<ChatEvent>, Error> {
        let session = self
            .conversations
            .get_session(session_id)
            .await
            .map_err(Error::from)?;
        let slot = self.bind(&session).await?;
        slot.touch();
        Ok(slot.bus.subscribe())
    }

    /// Tear down a session's binding, cancelling any in-flight turn.
    /// Queued tasks are discarded; nothing further is persisted.
    pub fn close_session(&self, session_id: &SessionId) {
        if let Some((_, slot)) = self.slots.remove(session_id.as_str()) {
            let _ = slot.cancel_tx.send(true);
            tracing::info!(session_id = %session_id, "Closed session binding");
        }
    }

    /// Number of live bindings (for health output and tests).
    pub fn bound_sessions(&self) -> usize {
        self.slots.len()
    }

    /// Start the idle-eviction sweeper. Returns a shutdown sender.
    pub fn start_eviction_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(timeouts::EVICTION_SWEEP_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = orchestrator.evict_idle();
                        if evicted > 0 {
                            tracing::info!(count = evicted, "Evicted idle session bindings");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Eviction task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    /// Drop bindings idle past the horizon. The worker drains and exits on
    /// its own once the queue sender is gone.
    pub fn evict_idle(&self) -> usize {
        let horizon = self.config.idle_eviction;
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|entry| entry.value().idle_for() > horizon)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            if self.slots.remove(&key).is_some() {
                evicted += 1;
                tracing::debug!(session_id = %key, "Evicted idle binding");
            }
        }
        evicted
    }

    /// Cancel everything (process shutdown).
    pub fn shutdown(&self) {
        for entry in self.slots.iter() {
            let _ = entry.value().cancel_tx.send(true);
        }
        self.slots.clear();
    }

    /// Get or create the sticky binding for a session.
    async fn bind(&self, session: &Session) -> Result<Arc<SessionSlot>, Error> {
        if let Some(slot) = self.slots.get(session.id.as_str()) {
            return Ok(Arc::clone(slot.value()));
        }

        // Resolve the roster before taking the entry so the map is never
        // held across an await.
        let roster = self
            .personas
            .list(&session.owner)
            .await
            .map_err(Error::from)?;

        match self.slots.entry(session.id.as_str().to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(vacant) => {
                let (queue_tx, queue_rx) = mpsc::channel(QUEUE_DEPTH);
                let (cancel_tx, cancel_rx) = watch::channel(false);
                let bus = EventBus::new(self.config.event_buffer);

                let runner = TurnRunner {
                    conversations: self.conversations.clone(),
                    engine: self.engine.clone(),
                    factory: self.factory.clone(),
                    bus: bus.clone(),
                    llm_timeout: self.config.llm_timeout,
                    max_history: self.config.max_history,
                };
                tokio::spawn(session_worker(
                    session.clone(),
                    roster,
                    runner,
                    queue_rx,
                    cancel_rx,
                ));

                let slot = Arc::new(SessionSlot {
                    queue_tx,
                    bus,
                    cancel_tx,
                    last_activity: Mutex::new(Instant::now()),
                });
                vacant.insert(slot.clone());
                tracing::info!(
                    session_id = %session.id,
                    "Created runtime binding"
                );
                Ok(slot)
            }
        }
    }
}

/// Per-session worker: strictly serial task processing in arrival order.
async fn session_worker(
    session: Session,
    roster: Vec<Persona>,
    runner: TurnRunner,
    mut queue_rx: mpsc::Receiver<TurnTask>,
    cancel_rx: watch::Receiver<bool>,
) {
    let mut state = SchedulerState::default();

    while let Some(task) = queue_rx.recv().await {
        if *cancel_rx.borrow() {
            break;
        }
        runner
            .run(&session, &roster, &mut state, &cancel_rx, task)
            .await;
    }

    tracing::debug!(session_id = %session.id, "Session worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::SessionPatch;
    use parley_llm::{ChatBackend, ChatOutcome, ChatRequest, FinishReason, LlmError};
    use parley_persistence::{connect, ApiProfileStore, KeyCipher};
    use parley_rag::{EmbedderConfig, VectorStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::factory::ResolvedChatBackend;

    /// Backend that streams fixed chunks with a per-chunk delay.
    struct ChunkBackend {
        chunks: Vec<String>,
        delay: Duration,
    }

    #[async_trait]
    impl ChatBackend for ChunkBackend {
        async fn stream_chat(
            &self,
            _request: ChatRequest,
            tx: mpsc::Sender<String>,
        ) -> Result<ChatOutcome, LlmError> {
            let mut text = String::new();
            for chunk in &self.chunks {
                tokio::time::sleep(self.delay).await;
                text.push_str(chunk);
                if tx.send(chunk.clone()).await.is_err() {
                    return Ok(ChatOutcome {
                        text,
                        tool_calls: Vec::new(),
                        finish: FinishReason::Cancelled,
                    });
                }
            }
            Ok(ChatOutcome {
                text,
                tool_calls: Vec::new(),
                finish: FinishReason::Stop,
            })
        }

        fn model_name(&self) -> &str {
            "chunked"
        }
    }

    /// Backend that always fails.
    struct FailingBackend;

    #[async_trait]
    impl ChatBackend for FailingBackend {
        async fn stream_chat(
            &self,
            _request: ChatRequest,
            _tx: mpsc::Sender<String>,
        ) -> Result<ChatOutcome, LlmError> {
            Err(LlmError::Api("upstream 503".into()))
        }

        fn model_name(&self) -> &str {
            "failing"
        }
    }

    /// Factory that cycles through scripted backends, one per call.
    struct ScriptedFactory {
        backends: Vec<Arc<dyn ChatBackend>>,
        next: AtomicUsize,
    }

    impl ScriptedFactory {
        fn cycling(backends: Vec<Arc<dyn ChatBackend>>) -> Arc<Self> {
            Arc::new(Self {
                backends,
                next: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BackendFactory for ScriptedFactory {
        async fn chat_backend(&self, _persona: &Persona) -> Result<ResolvedChatBackend, Error> {
            let index = self.next.fetch_add(1, Ordering::SeqCst) % self.backends.len();
            Ok(ResolvedChatBackend {
                backend: self.backends[index].clone(),
                temperature: 0.0,
            })
        }

        async fn embedder_config(
            &self,
            _persona: &Persona,
        ) -> Result<Option<EmbedderConfig>, Error> {
            Ok(None)
        }
    }

    struct Harness {
        orchestrator: Arc<SessionOrchestrator>,
        conversations: ConversationStore,
        session: Session,
    }

    async fn harness(factory: Arc<dyn BackendFactory>, personas_count: usize) -> Harness {
        let pool = connect("sqlite::memory:").await.unwrap();
        let conversations = ConversationStore::new(pool.clone());
        let personas = PersonaStore::new(pool.clone());
        let profiles = ApiProfileStore::new(pool, KeyCipher::new([1u8; 32]));

        let profile = profiles
            .create(
                "alice",
                parley_persistence::NewApiProfile {
                    name: "main".into(),
                    base_url: "http://127.0.0.1:1/v1".into(),
                    model: "test".into(),
                    api_key: "sk-x".into(),
                    temperature: 0.0,
                    is_embedding_model: false,
                    embedding_dim: None,
                },
            )
            .await
            .unwrap();

        for i in 0..personas_count {
            personas
                .create(
                    "alice",
                    parley_persistence::NewPersona {
                        handle: format!("maid{}", i),
                        display_name: format!("Maid {}", i),
                        system_prompt: "helpful".into(),
                        tone: String::new(),
                        proactivity: 0.9,
                        memory_window: 10,
                        max_agents_per_turn: 1,
                        api_profile_id: profile.id.clone(),
                        embedding_profile_id: None,
                        is_default: i == 0,
                        background_text: None,
                    },
                )
                .await
                .unwrap();
        }

        let session = conversations
            .create_session("alice", SessionPatch::default())
            .await
            .unwrap();

        let engine = Arc::new(RetrievalEngine::new(Arc::new(
            VectorStore::connect("http://127.0.0.1:6334").unwrap(),
        )));
        let orchestrator = Arc::new(SessionOrchestrator::new(
            conversations.clone(),
            personas,
            factory,
            engine,
            OrchestratorConfig {
                llm_timeout: Duration::from_secs(5),
                idle_eviction: Duration::from_secs(1800),
                event_buffer: 256,
                max_history: 128,
            },
        ));

        Harness {
            orchestrator,
            conversations,
            session,
        }
    }

    fn chunked(chunks: &[&str], delay_ms: u64) -> Arc<dyn ChatBackend> {
        Arc::new(ChunkBackend {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            delay: Duration::from_millis(delay_ms),
        })
    }

    async fn collect_until_idle(
        rx: &mut broadcast::Receiver<ChatEvent>,
        expected_ends: usize,
    ) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        let mut ends = 0;
        while ends < expected_ends {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(event)) => {
                    if matches!(
                        event,
                        ChatEvent::AgentEnd { .. } | ChatEvent::AgentError { .. }
                    ) {
                        ends += 1;
                    }
                    events.push(event);
                }
                _ => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn test_streaming_order_across_two_messages() {
        // Scenario: posting "A" then "B" yields all of m_A's events before
        // any of m_B's.
        let factory = ScriptedFactory::cycling(vec![
            chunked(&["re", "ply ", "A"], 5),
            chunked(&["reply B"], 5),
        ]);
        let h = harness(factory, 1).await;

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator.enqueue(&h.session.id, "A", None).await.unwrap();
        h.orchestrator.enqueue(&h.session.id, "B", None).await.unwrap();

        let events = collect_until_idle(&mut rx, 2).await;

        let agent_message_ids: Vec<String> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::AgentStart { message_id, .. } => Some(message_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(agent_message_ids.len(), 2);
        let (m_a, m_b) = (&agent_message_ids[0], &agent_message_ids[1]);

        let last_a = events
            .iter()
            .rposition(|e| e.message_id() == Some(m_a.as_str()))
            .unwrap();
        let first_b = events
            .iter()
            .position(|e| e.message_id() == Some(m_b.as_str()))
            .unwrap();
        assert!(
            last_a < first_b,
            "all events for the first turn must precede the second"
        );
    }

    #[tokio::test]
    async fn test_chunks_join_to_persisted_reply() {
        let factory = ScriptedFactory::cycling(vec![chunked(&["The ", "code ", "is ", "42."], 2)]);
        let h = harness(factory, 1).await;

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator
            .enqueue(&h.session.id, "what is the code?", None)
            .await
            .unwrap();

        let events = collect_until_idle(&mut rx, 1).await;

        let joined: String = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::AgentChunk { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        let (end_content, persisted_id) = events
            .iter()
            .find_map(|e| match e {
                ChatEvent::AgentEnd {
                    content,
                    persisted_message_id,
                    ..
                } => Some((content.clone(), persisted_message_id.clone())),
                _ => None,
            })
            .unwrap();

        assert_eq!(joined, "The code is 42.");
        assert_eq!(end_content, joined);

        let history = h.conversations.list_messages(&h.session.id, 10).await.unwrap();
        let reply = history.iter().find(|m| m.sender == "maid0").unwrap();
        assert_eq!(reply.content, joined);
        assert_eq!(persisted_id.as_deref(), Some(reply.id.as_str()));
    }

    #[tokio::test]
    async fn test_enqueue_during_running_turn_is_visible_immediately() {
        // A slow first turn must not delay the second message's commit.
        let factory = ScriptedFactory::cycling(vec![
            chunked(&["slow ", "reply ", "here ", "now"], 50),
            chunked(&["fast"], 1),
        ]);
        let h = harness(factory, 1).await;

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator.enqueue(&h.session.id, "first", None).await.unwrap();
        // Wait for the first turn to actually start streaming.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(ChatEvent::AgentChunk { .. })) => break,
                Ok(Ok(_)) => continue,
                other => panic!("no chunk observed: {:?}", other),
            }
        }

        h.orchestrator.enqueue(&h.session.id, "second", None).await.unwrap();
        let history = h.conversations.list_messages(&h.session.id, 10).await.unwrap();
        let user_messages: Vec<_> = history
            .iter()
            .filter(|m| m.sender == "user")
            .map(|m| m.content.as_str())
            .collect();
        // Both user messages are durable while the first reply is streaming.
        assert_eq!(user_messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_close_session_cancels_without_persisting() {
        let factory = ScriptedFactory::cycling(vec![chunked(
            &["c0 ", "c1 ", "c2 ", "c3 ", "c4 ", "c5 ", "c6 ", "c7"],
            50,
        )]);
        let h = harness(factory, 1).await;

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator.enqueue(&h.session.id, "go", None).await.unwrap();

        // Observe the first chunk, then delete mid-stream.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(ChatEvent::AgentChunk { .. })) => break,
                Ok(Ok(_)) => continue,
                other => panic!("no chunk observed: {:?}", other),
            }
        }
        h.orchestrator.close_session(&h.session.id);

        // The stream terminates within bounded time: an unpersisted
        // agent.end, then channel close.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        let mut saw_unpersisted_end = false;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(ChatEvent::AgentEnd {
                    persisted_message_id,
                    ..
                })) => {
                    assert!(persisted_message_id.is_none());
                    saw_unpersisted_end = true;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_closed)) => break,
                Err(_) => panic!("bus did not close within one second"),
            }
        }
        assert!(saw_unpersisted_end);

        // No persona reply was committed.
        let history = h.conversations.list_messages(&h.session.id, 10).await.unwrap();
        assert!(history.iter().all(|m| m.sender == "user"));
    }

    #[tokio::test]
    async fn test_upstream_error_is_contained_to_one_persona() {
        // Two personas, one slot each... max slots = 1, so force both via
        // targets; first fails, second succeeds.
        let factory = ScriptedFactory::cycling(vec![
            Arc::new(FailingBackend) as Arc<dyn ChatBackend>,
            chunked(&["still here"], 1),
        ]);
        let h = harness(factory, 2).await;

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator
            .enqueue(
                &h.session.id,
                "both of you",
                Some(vec!["maid0".into(), "maid1".into()]),
            )
            .await
            .unwrap();

        let events = collect_until_idle(&mut rx, 2).await;

        let errored: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::AgentError { sender, .. } => Some(sender.as_str()),
                _ => None,
            })
            .collect();
        let ended: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::AgentEnd { sender, .. } => Some(sender.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(errored, vec!["maid0"]);
        assert_eq!(ended, vec!["maid1"]);

        let history = h.conversations.list_messages(&h.session.id, 10).await.unwrap();
        assert!(history.iter().any(|m| m.sender == "maid1"));
        assert!(!history.iter().any(|m| m.sender == "maid0"));
    }

    #[tokio::test]
    async fn test_idle_eviction_drops_binding() {
        let factory = ScriptedFactory::cycling(vec![chunked(&["hi"], 1)]);
        let mut h = harness(factory, 1).await;
        // Rebuild with a tiny idle horizon.
        let orchestrator = Arc::get_mut(&mut h.orchestrator).unwrap();
        orchestrator.config.idle_eviction = Duration::from_millis(10);

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator.enqueue(&h.session.id, "hello", None).await.unwrap();
        let _ = collect_until_idle(&mut rx, 1).await;
        assert_eq!(h.orchestrator.bound_sessions(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.orchestrator.evict_idle(), 1);
        assert_eq!(h.orchestrator.bound_sessions(), 0);

        // The next message lazily rebinds.
        h.orchestrator.enqueue(&h.session.id, "again", None).await.unwrap();
        assert_eq!(h.orchestrator.bound_sessions(), 1);
    }

    #[tokio::test]
    async fn test_subscriber_disconnect_does_not_cancel_turn() {
        let factory = ScriptedFactory::cycling(vec![chunked(&["sur", "vives"], 20)]);
        let h = harness(factory, 1).await;

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator.enqueue(&h.session.id, "hello", None).await.unwrap();
        // Observe the stream starting, then walk away mid-turn.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Ok(ChatEvent::AgentChunk { .. })) => break,
                Ok(Ok(_)) => continue,
                other => panic!("no chunk observed: {:?}", other),
            }
        }
        drop(rx);

        // The turn still runs to completion and persists its reply.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let history = h.conversations.list_messages(&h.session.id, 10).await.unwrap();
            if history.iter().any(|m| m.sender == "maid0" && m.content == "survives") {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("reply was not persisted after subscriber disconnect");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let factory = ScriptedFactory::cycling(vec![chunked(&["x"], 1)]);
        let h = harness(factory, 1).await;
        let ghost = SessionId::parse("sess_alice_deadbeef").unwrap();
        let err = h.orchestrator.enqueue(&ghost, "hi", None).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mentioned_persona_is_the_speaker() {
        let factory = ScriptedFactory::cycling(vec![chunked(&["on it"], 1)]);
        let h = harness(factory, 2).await;

        let mut rx = h.orchestrator.subscribe(&h.session.id).await.unwrap();
        h.orchestrator
            .enqueue(&h.session.id, "hi @maid1", None)
            .await
            .unwrap();

        let events = collect_until_idle(&mut rx, 1).await;
        let speakers: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::AgentStart { sender, .. } => Some(sender.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(speakers, vec!["maid1"]);
    }
}
