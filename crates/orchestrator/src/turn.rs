//! Turn execution
//!
//! Runs one queued task: schedule speakers, then drive each persona's
//! streamed reply sequentially. Chunks go to the bus as they arrive; the
//! assembled reply is committed only at the end, so persistence stays off the
//! streaming hot path. Upstream failures and timeouts cost one persona, not
//! the turn; cancellation ends the turn without persisting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use parley_agent::{
    next_turn, AgentError, AgentTool, Invocation, KnowledgeSearchTool, PersonaRuntime,
    RuntimeMode, SchedulerState, ToolContext, TurnInput,
};
use parley_core::{ChatEvent, Error, Message, Persona, Session};
use parley_persistence::ConversationStore;
use parley_rag::RetrievalEngine;

use crate::bus::EventBus;
use crate::factory::BackendFactory;

/// Streaming chunk channel depth between runtime and bus forwarder.
const CHUNK_CHANNEL_DEPTH: usize = 64;

/// One queued unit of work for a session.
#[derive(Debug, Clone)]
pub struct TurnTask {
    /// The already-committed triggering user message.
    pub message: Message,
    /// Explicit target handles, overriding mention detection.
    pub targets: Option<Vec<String>>,
    /// Scheduler noise seed for this turn.
    pub seed: u64,
}

/// What happened to one persona within a turn.
enum PersonaOutcome {
    Committed(Message),
    Errored,
    Cancelled,
}

/// Executes tasks for one session; owned by that session's worker.
pub struct TurnRunner {
    pub conversations: ConversationStore,
    pub engine: Arc<RetrievalEngine>,
    pub factory: Arc<dyn BackendFactory>,
    pub bus: EventBus,
    pub llm_timeout: Duration,
    pub max_history: u32,
}

impl TurnRunner {
    /// Run one task to completion. Never returns an error: failures surface
    /// as bus events and the turn absorbs them.
    pub async fn run(
        &self,
        session: &Session,
        roster: &[Persona],
        state: &mut SchedulerState,
        cancel: &watch::Receiver<bool>,
        task: TurnTask,
    ) {
        metrics::counter!("parley_turns_total").increment(1);

        let speakers = next_turn(
            state,
            TurnInput {
                personas: roster,
                message: &task.message.content,
                fresh: true,
                targets: task.targets.as_deref(),
                seed: task.seed,
            },
        );
        if speakers.is_empty() {
            tracing::debug!(session_id = %session.id, "Turn produced no speakers");
            return;
        }

        let window = speakers
            .iter()
            .map(|p| p.memory_window)
            .max()
            .unwrap_or(1)
            .min(self.max_history);

        let mut history = match self.conversations.list_messages(&session.id, window).await {
            Ok(history) => history,
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "History reload failed");
                self.bus.publish(ChatEvent::SystemError {
                    reason: "history unavailable".to_string(),
                });
                return;
            }
        };
        // The triggering message is passed separately to the runtime.
        history.retain(|m| m.id != task.message.id);

        for persona in &speakers {
            if *cancel.borrow() {
                break;
            }
            match self
                .run_persona(session, persona, &history, &task, cancel)
                .await
            {
                PersonaOutcome::Committed(message) => {
                    // Later speakers in the same turn see this reply.
                    history.push(message);
                }
                PersonaOutcome::Errored => continue,
                PersonaOutcome::Cancelled => break,
            }
        }
    }

    async fn run_persona(
        &self,
        session: &Session,
        persona: &Persona,
        history: &[Message],
        task: &TurnTask,
        cancel: &watch::Receiver<bool>,
    ) -> PersonaOutcome {
        let pending_id = uuid::Uuid::new_v4().to_string();
        self.bus.publish(ChatEvent::AgentStart {
            message_id: pending_id.clone(),
            sender: persona.handle.clone(),
        });

        // Credentials are decrypted here and die with this frame.
        let resolved = match self.factory.chat_backend(persona).await {
            Ok(resolved) => resolved,
            Err(e) => return self.fail(&pending_id, persona, e),
        };
        let embedder = match self.factory.embedder_config(persona).await {
            Ok(embedder) => embedder,
            Err(e) => return self.fail(&pending_id, persona, e),
        };

        let (mode, tools): (RuntimeMode, Vec<Arc<dyn AgentTool>>) = match embedder {
            Some(config) => (
                RuntimeMode::Retrieval,
                vec![Arc::new(KnowledgeSearchTool::new(self.engine.clone(), config))],
            ),
            None => (RuntimeMode::Direct, Vec::new()),
        };
        let tool_ctx = ToolContext {
            owner: session.owner.clone(),
            persona_id: persona.id.clone(),
        };

        let invocation = Invocation {
            persona: persona.clone(),
            history: history.to_vec(),
            user_sender: task.message.sender.clone(),
            user_message: task.message.content.clone(),
            mode,
            temperature: resolved.temperature,
        };
        let runtime = PersonaRuntime::new(resolved.backend);

        let (chunk_tx, mut chunk_rx) = mpsc::channel::<String>(CHUNK_CHANNEL_DEPTH);
        let forward_bus = self.bus.clone();
        let forward_sender = persona.handle.clone();
        let forward_id = pending_id.clone();
        let forwarder = tokio::spawn(async move {
            let mut assembled = String::new();
            while let Some(chunk) = chunk_rx.recv().await {
                assembled.push_str(&chunk);
                forward_bus.publish(ChatEvent::AgentChunk {
                    message_id: forward_id.clone(),
                    sender: forward_sender.clone(),
                    content: chunk,
                });
            }
            assembled
        });

        let started = Instant::now();
        let result = tokio::time::timeout(
            self.llm_timeout,
            runtime.stream_reply(&invocation, &tools, &tool_ctx, cancel.clone(), chunk_tx),
        )
        .await;
        // The chunk sender is gone either way; the forwarder drains and ends.
        let assembled = forwarder.await.unwrap_or_default();
        metrics::histogram!("parley_llm_call_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Err(_elapsed) => self.fail(&pending_id, persona, Error::Timeout),
            Ok(Err(AgentError::Cancelled)) => {
                tracing::info!(
                    session_id = %session.id,
                    persona = %persona.handle,
                    "Turn cancelled mid-stream"
                );
                self.bus.publish(ChatEvent::AgentEnd {
                    message_id: pending_id,
                    sender: persona.handle.clone(),
                    content: assembled,
                    persisted_message_id: None,
                });
                PersonaOutcome::Cancelled
            }
            Ok(Err(e)) => self.fail(&pending_id, persona, e.into()),
            Ok(Ok(text)) => {
                debug_assert_eq!(assembled, text);
                match self
                    .conversations
                    .append_message(&session.id, &persona.handle, &text)
                    .await
                {
                    Ok(message) => {
                        metrics::counter!("parley_agent_replies_total").increment(1);
                        self.bus.publish(ChatEvent::AgentEnd {
                            message_id: pending_id,
                            sender: persona.handle.clone(),
                            content: text,
                            persisted_message_id: Some(message.id.clone()),
                        });
                        PersonaOutcome::Committed(message)
                    }
                    Err(e) => self.fail(&pending_id, persona, e.into()),
                }
            }
        }
    }

    /// Emit `agent.error` and let the turn move on.
    fn fail(&self, pending_id: &str, persona: &Persona, error: Error) -> PersonaOutcome {
        metrics::counter!("parley_agent_errors_total").increment(1);
        tracing::warn!(
            persona = %persona.handle,
            error = %error,
            "Persona reply failed"
        );
        self.bus.publish(ChatEvent::AgentError {
            message_id: pending_id.to_string(),
            sender: persona.handle.clone(),
            reason: error.to_string(),
        });
        PersonaOutcome::Errored
    }
}
