//! Request-resolution orchestrator.
//!
//! Pipeline:
//! 1. **Classify** the utterance into a task kind
//! 2. **Resolve references** for tasks about earlier results
//! 3. **Select** an operation and **assess** its usability, discarding
//!    rejected candidates until one fits or the discard budget runs out
//! 4. **Extract parameters**, pausing with `ask_user` when something is missing
//! 5. **Execute** the operation against the caller's data handle
//! 6. **Describe** the result to the user
//!
//! Control flow is driven by [`next_transition`]; each stage only reports an
//! outcome. One in-flight request per conversation: turns for the same
//! conversation are serialized on a per-conversation lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as TokioMutex;

use super::classifier;
use super::conversation::{title_from_utterance, ConversationStore};
use super::describer;
use super::errors::{AgentError, StageError};
use super::executor;
use super::extractor::{self, ExtractionResult};
use super::references;
use super::registry::{DataHandle, OperationDescriptor, OperationRegistry, Visualizer};
use super::retrier::StageCall;
use super::selector::{self, SelectionResult, UsabilityVerdict, DEFAULT_NO_MATCH_REASON};
use super::turn_state::{next_transition, Stage, StageOutcome, Transition, TurnState};
use super::types::{
    Conversation, ConversationMessage, ConversationSummary, MessageStatus, MessageView,
    NewMessage, StructuredResult, TurnResponse,
};
use crate::inference::config::OrchestratorConfig;
use crate::inference::Oracle;

// ─── User-facing Messages ───────────────────────────────────────────────────

/// Reply when a stage could not get a usable answer from the oracle.
pub const GENERIC_FAILURE: &str =
    "Sorry, I could not understand the request. Please try rephrasing it.";

/// Reply when the referenced messages could not be identified.
pub const REFERENCE_FAILURE: &str =
    "I could not determine which earlier messages you are referring to.";

/// Reply when the discard budget is spent.
pub const NO_SUITABLE_OPERATION: &str =
    "Sorry, I could not find a suitable function for your request.";

const NO_VISUALIZER: &str = "Visualizations are not available in this deployment.";

const NOTHING_TO_PLOT: &str = "None of the referenced results can be visualized.";

// ─── Context ────────────────────────────────────────────────────────────────

/// Everything a request needs besides the conversation store.
///
/// Passed explicitly instead of living in globals, so several orchestrators
/// (or tests with scripted oracles) can coexist in one process.
pub struct OrchestratorContext {
    pub oracle: Arc<dyn Oracle>,
    /// Full registry. Requests only ever see filtered views of it.
    pub registry: Arc<OperationRegistry>,
    pub visualizer: Option<Arc<dyn Visualizer>>,
    pub config: OrchestratorConfig,
}

/// Mutable state of one physical turn.
struct TurnRun<'t> {
    conversation_id: &'t str,
    data: &'t DataHandle,
    /// Stripped history, loaded before the current user message was stored.
    history: Vec<MessageView>,
    /// Id of the user message that opened this turn.
    user_message_id: i64,
    state: TurnState,
    referenced: Vec<MessageView>,
    referenced_full: Vec<ConversationMessage>,
    /// What the describer says was computed.
    subject: String,
    result: Option<StructuredResult>,
    /// Message for the terminal assistant reply or the `ask_user` question.
    reply: Option<String>,
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

pub struct Orchestrator {
    ctx: OrchestratorContext,
    store: Mutex<Box<dyn ConversationStore>>,
    locks: Mutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl Orchestrator {
    pub fn new(ctx: OrchestratorContext, store: Box<dyn ConversationStore>) -> Self {
        Self {
            ctx,
            store: Mutex::new(store),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &OrchestratorContext {
        &self.ctx
    }

    /// Run the store closure under the store lock. Never held across `.await`.
    fn with_store<T>(
        &self,
        f: impl FnOnce(&dyn ConversationStore) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let store = self.store.lock().map_err(|e| AgentError::LockError {
            reason: e.to_string(),
        })?;
        f(&**store)
    }

    fn conversation_lock(&self, conversation_id: &str) -> Result<Arc<TokioMutex<()>>, AgentError> {
        let mut locks = self.locks.lock().map_err(|e| AgentError::LockError {
            reason: e.to_string(),
        })?;
        Ok(locks.entry(conversation_id.to_string()).or_default().clone())
    }

    /// Drop the conversation's lock entry once no other turn holds or awaits it.
    fn release_lock(&self, conversation_id: &str, lock: Arc<TokioMutex<()>>) {
        match self.locks.lock() {
            Ok(mut locks) => {
                // One reference in the map, one here.
                if Arc::strong_count(&lock) == 2 {
                    locks.remove(conversation_id);
                }
            }
            Err(e) => tracing::warn!(
                conversation_id = %conversation_id,
                error = %e,
                "conversation lock map poisoned, entry kept"
            ),
        }
    }

    fn stage_call(&self) -> StageCall<'_> {
        StageCall::new(self.ctx.oracle.as_ref(), self.ctx.config.retry_budget)
    }

    // ─── Entry Point ────────────────────────────────────────────────────────

    /// Process one user message and record exactly one assistant reply.
    ///
    /// `resume` selects how a suspended request is treated:
    /// - `None`: resume automatically when the last message asked the user
    ///   something and a suspended request exists
    /// - `Some(Stage::ExtractParameters)`: resume the suspended request
    /// - any other stage: discard a suspended request and start afresh
    ///
    /// Errors are returned only for store failures; every pipeline outcome,
    /// failures included, is a [`TurnResponse`].
    pub async fn handle_turn(
        &self,
        conversation_id: &str,
        utterance: &str,
        data: &DataHandle,
        resume: Option<Stage>,
    ) -> Result<TurnResponse, AgentError> {
        let lock = self.conversation_lock(conversation_id)?;
        let outcome = {
            let _guard = lock.lock().await;
            self.run_turn(conversation_id, utterance, data, resume).await
        };
        self.release_lock(conversation_id, lock);
        outcome
    }

    async fn run_turn(
        &self,
        conversation_id: &str,
        utterance: &str,
        data: &DataHandle,
        resume: Option<Stage>,
    ) -> Result<TurnResponse, AgentError> {
        let config = &self.ctx.config;
        let (history, last_status, pending) = self.with_store(|store| {
            if !store.exists(conversation_id)? {
                store.create(conversation_id, &title_from_utterance(utterance))?;
            }
            let history = store.recent_history(
                conversation_id,
                config.history_window,
                config.history_token_budget,
            )?;
            Ok((
                history,
                store.last_status(conversation_id)?,
                store.load_pending_turn(conversation_id)?,
            ))
        })?;

        let awaiting_answer = last_status == Some(MessageStatus::AskUser);
        let wants_resume = match resume {
            Some(stage) => stage.is_resumable(),
            None => awaiting_answer,
        };
        let resumed = match pending {
            Some(state) if wants_resume => Some(state),
            _ => {
                if resume.is_some_and(|s| s.is_resumable()) {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        "resume requested without a suspended request, starting afresh"
                    );
                }
                None
            }
        };

        let user_status = if resumed.is_some() {
            MessageStatus::UserResponse
        } else {
            MessageStatus::UserMsg
        };
        let user_message = self.with_store(|store| {
            if resumed.is_none() {
                store.clear_pending_turn(conversation_id)?;
            }
            store.append(conversation_id, NewMessage::user(utterance, user_status))
        })?;

        let (state, start) = match resumed {
            Some(mut state) => {
                state.push_clarification(utterance);
                (state, Stage::ExtractParameters)
            }
            None => (TurnState::new(utterance), Stage::Classify),
        };

        let mut run = TurnRun {
            conversation_id,
            data,
            history,
            user_message_id: user_message.id,
            state,
            referenced: Vec::new(),
            referenced_full: Vec::new(),
            subject: String::new(),
            result: None,
            reply: None,
        };
        if start == Stage::ExtractParameters && !run.state.referenced_message_ids.is_empty() {
            self.load_referenced(&mut run)?;
        }

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = user_message.id,
            start = %start,
            "turn started"
        );

        let mut stage = start;
        loop {
            let outcome = self.run_stage(stage, &mut run).await?;
            let transition = next_transition(stage, run.state.task, outcome);
            tracing::info!(
                conversation_id = %conversation_id,
                stage = %stage,
                outcome = ?outcome,
                next = ?transition,
                "stage finished"
            );
            match transition {
                Transition::Continue(next) => stage = next,
                Transition::Suspend => return self.suspend(run),
                Transition::Finish(status) => return self.finish(run, status),
            }
        }
    }

    fn suspend(&self, mut run: TurnRun<'_>) -> Result<TurnResponse, AgentError> {
        let question = run
            .reply
            .take()
            .unwrap_or_else(|| "Could you provide more details?".to_string());
        run.state.push_question(question.clone());

        self.with_store(|store| {
            store.save_pending_turn(run.conversation_id, &run.state)?;
            store.append(
                run.conversation_id,
                NewMessage::assistant(question.clone(), MessageStatus::AskUser, None),
            )
        })?;

        Ok(TurnResponse {
            status: MessageStatus::AskUser,
            message: question,
            data: None,
            next_stage: Some(Stage::ExtractParameters),
        })
    }

    fn finish(&self, mut run: TurnRun<'_>, status: MessageStatus) -> Result<TurnResponse, AgentError> {
        let message = run.reply.take().unwrap_or_else(|| GENERIC_FAILURE.to_string());
        let data = match status {
            MessageStatus::Success => run.result.take(),
            _ => None,
        };

        self.with_store(|store| {
            store.append(
                run.conversation_id,
                NewMessage::assistant(message.clone(), status, data.clone()),
            )?;
            store.clear_pending_turn(run.conversation_id)
        })?;

        tracing::info!(
            conversation_id = %run.conversation_id,
            status = status.as_str(),
            task = ?run.state.task.map(|t| t.as_str()),
            discards = run.state.discarded_operations.len(),
            "turn finished"
        );
        Ok(TurnResponse {
            status,
            message,
            data,
            next_stage: None,
        })
    }

    // ─── Stages ─────────────────────────────────────────────────────────────

    async fn run_stage(&self, stage: Stage, run: &mut TurnRun<'_>) -> Result<StageOutcome, AgentError> {
        let call = self.stage_call();
        let outcome = match stage {
            Stage::Classify => {
                match classifier::classify(&call, &run.state.utterance, &run.history).await {
                    Ok(task) => {
                        run.state.task = Some(task);
                        StageOutcome::Classified(task)
                    }
                    Err(e) => stage_failed(run, &e, GENERIC_FAILURE),
                }
            }

            Stage::Chat => {
                match classifier::answer_chat(&call, &run.state.utterance, &run.history).await {
                    Ok(answer) => {
                        run.reply = Some(answer);
                        StageOutcome::Completed
                    }
                    Err(e) => stage_failed(run, &e, GENERIC_FAILURE),
                }
            }

            Stage::ResolveReferences => {
                let last_id = run.user_message_id - 1;
                if last_id < 1 {
                    run.reply = Some(REFERENCE_FAILURE.to_string());
                    return Ok(StageOutcome::Failed);
                }
                match references::resolve_references(&call, &run.state.utterance, &run.history, last_id)
                    .await
                {
                    Ok(ids) => {
                        run.state.referenced_message_ids = ids;
                        self.load_referenced(run)?;
                        StageOutcome::ReferencesResolved
                    }
                    Err(e) => stage_failed(run, &e, REFERENCE_FAILURE),
                }
            }

            Stage::ExplainFormerResult => {
                match describer::explain_former_result(
                    &call,
                    &run.state.utterance,
                    &run.referenced_full,
                    self.ctx.config.payload_char_limit,
                )
                .await
                {
                    Ok(text) => {
                        run.reply = Some(text);
                        StageOutcome::Completed
                    }
                    Err(e) => stage_failed(run, &e, GENERIC_FAILURE),
                }
            }

            Stage::Visualize => self.visualize(&call, run).await,

            Stage::SelectOperation => {
                let turn = self.ctx.registry.turn_view(&run.state.discarded_operations);
                if turn.is_empty() {
                    run.reply = Some(if run.state.discarded_operations.is_empty() {
                        DEFAULT_NO_MATCH_REASON.to_string()
                    } else {
                        NO_SUITABLE_OPERATION.to_string()
                    });
                    return Ok(StageOutcome::NoOperation);
                }
                match selector::select_operation(&call, &run.state.utterance, &run.referenced, &turn).await {
                    Ok(SelectionResult::Selected { name, reason }) => {
                        tracing::info!(
                            conversation_id = %run.conversation_id,
                            operation = %name,
                            reason = reason.as_deref().unwrap_or(""),
                            "operation selected"
                        );
                        run.state.selected_operation = Some(name);
                        StageOutcome::OperationSelected
                    }
                    Ok(SelectionResult::NoneSuitable { reason }) => {
                        run.reply = Some(reason);
                        StageOutcome::NoOperation
                    }
                    Err(e) => stage_failed(run, &e, GENERIC_FAILURE),
                }
            }

            Stage::AssessUsability => {
                let Some(descriptor) = self.selected_descriptor(run) else {
                    return Ok(StageOutcome::Failed);
                };
                match selector::assess_usability(&call, &run.state.utterance, &run.referenced, descriptor)
                    .await
                {
                    Ok(UsabilityVerdict::Usable) => StageOutcome::Usable,
                    Ok(UsabilityVerdict::Abort { reason }) => self.discard(run, &reason),
                    Err(e) => self.discard(run, &e.to_string()),
                }
            }

            Stage::ExtractParameters => {
                let Some(descriptor) = self.selected_descriptor(run) else {
                    return Ok(StageOutcome::Failed);
                };
                extractor::seed_history(&mut run.state, &run.referenced);
                match extractor::extract_parameters(&call, descriptor, &run.state.extraction_history).await {
                    Ok(ExtractionResult::Success {
                        parameters,
                        assumptions,
                    }) => {
                        run.state.extracted_parameters = parameters;
                        run.state.parameter_assumptions = assumptions;
                        StageOutcome::ParametersReady
                    }
                    Ok(pending @ ExtractionResult::Pending { .. }) => {
                        run.reply = pending.question();
                        StageOutcome::ParametersPending
                    }
                    Ok(ExtractionResult::Abort { reason }) => self.discard(run, &reason),
                    Err(e) => stage_failed(run, &e, GENERIC_FAILURE),
                }
            }

            Stage::Execute => {
                let Some(name) = run.state.selected_operation.clone() else {
                    return Ok(StageOutcome::Failed);
                };
                match executor::execute(&self.ctx.registry, &name, run.data, &run.state.extracted_parameters) {
                    Ok(result) => {
                        run.result = Some(result);
                        run.subject = name;
                        StageOutcome::Executed
                    }
                    Err(e) => {
                        run.reply = Some(executor::failure_message(&name, &e));
                        StageOutcome::Failed
                    }
                }
            }

            Stage::Describe => {
                let Some(result) = run.result.as_ref() else {
                    return Ok(StageOutcome::Failed);
                };
                let text = describer::describe_result(
                    &call,
                    &run.state.utterance,
                    &run.subject,
                    &run.state.extracted_parameters,
                    run.state.parameter_assumptions.as_deref(),
                    result,
                )
                .await;
                run.reply = Some(text);
                StageOutcome::Completed
            }
        };
        Ok(outcome)
    }

    async fn visualize(&self, call: &StageCall<'_>, run: &mut TurnRun<'_>) -> StageOutcome {
        let Some(visualizer) = self.ctx.visualizer.as_deref() else {
            run.reply = Some(NO_VISUALIZER.to_string());
            return StageOutcome::Failed;
        };
        let Some(target) = run
            .referenced_full
            .iter()
            .rev()
            .filter_map(|m| m.data.as_ref())
            .find(|d| d.visualizable && !d.available_visualizations.is_empty())
            .cloned()
        else {
            run.reply = Some(NOTHING_TO_PLOT.to_string());
            return StageOutcome::Failed;
        };

        let choice = match describer::choose_visualization(
            call,
            &run.state.utterance,
            &target.available_visualizations,
        )
        .await
        {
            Ok(choice) => choice,
            Err(e) => return stage_failed(run, &e, GENERIC_FAILURE),
        };

        match executor::render_visualization(visualizer, &target, &choice) {
            Ok(rendered) => {
                run.result = Some(rendered);
                run.subject = format!("{choice} visualization of an earlier result");
                StageOutcome::Visualized
            }
            Err(e) => {
                run.reply = Some(executor::failure_message(&choice, &e));
                StageOutcome::Failed
            }
        }
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn load_referenced(&self, run: &mut TurnRun<'_>) -> Result<(), AgentError> {
        let full = self.with_store(|store| {
            store.messages_by_ids(run.conversation_id, &run.state.referenced_message_ids)
        })?;
        run.referenced = full.iter().map(ConversationMessage::stripped).collect();
        run.referenced_full = full;
        Ok(())
    }

    fn selected_descriptor(&self, run: &TurnRun<'_>) -> Option<&OperationDescriptor> {
        let descriptor = run
            .state
            .selected_operation
            .as_deref()
            .and_then(|name| self.ctx.registry.descriptor(name));
        if descriptor.is_none() {
            tracing::error!(
                conversation_id = %run.conversation_id,
                operation = ?run.state.selected_operation,
                "no descriptor for the selected operation"
            );
        }
        descriptor
    }

    /// Drop the current candidate. Assessor and extractor rejections share
    /// one counter.
    fn discard(&self, run: &mut TurnRun<'_>, reason: &str) -> StageOutcome {
        let name = run.state.discard_selected();
        let discards = run.state.discarded_operations.len();
        let budget_exhausted = discards >= self.ctx.config.discard_budget as usize;

        tracing::warn!(
            conversation_id = %run.conversation_id,
            operation = ?name,
            discards,
            budget_exhausted,
            reason = %reason,
            "operation discarded"
        );
        if budget_exhausted {
            run.reply = Some(NO_SUITABLE_OPERATION.to_string());
        }
        StageOutcome::Discarded { budget_exhausted }
    }

    // ─── Conversation Management ────────────────────────────────────────────

    /// Create an empty conversation and return its id.
    pub fn new_conversation(&self) -> Result<String, AgentError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.with_store(|store| store.create(&id, &title_from_utterance("")))?;
        Ok(id)
    }

    pub fn load_conversation(&self, conversation_id: &str) -> Result<Conversation, AgentError> {
        self.with_store(|store| store.load(conversation_id))
    }

    pub fn rename_conversation(&self, conversation_id: &str, title: &str) -> Result<(), AgentError> {
        self.with_store(|store| store.rename(conversation_id, title))
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<(), AgentError> {
        self.with_store(|store| store.delete(conversation_id))?;
        match self.locks.lock() {
            Ok(mut locks) => {
                locks.remove(conversation_id);
            }
            Err(e) => tracing::warn!(
                conversation_id = %conversation_id,
                error = %e,
                "conversation lock map poisoned, entry kept"
            ),
        }
        Ok(())
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>, AgentError> {
        self.with_store(|store| store.list())
    }
}

/// Record a stage failure with its user-facing message.
fn stage_failed(run: &mut TurnRun<'_>, error: &StageError, message: &str) -> StageOutcome {
    tracing::warn!(
        conversation_id = %run.conversation_id,
        task = ?run.state.task.map(|t| t.as_str()),
        error = %error,
        "stage failed"
    );
    run.reply = Some(message.to_string());
    StageOutcome::Failed
}

// ─── Tests ──────────────────────────────────────────────────────────────────
