//! The orchestration loop: ask the model, run the tools it requests, repeat.

use relay_types::{
    ConversationContext, ModelClient, ModelError, RelayError, ToolDeclaration, ToolExecutor,
    Turn,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_STEPS: usize = 10;
pub const DEFAULT_MAX_TOOL_CALLS: usize = 25;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

/// Returned as the partial answer when nothing better was produced.
pub const NO_ANSWER_NOTICE: &str =
    "No final answer was produced before the step limit was reached.";

/// Bounds on one query resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopLimits {
    /// Model calls per query.
    pub max_steps: usize,
    /// Tool invocations per query.
    pub max_tool_calls: usize,
    pub model_timeout: Duration,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_tool_calls: DEFAULT_MAX_TOOL_CALLS,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }
}

/// Progress reported while a query is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    /// Non-empty text from a model step.
    ModelText(String),
    /// A tool is about to run.
    ToolStart { name: String, arguments: String },
    /// A tool finished; `output` is what the model will see.
    ToolEnd {
        name: String,
        output: String,
        is_error: bool,
    },
    /// The model produced a final answer.
    Done,
    /// A step or tool-call limit was hit.
    LoopExceeded { steps: usize, tool_calls: usize },
    /// The caller cancelled the query.
    Cancelled,
}

/// How a resolution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Final,
    /// A limit was hit; the text is the best partial answer.
    LoopExceeded,
}

/// The answer to one query and how it was reached.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Final text, or for `LoopExceeded` a partial answer that is never empty.
    pub text: String,
    pub outcome: Outcome,
    /// Model calls made.
    pub steps: usize,
    /// Tool invocations made.
    pub tool_calls: usize,
    pub context: ConversationContext,
}

impl Resolution {
    pub fn is_final(&self) -> bool {
        self.outcome == Outcome::Final
    }
}

/// Drives a model and a tool executor until the model answers.
pub struct Orchestrator {
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolExecutor>,
    limits: LoopLimits,
    system_prompt: Option<String>,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<dyn ToolExecutor>) -> Self {
        Self {
            model,
            tools,
            limits: LoopLimits::default(),
            system_prompt: None,
        }
    }

    pub fn with_limits(mut self, limits: LoopLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn limits(&self) -> LoopLimits {
        self.limits
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Resolve a query with no cancellation and no progress callback.
    pub async fn resolve(&self, query: &str) -> Result<Resolution, RelayError> {
        self.resolve_with(query, CancellationToken::new(), |_| {})
            .await
    }

    /// Resolve a query, reporting progress to `on_event`.
    ///
    /// The `cancel` token aborts the loop while waiting on the model or a tool.
    /// Tool failures are folded into the context as `Error: ...` results so
    /// the model can react; model failures end the query.
    pub async fn resolve_with<F>(
        &self,
        query: &str,
        cancel: CancellationToken,
        mut on_event: F,
    ) -> Result<Resolution, RelayError>
    where
        F: FnMut(LoopEvent),
    {
        let mut context =
            ConversationContext::new(query).with_system(self.system_prompt.clone());
        let declarations: Vec<ToolDeclaration> = self.tools.declarations();
        let mut tool_calls = 0usize;

        for step in 1..=self.limits.max_steps {
            tracing::debug!(
                "step {step}/{}: {} turns, {} tools",
                self.limits.max_steps,
                context.len(),
                declarations.len()
            );

            let generate = tokio::time::timeout(
                self.limits.model_timeout,
                self.model.generate(&context, &declarations),
            );
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    on_event(LoopEvent::Cancelled);
                    return Err(RelayError::Cancelled);
                }
                result = generate => match result {
                    Ok(reply) => reply?,
                    Err(_) => {
                        return Err(ModelError::Timeout {
                            timeout_ms: self.limits.model_timeout.as_millis() as u64,
                        }
                        .into());
                    }
                },
            };

            if !reply.text.trim().is_empty() {
                on_event(LoopEvent::ModelText(reply.text.clone()));
            }

            if reply.is_terminal() {
                context.push(Turn::Model {
                    text: reply.text.clone(),
                });
                on_event(LoopEvent::Done);
                return Ok(Resolution {
                    text: reply.text,
                    outcome: Outcome::Final,
                    steps: step,
                    tool_calls,
                    context,
                });
            }

            if !reply.text.trim().is_empty() {
                context.push(Turn::Model { text: reply.text });
            }

            for call in reply.tool_calls {
                if tool_calls >= self.limits.max_tool_calls {
                    return Ok(self.exceeded(context, step, tool_calls, &mut on_event));
                }
                tool_calls += 1;

                on_event(LoopEvent::ToolStart {
                    name: call.name.clone(),
                    arguments: call.arguments.to_string(),
                });
                let execute = self.tools.execute(&call.name, call.arguments.clone());
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        on_event(LoopEvent::Cancelled);
                        return Err(RelayError::Cancelled);
                    }
                    result = execute => result,
                };

                let (text, is_error) = match result {
                    Ok(output) if output.is_error => {
                        (format!("Error: {}", output.joined_text()), true)
                    }
                    Ok(output) => (output.joined_text(), false),
                    Err(e) => {
                        tracing::debug!("Tool '{}' failed: {e}", call.name);
                        (format!("Error: {e}"), true)
                    }
                };
                on_event(LoopEvent::ToolEnd {
                    name: call.name.clone(),
                    output: text.clone(),
                    is_error,
                });

                let call_id = call.id.clone();
                let name = call.name.clone();
                context.push(Turn::ToolCall(call));
                context.push(Turn::ToolResult {
                    call_id,
                    name,
                    text,
                    is_error,
                });
            }
        }

        let steps = self.limits.max_steps;
        Ok(self.exceeded(context, steps, tool_calls, &mut on_event))
    }

    fn exceeded<F>(
        &self,
        context: ConversationContext,
        steps: usize,
        tool_calls: usize,
        on_event: &mut F,
    ) -> Resolution
    where
        F: FnMut(LoopEvent),
    {
        tracing::warn!(
            "Query stopped after {steps} model steps and {tool_calls} tool calls (limits {}/{})",
            self.limits.max_steps,
            self.limits.max_tool_calls
        );
        on_event(LoopEvent::LoopExceeded { steps, tool_calls });
        let text = partial_answer(&context);
        Resolution {
            text,
            outcome: Outcome::LoopExceeded,
            steps,
            tool_calls,
            context,
        }
    }
}

/// Best text to show when the loop stops early: the last model text, else
/// the last successful tool result, else a fixed notice.
pub fn partial_answer(context: &ConversationContext) -> String {
    context
        .last_model_text()
        .or_else(|| context.last_tool_text())
        .unwrap_or(NO_ANSWER_NOTICE)
        .to_string()
}
