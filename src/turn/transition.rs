//! Pure turn transition function
//!
//! One turn: user message in, model invoked, zero or more tool cycles,
//! final assistant answer out. Given the same state and event this always
//! produces the same result; all I/O lives behind the returned effects.

use super::state::{SessionContext, ToolCall, TurnState};
use super::{Effect, TurnEvent};
use crate::db::{ErrorKind, ToolResult};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: TurnState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: TurnState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("A turn is already in progress for this conversation")]
    TurnInProgress,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
pub fn transition(
    state: &TurnState,
    context: &SessionContext,
    event: TurnEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        // ============================================================
        // User message starts a turn
        // ============================================================
        (TurnState::Idle | TurnState::Failed { .. }, TurnEvent::UserMessage { text }) => {
            Ok(TransitionResult::new(TurnState::AwaitingModel { round: 0 })
                .with_effect(Effect::persist_user_message(text))
                .with_effect(Effect::PersistState)
                .with_effect(Effect::RequestModel))
        }

        // A turn is in flight: reject further input
        (
            TurnState::AwaitingModel { .. } | TurnState::AwaitingTools { .. },
            TurnEvent::UserMessage { .. },
        ) => Err(TransitionError::TurnInProgress),

        // ============================================================
        // Model response: final answer or tool cycle
        // ============================================================
        (
            TurnState::AwaitingModel { round },
            TurnEvent::ModelResponse {
                content,
                tool_calls,
                usage,
            },
        ) => {
            if tool_calls.is_empty() {
                // Final answer; the turn is done
                return Ok(TransitionResult::new(TurnState::Idle)
                    .with_effect(Effect::persist_assistant_message(content, usage))
                    .with_effect(Effect::PersistState)
                    .with_effect(Effect::notify_turn_done()));
            }

            if *round >= context.max_tool_rounds {
                // Bounded loop: answer every requested call with a synthetic
                // error so no tool_use is left dangling, then fail the turn
                let results: Vec<ToolResult> = tool_calls
                    .iter()
                    .map(|call| {
                        ToolResult::error(&call.id, "Not executed: tool cycle limit reached")
                    })
                    .collect();
                let message = format!(
                    "Turn exceeded the limit of {} tool cycles",
                    context.max_tool_rounds
                );

                return Ok(TransitionResult::new(TurnState::Failed {
                    message: message.clone(),
                    kind: ErrorKind::TurnLimit,
                })
                .with_effect(Effect::persist_assistant_message(content, usage))
                .with_effect(Effect::PersistToolResults { results })
                .with_effect(Effect::PersistState)
                .with_effect(Effect::notify_error(&message)));
            }

            let running: Vec<Effect> = tool_calls
                .iter()
                .map(|call| Effect::notify_tool_status(&call.name, "running"))
                .collect();

            Ok(TransitionResult::new(TurnState::AwaitingTools {
                pending: tool_calls.clone(),
                collected: vec![],
                round: *round,
            })
            .with_effect(Effect::persist_assistant_message(content, usage))
            .with_effect(Effect::PersistState)
            .with_effect(Effect::DispatchTools { calls: tool_calls })
            .with_effects(running))
        }

        // Model failure: catch and report, no retry
        (TurnState::AwaitingModel { .. }, TurnEvent::ModelFailed { message, kind }) => {
            Ok(TransitionResult::new(TurnState::Failed {
                message: message.clone(),
                kind,
            })
            .with_effect(Effect::PersistState)
            .with_effect(Effect::notify_error(&message)))
        }

        // ============================================================
        // Tool results: collect until the batch drains
        // ============================================================
        (
            TurnState::AwaitingTools {
                pending,
                collected,
                round,
            },
            TurnEvent::ToolFinished {
                tool_use_id,
                result,
            },
        ) => {
            let Some(position) = pending.iter().position(|call| call.id == tool_use_id) else {
                return Err(TransitionError::InvalidTransition(format!(
                    "Result for tool call {tool_use_id} which is not pending"
                )));
            };

            let finished = pending[position].clone();
            let remaining: Vec<ToolCall> = pending
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != position)
                .map(|(_, call)| call.clone())
                .collect();
            let mut new_collected = collected.clone();
            new_collected.push(result.clone());

            let effects = vec![
                Effect::persist_tool_message(&result),
                Effect::notify_tool_status(&finished.name, "complete"),
            ];

            if remaining.is_empty() {
                // Every requested tool answered; back to the model
                Ok(TransitionResult {
                    new_state: TurnState::AwaitingModel { round: round + 1 },
                    effects,
                }
                .with_effect(Effect::PersistState)
                .with_effect(Effect::RequestModel))
            } else {
                Ok(TransitionResult {
                    new_state: TurnState::AwaitingTools {
                        pending: remaining,
                        collected: new_collected,
                        round: *round,
                    },
                    effects,
                }
                .with_effect(Effect::PersistState))
            }
        }

        // ============================================================
        // Everything else is a contract violation
        // ============================================================
        (state, event) => Err(TransitionError::InvalidTransition(format!(
            "No transition from {state:?} with event {event:?}"
        ))),
    }
}
