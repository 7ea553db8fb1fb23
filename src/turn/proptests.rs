//! Property-based tests for the turn transition function

use super::state::*;
use super::transition::*;
use super::*;
use crate::db::ToolResult;
use crate::llm::{ContentBlock, Usage};
use proptest::prelude::*;

fn test_context() -> SessionContext {
    SessionContext::new("test-conv")
}

// ============================================================================
// Generators
// ============================================================================

fn arb_tool_call() -> impl Strategy<Value = ToolCall> {
    (
        "[a-z0-9]{8}",
        prop_oneof![Just("web_search"), Just("stock_price"), Just("nonsense")],
        "[a-zA-Z ]{0,20}",
    )
        .prop_map(|(id, name, arg)| {
            ToolCall::new(id, name, serde_json::json!({ "value": arg }))
        })
}

fn arb_tool_result(id: String) -> impl Strategy<Value = ToolResult> {
    (any::<bool>(), "[a-zA-Z0-9 ]{0,40}").prop_map(move |(is_error, output)| ToolResult {
        tool_use_id: id.clone(),
        output,
        is_error,
    })
}

fn arb_awaiting_tools() -> impl Strategy<Value = TurnState> {
    (
        proptest::collection::vec(arb_tool_call(), 1..4),
        0u32..DEFAULT_MAX_TOOL_ROUNDS,
    )
        .prop_map(|(pending, round)| TurnState::AwaitingTools {
            pending,
            collected: vec![],
            round,
        })
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    /// A user message from a quiescent state always persists exactly one
    /// message and requests the model.
    #[test]
    fn user_message_from_quiescent_state(text in "[a-zA-Z0-9 ]{1,40}", failed in any::<bool>()) {
        let state = if failed {
            TurnState::Failed { message: "x".to_string(), kind: crate::db::ErrorKind::Unknown }
        } else {
            TurnState::Idle
        };

        let result = transition(&state, &test_context(), TurnEvent::UserMessage { text }).unwrap();

        prop_assert_eq!(&result.new_state, &TurnState::AwaitingModel { round: 0 });
        let persisted = result.effects.iter()
            .filter(|e| matches!(e, Effect::PersistMessage { .. }))
            .count();
        prop_assert_eq!(persisted, 1);
        prop_assert!(result.effects.iter().any(|e| matches!(e, Effect::RequestModel)));
    }

    /// While a turn is active, user messages are always rejected; state
    /// and effects are untouched.
    #[test]
    fn active_turn_rejects_user_messages(state in prop_oneof![
        (0u32..5).prop_map(|round| TurnState::AwaitingModel { round }),
        arb_awaiting_tools(),
    ], text in "[a-z]{1,10}") {
        let result = transition(&state, &test_context(), TurnEvent::UserMessage { text });
        prop_assert!(matches!(result, Err(TransitionError::TurnInProgress)));
    }

    /// Finishing a pending tool always shrinks the pending set by exactly
    /// one and persists exactly one tool message; the model is re-invoked
    /// exactly when the batch drains.
    #[test]
    fn tool_finished_drains_batch(state in arb_awaiting_tools(), pick in any::<prop::sample::Index>()) {
        let TurnState::AwaitingTools { pending, round, .. } = state.clone() else {
            unreachable!()
        };
        let call = &pending[pick.index(pending.len())];
        let result = transition(
            &state,
            &test_context(),
            TurnEvent::ToolFinished {
                tool_use_id: call.id.clone(),
                result: ToolResult::success(&call.id, "ok"),
            },
        ).unwrap();

        let persisted = result.effects.iter()
            .filter(|e| matches!(e, Effect::PersistMessage { .. }))
            .count();
        prop_assert_eq!(persisted, 1);

        let requests_model = result.effects.iter().any(|e| matches!(e, Effect::RequestModel));
        match &result.new_state {
            TurnState::AwaitingModel { round: next } => {
                prop_assert_eq!(pending.len(), 1);
                prop_assert_eq!(*next, round + 1);
                prop_assert!(requests_model);
            }
            TurnState::AwaitingTools { pending: remaining, collected, round: same } => {
                prop_assert_eq!(remaining.len(), pending.len() - 1);
                prop_assert_eq!(collected.len(), 1);
                prop_assert_eq!(*same, round);
                prop_assert!(!requests_model);
                prop_assert!(!remaining.iter().any(|c| c.id == call.id));
            }
            other => prop_assert!(false, "unexpected state {:?}", other),
        }
    }

    /// The tool-cycle counter never decreases within a turn.
    #[test]
    fn round_is_monotonic(state in arb_awaiting_tools()) {
        let TurnState::AwaitingTools { pending, round, .. } = state.clone() else {
            unreachable!()
        };
        let call = &pending[0];
        let result = transition(
            &state,
            &test_context(),
            TurnEvent::ToolFinished {
                tool_use_id: call.id.clone(),
                result: ToolResult::success(&call.id, "ok"),
            },
        ).unwrap();

        let next_round = match &result.new_state {
            TurnState::AwaitingModel { round } | TurnState::AwaitingTools { round, .. } => *round,
            _ => round,
        };
        prop_assert!(next_round >= round);
    }

    /// A result for a tool that was never dispatched is rejected without
    /// effects.
    #[test]
    fn stray_result_rejected(state in arb_awaiting_tools(), result in arb_tool_result("not-pending".to_string())) {
        let outcome = transition(
            &state,
            &test_context(),
            TurnEvent::ToolFinished { tool_use_id: "not-pending".to_string(), result },
        );
        prop_assert!(matches!(outcome, Err(TransitionError::InvalidTransition(_))));
    }

    /// At the cycle cap, tool-requesting responses always fail the turn
    /// with one synthetic result per requested call.
    #[test]
    fn cap_produces_synthetic_results(calls in proptest::collection::vec(arb_tool_call(), 1..4)) {
        let context = test_context().with_max_tool_rounds(3);
        let content: Vec<ContentBlock> = calls
            .iter()
            .map(|c| ContentBlock::tool_use(&c.id, &c.name, c.input.clone()))
            .collect();

        let result = transition(
            &TurnState::AwaitingModel { round: 3 },
            &context,
            TurnEvent::ModelResponse { content, tool_calls: calls.clone(), usage: Usage::default() },
        ).unwrap();

        let matched = matches!(
            result.new_state,
            TurnState::Failed { kind: crate::db::ErrorKind::TurnLimit, .. }
        );
        prop_assert!(matched);
        let synthetic = result.effects.iter().find_map(|e| match e {
            Effect::PersistToolResults { results } => Some(results.len()),
            _ => None,
        });
        prop_assert_eq!(synthetic, Some(calls.len()));
    }
}
