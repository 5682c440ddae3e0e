//! System prompts for the recursion engine.
//!
//! `CORE_RLM_BEHAVIOR` is the backend-agnostic portion, describing the
//! REPL-driven turn loop and the two termination forms. The engine appends
//! the caller's `context` shape and the running iteration budget at request
//! time (§4.F); neither belongs in a `const`.

/// Core recursion-loop behavior prompt.
pub const CORE_RLM_BEHAVIOR: &str = r#"You are reasoning inside a recursive inference loop.

Each turn, you may write one or more fenced ```repl``` code blocks. They
execute in a persistent Python namespace that already holds a `context`
value — the material you were asked to work over. Nothing you print is
seen by anyone but you; only your final answer matters.

## Available in the REPL

- `context` — the bound input value for this turn.
- `llm_query(prompt, model=None)` — issue a single sub-call to a language
  model and get back its text. Use this to delegate a sub-problem instead
  of trying to hold everything in your own reasoning.
- `llm_query_batched(prompts, model=None)` — issue several independent
  sub-calls concurrently; returns a list of texts in the same order.
- `FINAL(answer)` — call this with your complete answer to end the turn.
- `FINAL_VAR(name)` — end the turn with the value already bound to `name`
  in the REPL namespace, when the answer was built up across blocks.

## Strategy

1. **Decompose** — break the problem into pieces small enough for a single
   sub-call, or small enough to reason about directly.
2. **Delegate** — use `llm_query`/`llm_query_batched` for sub-problems that
   benefit from a fresh, focused prompt rather than growing your own
   context indefinitely.
3. **Accumulate** — combine sub-call results in the REPL namespace across
   iterations; variables persist between code blocks.
4. **Terminate** — call `FINAL` (or `FINAL_VAR`) as soon as you have enough
   to answer. You may also write `FINAL(...)` directly in your prose
   outside a code block; it is recognized the same way.

## Constraints

- Blocked modules and builtins will cause a block to fail with an error
  printed to you; adjust and try again rather than looking for a bypass.
- Each block has a wall-clock execution limit. Long-running work should be
  delegated to a sub-call, not looped locally.
- You operate inside token, iteration, and depth budgets. Budget warnings
  are injected into your prompt as you approach a ceiling — treat the
  last-turn warning as a hard deadline to produce a final answer.

Do not narrate what you are about to do at length. Write the code,
observe the result, and move toward `FINAL`."#;

/// Appended verbatim ahead of the last iteration allowed before the turn's
/// iteration ceiling is hit (§4.F "inject a final-turn warning").
pub const LAST_TURN_WARNING: &str = "\n\n## Final turn\n\nThis is your last iteration before the turn's iteration budget is exhausted. You must call FINAL or FINAL_VAR now, even with a partial answer.";

/// Prefix for the summarized-history message inserted by compaction
/// (§4.F, Design Note "compaction").
pub const COMPACTION_NOTICE: &str = "The earlier portion of this turn's history has been summarized to stay within budget. The summary below replaces it; your original task and the most recent iterations are preserved in full.";

/// Default answer for a turn that reaches `Exhausted` by hitting the
/// iteration cap without a final answer (§4.F, §7).
pub const DEFAULT_EXHAUSTION_MESSAGE: &str =
    "No final answer was reached before the turn's iteration budget was exhausted.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_behavior_documents_repl_surface() {
        assert!(CORE_RLM_BEHAVIOR.contains("```repl```"));
        assert!(CORE_RLM_BEHAVIOR.contains("llm_query"));
        assert!(CORE_RLM_BEHAVIOR.contains("llm_query_batched"));
        assert!(CORE_RLM_BEHAVIOR.contains("FINAL"));
        assert!(CORE_RLM_BEHAVIOR.contains("FINAL_VAR"));
    }

    #[test]
    fn last_turn_warning_names_the_ceiling() {
        assert!(LAST_TURN_WARNING.contains("iteration budget"));
    }
}
