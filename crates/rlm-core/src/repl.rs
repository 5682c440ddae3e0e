//! REPL environment (§4.C): a persistent Python namespace exposing
//! `llm_query`, `llm_query_batched`, `FINAL`, `FINAL_VAR`, and the bound
//! `context` value.
//!
//! The REPL never owns the router; it holds a one-way capability (a
//! [`SubCallDispatcher`]) handed to it at `setup`, per the "reference cycles
//! between engine and environment" design note — this avoids mutual
//! ownership between the engine and its execution environment.

use std::ffi::CStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::{PyCFunction, PyDict, PyModule, PyTuple};

use crate::error::{Result, RlmError};
use crate::router::SubCallDispatcher;
use crate::sandbox::{SandboxTier, Validator};
use crate::types::{LMRequest, LMResponse, ModelPreferences, ReplResult};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Embedded helper that executes a validated code fragment inside a
/// persistent namespace, capturing stdout/stderr and turning any unhandled
/// exception into `error = true` with the traceback in stderr.
const EXEC_SHIM_SRC: &CStr = cr#"
import contextlib
import io
import traceback


def exec_in_namespace(code, namespace):
    out = io.StringIO()
    err = io.StringIO()
    error = False
    try:
        compiled = compile(code, "<repl>", "exec")
        with contextlib.redirect_stdout(out), contextlib.redirect_stderr(err):
            exec(compiled, namespace)
    except BaseException:
        error = True
        err.write(traceback.format_exc())
    return out.getvalue(), err.getvalue(), error
"#;

/// Pending final-answer slot, set by `FINAL`/`FINAL_VAR` and consumed after
/// each `execute()` call.
#[derive(Default)]
struct PendingFinal(Mutex<Option<String>>);

impl PendingFinal {
    fn set(&self, value: String) {
        *self.0.lock().expect("pending-final lock poisoned") = Some(value);
    }

    fn take(&self) -> Option<String> {
        self.0.lock().expect("pending-final lock poisoned").take()
    }
}

/// Aggregated sub-call usage collected by `llm_query`/`llm_query_batched`
/// during a single `execute()` call.
#[derive(Default)]
struct SubCallLedger(Mutex<Vec<(String, crate::types::Usage)>>);

impl SubCallLedger {
    fn record(&self, model: String, usage: crate::types::Usage) {
        self.0.lock().expect("ledger lock poisoned").push((model, usage));
    }

    fn drain(&self) -> Vec<(String, crate::types::Usage)> {
        std::mem::take(&mut *self.0.lock().expect("ledger lock poisoned"))
    }
}

/// Owns a persistent Python namespace across `execute()` calls within a turn.
pub struct ReplEnvironment {
    namespace: Py<PyDict>,
    dispatcher: Arc<dyn SubCallDispatcher>,
    scope_id: String,
    depth: u32,
    timeout: Duration,
    pending_final: Arc<PendingFinal>,
    ledger: Arc<SubCallLedger>,
}

impl ReplEnvironment {
    /// `setup(context_value)`: seeds the namespace with `context`, the four
    /// helper callables, and (later, via [`ReplEnvironment::register_tool`])
    /// any custom-tool closures.
    pub fn setup(
        context_json: serde_json::Value,
        dispatcher: Arc<dyn SubCallDispatcher>,
        scope_id: impl Into<String>,
        depth: u32,
    ) -> Result<Self> {
        let scope_id = scope_id.into();
        let pending_final = Arc::new(PendingFinal::default());
        let ledger = Arc::new(SubCallLedger::default());

        let namespace: Py<PyDict> = Python::with_gil(|py| -> PyResult<Py<PyDict>> {
            let ns = PyDict::new(py);
            let context_py = json_to_py(py, &context_json)?;
            ns.set_item("context", context_py)?;
            bind_helpers(py, &ns, dispatcher.clone(), &scope_id, depth, &pending_final, &ledger)?;
            Ok(ns.unbind())
        })
        .map_err(|e| RlmError::Internal(format!("repl setup failed: {e}")))?;

        Ok(Self {
            namespace,
            dispatcher,
            scope_id,
            depth,
            timeout: DEFAULT_TIMEOUT,
            pending_final,
            ledger,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Inject an additional callable ("registered custom tool") into the
    /// namespace. Any name not among the four helpers and `context` is
    /// either written by the code itself or came from here (§3 invariant).
    pub fn register_tool(&mut self, name: &str, callable: Py<PyAny>) -> Result<()> {
        Python::with_gil(|py| {
            self.namespace
                .bind(py)
                .set_item(name, callable)
                .map_err(|e| RlmError::Internal(format!("failed to register tool: {e}")))
        })
    }

    /// `execute(code)`: validates, executes under the REPL sandbox tier,
    /// returns a [`ReplResult`]. After execution, consumes any pending final
    /// answer set via `FINAL`/`FINAL_VAR`.
    pub async fn execute(&self, code: &str) -> Result<(ReplResult, Option<String>)> {
        let validator = Validator::new(SandboxTier::Repl);
        if let Err(e) = validator.validate(code) {
            return Ok((ReplResult::failed(e.to_string()), None));
        }

        let namespace = self.namespace.clone();
        let code = code.to_string();
        let timeout = self.timeout;

        let exec_future = tokio::task::spawn_blocking(move || run_in_namespace(namespace, &code));

        let outcome = match tokio::time::timeout(timeout, exec_future).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => ReplResult::failed(format!("execution error: {e}")),
            Ok(Err(join_err)) => ReplResult::failed(format!("execution panicked: {join_err}")),
            Err(_) => ReplResult::failed(format!(
                "execution timed out after {timeout:?} (ExecutionTimeout)"
            )),
        };

        let mut result = outcome;
        for (model, usage) in self.ledger.drain() {
            result.record_sub_call(&model, usage);
        }

        let final_answer = self.pending_final.take();
        Ok((result, final_answer))
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }
}

fn run_in_namespace(namespace: Py<PyDict>, code: &str) -> PyResult<ReplResult> {
    Python::with_gil(|py| {
        let shim = PyModule::from_code(py, EXEC_SHIM_SRC, c"rlm_repl_exec.py", c"rlm_repl_exec")?;
        let ns = namespace.bind(py);
        let output = shim.getattr("exec_in_namespace")?.call1((code, ns))?;
        let tuple = output.downcast::<PyTuple>()?;
        let stdout: String = tuple.get_item(0)?.extract()?;
        let stderr: String = tuple.get_item(1)?.extract()?;
        let error: bool = tuple.get_item(2)?.extract()?;
        Ok(ReplResult {
            stdout,
            stderr,
            error,
            sub_call_usage: Default::default(),
        })
    })
}

#[allow(clippy::too_many_arguments)]
fn bind_helpers(
    py: Python<'_>,
    ns: &Bound<'_, PyDict>,
    dispatcher: Arc<dyn SubCallDispatcher>,
    scope_id: &str,
    depth: u32,
    pending_final: &Arc<PendingFinal>,
    ledger: &Arc<SubCallLedger>,
) -> PyResult<()> {
    {
        let dispatcher = dispatcher.clone();
        let scope_id = scope_id.to_string();
        let ledger = ledger.clone();
        let llm_query = PyCFunction::new_closure(
            py,
            Some(c"llm_query"),
            Some(c"llm_query(prompt, *, model=None) -> str"),
            move |args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<String> {
                let prompt: String = args.get_item(0)?.extract()?;
                let model = extract_model_kwarg(kwargs)?;
                call_llm_query(&dispatcher, &scope_id, depth, prompt, model, &ledger)
            },
        )?;
        ns.set_item("llm_query", llm_query)?;
    }

    {
        let dispatcher = dispatcher.clone();
        let scope_id = scope_id.to_string();
        let ledger = ledger.clone();
        let llm_query_batched = PyCFunction::new_closure(
            py,
            Some(c"llm_query_batched"),
            Some(c"llm_query_batched(prompts, *, model=None) -> list[str]"),
            move |args: &Bound<'_, PyTuple>, kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<Vec<String>> {
                let prompts: Vec<String> = args.get_item(0)?.extract()?;
                let model = extract_model_kwarg(kwargs)?;
                call_llm_query_batched(&dispatcher, &scope_id, depth, prompts, model, &ledger)
            },
        )?;
        ns.set_item("llm_query_batched", llm_query_batched)?;
    }

    {
        let pending_final = pending_final.clone();
        let final_fn = PyCFunction::new_closure(
            py,
            Some(c"FINAL"),
            Some(c"FINAL(value) -> value"),
            move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<PyObject> {
                let value = args.get_item(0)?;
                let stringified: String = value.str()?.extract()?;
                pending_final.set(stringified);
                Ok(value.unbind())
            },
        )?;
        ns.set_item("FINAL", final_fn)?;
    }

    {
        let pending_final = pending_final.clone();
        let namespace_handle: Py<PyDict> = ns.clone().unbind();
        let final_var_fn = PyCFunction::new_closure(
            py,
            Some(c"FINAL_VAR"),
            Some(c"FINAL_VAR(name) -> str"),
            move |args: &Bound<'_, PyTuple>, _kwargs: Option<&Bound<'_, PyDict>>| -> PyResult<String> {
                let py = args.py();
                let name: String = args.get_item(0)?.extract()?;
                let namespace = namespace_handle.bind(py);
                match namespace.get_item(name.as_str()) {
                    Ok(Some(value)) => {
                        let stringified: String = value.str()?.extract()?;
                        pending_final.set(stringified.clone());
                        Ok(stringified)
                    }
                    _ => Ok(format!(
                        "FINAL_VAR: no variable named '{name}' is bound yet -- assign it first"
                    )),
                }
            },
        )?;
        ns.set_item("FINAL_VAR", final_var_fn)?;
    }

    Ok(())
}

fn extract_model_kwarg(kwargs: Option<&Bound<'_, PyDict>>) -> PyResult<Option<String>> {
    match kwargs.and_then(|k| k.get_item("model").ok().flatten()) {
        Some(value) if !value.is_none() => Ok(Some(value.extract()?)),
        _ => Ok(None),
    }
}

fn call_llm_query(
    dispatcher: &Arc<dyn SubCallDispatcher>,
    scope_id: &str,
    depth: u32,
    prompt: String,
    model: Option<String>,
    ledger: &Arc<SubCallLedger>,
) -> PyResult<String> {
    let mut request = LMRequest::single(prompt, scope_id, depth + 1);
    if let Some(model) = model {
        request = request.with_preferences(ModelPreferences::exact(model));
    }
    let response = block_on_dispatch(dispatcher, request)
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
    match response {
        LMResponse::Single { chat_completion } => {
            ledger.record(chat_completion.model_name.clone(), chat_completion.usage);
            Ok(chat_completion.text)
        }
        LMResponse::Batched { chat_completions } => Ok(chat_completions
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("\n")),
        LMResponse::Error { message } => Err(PyRuntimeError::new_err(message)),
    }
}

fn call_llm_query_batched(
    dispatcher: &Arc<dyn SubCallDispatcher>,
    scope_id: &str,
    depth: u32,
    prompts: Vec<String>,
    model: Option<String>,
    ledger: &Arc<SubCallLedger>,
) -> PyResult<Vec<String>> {
    let mut request = LMRequest::batched(prompts.clone(), scope_id, depth + 1);
    if let Some(model) = model {
        request = request.with_preferences(ModelPreferences::exact(model));
    }
    let response = block_on_dispatch(dispatcher, request)
        .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
    match response {
        LMResponse::Batched { chat_completions } => {
            let mut results = Vec::with_capacity(prompts.len());
            for (i, _) in prompts.iter().enumerate() {
                match chat_completions.get(i) {
                    Some(completion) => {
                        ledger.record(completion.model_name.clone(), completion.usage);
                        results.push(completion.text.clone());
                    }
                    // Missing entries become explanatory error strings
                    // in-place rather than raising (§4.C).
                    None => results.push(format!("llm_query_batched: missing result for prompt {i}")),
                }
            }
            Ok(results)
        }
        LMResponse::Single { chat_completion } => {
            ledger.record(chat_completion.model_name.clone(), chat_completion.usage);
            Ok(vec![chat_completion.text])
        }
        LMResponse::Error { message } => Ok(prompts
            .iter()
            .map(|_| format!("llm_query_batched: {message}"))
            .collect()),
    }
}

fn block_on_dispatch(
    dispatcher: &Arc<dyn SubCallDispatcher>,
    request: LMRequest,
) -> Result<LMResponse> {
    let dispatcher = dispatcher.clone();
    tokio::task::block_in_place(|| {
        tokio::runtime::Handle::current().block_on(dispatcher.dispatch(request))
    })
}

fn json_to_py(py: Python<'_>, value: &serde_json::Value) -> PyResult<PyObject> {
    use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyString};
    Ok(match value {
        serde_json::Value::Null => py.None(),
        serde_json::Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any().unbind(),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_pyobject(py)?.into_any().unbind()
            } else {
                PyFloat::new(py, n.as_f64().unwrap_or_default())
                    .into_any()
                    .unbind()
            }
        }
        serde_json::Value::String(s) => PyString::new(py, s).into_any().unbind(),
        serde_json::Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            list.into_any().unbind()
        }
        serde_json::Value::Object(map) => {
            let dict = PyDict::new(py);
            for (k, v) in map {
                dict.set_item(k, json_to_py(py, v)?)?;
            }
            dict.into_any().unbind()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MockDispatcher;

    fn dispatcher(responses: Vec<LMResponse>) -> Arc<dyn SubCallDispatcher> {
        Arc::new(MockDispatcher::new(responses))
    }

    #[tokio::test]
    async fn final_callable_stows_pending_answer() {
        let env = ReplEnvironment::setup(serde_json::json!({}), dispatcher(vec![]), "turn-1", 0)
            .unwrap();
        let (result, final_answer) = env.execute("FINAL('42')").await.unwrap();
        assert!(!result.error);
        assert_eq!(final_answer, Some("42".to_string()));
    }

    #[tokio::test]
    async fn sandbox_rejection_surfaces_as_repl_error() {
        let env = ReplEnvironment::setup(serde_json::json!({}), dispatcher(vec![]), "turn-1", 0)
            .unwrap();
        let (result, final_answer) = env.execute("import os").await.unwrap();
        assert!(result.error);
        assert!(result.stderr.contains("blocked module"));
        assert!(final_answer.is_none());
    }

    #[tokio::test]
    async fn llm_query_returns_mocked_completion_and_records_usage() {
        let responses = vec![LMResponse::single(crate::types::ChatCompletion::new(
            "otter",
            crate::types::Usage::new(3, 1),
            "mock-model",
        ))];
        let env = ReplEnvironment::setup(
            serde_json::json!({}),
            dispatcher(responses),
            "turn-1",
            0,
        )
        .unwrap();
        let (result, final_answer) = env
            .execute("x = llm_query('name an animal')\nFINAL(x)")
            .await
            .unwrap();
        assert!(!result.error);
        assert_eq!(final_answer, Some("otter".to_string()));
        assert_eq!(result.sub_call_usage["mock-model"].total(), 4);
    }

    #[tokio::test]
    async fn namespace_persists_across_executions() {
        let env = ReplEnvironment::setup(serde_json::json!({}), dispatcher(vec![]), "turn-1", 0)
            .unwrap();
        env.execute("x = 41").await.unwrap();
        let (result, _) = env.execute("print(x + 1)").await.unwrap();
        assert_eq!(result.stdout.trim(), "42");
    }
}
