//! Two-tier sandbox (§4.B): AST validation plus runtime module stubbing.
//!
//! Validation is driven through Python's own `ast` module via `pyo3` rather
//! than a hand-rolled Rust grammar — the validator must reason about
//! `ast.Constant` nodes exactly the way CPython's compiler does, which is a
//! property of the reference implementation, not something worth
//! reimplementing natively.

use std::ffi::CStr;
use std::sync::OnceLock;

use pyo3::prelude::*;
use pyo3::types::{PyList, PyModule};

use crate::error::{Result, RlmError};

/// Which caller the sandbox is validating for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxTier {
    /// Arbitrary user code invoked from the retrieval gateway.
    Strict,
    /// The recursion engine's executor.
    Repl,
}

/// Modules no fragment may import, in either tier.
pub const BLOCKED_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "socket",
    "shutil",
    "ctypes",
    "sys",
    "signal",
    "threading",
    "multiprocessing",
    "pickle",
];

/// Builtins blocked in both tiers.
const COMMON_BLOCKED_BUILTINS: &[&str] = &["eval", "exec", "compile", "input", "globals", "locals"];

/// Additional builtins blocked only in strict mode.
const STRICT_ONLY_BUILTINS: &[&str] = &["__import__", "open"];

impl SandboxTier {
    fn blocked_builtins(&self) -> Vec<&'static str> {
        let mut blocked = COMMON_BLOCKED_BUILTINS.to_vec();
        if *self == SandboxTier::Strict {
            blocked.extend_from_slice(STRICT_ONLY_BUILTINS);
        }
        blocked
    }
}

/// Embedded Python AST walker. See module docs for why this lives in Python
/// rather than Rust.
const VALIDATOR_SRC: &CStr = cr#"
import ast

_BLOCKED_MODULES = {
    "os", "subprocess", "socket", "shutil", "ctypes",
    "sys", "signal", "threading", "multiprocessing", "pickle",
}


def _root_name(node):
    while isinstance(node, ast.Attribute):
        node = node.value
    if isinstance(node, ast.Name):
        return node.id
    return None


class _Visitor(ast.NodeVisitor):
    def __init__(self, blocked_builtins):
        self.blocked_builtins = set(blocked_builtins)
        self.violations = []

    def visit_Import(self, node):
        for alias in node.names:
            root = alias.name.split(".")[0]
            if root in _BLOCKED_MODULES:
                self.violations.append(f"import of blocked module '{root}'")
        self.generic_visit(node)

    def visit_ImportFrom(self, node):
        if node.module is not None:
            root = node.module.split(".")[0]
            if root in _BLOCKED_MODULES:
                self.violations.append(f"import of blocked module '{root}'")
        self.generic_visit(node)

    def visit_Call(self, node):
        func = node.func
        name = None
        if isinstance(func, ast.Name):
            name = func.id
        elif isinstance(func, ast.Attribute):
            name = func.attr

        if name in self.blocked_builtins:
            self.violations.append(f"call to blocked builtin '{name}'")

        if name == "__import__" and node.args:
            first = node.args[0]
            if isinstance(first, ast.Constant) and isinstance(first.value, str):
                if first.value.split(".")[0] in _BLOCKED_MODULES:
                    self.violations.append(
                        f"__import__ of blocked module '{first.value}'"
                    )

        if name == "getattr" and node.args:
            if _root_name(node.args[0]) == "__builtins__":
                self.violations.append("getattr bypass via __builtins__")

        self.generic_visit(node)

    def visit_Attribute(self, node):
        if node.attr == "__builtins__" or _root_name(node) == "__builtins__":
            self.violations.append("attribute traversal into __builtins__")
        self.generic_visit(node)


def validate(code, blocked_builtins):
    try:
        tree = ast.parse(code)
    except SyntaxError as exc:
        return [f"syntax error: {exc}"]
    visitor = _Visitor(blocked_builtins)
    visitor.visit(tree)
    return visitor.violations
"#;

/// Embedded Python runtime-stub installer. Covers dynamic/indirect access
/// that the static AST pass cannot see (a constructed module name, an
/// already-bound alias).
const RUNTIME_STUB_SRC: &CStr = cr#"
import sys


class _BlockedModule:
    def __init__(self, name):
        object.__setattr__(self, "_name", name)

    def __getattr__(self, attr):
        raise RuntimeError(
            f"module '{object.__getattribute__(self, '_name')}' is not permitted in this sandbox"
        )


def install_stubs(blocked_modules):
    for name in blocked_modules:
        sys.modules[name] = _BlockedModule(name)
"#;

fn validator_module(py: Python<'_>) -> PyResult<Bound<'_, PyModule>> {
    PyModule::from_code(py, VALIDATOR_SRC, c"rlm_sandbox_validator.py", c"rlm_sandbox_validator")
}

fn runtime_stub_module(py: Python<'_>) -> PyResult<Bound<'_, PyModule>> {
    PyModule::from_code(py, RUNTIME_STUB_SRC, c"rlm_sandbox_runtime.py", c"rlm_sandbox_runtime")
}

/// Validates and (for the REPL tier) installs runtime module stubs ahead of
/// execution.
pub struct Validator {
    tier: SandboxTier,
}

impl Validator {
    pub fn new(tier: SandboxTier) -> Self {
        Self { tier }
    }

    /// Syntactic pass (§4.B.1): reject blocked imports, blocked builtin
    /// calls, and known bypass patterns.
    pub fn validate(&self, code: &str) -> Result<()> {
        Python::with_gil(|py| {
            let module = validator_module(py)
                .map_err(|e| RlmError::Internal(format!("validator init failed: {e}")))?;
            let blocked = self.tier.blocked_builtins();
            let result = module
                .getattr("validate")
                .and_then(|f| f.call1((code, blocked)))
                .map_err(|e| RlmError::Internal(format!("validator invocation failed: {e}")))?;
            let violations: Vec<String> = result
                .downcast::<PyList>()
                .map_err(|e| RlmError::Internal(format!("unexpected validator output: {e}")))?
                .iter()
                .map(|v| v.to_string())
                .collect();
            if violations.is_empty() {
                Ok(())
            } else {
                Err(RlmError::ValidatorRejection(violations.join("; ")))
            }
        })
    }

    /// Runtime pass (§4.B.2): replace dangerous modules in the imported
    /// module table with stubs that raise on any attribute access.
    pub fn install_runtime_stubs(&self, py: Python<'_>) -> Result<()> {
        let module = runtime_stub_module(py)
            .map_err(|e| RlmError::Internal(format!("runtime stub init failed: {e}")))?;
        module
            .getattr("install_stubs")
            .and_then(|f| f.call1((BLOCKED_MODULES.to_vec(),)))
            .map_err(|e| RlmError::Internal(format!("runtime stub install failed: {e}")))?;
        Ok(())
    }
}

fn shared_validator(tier: SandboxTier) -> &'static Validator {
    static STRICT: OnceLock<Validator> = OnceLock::new();
    static REPL: OnceLock<Validator> = OnceLock::new();
    match tier {
        SandboxTier::Strict => STRICT.get_or_init(|| Validator::new(SandboxTier::Strict)),
        SandboxTier::Repl => REPL.get_or_init(|| Validator::new(SandboxTier::Repl)),
    }
}

/// Convenience entry point using a process-wide cached validator per tier.
pub fn validate(tier: SandboxTier, code: &str) -> Result<()> {
    shared_validator(tier).validate(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_rejects_open() {
        let err = validate(SandboxTier::Strict, "open('/etc/passwd')").unwrap_err();
        assert!(matches!(err, RlmError::ValidatorRejection(_)));
    }

    #[test]
    fn repl_permits_open_and_import() {
        assert!(validate(SandboxTier::Repl, "import json\nopen('x')").is_ok());
    }

    #[test]
    fn both_tiers_reject_os_import() {
        assert!(validate(SandboxTier::Strict, "import os").is_err());
        assert!(validate(SandboxTier::Repl, "import os").is_err());
    }

    #[test]
    fn rejects_import_from_blocked_module() {
        assert!(validate(SandboxTier::Repl, "from subprocess import run").is_err());
    }

    #[test]
    fn rejects_dynamic_import_of_blocked_module() {
        assert!(validate(SandboxTier::Repl, "__import__('os')").is_err());
    }

    #[test]
    fn rejects_builtins_bypass() {
        assert!(validate(SandboxTier::Repl, "getattr(__builtins__, 'eval')").is_err());
        assert!(validate(SandboxTier::Repl, "x = __builtins__.eval").is_err());
    }

    #[test]
    fn validator_is_idempotent() {
        let code = "import os\neval('1')";
        let first = validate(SandboxTier::Strict, code);
        let second = validate(SandboxTier::Strict, code);
        assert_eq!(first.is_err(), second.is_err());
    }

    #[test]
    fn ordinary_code_passes() {
        assert!(validate(SandboxTier::Repl, "x = 1 + 1\nprint(x)").is_ok());
    }
}
