use super::helpers::{DATABASE_SOURCE, SAFE_DATA_SOURCE};
use crate::errors::Result;
use crate::gate::CapabilityGate;
use crate::guard::python_guard_source;
use crate::policy::Policy;
use crate::request::RESULT_BINDING;
use serde_json::{Map, Value};

/// Exit codes the host uses when it reports on its own.
pub const EXIT_RUNTIME_ERROR: i32 = 1;
pub const EXIT_CAPABILITY_DENIED: i32 = 3;
pub const EXIT_DATA_WRITE_REJECTED: i32 = 4;
pub const EXIT_MEMORY_EXCEEDED: i32 = 5;

const PREAMBLE: &str = r#"import builtins as _builtins
import io as _io
import json as _json
import math as _math
import os as _os
import re as _re
import sys as _sys
"#;

const SQLITE_IMPORT: &str = r#"try:
    import sqlite3 as _sqlite3
except ImportError:
    _sqlite3 = None
"#;

// Host name encoding is imported lazily from C, with no caller globals.
const SOCKET_IMPORT: &str = r#"try:
    import socket as _socket
    import encodings.idna
except ImportError:
    _socket = None
"#;

const MAIN_HEAD: &str = r#"

def _sandbox_main():
    real_stdout = _sys.stdout
    real_stderr = _sys.stderr
    real_exit = _os._exit
    captured_out = _io.StringIO()
    captured_err = _io.StringIO()
    namespace = {}
"#;

const EMIT: &str = r#"
    def emit(doc, code):
        _sys.stdout = real_stdout
        _sys.stderr = real_stderr
        doc["stdout"] = captured_out.getvalue()[:output_cap]
        doc["stderr"] = captured_err.getvalue()[:output_cap]
        try:
            payload = _json.dumps(doc)
        except Exception as exc:
            payload = _json.dumps({"status": "non_serializable_result", "error": "report: %s" % exc})
        real_stdout.write(payload)
        real_stdout.flush()
        real_exit(code)

    def deny_capability(root):
        emit({
            "status": "capability_denied",
            "capability": root,
            "error": "capability '%s' is not permitted by policy '%s'" % (root, policy_name),
        }, 3)

    def deny_operation(event):
        emit({
            "status": "capability_denied",
            "capability": event,
            "error": "operation '%s' is not permitted by policy '%s'" % (event, policy_name),
        }, 3)

    def describe_error(exc):
        try:
            message = "%s: %s" % (type(exc).__name__, exc)
        except Exception:
            message = type(exc).__name__
        line = None
        tb = exc.__traceback__
        while tb is not None:
            if tb.tb_frame.f_code.co_filename == "<sandbox>":
                line = tb.tb_lineno
            tb = tb.tb_next
        if line is None and isinstance(exc, SyntaxError):
            line = exc.lineno
        if line is not None:
            message += " (line %s)" % line
        return message
"#;

const RUN: &str = r#"
    try:
        code = compile(source, "<sandbox>", "exec")
    except SyntaxError as exc:
        emit({"status": "runtime_error", "error": describe_error(exc)}, 1)

    install_audit_hook(code)
    _sys.stdout = captured_out
    _sys.stderr = captured_err
    gate_active[0] = True
    try:
        exec(code, namespace)
    except MemoryError:
        gate_active[0] = False
        emit({"status": "memory_exceeded", "error": "MemoryError"}, 5)
    except BaseException as exc:
        gate_active[0] = False
        emit({"status": "runtime_error", "error": describe_error(exc)}, 1)
    gate_active[0] = False
    _sys.stdout = real_stdout
    _sys.stderr = real_stderr

    if result_binding not in namespace:
        emit({
            "status": "missing_result_binding",
            "error": "code did not assign '%s'" % result_binding,
        }, 0)
    try:
        encoded = _json.dumps(namespace[result_binding], allow_nan=False, default=to_json)
    except (TypeError, ValueError, OverflowError, RecursionError) as exc:
        emit({"status": "non_serializable_result", "error": "%s: %s" % (type(exc).__name__, exc)}, 0)
    emit({"status": "ok", "result": _json.loads(encoded)}, 0)


_sandbox_main()
"#;

/// Generated Python program that runs one request inside the execution host.
///
/// Layout: module preamble, then one `_sandbox_main` function holding the
/// report writer, the capability gate, the data helpers and finally the
/// caller's code, compiled under the file name `<sandbox>` and executed in
/// its own namespace.
pub struct HostScript<'a> {
    policy: &'a Policy,
    source: &'a str,
    context: &'a Map<String, Value>,
}

impl<'a> HostScript<'a> {
    pub fn new(policy: &'a Policy, source: &'a str, context: &'a Map<String, Value>) -> Self {
        Self {
            policy,
            source,
            context,
        }
    }

    pub fn render(&self) -> Result<String> {
        let database = self.policy.database_access();
        let network = self.policy.allow_network();

        let mut script = String::with_capacity(16 * 1024 + self.source.len());
        script.push_str(PREAMBLE);
        if database {
            script.push_str(SQLITE_IMPORT);
        }
        if network {
            script.push_str(SOCKET_IMPORT);
        }

        script.push_str(MAIN_HEAD);
        script.push_str(&format!(
            "    output_cap = {}\n",
            self.policy.max_output_bytes()
        ));
        script.push_str(&format!(
            "    policy_name = {}\n",
            python_str(self.policy.name())?
        ));
        script.push_str(&format!(
            "    result_binding = {}\n",
            python_str(RESULT_BINDING)?
        ));
        script.push_str(EMIT);
        script.push('\n');
        script.push_str(&CapabilityGate::new(self.policy).python_source());
        script.push_str(SAFE_DATA_SOURCE);
        if database {
            script.push_str(&python_guard_source());
            script.push_str(DATABASE_SOURCE);
        }

        // Context crosses as a JSON document inside a string literal.
        let context_json = serde_json::to_string(&Value::Object(self.context.clone()))?;
        script.push('\n');
        script.push_str(&format!(
            "    namespace.update(_json.loads({}))\n",
            python_str(&context_json)?
        ));
        script.push_str("    namespace[\"__builtins__\"] = safe_builtins\n");
        script.push_str("    namespace[\"__name__\"] = \"__sandbox__\"\n");
        script.push_str("    namespace[\"SafeArray\"] = SafeArray\n");
        script.push_str("    namespace[\"SafeTable\"] = SafeTable\n");
        if database {
            script.push_str("    namespace[\"read_only_connect\"] = read_only_connect\n");
        }
        script.push_str(&format!("    source = {}\n", python_str(self.source)?));
        script.push_str(RUN);
        Ok(script)
    }
}

/// A JSON string literal is also a valid Python string literal.
fn python_str(value: &str) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}
