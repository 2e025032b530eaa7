//! Capability Gate.
//!
//! The gate runs inside the execution host. It replaces the interpreter's
//! import hook before caller code exists and consults the policy's
//! allow-lists on every resolution:
//!
//! - imports issued from the caller's scope must name an allowed capability;
//! - imports issued from inside an already-loaded module may also name one of
//!   the policy's internal capabilities;
//! - relative imports resolve inside an already-permitted package.
//!
//! A miss ends the execution on the spot with `capability_denied`; the caller
//! cannot intercept it. [`CapabilityGate::check`] is the same decision on the
//! engine side.

use crate::policy::{root_capability, Policy};
use std::collections::BTreeSet;

/// Builtins removed from the caller's scope.
pub const REMOVED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "open",
    "input",
    "breakpoint",
    "exit",
    "quit",
    "help",
    "globals",
    "locals",
    "vars",
    "memoryview",
    "copyright",
    "credits",
    "license",
    "__loader__",
    "__spec__",
];

/// Where an import request originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportOrigin {
    /// The caller's code.
    CallerScope,
    /// Code of a module that is already loaded.
    LoadedModule,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied { capability: String },
}

pub struct CapabilityGate<'a> {
    policy: &'a Policy,
}

impl<'a> CapabilityGate<'a> {
    pub fn new(policy: &'a Policy) -> Self {
        Self { policy }
    }

    pub fn check(&self, module: &str, origin: ImportOrigin) -> GateDecision {
        let allowed = match origin {
            ImportOrigin::CallerScope => self.policy.allows(module),
            ImportOrigin::LoadedModule => self.policy.allows_transitively(module),
        };
        if allowed {
            GateDecision::Allowed
        } else {
            GateDecision::Denied {
                capability: root_capability(module).to_string(),
            }
        }
    }

    /// Python source installing the gate, indented for the host's main
    /// function body.
    ///
    /// Expects `namespace`, `deny_capability`, `deny_operation`, `real_exit`
    /// and `_builtins` in scope and defines `gate_active`, `safe_builtins` and
    /// `install_audit_hook`.
    ///
    /// The import hook only sees imports. Everything that reaches the
    /// operating system through an attribute of an allowed module goes through
    /// the audit hook instead, which is armed by the `exec` of the caller's
    /// code and stays armed until the process exits. Outside that, file opens
    /// must be read-only below an import root or the workspace, directory
    /// listings must stay below those roots, and sockets only connect to the
    /// policy's targets (or addresses those targets resolved to).
    pub fn python_source(&self) -> String {
        let mut src = String::new();
        src.push_str(&format!(
            "    allowed_capabilities = {}\n",
            python_frozenset(self.policy.allowed_capabilities())
        ));
        src.push_str(&format!(
            "    internal_capabilities = {}\n",
            python_frozenset(self.policy.internal_capabilities())
        ));
        src.push_str(&format!(
            "    removed_builtins = {}\n",
            python_frozenset(REMOVED_BUILTINS.iter().copied())
        ));
        src.push_str(GATE_BODY);
        if self.policy.allow_network() {
            src.push_str(&format!(
                "    audit_network_targets = {}\n",
                python_frozenset(self.policy.allowed_network_targets())
            ));
            src.push_str("    audit_resolver = _socket.getaddrinfo if _socket is not None else None\n");
        } else {
            src.push_str("    audit_network_targets = None\n");
            src.push_str("    audit_resolver = None\n");
        }
        src.push_str(AUDIT_BODY);
        src
    }
}

const GATE_BODY: &str = r#"    original_import = _builtins.__import__
    loaded_modules = _sys.modules
    gate_active = [False]

    def capability_gate(name, globals=None, locals=None, fromlist=(), level=0):
        if gate_active[0] and level == 0:
            root = name.partition(".")[0]
            # Codec lookup re-imports loaded modules without globals
            from_caller = globals is namespace or (globals is None and name not in loaded_modules)
            if root not in allowed_capabilities:
                if from_caller or root not in internal_capabilities:
                    deny_capability(root)
        return original_import(name, globals, locals, fromlist, level)

    _builtins.__import__ = capability_gate
    safe_builtins = {
        key: value
        for key, value in vars(_builtins).items()
        if key not in removed_builtins
    }
    safe_builtins["__import__"] = capability_gate
"#;

const AUDIT_BODY: &str = r#"
    audit_denied_prefixes = (
        "os.", "subprocess.", "shutil.", "pty.", "gc.", "signal.", "resource.",
        "tempfile.", "glob.", "webbrowser.", "ctypes.", "fcntl.", "syslog.",
        "_winapi.", "winreg.", "msvcrt.",
    )
    audit_denied_events = frozenset({
        "sys.addaudithook", "code.__new__", "socket.bind", "socket.sethostname",
        "sqlite3.enable_load_extension", "sqlite3.load_extension",
    })
    audit_tolerated_events = frozenset({"ctypes.dlopen", "ctypes.dlsym", "ctypes.dlsym/handle"})
    audit_target_events = frozenset({"socket.connect", "socket.sendto", "socket.sendmsg"})

    def install_audit_hook(caller_code):
        kind = type
        text = str
        raw = bytes
        number = int
        size = len
        failure = Exception
        not_permitted = PermissionError
        hard_exit = real_exit
        workdir = _os.getcwd()
        write_flags = _os.O_WRONLY | _os.O_RDWR | _os.O_CREAT | _os.O_TRUNC | _os.O_APPEND
        read_roots = tuple(
            entry.rstrip("/") + "/"
            for entry in _sys.path + [workdir]
            if kind(entry) is text and entry.startswith("/")
        )
        denied_prefixes = audit_denied_prefixes
        denied_events = audit_denied_events
        tolerated_events = audit_tolerated_events
        target_events = audit_target_events
        targets = audit_network_targets
        resolver = audit_resolver
        armed = [False]
        resolving = [False]
        resolved = set()

        def deny(event):
            deny_operation(event)
            hard_exit(3)

        def readable(path):
            if kind(path) is raw:
                path = path.decode("utf-8", "surrogateescape")
            if kind(path) is not text or "\x00" in path:
                return False
            if not path.startswith("/"):
                path = workdir + "/" + path
            parts = []
            for part in path.split("/"):
                if part == "..":
                    if parts:
                        parts.pop()
                elif part and part != ".":
                    parts.append(part)
            return ("/" + "/".join(parts) + "/").startswith(read_roots)

        def target_of(address):
            if kind(address) is not tuple or size(address) < 2:
                return None
            host, port = address[0], address[1]
            if kind(port) is text and port.isdigit():
                port = number(port)
            if kind(host) is not text or kind(port) is not number:
                return None
            return "%s:%d" % (host.strip().lower().rstrip("."), port)

        def remember_resolution(host, port):
            target = target_of((host, port))
            if resolving[0] or target is None or target not in targets:
                return
            resolving[0] = True
            try:
                for info in resolver(host, port):
                    address = target_of(info[4][:2])
                    if address is not None:
                        resolved.add(address)
            except failure:
                pass
            finally:
                resolving[0] = False

        def audit_hook(event, args):
            if not armed[0]:
                if event == "exec" and args and args[0] is caller_code:
                    armed[0] = True
                return
            if event == "open":
                path, mode, flags = args[0], args[1], args[2]
                if kind(flags) is number and flags & write_flags:
                    deny(event)
                if kind(mode) is text and mode.strip("rbt"):
                    deny(event)
                if not readable(path):
                    deny(event)
            elif event == "os.listdir" or event == "os.scandir":
                path = args[0] if args else None
                if not readable("." if path is None else path):
                    deny(event)
            elif event in tolerated_events:
                return
            elif event in denied_events or event.startswith(denied_prefixes):
                deny(event)
            elif event.startswith("socket."):
                if targets is None or resolver is None:
                    deny(event)
                if event == "socket.getaddrinfo":
                    remember_resolution(args[0], args[1])
                elif event in target_events:
                    address = args[1]
                    if address is None and event == "socket.sendmsg":
                        return
                    target = target_of(address)
                    if target not in targets and target not in resolved:
                        raise not_permitted("network target not allowed: %r" % (address,))

        _sys.addaudithook(audit_hook)
"#;

/// Render names as a Python `frozenset` literal. Names are identifiers or
/// `host:port` strings, so they never need escaping beyond JSON's.
pub fn python_frozenset<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let sorted: BTreeSet<String> = items
        .into_iter()
        .map(|s| serde_json::Value::String(s.as_ref().to_string()).to_string())
        .collect();
    if sorted.is_empty() {
        return "frozenset()".to_string();
    }
    format!(
        "frozenset({{{}}})",
        sorted.into_iter().collect::<Vec<_>>().join(", ")
    )
}
