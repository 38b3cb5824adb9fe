//! The restricted execution environment.
//!
//! Runs inside the worker process. Every call builds a brand-new
//! interpreter, strips its builtins down to the allow-list, redirects
//! `sys.stdout`/`sys.stderr` into per-run buffers, then compiles and executes
//! the snippet. Nothing survives between calls.

mod capture;

pub use capture::{OutputCapture, OutputLimitExceeded, Stream};

use anyhow::Result;
use rustpython_vm::{
    builtins::PyBaseExceptionRef, compiler::Mode, AsObject, Interpreter, PyObjectRef,
    VirtualMachine,
};
use tracing::debug;

use crate::policy::ALLOWED_BUILTINS;
use crate::transport::RunOutcome;

/// Deletes every builtin whose name is not in `_keep`. Runs in a throwaway
/// scope before the snippet is compiled.
const RESTRICT_BUILTINS: &str = r"
_ns = __builtins__ if type(__builtins__) is dict else vars(__builtins__)
for _name in list(_ns):
    if _name not in _keep:
        del _ns[_name]
";

/// Run `code` in a fresh restricted environment.
///
/// `Err` means the environment itself could not be prepared; anything the
/// snippet does (including syntax errors) is reported through `RunOutcome`.
pub fn run_snippet(code: &str, max_output_bytes: usize) -> Result<RunOutcome> {
    let capture = OutputCapture::new(max_output_bytes);
    let interpreter = Interpreter::with_init(rustpython_vm::Settings::default(), |_vm| {});

    interpreter.enter(|vm| {
        restrict_builtins(vm).map_err(|exc| setup_error(vm, "restrict builtins", &exc))?;
        capture
            .install(vm)
            .map_err(|exc| setup_error(vm, "install output capture", &exc))?;

        let code_obj = match vm.compile(code, Mode::Exec, "<string>".to_owned()) {
            Ok(code_obj) => code_obj,
            Err(err) => {
                debug!(error = %err, "Snippet failed to compile");
                return Ok(RunOutcome::Raised {
                    stdout: String::new(),
                    message: err.to_string(),
                });
            }
        };

        let scope = vm.new_scope_with_builtins();
        let result = vm.run_code_obj(code_obj, scope);
        let (stdout, stderr) = capture.contents();

        Ok(match result {
            Ok(_) => RunOutcome::Completed { stdout, stderr },
            Err(exc) => {
                let message = exception_message(vm, &exc);
                debug!(%message, "Snippet raised");
                RunOutcome::Raised { stdout, message }
            }
        })
    })
}

/// Strip the interpreter's builtins module to `ALLOWED_BUILTINS`.
///
/// The module is shared by every scope this interpreter creates, so the
/// snippet's scope can only ever resolve allow-listed names.
fn restrict_builtins(vm: &VirtualMachine) -> Result<(), PyBaseExceptionRef> {
    let keep: Vec<PyObjectRef> = ALLOWED_BUILTINS
        .iter()
        .map(|name| vm.ctx.new_str(*name).into())
        .collect();

    let scope = vm.new_scope_with_builtins();
    scope
        .globals
        .set_item("_keep", vm.ctx.new_tuple(keep).into(), vm)?;

    let code_obj = vm
        .compile(RESTRICT_BUILTINS, Mode::Exec, "<restrict>".to_owned())
        .map_err(|err| vm.new_runtime_error(err.to_string()))?;
    vm.run_code_obj(code_obj, scope)?;
    Ok(())
}

/// `str(exc)`, falling back to `repr(exc)` when the message is empty.
fn exception_message(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> String {
    let message = exc
        .as_object()
        .str(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_default();
    if !message.is_empty() {
        return message;
    }
    exc.as_object()
        .repr(vm)
        .map(|s| s.as_str().to_owned())
        .unwrap_or_else(|_| "Unknown error".to_owned())
}

fn setup_error(vm: &VirtualMachine, step: &str, exc: &PyBaseExceptionRef) -> anyhow::Error {
    anyhow::anyhow!(
        "Failed to {step}: {}",
        exception_message(vm, exc)
    )
}
