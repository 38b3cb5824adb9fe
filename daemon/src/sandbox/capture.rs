//! In-memory stdout/stderr capture for a single execution.
//!
//! `sys.stdout` and `sys.stderr` are replaced with small namespace objects
//! whose `write(s)` delegates here. `print()` goes through `sys.stdout.write`,
//! so everything the snippet prints lands in these buffers and never on the
//! worker's real stdout (which carries protocol frames).

use std::sync::{Arc, Mutex, PoisonError};

use rustpython_vm::{builtins::PyStr, function::FuncArgs, PyObjectRef, PyResult, VirtualMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Default)]
struct Buffers {
    stdout: String,
    stderr: String,
}

/// Shared capture buffers with a combined size cap.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    buffers: Arc<Mutex<Buffers>>,
    limit_bytes: usize,
}

/// Returned when a write would push the captured output past its cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputLimitExceeded {
    pub limit_bytes: usize,
}

impl OutputCapture {
    pub fn new(limit_bytes: usize) -> Self {
        Self {
            buffers: Arc::new(Mutex::new(Buffers::default())),
            limit_bytes,
        }
    }

    /// Append `data` to `stream`. Nothing is written if the cap would be exceeded.
    pub fn write(&self, stream: Stream, data: &str) -> Result<(), OutputLimitExceeded> {
        let mut buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        let used = buffers.stdout.len() + buffers.stderr.len();
        if used + data.len() > self.limit_bytes {
            return Err(OutputLimitExceeded {
                limit_bytes: self.limit_bytes,
            });
        }
        match stream {
            Stream::Stdout => buffers.stdout.push_str(data),
            Stream::Stderr => buffers.stderr.push_str(data),
        }
        Ok(())
    }

    /// Copy out `(stdout, stderr)`.
    pub fn contents(&self) -> (String, String) {
        let buffers = self.buffers.lock().unwrap_or_else(PoisonError::into_inner);
        (buffers.stdout.clone(), buffers.stderr.clone())
    }

    /// Point `sys.stdout` and `sys.stderr` of `vm` at this capture.
    pub fn install(&self, vm: &VirtualMachine) -> PyResult<()> {
        let stdout = self.writer_object(vm, Stream::Stdout)?;
        let stderr = self.writer_object(vm, Stream::Stderr)?;
        vm.sys_module.set_attr("stdout", stdout, vm)?;
        vm.sys_module.set_attr("stderr", stderr, vm)?;
        Ok(())
    }

    /// Build a namespace object exposing `write(s)` and `flush()`.
    fn writer_object(&self, vm: &VirtualMachine, stream: Stream) -> PyResult<PyObjectRef> {
        let capture = self.clone();

        let write_fn = vm.new_function(
            "write",
            move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                let [arg] = args.args.as_slice() else {
                    return Err(vm.new_type_error(format!(
                        "write() takes exactly one argument ({} given)",
                        args.args.len()
                    )));
                };
                let Some(data) = arg.downcast_ref::<PyStr>() else {
                    return Err(vm.new_type_error(format!(
                        "write() argument must be str, not {}",
                        &*arg.class().name()
                    )));
                };
                let data = data.as_str();

                match capture.write(stream, data) {
                    Ok(()) => Ok(vm.ctx.new_int(data.chars().count()).into()),
                    Err(OutputLimitExceeded { limit_bytes }) => Err(vm.new_runtime_error(
                        format!("Output limit exceeded: {limit_bytes} bytes"),
                    )),
                }
            },
        );

        let flush_fn = vm.new_function(
            "flush",
            move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                Ok(vm.ctx.none())
            },
        );

        let ns = vm.new_module("<capture>", vm.ctx.new_dict(), None);
        ns.set_attr("write", write_fn, vm)?;
        ns.set_attr("flush", flush_fn, vm)?;
        ns.set_attr("closed", vm.ctx.new_bool(false), vm)?;
        ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm)?;
        Ok(ns.into())
    }
}
