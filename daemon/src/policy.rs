//! Fixed execution policy: request limits, the coarse text filter, the
//! builtin allow-list and the user-facing messages.
//!
//! The text filter is a best-effort syntactic check. It is not a security
//! boundary; containment comes from the stripped builtins inside the worker
//! and from the worker's process isolation.

/// Maximum snippet length, in characters.
pub const MAX_CODE_CHARS: usize = 4000;

/// Substrings that cause a snippet to be refused before dispatch:
/// dunder access and the module-loading keyword.
pub const REJECTED_SUBSTRINGS: &[&str] = &["__", "import"];

/// Callable names visible to executed code. Everything else in the
/// interpreter's builtins is removed before the snippet runs.
pub const ALLOWED_BUILTINS: &[&str] = &[
    "print",
    "range",
    "len",
    "int",
    "float",
    "str",
    "bool",
    "list",
    "dict",
    "set",
    "tuple",
    "enumerate",
    "abs",
    "min",
    "max",
    "sum",
];

pub const POLICY_REJECTION_MESSAGE: &str =
    "Sorry, importing modules or using special names isn't allowed.";

pub const TIMEOUT_MESSAGE: &str = "Your code took too long to finish.";

/// Output shown when a run printed nothing and raised nothing.
pub const NO_OUTPUT_PLACEHOLDER: &str = "No output";

/// Returns the first rejected substring found in `code`, if any.
pub fn rejected_substring(code: &str) -> Option<&'static str> {
    REJECTED_SUBSTRINGS
        .iter()
        .copied()
        .find(|needle| code.contains(needle))
}

/// Whether `name` is on the builtin allow-list.
pub fn is_allowed_builtin(name: &str) -> bool {
    ALLOWED_BUILTINS.contains(&name)
}
