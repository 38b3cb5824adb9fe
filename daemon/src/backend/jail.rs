//! bubblewrap backend.
//!
//! Runs the worker inside a fresh set of namespaces: no network, private
//! `/tmp`, read-only system directories, and nothing else from the host
//! filesystem except the worker binary itself.

use std::path::Path;

use tokio::process::Command;

/// Host directories bound read-only so a dynamically linked worker can load.
const READ_ONLY_SYSTEM_DIRS: &[&str] = &["/usr", "/lib", "/lib64", "/bin", "/etc/ld.so.cache"];

/// Where the worker binary appears inside the jail.
const JAILED_WORKER_PATH: &str = "/sandbox/worker";

/// Build the `bwrap` invocation that starts the worker.
pub(super) fn command(bwrap: &Path, worker: &Path) -> Command {
    let mut cmd = Command::new(bwrap);
    cmd.env_clear();

    cmd.args([
        "--unshare-all",
        "--die-with-parent",
        "--new-session",
        "--clearenv",
        "--proc",
        "/proc",
        "--dev",
        "/dev",
        "--tmpfs",
        "/tmp",
    ]);

    for dir in READ_ONLY_SYSTEM_DIRS {
        cmd.args(["--ro-bind-try", dir, dir]);
    }

    cmd.arg("--ro-bind").arg(worker).arg(JAILED_WORKER_PATH);

    if let Ok(filter) = std::env::var("RUST_LOG") {
        cmd.args(["--setenv", "RUST_LOG"]).arg(filter);
    }

    cmd.args(["--chdir", "/tmp", "--", JAILED_WORKER_PATH]);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn jail_unshares_everything_and_binds_worker() {
        let cmd = command(Path::new("/usr/bin/bwrap"), Path::new("/opt/worker"));
        assert_eq!(cmd.as_std().get_program(), "/usr/bin/bwrap");

        let args = args(&cmd);
        assert!(args.contains(&"--unshare-all".to_string()));
        assert!(args.contains(&"--die-with-parent".to_string()));

        let bind = args.iter().position(|a| a == "--ro-bind").unwrap();
        assert_eq!(args[bind + 1], "/opt/worker");
        assert_eq!(args[bind + 2], JAILED_WORKER_PATH);
    }

    #[test]
    fn jail_execs_worker_last() {
        let cmd = command(Path::new("bwrap"), Path::new("/opt/worker"));
        let args = args(&cmd);
        let sep = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[sep + 1..], [JAILED_WORKER_PATH.to_string()]);
    }
}
