//! RUN execution.
//!
//! A [`CommandRunner`] executes one RUN command with a stage rootfs as its
//! filesystem root. Timeouts are enforced by the caller: runners spawn
//! children with `kill_on_drop`, so abandoning the future kills the process.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use kiln_core::error::{KilnError, Result};
use tokio::process::Command;

/// `PATH` used when the image defines none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// One RUN invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub argv: Vec<String>,
    pub workdir: String,
    /// Image env overlaid on ARG bindings
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
}

/// Captured result of a RUN command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last `max_lines` lines of stderr.
    pub fn stderr_tail(&self, max_lines: usize) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(max_lines);
        lines[start..].join("\n")
    }
}

/// Executes RUN commands against a root filesystem.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, rootfs: &Path, spec: &RunSpec) -> Result<RunOutput>;
}

/// Runs commands under `chroot(8)`.
///
/// Needs root privileges and a `/bin/sh` inside the rootfs, which is used
/// to enter the working directory before exec'ing the command.
#[derive(Debug, Clone)]
pub struct ChrootRunner {
    chroot_binary: String,
}

impl Default for ChrootRunner {
    fn default() -> Self {
        Self {
            chroot_binary: "chroot".to_string(),
        }
    }
}

impl ChrootRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            chroot_binary: binary.into(),
        }
    }

    fn arguments(&self, rootfs: &Path, spec: &RunSpec) -> Vec<String> {
        let mut args = Vec::with_capacity(spec.argv.len() + 6);
        if let Some(user) = &spec.user {
            args.push(format!("--userspec={}", user));
        }
        args.push(rootfs.display().to_string());
        args.push("/bin/sh".to_string());
        args.push("-c".to_string());
        args.push("cd \"$0\" && exec \"$@\"".to_string());
        args.push(spec.workdir.clone());
        args.extend(spec.argv.iter().cloned());
        args
    }

    fn environment(spec: &RunSpec) -> BTreeMap<String, String> {
        let mut env = spec.env.clone();
        env.entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH.to_string());
        env.entry("HOME".to_string())
            .or_insert_with(|| "/root".to_string());
        env
    }
}

#[async_trait]
impl CommandRunner for ChrootRunner {
    async fn run(&self, rootfs: &Path, spec: &RunSpec) -> Result<RunOutput> {
        if spec.argv.is_empty() {
            return Err(KilnError::Build("RUN requires a command".to_string()));
        }

        tracing::debug!(
            rootfs = %rootfs.display(),
            workdir = %spec.workdir,
            argv = ?spec.argv,
            "Running command"
        );

        let child = Command::new(&self.chroot_binary)
            .args(self.arguments(rootfs, spec))
            .env_clear()
            .envs(Self::environment(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                KilnError::Build(format!(
                    "Failed to spawn {}: {}",
                    self.chroot_binary, e
                ))
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| KilnError::Build(format!("Failed to wait for command: {}", e)))?;

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> RunSpec {
        RunSpec {
            argv: vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "make install".to_string(),
            ],
            workdir: "/src".to_string(),
            env: BTreeMap::from([("CC".to_string(), "gcc".to_string())]),
            user: None,
        }
    }

    #[test]
    fn test_chroot_arguments() {
        let runner = ChrootRunner::new();
        let args = runner.arguments(&PathBuf::from("/tmp/rootfs"), &spec());
        assert_eq!(args[0], "/tmp/rootfs");
        assert_eq!(args[1], "/bin/sh");
        assert_eq!(args[4], "/src");
        assert_eq!(&args[5..], &["/bin/sh", "-c", "make install"]);
    }

    #[test]
    fn test_chroot_arguments_with_user() {
        let runner = ChrootRunner::new();
        let mut spec = spec();
        spec.user = Some("1000:1000".to_string());
        let args = runner.arguments(&PathBuf::from("/r"), &spec);
        assert_eq!(args[0], "--userspec=1000:1000");
        assert_eq!(args[1], "/r");
    }

    #[test]
    fn test_default_path_added() {
        let env = ChrootRunner::environment(&spec());
        assert_eq!(env.get("PATH").map(String::as_str), Some(DEFAULT_PATH));
        assert_eq!(env.get("CC").map(String::as_str), Some("gcc"));

        let mut custom = spec();
        custom.env.insert("PATH".to_string(), "/opt/bin".to_string());
        let env = ChrootRunner::environment(&custom);
        assert_eq!(env.get("PATH").map(String::as_str), Some("/opt/bin"));
    }

    #[test]
    fn test_stderr_tail() {
        let output = RunOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "one\ntwo\nthree\n".to_string(),
        };
        assert_eq!(output.stderr_tail(2), "two\nthree");
        assert_eq!(output.stderr_tail(10), "one\ntwo\nthree");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_missing_binary_is_error() {
        let runner = ChrootRunner::with_binary("/nonexistent/chroot");
        let err = runner
            .run(&PathBuf::from("/tmp"), &spec())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }
}
