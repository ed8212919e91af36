use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env_overrides: BTreeMap<String, String>,
    pub capture_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env_overrides: BTreeMap::new(),
            capture_output: true,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env_overrides.insert(key.to_string(), value.to_string());
        self
    }

    /// Lets the child write straight to the operator's terminal.
    pub fn inherit_output(mut self) -> Self {
        self.capture_output = false;
        self
    }

    /// Same command, prefixed by another program (sudo, runuser).
    pub fn wrapped_by(&self, program: &str, prefix_args: &[String]) -> Self {
        let mut args = prefix_args.to_vec();
        args.push(self.program.clone());
        args.extend(self.args.iter().cloned());
        Self {
            program: program.to_string(),
            args,
            cwd: self.cwd.clone(),
            env_overrides: self.env_overrides.clone(),
            capture_output: self.capture_output,
        }
    }

    pub fn render(&self) -> String {
        let mut parts = vec![self.program.clone()];
        for arg in &self.args {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                parts.push(format!("'{}'", arg.replace('\'', "'\\''")));
            } else {
                parts.push(arg.clone());
            }
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Best diagnostic for a failed command: stderr, else stdout, else the code.
    pub fn failure_summary(&self) -> String {
        let stderr = self.stderr_text();
        if !stderr.is_empty() {
            return stderr;
        }
        let stdout = self.stdout_text();
        if !stdout.is_empty() {
            return stdout;
        }
        format!("exit status {}", self.status_code)
    }
}

pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
        (**self).run(spec)
    }
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
        debug!(command = %spec.render(), cwd = ?spec.cwd, "running command");
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env_overrides {
            cmd.env(key, value);
        }
        if spec.capture_output {
            let output = cmd.stdin(Stdio::null()).output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            debug!(command = %spec.render(), status_code, "command finished");
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            debug!(command = %spec.render(), status_code, "command finished");
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn render_quotes_arguments_with_spaces() {
        let spec = CommandSpec::new("git")
            .arg("commit")
            .arg("-m")
            .arg("it's done");
        assert_eq!(spec.render(), "git commit -m 'it'\\''s done'");
    }

    #[test]
    fn wrapped_by_prefixes_program_and_keeps_cwd() {
        let dir = tempdir().unwrap();
        let spec = CommandSpec::new("git").arg("pull").cwd(dir.path());
        let wrapped = spec.wrapped_by("sudo", &["-u".to_string(), "pi".to_string()]);
        assert_eq!(wrapped.program, "sudo");
        assert_eq!(wrapped.args, vec!["-u", "pi", "git", "pull"]);
        assert_eq!(wrapped.cwd.as_deref(), Some(dir.path()));
    }

    #[test]
    fn system_runner_captures_exit_code_and_stdout() {
        let output = SystemRunner
            .run(&CommandSpec::new("sh").arg("-c").arg("echo hello; exit 3"))
            .expect("run sh");
        assert_eq!(output.status_code, 3);
        assert_eq!(output.stdout_text(), "hello");
        assert!(!output.success());
    }

    #[test]
    fn system_runner_honours_cwd() {
        let dir = tempdir().unwrap();
        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        let output = SystemRunner
            .run(&CommandSpec::new("pwd").cwd(&canonical))
            .expect("run pwd");
        assert_eq!(output.stdout_text(), canonical.to_string_lossy());
    }

    #[test]
    fn failure_summary_prefers_stderr() {
        let output = CommandOutput {
            status_code: 2,
            stdout: b"out".to_vec(),
            stderr: b"boom\n".to_vec(),
        };
        assert_eq!(output.failure_summary(), "boom");
        let silent = CommandOutput {
            status_code: 2,
            ..CommandOutput::default()
        };
        assert_eq!(silent.failure_summary(), "exit status 2");
    }
}
