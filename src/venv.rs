use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::detect::HostIdentity;
use crate::error::SetupError;
use crate::lock::EnvLock;
use crate::privilege::{select_invoker, Invoker};
use crate::runner::{CommandRunner, CommandSpec};
use crate::settings::Runtime;

/// A usable runtime environment. Only handed out once the ready marker and
/// the interpreter are both in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeEnvironment {
    pub path: PathBuf,
    pub python: PathBuf,
    /// False when an existing environment was reused untouched.
    pub created: bool,
    /// Best-effort steps that failed without invalidating the environment.
    pub degraded: Vec<String>,
}

pub fn python_path(env_path: &Path) -> PathBuf {
    env_path.join("bin").join("python3")
}

pub fn marker_path(env_path: &Path, runtime: &Runtime) -> PathBuf {
    env_path.join(&runtime.ready_marker)
}

/// The single source of truth for "this environment exists".
pub fn is_ready(env_path: &Path, runtime: &Runtime) -> bool {
    marker_path(env_path, runtime).is_file() && python_path(env_path).is_file()
}

pub struct EnvironmentManager<'a, R: CommandRunner> {
    runner: R,
    runtime: &'a Runtime,
}

fn creation_error(message: impl Into<String>) -> SetupError {
    SetupError::EnvironmentCreation(message.into())
}

impl<'a, R: CommandRunner> EnvironmentManager<'a, R> {
    pub fn new(runner: R, runtime: &'a Runtime) -> Self {
        Self { runner, runtime }
    }

    /// Returns the environment at `identity.runtime_env_path`, creating it
    /// when its ready marker is absent. A ready environment is never
    /// modified: the agent may be running from it.
    pub fn ensure_environment(
        &self,
        identity: &HostIdentity,
    ) -> Result<RuntimeEnvironment, SetupError> {
        let env_path = identity.runtime_env_path.as_path();
        if is_ready(env_path, self.runtime) {
            debug!(env = %env_path.display(), "runtime environment ready, reusing");
            return Ok(self.existing(env_path));
        }

        let parent = env_path.parent().ok_or_else(|| {
            creation_error(format!(
                "runtime environment path has no parent: {}",
                env_path.display()
            ))
        })?;
        fs::create_dir_all(parent).map_err(|err| {
            creation_error(format!("cannot create {}: {}", parent.display(), err))
        })?;
        let lock_path = EnvLock::path_for(env_path).ok_or_else(|| {
            creation_error(format!("invalid environment path {}", env_path.display()))
        })?;
        let lock = EnvLock::try_acquire(&lock_path)?;
        debug!(lock = %lock.path().display(), "holding environment lock");

        // Another run may have finished while we waited for the lock.
        if is_ready(env_path, self.runtime) {
            return Ok(self.existing(env_path));
        }

        let invoker = select_invoker(&self.runner, parent)?;
        info!(
            env = %env_path.display(),
            invoker = %invoker.describe(),
            "creating runtime environment"
        );
        self.create(invoker.as_ref(), env_path, &identity.repo_root_path)
    }

    fn existing(&self, env_path: &Path) -> RuntimeEnvironment {
        RuntimeEnvironment {
            path: env_path.to_path_buf(),
            python: python_path(env_path),
            created: false,
            degraded: Vec::new(),
        }
    }

    fn create(
        &self,
        invoker: &dyn Invoker,
        env_path: &Path,
        repo_root: &Path,
    ) -> Result<RuntimeEnvironment, SetupError> {
        // An environment without the marker may still be loaded by a running
        // agent. Creation is repeated over it in place, never removed.
        if env_path.exists() {
            debug!(env = %env_path.display(), "completing environment without ready marker");
        }

        self.materialize(invoker, env_path)?;
        let python = python_path(env_path);
        if !python.is_file() {
            return Err(creation_error(format!(
                "interpreter missing after creation: {}",
                python.display()
            )));
        }

        let pip = |args: &[&str]| {
            CommandSpec::new(python.to_string_lossy().to_string())
                .args(["-m", "pip"])
                .args(args.iter().copied())
                .cwd(repo_root)
        };
        run_step(
            invoker,
            &pip(&["install", "--upgrade", "pip"]),
            "upgrade pip",
        )?;

        let requirements = repo_root.join(&self.runtime.requirements);
        if !requirements.is_file() {
            return Err(creation_error(format!(
                "requirements file not found: {}",
                requirements.display()
            )));
        }
        run_step(
            invoker,
            &pip(&["install", "-r"]).path_arg(&requirements),
            "install pinned dependencies",
        )?;

        let mut degraded = Vec::new();
        for package in &self.runtime.optional_packages {
            let spec = pip(&["install", package.as_str()]);
            if let Err(err) = run_step(invoker, &spec, "install optional package") {
                warn!(package = %package, error = %err, "optional package not installed");
                degraded.push(format!("optional package {package} not installed: {err}"));
            }
        }

        let marker = marker_path(env_path, self.runtime);
        run_step(
            invoker,
            &CommandSpec::new("touch").path_arg(&marker),
            "write ready marker",
        )?;
        if !is_ready(env_path, self.runtime) {
            return Err(creation_error(format!(
                "ready marker was not written: {}",
                marker.display()
            )));
        }
        Ok(RuntimeEnvironment {
            path: env_path.to_path_buf(),
            python,
            created: true,
            degraded,
        })
    }

    /// `virtualenv -p` first, the interpreter's own venv module otherwise.
    fn materialize(&self, invoker: &dyn Invoker, env_path: &Path) -> Result<(), SetupError> {
        let interpreter = &self.runtime.interpreter;
        let virtualenv = CommandSpec::new("virtualenv")
            .arg("-p")
            .arg(interpreter.as_str())
            .path_arg(env_path);
        match run_step(invoker, &virtualenv, "create environment with virtualenv") {
            Ok(()) => Ok(()),
            Err(err) => {
                debug!(error = %err, "virtualenv unavailable, falling back to venv");
                let venv = CommandSpec::new(interpreter.as_str())
                    .args(["-m", "venv"])
                    .path_arg(env_path);
                run_step(invoker, &venv, "create environment with venv")
            }
        }
    }
}

fn run_step(invoker: &dyn Invoker, spec: &CommandSpec, step: &str) -> Result<(), SetupError> {
    let output = match invoker.invoke(spec) {
        Ok(output) => output,
        Err(SetupError::Process(message)) => {
            return Err(creation_error(format!("{step}: {message}")))
        }
        Err(err) => return Err(err),
    };
    if !output.success() {
        return Err(creation_error(format!(
            "{step} (`{}`) failed: {}",
            spec.render(),
            output.failure_summary()
        )));
    }
    Ok(())
}
