use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::{debug, info, warn};

use crate::error::SetupError;
use crate::launch_config::{LaunchConfiguration, Transport};
use crate::settings::Agent;
use crate::venv::RuntimeEnvironment;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FORWARDED_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Exactly what will be executed; also what `config render` reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

pub struct Launcher<'a> {
    agent: &'a Agent,
    transport: Transport,
}

impl<'a> Launcher<'a> {
    pub fn new(agent: &'a Agent, transport: Transport) -> Self {
        Self { agent, transport }
    }

    pub fn plan(
        &self,
        env: &RuntimeEnvironment,
        config: &LaunchConfiguration,
    ) -> Result<LaunchPlan, SetupError> {
        config.validate()?;
        let payload = config.encode(self.transport)?;
        Ok(LaunchPlan {
            program: env.python.clone(),
            args: vec!["-m".to_string(), self.agent.module.clone(), payload],
            cwd: working_dir(&config.repo_root_dir, &self.agent.working_subdir),
        })
    }

    /// Runs the agent as a direct child and returns its exit code. Signals
    /// sent to the orchestrator are relayed to the child and the wait goes
    /// on, so the child is never orphaned. The child leads its own process
    /// group, so a terminal interrupt reaches it once, through the relay.
    pub fn launch(
        &self,
        env: &RuntimeEnvironment,
        config: &LaunchConfiguration,
    ) -> Result<i32, SetupError> {
        let plan = self.plan(env, config)?;
        let relay = SignalRelay::install()?;
        info!(
            program = %plan.program.display(),
            module = %self.agent.module,
            cwd = %plan.cwd.display(),
            transport = ?self.transport,
            "launching agent"
        );
        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .current_dir(&plan.cwd)
            .process_group(0)
            .spawn()
            .map_err(|err| {
                SetupError::Launch(format!(
                    "failed to start {}: {}",
                    plan.program.display(),
                    err
                ))
            })?;
        let status = relay.wait(&mut child)?;
        let code = exit_code_of(status);
        debug!(%status, code, "agent exited");
        Ok(code)
    }
}

fn working_dir(repo_root: &Path, subdir: &str) -> PathBuf {
    let candidate = repo_root.join(subdir);
    if !subdir.is_empty() && candidate.is_dir() {
        candidate
    } else {
        repo_root.to_path_buf()
    }
}

/// Shell convention: death by signal N reads as 128+N.
pub fn exit_code_of(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

struct SignalRelay {
    pending: Vec<(i32, Arc<AtomicBool>, signal_hook::SigId)>,
}

impl SignalRelay {
    fn install() -> Result<Self, SetupError> {
        let mut pending = Vec::new();
        for signal in FORWARDED_SIGNALS {
            let raised = Arc::new(AtomicBool::new(false));
            let id = flag::register(signal, Arc::clone(&raised)).map_err(|err| {
                SetupError::Launch(format!("cannot install handler for signal {signal}: {err}"))
            })?;
            pending.push((signal, raised, id));
        }
        Ok(Self { pending })
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, SetupError> {
        let pid = child.id() as libc::pid_t;
        loop {
            for (signal, raised, _) in &self.pending {
                if raised.swap(false, Ordering::SeqCst) {
                    info!(signal, pid, "forwarding signal to agent");
                    // SAFETY: kill has no memory-safety preconditions.
                    if unsafe { libc::kill(pid, *signal) } != 0 {
                        warn!(signal, pid, "failed to forward signal");
                    }
                }
            }
            if let Some(status) = child
                .try_wait()
                .map_err(|err| SetupError::Launch(format!("failed to wait for agent: {err}")))?
            {
                return Ok(status);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        for (_, _, id) in self.pending.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}
