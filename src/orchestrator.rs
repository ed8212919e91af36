use std::env;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::detect::{ExecutionContext, HostIdentity};
use crate::error::SetupError;
use crate::launch_config::{self, LaunchConfiguration, PassthroughArgs, Transport};
use crate::launcher::Launcher;
use crate::logging::Reporter;
use crate::privilege::{
    account_by_name, chown_file, open_no_follow, run_as_owner, select_invoker,
};
use crate::provision::{ClockOutcome, HostCapabilities, ProvisionOutcome, Provisioner};
use crate::runner::{CommandRunner, CommandSpec};
use crate::settings::{Settings, TimeSync};
use crate::update::UpdateController;
use crate::venv::EnvironmentManager;

type ClockSource<'a> = Box<dyn Fn(&TimeSync) -> Result<DateTime<Utc>, String> + 'a>;

/// Detector output in, agent exit code out. Each stage surfaces its own
/// error; nothing fatal is downgraded to a warning here.
pub struct Orchestrator<'a, R: CommandRunner> {
    settings: &'a Settings,
    runner: R,
    reporter: &'a Reporter,
    host: HostCapabilities,
    clock: Option<ClockSource<'a>>,
}

impl<'a, R: CommandRunner> Orchestrator<'a, R> {
    pub fn new(
        settings: &'a Settings,
        runner: R,
        reporter: &'a Reporter,
        host: HostCapabilities,
    ) -> Self {
        Self {
            settings,
            runner,
            reporter,
            host,
            clock: None,
        }
    }

    pub fn with_clock<F>(mut self, source: F) -> Self
    where
        F: Fn(&TimeSync) -> Result<DateTime<Utc>, String> + 'a,
    {
        self.clock = Some(Box::new(source));
        self
    }

    pub fn install(&self, identity: &HostIdentity, args: &[String]) -> Result<i32, SetupError> {
        let passthrough = PassthroughArgs::parse(args);
        if identity.execution_context == ExecutionContext::ManagedAddOn {
            debug!("managed add-on: the supervisor owns system packages");
        } else {
            self.reporter.header("Checking system dependencies");
            self.provision(passthrough.skip_sudo_actions)?;
        }

        self.reporter.header("Preparing the runtime environment");
        let manager = EnvironmentManager::new(&self.runner, &self.settings.runtime);
        let runtime_env = manager.ensure_environment(identity)?;
        if runtime_env.created {
            self.reporter
                .success(&format!("Created {}", runtime_env.path.display()));
        } else {
            self.reporter
                .info(&format!("Using {}", runtime_env.path.display()));
        }
        for note in &runtime_env.degraded {
            self.reporter.warn(note);
        }

        let config = launch_config::build(identity, args)?;
        self.prepare_storage(identity, &config)?;
        if identity.execution_context == ExecutionContext::BareMetal {
            if let Err(err) = self.write_update_helper(identity) {
                self.reporter
                    .warn(&format!("could not write the update helper script: {err}"));
            }
        }

        self.report_revision(&identity.repo_root_path);
        self.reporter.header("Starting homeway");
        let transport = Transport::for_context(identity.execution_context);
        Launcher::new(&self.settings.agent, transport).launch(&runtime_env, &config)
    }

    /// Self-update is a bare-metal concern; container images are replaced,
    /// not patched in place.
    pub fn update(&self, identity: &HostIdentity, args: &[String]) -> Result<i32, SetupError> {
        if identity.execution_context != ExecutionContext::BareMetal {
            return Err(SetupError::EnvironmentResolution(
                "self-update only applies to bare-metal installs; pull a newer image instead"
                    .to_string(),
            ));
        }
        self.reporter.header("Updating homeway");
        let invoker = select_invoker(&self.runner, &identity.repo_root_path)?;
        let controller = UpdateController::new(
            invoker.as_ref(),
            &identity.repo_root_path,
            &self.settings.update,
        );
        let report = controller.run(|release| {
            self.reporter
                .success(&format!("Source tree now at {} ({})", release.tag, release.commit));
            self.install(identity, args)
        })?;
        Ok(report.agent_exit_code)
    }

    fn provision(&self, skip_sudo_actions: bool) -> Result<(), SetupError> {
        let provisioner = Provisioner::new(&self.runner, self.host.clone(), skip_sudo_actions);
        self.sync_clock(&provisioner);

        let Some(manager) = provisioner.manager() else {
            return Err(SetupError::Provisioning(
                "no supported package manager found (expected apt-get or apk)".to_string(),
            ));
        };
        match provisioner.ensure(manager.required(&self.settings.packages))? {
            ProvisionOutcome::AlreadySatisfied => {
                self.reporter.info("System dependencies already installed.")
            }
            ProvisionOutcome::Installed(packages) => self
                .reporter
                .success(&format!("Installed {}", packages.join(", "))),
            ProvisionOutcome::Skipped(packages) => self.reporter.warn(&format!(
                "skipping install of {} (-skipsudoactions); the setup may fail later",
                packages.join(", ")
            )),
        }
        Ok(())
    }

    /// Best effort; every failure is a warning.
    fn sync_clock(&self, provisioner: &Provisioner<&R>) {
        let time_sync = &self.settings.time_sync;
        let Some(source) = self.clock.as_ref().filter(|_| time_sync.enabled) else {
            return;
        };
        let result = source(time_sync)
            .map_err(SetupError::Process)
            .and_then(|remote| provisioner.sync_clock(time_sync, remote, Utc::now()));
        match result {
            Ok(ClockOutcome::InSync { skew_sec }) => debug!(skew_sec, "clock in sync"),
            Ok(ClockOutcome::Adjusted { skew_sec }) => self
                .reporter
                .info(&format!("System clock corrected by {skew_sec}s.")),
            Ok(ClockOutcome::Skipped { skew_sec }) => self.reporter.warn(&format!(
                "system clock is off by {skew_sec}s; not correcting it (-skipsudoactions)"
            )),
            Err(err) => self
                .reporter
                .warn(&format!("time sync failed, continuing: {err}")),
        }
    }

    fn report_revision(&self, repo_root: &Path) {
        if !repo_root.join(".git").exists() {
            return;
        }
        let spec = CommandSpec::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .cwd(repo_root);
        match run_as_owner(&self.runner, repo_root, &spec) {
            Ok((0, revision)) => self.reporter.info(&format!("Source revision {revision}")),
            Ok((code, _)) => debug!(code, "cannot read the source revision"),
            Err(err) => debug!(error = %err, "cannot read the source revision"),
        }
    }

    fn prepare_storage(
        &self,
        identity: &HostIdentity,
        config: &LaunchConfiguration,
    ) -> Result<(), SetupError> {
        let mut dirs = vec![config.storage_dir.clone()];
        dirs.extend(config.logs_dir.clone());
        for dir in &dirs {
            fs::create_dir_all(dir).map_err(|err| {
                SetupError::Launch(format!("cannot create {}: {}", dir.display(), err))
            })?;
        }
        // Root created these; the agent runs as the invoking user.
        if self.host.euid == 0
            && identity.execution_context == ExecutionContext::BareMetal
            && identity.invoking_username != "root"
        {
            let spec = CommandSpec::new("chown")
                .arg("-R")
                .arg(format!("{}:", identity.invoking_username))
                .path_arg(&identity.data_root);
            let output = self.runner.run(&spec)?;
            if !output.success() {
                return Err(SetupError::Launch(format!(
                    "cannot hand {} to {}: {}",
                    identity.data_root.display(),
                    identity.invoking_username,
                    output.failure_summary()
                )));
            }
        }
        Ok(())
    }

    fn write_update_helper(&self, identity: &HostIdentity) -> Result<PathBuf, SetupError> {
        let path = identity
            .invoking_home_dir
            .join(&self.settings.update.helper_script);
        let exe = env::current_exe()?;
        let mut file = open_no_follow(&path, 0o755)?;
        file.write_all(helper_script(&identity.repo_root_path, &exe).as_bytes())?;
        file.set_permissions(fs::Permissions::from_mode(0o755))?;
        if self.host.euid == 0 {
            if let Some(account) = account_by_name(&identity.invoking_username) {
                chown_file(&file, &account)?;
            }
        }
        info!(path = %path.display(), "wrote update helper");
        Ok(path)
    }
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

pub fn helper_script(repo_root: &Path, exe: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         # Updates homeway to the latest release and restarts it.\n\
         cd {} || exit 1\n\
         exec {} update \"$@\"\n",
        shell_quote(repo_root),
        shell_quote(exe)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::EndpointHint;
    use crate::logging::LogConfig;
    use crate::provision::PackageManager;
    use crate::runner::mock::{failed, ok, MockRunner};
    use crate::runner::CommandOutput;
    use crate::venv::is_ready;
    use tempfile::{tempdir, TempDir};

    fn quiet_reporter() -> Reporter {
        Reporter::new(LogConfig {
            debug: false,
            color: false,
            json: true,
            log_file: None,
        })
    }

    fn host(euid: u32) -> HostCapabilities {
        HostCapabilities {
            euid,
            interactive: false,
            sudo_available: true,
            manager: Some(PackageManager::Apt),
        }
    }

    struct Layout {
        _root: TempDir,
        identity: HostIdentity,
    }

    fn bare_metal() -> Layout {
        let root = tempdir().unwrap();
        let home = root.path().join("home");
        let repo = root.path().join("repo");
        fs::create_dir_all(&home).unwrap();
        fs::create_dir_all(&repo).unwrap();
        fs::write(repo.join("requirements.txt"), "requests\n").unwrap();
        let identity = HostIdentity {
            repo_root_path: repo,
            runtime_env_path: home.join("homeway-env"),
            invoking_username: "pi".to_string(),
            data_root: home.join(".homeway"),
            invoking_home_dir: home,
            execution_context: ExecutionContext::BareMetal,
            endpoint_hint: EndpointHint::default(),
            supervisor_payload: None,
        };
        Layout {
            _root: root,
            identity,
        }
    }

    #[test]
    fn denied_elevation_aborts_before_the_environment_exists() {
        let layout = bare_metal();
        let runner = MockRunner::default();
        runner.respond(|spec| match spec.program.as_str() {
            "dpkg-query" => Some(failed(1, "no packages found")),
            "sudo" => Some(failed(1, "sudo: a password is required")),
            _ => None,
        });
        let reporter = quiet_reporter();
        let settings = Settings::default();
        let err = Orchestrator::new(&settings, &runner, &reporter, host(1000))
            .install(&layout.identity, &[])
            .unwrap_err();
        assert!(matches!(err, SetupError::InsufficientPrivilege(_)));
        assert_eq!(err.exit_code(), 11);
        assert!(!layout.identity.runtime_env_path.exists());
        assert!(runner.calls().iter().all(|spec| spec.program != "virtualenv"));
    }

    /// Tools that leave behind what the real ones would; the created
    /// interpreter is a script exiting with `agent_code`.
    fn fake_host(runner: &MockRunner, agent_code: i32) {
        runner.respond(move |spec| {
            let target = PathBuf::from(spec.args.last().cloned().unwrap_or_default());
            match spec.program.as_str() {
                "dpkg-query" => Some(ok("install ok installed")),
                "virtualenv" => {
                    let bin = target.join("bin");
                    fs::create_dir_all(&bin).unwrap();
                    let python = bin.join("python3");
                    fs::write(&python, format!("#!/bin/sh\nexit {agent_code}\n")).unwrap();
                    fs::set_permissions(&python, fs::Permissions::from_mode(0o755)).unwrap();
                    Some(CommandOutput::default())
                }
                "touch" => {
                    fs::write(&target, "").unwrap();
                    Some(CommandOutput::default())
                }
                _ => None,
            }
        });
    }

    #[test]
    fn install_provisions_creates_and_propagates_agent_exit_code() {
        let layout = bare_metal();
        let runner = MockRunner::default();
        fake_host(&runner, 5);
        let reporter = quiet_reporter();
        let settings = Settings::default();
        let orchestrator = Orchestrator::new(&settings, &runner, &reporter, host(1000));

        let code = orchestrator.install(&layout.identity, &[]).unwrap();
        assert_eq!(code, 5);
        let identity = &layout.identity;
        assert!(is_ready(&identity.runtime_env_path, &settings.runtime));
        assert!(identity.data_root.join("data").is_dir());
        assert!(identity.data_root.join("logs").is_dir());
        let helper = identity.invoking_home_dir.join("update-homeway.sh");
        assert!(fs::read_to_string(helper).unwrap().contains(" update \"$@\""));
        assert!(!runner.rendered().iter().any(|cmd| cmd.starts_with("sudo")));

        // Second run reuses the environment without creating anything.
        let before = runner.calls().len();
        assert_eq!(orchestrator.install(&layout.identity, &[]).unwrap(), 5);
        let again = &runner.rendered()[before..];
        assert!(again.iter().all(|cmd| cmd.starts_with("dpkg-query")));
    }

    #[test]
    fn root_hands_storage_to_the_invoking_user() {
        let layout = bare_metal();
        let runner = MockRunner::default();
        fake_host(&runner, 0);
        let reporter = quiet_reporter();
        let settings = Settings::default();
        Orchestrator::new(&settings, &runner, &reporter, host(0))
            .install(&layout.identity, &[])
            .unwrap();
        let chown = format!("chown -R pi: {}", layout.identity.data_root.display());
        assert!(runner.rendered().contains(&chown));
    }

    #[test]
    fn skip_sudo_actions_never_elevates() {
        let layout = bare_metal();
        let runner = MockRunner::default();
        runner.respond(|spec| (spec.program == "dpkg-query").then(|| failed(1, "")));
        fake_host(&runner, 0);
        let reporter = quiet_reporter();
        let settings = Settings::default();
        Orchestrator::new(&settings, &runner, &reporter, host(1000))
            .install(&layout.identity, &["-skipsudoactions".to_string()])
            .unwrap();
        assert!(!runner.rendered().iter().any(|cmd| cmd.starts_with("sudo")));
    }

    #[test]
    fn failed_clock_source_is_only_a_warning() {
        let layout = bare_metal();
        let runner = MockRunner::default();
        fake_host(&runner, 0);
        let reporter = quiet_reporter();
        let settings = Settings::default();
        let code = Orchestrator::new(&settings, &runner, &reporter, host(1000))
            .with_clock(|_| Err("network unreachable".to_string()))
            .install(&layout.identity, &[])
            .unwrap();
        assert_eq!(code, 0);
        assert!(!runner.rendered().iter().any(|cmd| cmd.starts_with("date")));
    }

    #[test]
    fn update_is_refused_outside_bare_metal() {
        let mut layout = bare_metal();
        layout.identity.execution_context = ExecutionContext::GenericContainer;
        let runner = MockRunner::default();
        let reporter = quiet_reporter();
        let settings = Settings::default();
        let err = Orchestrator::new(&settings, &runner, &reporter, host(0))
            .update(&layout.identity, &[])
            .unwrap_err();
        assert_eq!(err.exit_code(), 10);
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn helper_script_execs_update_from_repo_root() {
        let script = helper_script(
            Path::new("/home/pi/homeway"),
            Path::new("/usr/bin/homeway-setup"),
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("cd '/home/pi/homeway' || exit 1"));
        assert!(script.contains("exec '/usr/bin/homeway-setup' update \"$@\""));
    }

    #[test]
    fn helper_is_not_written_through_a_symlink() {
        let layout = bare_metal();
        let home = &layout.identity.invoking_home_dir;
        let target = home.join("shadow");
        fs::write(&target, "untouched\n").unwrap();
        std::os::unix::fs::symlink(&target, home.join("update-homeway.sh")).unwrap();
        let runner = MockRunner::default();
        let reporter = quiet_reporter();
        let settings = Settings::default();
        let result = Orchestrator::new(&settings, &runner, &reporter, host(0))
            .write_update_helper(&layout.identity);
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "untouched\n");
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_ne!(mode, 0o755);
    }

    #[test]
    fn helper_replaces_a_previous_copy_and_is_executable() {
        let layout = bare_metal();
        let path = layout.identity.invoking_home_dir.join("update-homeway.sh");
        fs::write(&path, "stale contents that are longer than nothing\n").unwrap();
        let runner = MockRunner::default();
        let reporter = quiet_reporter();
        let settings = Settings::default();
        let written = Orchestrator::new(&settings, &runner, &reporter, host(1000))
            .write_update_helper(&layout.identity)
            .unwrap();
        assert_eq!(written, path);
        let script = fs::read_to_string(&path).unwrap();
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(!script.contains("stale"));
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}
