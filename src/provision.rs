use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::SetupError;
use crate::privilege::{effective_uid, stdin_is_terminal};
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use crate::settings::{Packages, TimeSync};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Apk,
}

impl PackageManager {
    pub fn detect() -> Option<Self> {
        if which::which("apt-get").is_ok() {
            Some(PackageManager::Apt)
        } else if which::which("apk").is_ok() {
            Some(PackageManager::Apk)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PackageManager::Apt => "apt-get",
            PackageManager::Apk => "apk",
        }
    }

    pub fn required<'a>(self, packages: &'a Packages) -> &'a BTreeSet<String> {
        match self {
            PackageManager::Apt => &packages.apt,
            PackageManager::Apk => &packages.apk,
        }
    }

    fn presence_check(self, package: &str) -> CommandSpec {
        match self {
            PackageManager::Apt => CommandSpec::new("dpkg-query")
                .args(["-W", "--showformat=${Status}"])
                .arg(package),
            PackageManager::Apk => CommandSpec::new("apk").args(["info", "-e"]).arg(package),
        }
    }

    fn is_present(self, output: &CommandOutput) -> bool {
        match self {
            // dpkg-query also knows removed packages; only "installed" counts.
            PackageManager::Apt => {
                output.success() && output.stdout_text().ends_with("install ok installed")
            }
            PackageManager::Apk => output.success(),
        }
    }

    fn install_commands(self, missing: &[String]) -> Vec<CommandSpec> {
        match self {
            PackageManager::Apt => vec![
                CommandSpec::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .inherit_output(),
                CommandSpec::new("apt-get")
                    .args(["install", "-y"])
                    .args(missing.iter().cloned())
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .inherit_output(),
            ],
            PackageManager::Apk => vec![CommandSpec::new("apk")
                .args(["add", "--no-cache"])
                .args(missing.iter().cloned())
                .inherit_output()],
        }
    }
}

/// What the provisioner can rely on about the host. Read once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCapabilities {
    pub euid: u32,
    pub interactive: bool,
    pub sudo_available: bool,
    pub manager: Option<PackageManager>,
}

impl HostCapabilities {
    pub fn current() -> Self {
        Self {
            euid: effective_uid(),
            interactive: stdin_is_terminal(),
            sudo_available: which::which("sudo").is_ok(),
            manager: PackageManager::detect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Elevation {
    Direct,
    Sudo { non_interactive: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    AlreadySatisfied,
    Installed(Vec<String>),
    /// `-skipsudoactions` was given; these stay missing.
    Skipped(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOutcome {
    InSync { skew_sec: i64 },
    Adjusted { skew_sec: i64 },
    Skipped { skew_sec: i64 },
}

pub struct Provisioner<R: CommandRunner> {
    runner: R,
    host: HostCapabilities,
    skip_sudo_actions: bool,
    elevation: OnceCell<Elevation>,
}

impl<R: CommandRunner> Provisioner<R> {
    pub fn new(runner: R, host: HostCapabilities, skip_sudo_actions: bool) -> Self {
        Self {
            runner,
            host,
            skip_sudo_actions,
            elevation: OnceCell::new(),
        }
    }

    pub fn manager(&self) -> Option<PackageManager> {
        self.host.manager
    }

    /// Installs whichever of `required` is missing. Safe on every startup:
    /// with nothing missing no elevation is requested and nothing runs
    /// besides presence checks.
    pub fn ensure(&self, required: &BTreeSet<String>) -> Result<ProvisionOutcome, SetupError> {
        if required.is_empty() {
            return Ok(ProvisionOutcome::AlreadySatisfied);
        }
        let manager = self.host.manager.ok_or_else(|| {
            SetupError::Provisioning(
                "no supported package manager found (expected apt-get or apk)".to_string(),
            )
        })?;
        let missing = self.missing_packages(manager, required)?;
        if missing.is_empty() {
            debug!(manager = manager.name(), "system packages already present");
            return Ok(ProvisionOutcome::AlreadySatisfied);
        }
        if self.skip_sudo_actions {
            return Ok(ProvisionOutcome::Skipped(missing));
        }
        let elevation = self.elevation()?;
        info!(manager = manager.name(), packages = ?missing, "installing system packages");
        for spec in manager.install_commands(&missing) {
            let elevated = elevate(&spec, elevation);
            let output = self.runner.run(&elevated).map_err(|err| {
                SetupError::Provisioning(format!("failed to run `{}`: {}", elevated.render(), err))
            })?;
            if !output.success() {
                return Err(SetupError::Provisioning(format!(
                    "`{}` failed: {}",
                    spec.render(),
                    output.failure_summary()
                )));
            }
        }
        Ok(ProvisionOutcome::Installed(missing))
    }

    fn missing_packages(
        &self,
        manager: PackageManager,
        required: &BTreeSet<String>,
    ) -> Result<Vec<String>, SetupError> {
        let mut missing = Vec::new();
        for package in required {
            let spec = manager.presence_check(package);
            let output = self.runner.run(&spec).map_err(|err| {
                SetupError::Provisioning(format!("failed to run `{}`: {}", spec.render(), err))
            })?;
            if !manager.is_present(&output) {
                missing.push(package.clone());
            }
        }
        Ok(missing)
    }

    /// Root runs directly. Anyone else must get through sudo; a refused or
    /// impossible elevation stops provisioning before anything is installed.
    fn elevation(&self) -> Result<Elevation, SetupError> {
        if let Some(elevation) = self.elevation.get() {
            return Ok(*elevation);
        }
        let elevation = if self.host.euid == 0 {
            Elevation::Direct
        } else {
            if !self.host.sudo_available {
                return Err(SetupError::InsufficientPrivilege(
                    "system packages need root and sudo is not installed".to_string(),
                ));
            }
            let check = if self.host.interactive {
                CommandSpec::new("sudo").arg("-v").inherit_output()
            } else {
                CommandSpec::new("sudo").args(["-n", "true"])
            };
            let output = self.runner.run(&check).map_err(|err| {
                SetupError::InsufficientPrivilege(format!("cannot run sudo: {err}"))
            })?;
            if !output.success() {
                return Err(SetupError::InsufficientPrivilege(format!(
                    "sudo elevation was refused: {}",
                    output.failure_summary()
                )));
            }
            Elevation::Sudo {
                non_interactive: !self.host.interactive,
            }
        };
        let _ = self.elevation.set(elevation);
        Ok(elevation)
    }

    /// Sets the system clock from `remote` when it drifted beyond the
    /// tolerance. Callers treat every error here as a warning.
    pub fn sync_clock(
        &self,
        settings: &TimeSync,
        remote: DateTime<Utc>,
        local: DateTime<Utc>,
    ) -> Result<ClockOutcome, SetupError> {
        let skew_sec = (remote - local).num_seconds();
        if skew_sec.abs() <= settings.max_skew_sec {
            return Ok(ClockOutcome::InSync { skew_sec });
        }
        if self.skip_sudo_actions {
            return Ok(ClockOutcome::Skipped { skew_sec });
        }
        let elevation = self.elevation()?;
        let spec = CommandSpec::new("date")
            .args(["-u", "-s"])
            .arg(format!("@{}", remote.timestamp()));
        let output = self.runner.run(&elevate(&spec, elevation))?;
        if !output.success() {
            return Err(SetupError::Provisioning(format!(
                "failed to set the clock: {}",
                output.failure_summary()
            )));
        }
        Ok(ClockOutcome::Adjusted { skew_sec })
    }
}

fn elevate(spec: &CommandSpec, elevation: Elevation) -> CommandSpec {
    match elevation {
        Elevation::Direct => spec.clone(),
        Elevation::Sudo { non_interactive } => {
            // sudo resets the environment; overrides ride along via env(1).
            let inner = if spec.env_overrides.is_empty() {
                spec.clone()
            } else {
                let assignments: Vec<String> = spec
                    .env_overrides
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect();
                let mut inner = spec.wrapped_by("env", &assignments);
                inner.env_overrides.clear();
                inner
            };
            let prefix: Vec<String> = if non_interactive {
                vec!["-n".to_string()]
            } else {
                Vec::new()
            };
            inner.wrapped_by("sudo", &prefix)
        }
    }
}

pub fn parse_http_date(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc2822(raw.trim())
        .map(|date| date.with_timezone(&Utc))
        .map_err(|err| format!("unparseable Date header '{raw}': {err}"))
}

/// Authoritative time from the `Date` header of a HEAD request.
pub fn fetch_remote_time(settings: &TimeSync) -> Result<DateTime<Utc>, String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(settings.timeout_sec))
        .build()
        .map_err(|err| err.to_string())?;
    let response = client
        .head(&settings.url)
        .header("User-Agent", "homeway-setup")
        .send()
        .map_err(|err| format!("time request to {} failed: {}", settings.url, err))?;
    let date = response
        .headers()
        .get(reqwest::header::DATE)
        .ok_or_else(|| format!("{} returned no Date header", settings.url))?
        .to_str()
        .map_err(|err| err.to_string())?;
    parse_http_date(date)
}
