use std::collections::BTreeMap;
use std::env;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::SetupError;
use crate::launch_config::LaunchConfiguration;
use crate::privilege::{account_by_name, account_by_uid, effective_uid};
use crate::settings::Settings;

/// The fixed set of environment variables the orchestrator reads.
pub const CONSUMED_ENV_VARS: [&str; 8] = [
    "REPO_DIR",
    "VENV_DIR",
    "DATA_DIR",
    "HOME",
    "USER",
    "SUDO_USER",
    "HOME_ASSISTANT_IP",
    "HOME_ASSISTANT_PORT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionContext {
    BareMetal,
    GenericContainer,
    ManagedAddOn,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EndpointHint {
    pub ip: Option<String>,
    pub port: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostIdentity {
    pub repo_root_path: PathBuf,
    pub runtime_env_path: PathBuf,
    pub invoking_username: String,
    pub invoking_home_dir: PathBuf,
    pub execution_context: ExecutionContext,
    pub data_root: PathBuf,
    pub endpoint_hint: EndpointHint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor_payload: Option<LaunchConfiguration>,
}

/// Environment variables captured once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot {
    vars: BTreeMap<String, String>,
}

impl EnvSnapshot {
    pub fn capture() -> Self {
        let vars = CONSUMED_ENV_VARS
            .iter()
            .filter_map(|key| env::var(key).ok().map(|value| (key.to_string(), value)))
            .collect();
        Self { vars }
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            vars: pairs
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
        }
    }

    /// Set and non-blank.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

fn resolution_error(message: impl Into<String>) -> SetupError {
    SetupError::EnvironmentResolution(message.into())
}

fn is_writable_dir(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

fn absolutize(path: &str, cwd: &Path) -> PathBuf {
    let path = PathBuf::from(path);
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

fn required_existing_dir(env: &EnvSnapshot, key: &str, cwd: &Path) -> Result<PathBuf, SetupError> {
    let raw = env
        .get(key)
        .ok_or_else(|| resolution_error(format!("{key} must be set in a container context")))?;
    let path = absolutize(raw, cwd);
    if !path.is_dir() {
        return Err(resolution_error(format!(
            "{key} points to a missing directory: {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Returns the handoff if the sole argument is a supervisor contract.
fn supervisor_payload(args: &[String]) -> Option<Result<LaunchConfiguration, SetupError>> {
    match args {
        [only] => LaunchConfiguration::sniff(only),
        _ => None,
    }
}

struct Invoker {
    name: String,
    home: PathBuf,
}

fn resolve_invoker(env: &EnvSnapshot) -> Result<Invoker, SetupError> {
    // Elevated via sudo: the person behind it is the invoker, not root.
    if let Some(sudo_user) = env.get("SUDO_USER").filter(|name| *name != "root") {
        let account = account_by_name(sudo_user).ok_or_else(|| {
            resolution_error(format!("SUDO_USER '{sudo_user}' has no passwd entry"))
        })?;
        return Ok(Invoker {
            name: account.name,
            home: account.home,
        });
    }
    let current = account_by_uid(effective_uid());
    let name = env
        .get("USER")
        .map(str::to_string)
        .or_else(|| current.as_ref().map(|account| account.name.clone()))
        .ok_or_else(|| resolution_error("cannot determine the invoking user"))?;
    let home = env
        .get("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .or_else(|| current.map(|account| account.home))
        .ok_or_else(|| resolution_error("cannot determine a home directory; set HOME"))?;
    Ok(Invoker { name, home })
}

fn endpoint_hint(env: &EnvSnapshot) -> EndpointHint {
    EndpointHint {
        ip: env.get("HOME_ASSISTANT_IP").map(str::to_string),
        port: env.get("HOME_ASSISTANT_PORT").map(str::to_string),
    }
}

/// Classifies the host and resolves every path the later stages need.
/// Nothing on disk is touched.
pub fn detect(
    settings: &Settings,
    env: &EnvSnapshot,
    args: &[String],
    cwd: &Path,
) -> Result<HostIdentity, SetupError> {
    let marker = &settings.detection.container_marker;
    let context = if marker.exists() {
        ExecutionContext::GenericContainer
    } else {
        match supervisor_payload(args) {
            Some(Ok(_)) => ExecutionContext::ManagedAddOn,
            Some(Err(err)) => return Err(err),
            None => ExecutionContext::BareMetal,
        }
    };
    debug!(?context, marker = %marker.display(), "classified execution context");

    let invoker = resolve_invoker(env)?;
    let identity = match context {
        ExecutionContext::GenericContainer => {
            let repo_root = required_existing_dir(env, "REPO_DIR", cwd)?;
            let data_root = required_existing_dir(env, "DATA_DIR", cwd)?;
            let runtime_env = env
                .get("VENV_DIR")
                .map(|raw| absolutize(raw, cwd))
                .ok_or_else(|| resolution_error("VENV_DIR must be set in a container context"))?;
            if !is_writable_dir(&data_root) {
                return Err(resolution_error(format!(
                    "DATA_DIR is not writable: {}",
                    data_root.display()
                )));
            }
            HostIdentity {
                repo_root_path: repo_root,
                runtime_env_path: runtime_env,
                invoking_username: invoker.name,
                invoking_home_dir: invoker.home,
                execution_context: context,
                data_root,
                endpoint_hint: endpoint_hint(env),
                supervisor_payload: None,
            }
        }
        ExecutionContext::ManagedAddOn => {
            let payload = match supervisor_payload(args) {
                Some(Ok(payload)) => payload,
                _ => return Err(resolution_error("supervisor configuration vanished")),
            };
            let runtime_env = env
                .get("VENV_DIR")
                .map(|raw| absolutize(raw, cwd))
                .ok_or_else(|| resolution_error("VENV_DIR must be set in a managed add-on"))?;
            if !is_writable_dir(&payload.storage_dir) {
                return Err(resolution_error(format!(
                    "StorageDir from the supervisor is not a writable directory: {}",
                    payload.storage_dir.display()
                )));
            }
            HostIdentity {
                repo_root_path: absolutize(&payload.repo_root_dir.to_string_lossy(), cwd),
                runtime_env_path: runtime_env,
                invoking_username: invoker.name,
                invoking_home_dir: invoker.home,
                execution_context: context,
                data_root: payload.storage_dir.clone(),
                endpoint_hint: endpoint_hint(env),
                supervisor_payload: Some(payload),
            }
        }
        ExecutionContext::BareMetal => {
            let home = invoker.home;
            if !home.is_absolute() {
                return Err(resolution_error(format!(
                    "home directory is not absolute: {}",
                    home.display()
                )));
            }
            if !is_writable_dir(&home) {
                return Err(resolution_error(format!(
                    "home directory is missing or not writable: {}",
                    home.display()
                )));
            }
            let repo_root = match env.get("REPO_DIR") {
                Some(raw) => absolutize(raw, cwd),
                None => cwd.to_path_buf(),
            };
            if !repo_root.is_dir() {
                return Err(resolution_error(format!(
                    "repository root does not exist: {}",
                    repo_root.display()
                )));
            }
            let runtime_env = env
                .get("VENV_DIR")
                .map(|raw| absolutize(raw, cwd))
                .unwrap_or_else(|| home.join(&settings.runtime.env_dir_name));
            HostIdentity {
                repo_root_path: repo_root,
                runtime_env_path: runtime_env,
                invoking_username: invoker.name,
                data_root: home.join(&settings.storage.bare_metal_dir),
                invoking_home_dir: home,
                execution_context: context,
                endpoint_hint: endpoint_hint(env),
                supervisor_payload: None,
            }
        }
    };
    Ok(identity)
}
