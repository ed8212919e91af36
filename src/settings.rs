use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SetupError;

pub const DEFAULT_SETTINGS_YAML: &str = include_str!("../config/default.yaml");
pub const SETTINGS_ENV: &str = "HOMEWAY_SETUP_CONFIG";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub version: u32,
    pub detection: Detection,
    pub runtime: Runtime,
    pub agent: Agent,
    pub packages: Packages,
    pub time_sync: TimeSync,
    pub update: Update,
    pub storage: Storage,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Detection {
    pub container_marker: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Runtime {
    pub env_dir_name: String,
    pub interpreter: String,
    pub requirements: PathBuf,
    pub ready_marker: String,
    pub optional_packages: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Agent {
    pub module: String,
    pub working_subdir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Packages {
    pub apt: BTreeSet<String>,
    pub apk: BTreeSet<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TimeSync {
    pub enabled: bool,
    pub url: String,
    pub timeout_sec: u64,
    pub max_skew_sec: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Update {
    pub remote: String,
    pub branch: String,
    pub helper_script: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Storage {
    pub bare_metal_dir: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            detection: Detection::default(),
            runtime: Runtime::default(),
            agent: Agent::default(),
            packages: Packages::default(),
            time_sync: TimeSync::default(),
            update: Update::default(),
            storage: Storage::default(),
        }
    }
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            container_marker: PathBuf::from("/.homeway-standalone-docker"),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            env_dir_name: "homeway-env".to_string(),
            interpreter: "python3".to_string(),
            requirements: PathBuf::from("requirements.txt"),
            ready_marker: ".homeway-env-ready".to_string(),
            optional_packages: vec!["zstandard>=0.21.0,<0.23.0".to_string()],
        }
    }
}

impl Default for Agent {
    fn default() -> Self {
        Self {
            module: "homeway_linuxhost".to_string(),
            working_subdir: "homeway".to_string(),
        }
    }
}

impl Default for Packages {
    fn default() -> Self {
        let set = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            apt: set(&["curl", "python3", "python3-pip", "python3-venv", "virtualenv"]),
            apk: set(&["curl", "python3", "py3-pip", "py3-virtualenv"]),
        }
    }
}

impl Default for TimeSync {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://google.com".to_string(),
            timeout_sec: 5,
            max_skew_sec: 120,
        }
    }
}

impl Default for Update {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            branch: "main".to_string(),
            helper_script: "update-homeway.sh".to_string(),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            bare_metal_dir: ".homeway".to_string(),
        }
    }
}

pub fn resolve_settings_path(override_path: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = override_path {
        return Some(path.clone());
    }
    match env::var(SETTINGS_ENV) {
        Ok(path) if !path.trim().is_empty() => Some(PathBuf::from(path)),
        _ => None,
    }
}

pub fn read_settings_from_str(content: &str) -> Result<Settings, SetupError> {
    let settings: Settings = serde_yaml::from_str(content)?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn load_settings(path: Option<&Path>) -> Result<Settings, SetupError> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|err| {
                SetupError::Settings(format!(
                    "failed to read settings file {}: {}",
                    path.display(),
                    err
                ))
            })?;
            read_settings_from_str(&content)
        }
        None => read_settings_from_str(DEFAULT_SETTINGS_YAML),
    }
}

fn require_name(value: &str, field: &str) -> Result<(), SetupError> {
    if value.trim().is_empty() {
        return Err(SetupError::Settings(format!("{field} must not be empty")));
    }
    if value.contains('/') {
        return Err(SetupError::Settings(format!(
            "{field} must be a plain name, not a path: {value}"
        )));
    }
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<(), SetupError> {
    if settings.version != 1 {
        return Err(SetupError::Settings(format!(
            "unsupported settings version {}; expected 1",
            settings.version
        )));
    }
    if !settings.detection.container_marker.is_absolute() {
        return Err(SetupError::Settings(format!(
            "detection.container_marker must be absolute: {}",
            settings.detection.container_marker.display()
        )));
    }
    require_name(&settings.runtime.env_dir_name, "runtime.env_dir_name")?;
    require_name(&settings.runtime.ready_marker, "runtime.ready_marker")?;
    require_name(&settings.storage.bare_metal_dir, "storage.bare_metal_dir")?;
    require_name(&settings.update.helper_script, "update.helper_script")?;
    if settings.runtime.interpreter.trim().is_empty() {
        return Err(SetupError::Settings(
            "runtime.interpreter must not be empty".to_string(),
        ));
    }
    if settings.runtime.requirements.is_absolute() {
        return Err(SetupError::Settings(format!(
            "runtime.requirements must be relative to the repository root: {}",
            settings.runtime.requirements.display()
        )));
    }
    if settings.agent.module.trim().is_empty() {
        return Err(SetupError::Settings("agent.module must not be empty".to_string()));
    }
    if settings.update.remote.trim().is_empty() || settings.update.branch.trim().is_empty() {
        return Err(SetupError::Settings(
            "update.remote and update.branch must not be empty".to_string(),
        ));
    }
    if settings.time_sync.enabled {
        if settings.time_sync.timeout_sec == 0 {
            return Err(SetupError::Settings(
                "time_sync.timeout_sec must be greater than zero".to_string(),
            ));
        }
        if !settings.time_sync.url.starts_with("http://")
            && !settings.time_sync.url.starts_with("https://")
        {
            return Err(SetupError::Settings(format!(
                "time_sync.url must be an http(s) url: {}",
                settings.time_sync.url
            )));
        }
    }
    Ok(())
}
