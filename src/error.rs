use std::fmt;
use std::io;

use serde::Serialize;
use thiserror::Error;

/// Named stages of the self-update state machine, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateStage {
    FetchTags,
    ResolveLatest,
    ResetLocalState,
    CheckoutMain,
    Pull,
    RunProvisionerAndLauncher,
}

impl UpdateStage {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStage::FetchTags => "FETCH_TAGS",
            UpdateStage::ResolveLatest => "RESOLVE_LATEST",
            UpdateStage::ResetLocalState => "RESET_LOCAL_STATE",
            UpdateStage::CheckoutMain => "CHECKOUT_MAIN",
            UpdateStage::Pull => "PULL",
            UpdateStage::RunProvisionerAndLauncher => "RUN_PROVISIONER_AND_LAUNCHER",
        }
    }
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("environment resolution error: {0}")]
    EnvironmentResolution(String),
    #[error("insufficient privilege: {0}")]
    InsufficientPrivilege(String),
    #[error("runtime environment busy: {0}")]
    EnvironmentBusy(String),
    #[error("privilege switch error: {0}")]
    PrivilegeSwitch(String),
    #[error("configuration incomplete: {0}")]
    ConfigurationIncomplete(String),
    #[error("self-update failed at {stage}: {message}")]
    UpdateStage { stage: UpdateStage, message: String },
    #[error("system package provisioning failed: {0}")]
    Provisioning(String),
    #[error("runtime environment creation failed: {0}")]
    EnvironmentCreation(String),
    #[error("agent launch failed: {0}")]
    Launch(String),
    #[error("settings error: {0}")]
    Settings(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SetupError {
    /// Exit codes for bootstrap failures, all within 10..=19. The agent's
    /// own exit code is propagated verbatim and nothing stops the agent from
    /// exiting with a code in this band too. A bare exit status therefore
    /// cannot tell the two apart; the failure banner on stderr, or the
    /// `error_code` field under `--json`, is what marks a bootstrap failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            SetupError::EnvironmentResolution(_) => 10,
            SetupError::InsufficientPrivilege(_) => 11,
            SetupError::EnvironmentBusy(_) => 12,
            SetupError::PrivilegeSwitch(_) => 13,
            SetupError::ConfigurationIncomplete(_) => 14,
            SetupError::UpdateStage { .. } => 15,
            SetupError::Provisioning(_) => 16,
            SetupError::EnvironmentCreation(_) => 17,
            SetupError::Launch(_) => 18,
            SetupError::Settings(_)
            | SetupError::Process(_)
            | SetupError::Io(_)
            | SetupError::Json(_)
            | SetupError::Yaml(_) => 19,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SetupError::EnvironmentResolution(_) => "EnvironmentResolutionError",
            SetupError::InsufficientPrivilege(_) => "InsufficientPrivilegeError",
            SetupError::EnvironmentBusy(_) => "EnvironmentBusyError",
            SetupError::PrivilegeSwitch(_) => "PrivilegeSwitchError",
            SetupError::ConfigurationIncomplete(_) => "ConfigurationIncompleteError",
            SetupError::UpdateStage { .. } => "UpdateStageError",
            SetupError::Provisioning(_) => "ProvisioningError",
            SetupError::EnvironmentCreation(_) => "EnvironmentCreationError",
            SetupError::Launch(_) => "LaunchError",
            SetupError::Settings(_) => "SettingsError",
            SetupError::Process(_) => "ProcessError",
            SetupError::Io(_) => "IoError",
            SetupError::Json(_) => "JsonError",
            SetupError::Yaml(_) => "YamlError",
        }
    }

    pub fn stage(stage: UpdateStage, message: impl Into<String>) -> Self {
        SetupError::UpdateStage {
            stage,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn bootstrap_exit_codes_are_distinct_and_nonzero() {
        let errors = vec![
            SetupError::EnvironmentResolution(String::new()),
            SetupError::InsufficientPrivilege(String::new()),
            SetupError::EnvironmentBusy(String::new()),
            SetupError::PrivilegeSwitch(String::new()),
            SetupError::ConfigurationIncomplete(String::new()),
            SetupError::stage(UpdateStage::Pull, ""),
            SetupError::Provisioning(String::new()),
            SetupError::EnvironmentCreation(String::new()),
            SetupError::Launch(String::new()),
            SetupError::Settings(String::new()),
        ];
        let codes: BTreeSet<i32> = errors.iter().map(SetupError::exit_code).collect();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|code| (10..=19).contains(code)));
    }

    #[test]
    fn stage_error_names_the_stage() {
        let err = SetupError::stage(UpdateStage::ResetLocalState, "index.lock exists");
        assert_eq!(
            err.to_string(),
            "self-update failed at RESET_LOCAL_STATE: index.lock exists"
        );
    }
}
