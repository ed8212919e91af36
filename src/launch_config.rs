use std::path::PathBuf;

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::detect::{ExecutionContext, HostIdentity};
use crate::error::SetupError;

pub const STANDALONE_STORE_DIR: &str = "homeway-store";
pub const BARE_METAL_STORE_DIR: &str = "data";
pub const LOGS_DIR: &str = "logs";

/// The handoff object given to the agent as its sole argument. Unknown
/// fields are ignored so newer orchestrators can add keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfiguration {
    #[serde(rename = "RepoRootDir", alias = "VersionFileDir")]
    pub repo_root_dir: PathBuf,
    #[serde(rename = "StorageDir")]
    pub storage_dir: PathBuf,
    #[serde(rename = "LogsDir", default, skip_serializing_if = "Option::is_none")]
    pub logs_dir: Option<PathBuf>,
    #[serde(
        rename = "RunningInAddonContext",
        alias = "IsRunningInHaAddonEnv",
        default
    )]
    pub running_in_addon_context: bool,
    #[serde(
        rename = "IsRunningAsStandaloneDocker",
        default,
        skip_serializing_if = "is_false"
    )]
    pub running_as_standalone_docker: bool,
    #[serde(
        rename = "HomeAssistantIp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub home_assistant_ip: Option<String>,
    #[serde(
        rename = "HomeAssistantPort",
        default,
        deserialize_with = "port_from_number_or_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub home_assistant_port: Option<u16>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }
    match Option::<RawPort>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawPort::Number(port)) => Ok(Some(port)),
        Some(RawPort::Text(text)) => parse_port(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("invalid port '{raw}'; expected 1-65535")),
        Ok(port) => Ok(port),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Json,
    Base64,
}

impl Transport {
    /// Supervisor-started containers get base64 so embedded paths survive
    /// any shell quoting; direct launches on a host get plain JSON.
    pub fn for_context(context: ExecutionContext) -> Self {
        match context {
            ExecutionContext::BareMetal => Transport::Json,
            ExecutionContext::GenericContainer | ExecutionContext::ManagedAddOn => {
                Transport::Base64
            }
        }
    }
}

impl LaunchConfiguration {
    pub fn validate(&self) -> Result<(), SetupError> {
        if self.repo_root_dir.as_os_str().is_empty() {
            return Err(SetupError::ConfigurationIncomplete(
                "RepoRootDir is empty".to_string(),
            ));
        }
        if self.storage_dir.as_os_str().is_empty() {
            return Err(SetupError::ConfigurationIncomplete(
                "StorageDir is empty".to_string(),
            ));
        }
        if self
            .logs_dir
            .as_ref()
            .is_some_and(|dir| dir.as_os_str().is_empty())
        {
            return Err(SetupError::ConfigurationIncomplete(
                "LogsDir is present but empty".to_string(),
            ));
        }
        if self
            .home_assistant_ip
            .as_ref()
            .is_some_and(|ip| ip.trim().is_empty())
        {
            return Err(SetupError::ConfigurationIncomplete(
                "HomeAssistantIp is present but empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, SetupError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn encode(&self, transport: Transport) -> Result<String, SetupError> {
        let json = self.to_json()?;
        Ok(match transport {
            Transport::Json => json,
            Transport::Base64 => URL_SAFE.encode(json.as_bytes()),
        })
    }

    fn from_json_bytes(bytes: &[u8]) -> Result<Self, SetupError> {
        let config: LaunchConfiguration = serde_json::from_slice(bytes).map_err(|err| {
            SetupError::ConfigurationIncomplete(format!("malformed launch configuration: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Accepts either transport: raw JSON text or base64 (URL-safe or
    /// standard alphabet) of the same JSON.
    pub fn decode(payload: &str) -> Result<Self, SetupError> {
        let trimmed = payload.trim();
        if trimmed.starts_with('{') {
            return Self::from_json_bytes(trimmed.as_bytes());
        }
        let bytes = decode_base64(trimmed).ok_or_else(|| {
            SetupError::ConfigurationIncomplete(
                "launch configuration is neither JSON nor base64".to_string(),
            )
        })?;
        Self::from_json_bytes(&bytes)
    }

    /// Tells whether a command-line argument is a supervisor handoff.
    /// `None` means the argument is not one at all; `Some(Err)` means it
    /// looks like one but is malformed.
    pub fn sniff(arg: &str) -> Option<Result<Self, SetupError>> {
        let trimmed = arg.trim();
        if trimmed.is_empty() || trimmed.starts_with('-') {
            return None;
        }
        if trimmed.starts_with('{') {
            return Some(Self::from_json_bytes(trimmed.as_bytes()));
        }
        let bytes = decode_base64(trimmed)?;
        let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        if !value.is_object() {
            return None;
        }
        Some(Self::from_json_bytes(&bytes))
    }
}

fn decode_base64(text: &str) -> Option<Vec<u8>> {
    URL_SAFE
        .decode(text)
        .or_else(|_| STANDARD.decode(text))
        .ok()
}

/// Legacy single-dash flags forwarded from install.sh / update.sh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassthroughArgs {
    pub debug: bool,
    pub skip_sudo_actions: bool,
    pub update: bool,
    pub ha_ip: Option<String>,
    pub ha_port: Option<String>,
    pub ignored: Vec<String>,
}

impl PassthroughArgs {
    pub fn parse(args: &[String]) -> Self {
        let mut parsed = PassthroughArgs::default();
        let mut iter = args.iter().peekable();
        while let Some(raw) = iter.next() {
            let lowered = raw.to_lowercase();
            let (flag, inline_value) = match lowered.split_once('=') {
                Some((flag, _)) => (flag.to_string(), raw.split_once('=').map(|(_, v)| v)),
                None => (lowered.clone(), None),
            };
            let flag = flag.trim_start_matches('-');
            match flag {
                "debug" => parsed.debug = true,
                "skipsudoactions" => parsed.skip_sudo_actions = true,
                "update" => parsed.update = true,
                "ha-ip" | "ha-port" => {
                    let value = match inline_value {
                        Some(value) => Some(value.to_string()),
                        None => iter.next_if(|next| !next.starts_with('-')).cloned(),
                    };
                    match value {
                        Some(value) if flag == "ha-ip" => parsed.ha_ip = Some(value),
                        Some(value) => parsed.ha_port = Some(value),
                        None => parsed.ignored.push(raw.clone()),
                    }
                }
                _ => parsed.ignored.push(raw.clone()),
            }
        }
        parsed
    }
}

pub fn validate_identity(identity: &HostIdentity) -> Result<(), SetupError> {
    let required_paths = [
        ("repo_root_path", &identity.repo_root_path),
        ("runtime_env_path", &identity.runtime_env_path),
        ("invoking_home_dir", &identity.invoking_home_dir),
        ("data_root", &identity.data_root),
    ];
    for (field, path) in required_paths {
        if path.as_os_str().is_empty() {
            return Err(SetupError::ConfigurationIncomplete(format!(
                "host identity is missing {field}"
            )));
        }
        if !path.is_absolute() {
            return Err(SetupError::ConfigurationIncomplete(format!(
                "host identity {field} is not absolute: {}",
                path.display()
            )));
        }
    }
    if identity.invoking_username.trim().is_empty() {
        return Err(SetupError::ConfigurationIncomplete(
            "host identity is missing invoking_username".to_string(),
        ));
    }
    if identity.execution_context == ExecutionContext::ManagedAddOn
        && identity.supervisor_payload.is_none()
    {
        return Err(SetupError::ConfigurationIncomplete(
            "managed add-on identity carries no supervisor configuration".to_string(),
        ));
    }
    Ok(())
}

/// Builds the agent handoff. Pure: reads nothing beyond its arguments.
pub fn build(
    identity: &HostIdentity,
    cli_args: &[String],
) -> Result<LaunchConfiguration, SetupError> {
    validate_identity(identity)?;
    let overrides = PassthroughArgs::parse(cli_args);
    let data_root = &identity.data_root;
    let mut config = match identity.execution_context {
        ExecutionContext::ManagedAddOn => match &identity.supervisor_payload {
            Some(payload) => payload.clone(),
            None => {
                return Err(SetupError::ConfigurationIncomplete(
                    "managed add-on identity carries no supervisor configuration".to_string(),
                ))
            }
        },
        ExecutionContext::GenericContainer => LaunchConfiguration {
            repo_root_dir: identity.repo_root_path.clone(),
            storage_dir: data_root.join(STANDALONE_STORE_DIR),
            logs_dir: Some(data_root.join(LOGS_DIR)),
            running_in_addon_context: false,
            running_as_standalone_docker: true,
            home_assistant_ip: None,
            home_assistant_port: None,
        },
        ExecutionContext::BareMetal => LaunchConfiguration {
            repo_root_dir: identity.repo_root_path.clone(),
            storage_dir: data_root.join(BARE_METAL_STORE_DIR),
            logs_dir: Some(data_root.join(LOGS_DIR)),
            running_in_addon_context: false,
            running_as_standalone_docker: false,
            home_assistant_ip: None,
            home_assistant_port: None,
        },
    };

    if let Some(ip) = overrides
        .ha_ip
        .clone()
        .or_else(|| identity.endpoint_hint.ip.clone())
    {
        config.home_assistant_ip = Some(ip);
    }
    if let Some(raw) = overrides
        .ha_port
        .as_deref()
        .or(identity.endpoint_hint.port.as_deref())
    {
        let port = parse_port(raw).map_err(|err| {
            SetupError::ConfigurationIncomplete(format!("HomeAssistantPort: {err}"))
        })?;
        config.home_assistant_port = Some(port);
    }
    if !overrides.ignored.is_empty()
        && identity.execution_context != ExecutionContext::ManagedAddOn
    {
        debug!(ignored = ?overrides.ignored, "ignoring unrecognized passthrough args");
    }
    config.validate()?;
    Ok(config)
}
