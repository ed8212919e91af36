mod detect;
mod error;
mod launch_config;
mod launcher;
mod lock;
mod logging;
mod orchestrator;
mod privilege;
mod provision;
mod runner;
mod settings;
mod update;
mod venv;

use std::env;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use crate::detect::{detect, EnvSnapshot, HostIdentity};
use crate::error::SetupError;
use crate::launch_config::{LaunchConfiguration, PassthroughArgs, Transport};
use crate::logging::{init_logging, LogConfig, LogSink, Reporter, LOG_FILE_NAME};
use crate::orchestrator::Orchestrator;
use crate::privilege::{account_by_name, effective_uid};
use crate::provision::{fetch_remote_time, HostCapabilities};
use crate::runner::SystemRunner;
use crate::settings::{load_settings, resolve_settings_path, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "homeway-setup",
    version,
    about = "Bootstraps, updates and launches the homeway agent"
)]
struct Cli {
    /// Orchestrator settings YAML (defaults to the embedded settings).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision, prepare the runtime environment and run the agent.
    Install {
        #[arg(long, default_value_t = false)]
        update: bool,
        /// Legacy installer flags (-debug, -skipsudoactions, -update,
        /// -ha-ip, -ha-port) or a supervisor handoff.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Advance to the latest release, then run the install chain.
    Update {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the resolved host identity without changing anything.
    Detect {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the configuration the agent would be launched with.
    Render {
        #[arg(long, value_enum)]
        transport: Option<Transport>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Decode a JSON or base64 handoff and print it normalized.
    Decode { payload: String },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
}

struct Context {
    settings_path: Option<PathBuf>,
    json: bool,
}

fn passthrough_of(command: &Commands) -> PassthroughArgs {
    match command {
        Commands::Install { args, .. }
        | Commands::Update { args }
        | Commands::Detect { args }
        | Commands::Config {
            command: ConfigCommand::Render { args, .. },
        } => PassthroughArgs::parse(args),
        Commands::Config {
            command: ConfigCommand::Decode { .. },
        } => PassthroughArgs::default(),
    }
}

fn main() {
    let cli = Cli::parse();
    let debug = cli.debug || passthrough_of(&cli.command).debug;
    let sink = LogSink::default();
    let log_config = LogConfig::from_terminal(debug, cli.json);
    init_logging(&log_config, &sink);
    let mut reporter = Reporter::new(log_config);
    let ctx = Context {
        settings_path: resolve_settings_path(cli.settings.as_ref()),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Install { update, args } => {
            handle_install(&ctx, &mut reporter, &sink, update, &args)
        }
        Commands::Update { args } => handle_install(&ctx, &mut reporter, &sink, true, &args),
        Commands::Detect { args } => handle_detect(&ctx, &args),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    match result {
        Ok(code) => process::exit(code),
        Err(err) => {
            if ctx.json {
                let payload = JsonResult::<serde_json::Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                    error_code: Some(err.kind()),
                    exit_code: Some(err.exit_code()),
                };
                if print_json(&payload).is_err() {
                    eprintln!("{err}");
                }
            } else {
                reporter.banner(&err);
            }
            process::exit(err.exit_code());
        }
    }
}

fn load(ctx: &Context) -> Result<Settings, SetupError> {
    load_settings(ctx.settings_path.as_deref())
}

fn resolve_identity(settings: &Settings, args: &[String]) -> Result<HostIdentity, SetupError> {
    let cwd = env::current_dir().map_err(|err| {
        SetupError::EnvironmentResolution(format!("cannot read the working directory: {err}"))
    })?;
    detect(settings, &EnvSnapshot::capture(), args, &cwd)
}

fn attach_log_file(reporter: &mut Reporter, sink: &LogSink, identity: &HostIdentity) {
    let path = identity.invoking_home_dir.join(LOG_FILE_NAME);
    // Keep the log readable by the user when running elevated.
    let owner = (effective_uid() == 0 && identity.invoking_username != "root")
        .then(|| account_by_name(&identity.invoking_username))
        .flatten();
    match sink.attach(&path, owner.as_ref()) {
        Ok(()) => reporter.set_log_file(path),
        Err(err) => reporter.warn(&format!(
            "cannot write {}: {}; logging to the console only",
            path.display(),
            err
        )),
    }
}

fn handle_install(
    ctx: &Context,
    reporter: &mut Reporter,
    sink: &LogSink,
    update: bool,
    args: &[String],
) -> Result<i32, SetupError> {
    let settings = load(ctx)?;
    let identity = resolve_identity(&settings, args)?;
    attach_log_file(reporter, sink, &identity);
    tracing::info!(
        context = ?identity.execution_context,
        repo = %identity.repo_root_path.display(),
        env = %identity.runtime_env_path.display(),
        user = %identity.invoking_username,
        "host identity resolved"
    );

    let reporter: &Reporter = reporter;
    let update = update || PassthroughArgs::parse(args).update;
    let host = HostCapabilities::current();
    let orchestrator =
        Orchestrator::new(&settings, SystemRunner, reporter, host).with_clock(fetch_remote_time);
    let code = if update {
        orchestrator.update(&identity, args)?
    } else {
        orchestrator.install(&identity, args)?
    };
    if reporter.config().json {
        print_json(&JsonResult {
            ok: true,
            result: Some(json!({ "agent_exit_code": code, "update": update })),
            error: None,
            error_code: None,
            exit_code: Some(code),
        })?;
    }
    Ok(code)
}

fn handle_detect(ctx: &Context, args: &[String]) -> Result<i32, SetupError> {
    let settings = load(ctx)?;
    let identity = resolve_identity(&settings, args)?;
    output(ctx, serde_json::to_value(&identity)?)?;
    Ok(0)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<i32, SetupError> {
    match command {
        ConfigCommand::Render { transport, args } => {
            let settings = load(ctx)?;
            let identity = resolve_identity(&settings, &args)?;
            let config = launch_config::build(&identity, &args)?;
            let transport =
                transport.unwrap_or_else(|| Transport::for_context(identity.execution_context));
            let payload = config.encode(transport)?;
            if ctx.json {
                output(
                    ctx,
                    json!({
                        "execution_context": identity.execution_context,
                        "transport": transport,
                        "payload": payload,
                        "config": config,
                    }),
                )?;
            } else {
                println!("{payload}");
            }
        }
        ConfigCommand::Decode { payload } => {
            let config = LaunchConfiguration::decode(&payload)?;
            output(ctx, serde_json::to_value(&config)?)?;
        }
    }
    Ok(0)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SetupError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_code: None,
            exit_code: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SetupError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
