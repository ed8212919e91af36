use std::env;
use std::fs::File;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dialoguer::console::style;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::SetupError;
use crate::privilege::{chown_file, open_no_follow, Account};

pub const LOG_FILE_NAME: &str = "homeway-setup.log";
pub const LOG_FILTER_ENV: &str = "HOMEWAY_SETUP_LOG";
const OPERATOR_TARGET: &str = "operator";

/// Everything the logging component needs, passed explicitly instead of
/// living in global colour variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub debug: bool,
    pub color: bool,
    /// Operator lines go to stderr so stdout stays machine-readable.
    pub json: bool,
    pub log_file: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_terminal(debug: bool, json: bool) -> Self {
        let color = env::var_os("NO_COLOR").is_none() && io::stderr().is_terminal();
        Self {
            debug,
            color,
            json,
            log_file: None,
        }
    }
}

/// A log file that can be attached after the subscriber is installed.
/// Events recorded before `attach` are dropped.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    pub fn attach(&self, path: &Path, owner: Option<&Account>) -> Result<(), SetupError> {
        let file = open_no_follow(path, 0o644)?;
        if let Some(account) = owner {
            chown_file(&file, account)?;
        }
        let mut slot = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(file);
        Ok(())
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut slot = self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = LogSink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn console_filter() -> EnvFilter {
    let base = env::var(LOG_FILTER_ENV).unwrap_or_else(|_| "debug".to_string());
    // Operator lines already reach the terminal through the reporter.
    EnvFilter::new(format!("{base},{OPERATOR_TARGET}=off"))
}

/// Installs the global subscriber: a stderr layer only in debug mode, and a
/// file layer that records everything once the sink is attached.
pub fn init_logging(config: &LogConfig, sink: &LogSink) {
    let console = config.debug.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_ansi(config.color)
            .with_target(false)
            .with_filter(console_filter())
    });
    let file = tracing_subscriber::fmt::layer()
        .with_writer(sink.clone())
        .with_ansi(false)
        .with_filter(EnvFilter::new("debug"));
    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .ok();
}

/// Operator-facing output. Every line is mirrored into the log file.
#[derive(Debug, Clone)]
pub struct Reporter {
    config: LogConfig,
}

impl Reporter {
    pub fn new(config: LogConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn set_log_file(&mut self, path: PathBuf) {
        self.config.log_file = Some(path);
    }

    fn emit(&self, rendered: String) {
        if self.config.json {
            eprintln!("{rendered}");
        } else {
            println!("{rendered}");
        }
    }

    pub fn header(&self, title: &str) {
        tracing::info!(target: OPERATOR_TARGET, "== {title} ==");
        self.emit(format!(
            "\n{}",
            style(title).bold().cyan().force_styling(self.config.color)
        ));
    }

    pub fn info(&self, message: &str) {
        tracing::info!(target: OPERATOR_TARGET, "{message}");
        self.emit(message.to_string());
    }

    pub fn success(&self, message: &str) {
        tracing::info!(target: OPERATOR_TARGET, "{message}");
        self.emit(
            style(message)
                .green()
                .force_styling(self.config.color)
                .to_string(),
        );
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(target: OPERATOR_TARGET, "{message}");
        self.emit(
            style(format!("warning: {message}"))
                .yellow()
                .force_styling(self.config.color)
                .to_string(),
        );
    }

    /// The clearly marked diagnostic printed before a non-zero exit.
    pub fn banner(&self, err: &SetupError) {
        tracing::error!(target: OPERATOR_TARGET, code = err.exit_code(), "{err}");
        eprintln!("{}", render_banner(err, self.config.color));
        if let Some(path) = &self.config.log_file {
            eprintln!("Full log: {}", path.display());
        }
    }
}

pub fn render_banner(err: &SetupError, color: bool) -> String {
    let rule = "-".repeat(60);
    let title = format!("homeway setup failed ({}, exit {})", err.kind(), err.exit_code());
    format!(
        "{}\n{}\n{}\n{}",
        style(&rule).red().force_styling(color),
        style(title).bold().red().force_styling(color),
        style(err.to_string()).red().force_styling(color),
        style(&rule).red().force_styling(color),
    )
}
