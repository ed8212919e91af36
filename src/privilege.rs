use std::ffi::{CStr, CString};
use std::fs::{self, File, OpenOptions};
use std::io::IsTerminal;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SetupError;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};

const PASSWD_BUF_START: usize = 4096;
const PASSWD_BUF_MAX: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub home: PathBuf,
}

pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}

fn passwd_lookup<F>(mut lookup: F) -> Option<Account>
where
    F: FnMut(
        *mut libc::passwd,
        *mut libc::c_char,
        libc::size_t,
        *mut *mut libc::passwd,
    ) -> libc::c_int,
{
    let mut buf_len = PASSWD_BUF_START;
    loop {
        let mut buf: Vec<libc::c_char> = vec![0; buf_len];
        // SAFETY: passwd is a plain C struct; all-zero is a valid bit pattern.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = lookup(&mut pwd, buf.as_mut_ptr(), buf.len(), &mut result);
        if rc == libc::ERANGE && buf_len < PASSWD_BUF_MAX {
            buf_len *= 2;
            continue;
        }
        if rc != 0 || result.is_null() {
            return None;
        }
        // SAFETY: on success pw_name and pw_dir point into `buf`, which is
        // still alive, and are NUL-terminated.
        let (name, home) = unsafe {
            (
                CStr::from_ptr(pwd.pw_name).to_string_lossy().into_owned(),
                CStr::from_ptr(pwd.pw_dir).to_string_lossy().into_owned(),
            )
        };
        return Some(Account {
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            name,
            home: PathBuf::from(home),
        });
    }
}

pub fn account_by_uid(uid: u32) -> Option<Account> {
    passwd_lookup(|pwd, buf, len, result| {
        // SAFETY: all pointers are valid for the duration of the call.
        unsafe { libc::getpwuid_r(uid, pwd, buf, len, result) }
    })
}

pub fn account_by_name(name: &str) -> Option<Account> {
    let c_name = CString::new(name).ok()?;
    passwd_lookup(|pwd, buf, len, result| {
        // SAFETY: all pointers are valid for the duration of the call.
        unsafe { libc::getpwnam_r(c_name.as_ptr(), pwd, buf, len, result) }
    })
}

/// Opens `path` for writing, truncated, refusing to follow a symlink at the
/// final component. Used for files written into another user's home.
pub fn open_no_follow(path: &Path, mode: u32) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .custom_flags(libc::O_NOFOLLOW)
        .open(path)
}

/// Hands an open file to `account`. Callers decide whether they are
/// privileged enough to do so.
pub fn chown_file(file: &File, account: &Account) -> std::io::Result<()> {
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::fchown(file.as_raw_fd(), account.uid, account.gid) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Who owns a path versus who is running right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOwnership {
    pub path: PathBuf,
    pub owner_uid: u32,
    pub current_uid: u32,
}

impl ProcessOwnership {
    pub fn inspect(path: &Path) -> Result<Self, SetupError> {
        let meta = fs::metadata(path).map_err(|err| {
            SetupError::PrivilegeSwitch(format!(
                "cannot resolve owner of {}: {}",
                path.display(),
                err
            ))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            owner_uid: meta.uid(),
            current_uid: effective_uid(),
        })
    }

    pub fn requires_switch(&self) -> bool {
        self.owner_uid != self.current_uid
    }

    pub fn owner_account(&self) -> Result<Account, SetupError> {
        account_by_uid(self.owner_uid).ok_or_else(|| {
            SetupError::PrivilegeSwitch(format!(
                "owner uid {} of {} has no passwd entry",
                self.owner_uid,
                self.path.display()
            ))
        })
    }
}

/// Runs commands on behalf of a particular filesystem owner. Callers never
/// learn whether impersonation happens underneath.
pub trait Invoker {
    fn invoke(&self, spec: &CommandSpec) -> Result<CommandOutput, SetupError>;
    fn describe(&self) -> String;
}

pub struct DirectInvoker<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> DirectInvoker<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: CommandRunner> Invoker for DirectInvoker<R> {
    fn invoke(&self, spec: &CommandSpec) -> Result<CommandOutput, SetupError> {
        self.runner.run(spec).map_err(|err| {
            SetupError::Process(format!("failed to run `{}`: {}", spec.render(), err))
        })
    }

    fn describe(&self) -> String {
        "direct".to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevator {
    Sudo { non_interactive: bool },
    Runuser,
}

impl Elevator {
    pub fn detect(current_uid: u32, interactive: bool) -> Result<Self, SetupError> {
        if which::which("sudo").is_ok() {
            return Ok(Elevator::Sudo {
                non_interactive: !interactive,
            });
        }
        if current_uid == 0 && which::which("runuser").is_ok() {
            return Ok(Elevator::Runuser);
        }
        Err(SetupError::PrivilegeSwitch(
            "no impersonation mechanism available (expected sudo, or runuser when root)"
                .to_string(),
        ))
    }

    fn program(self) -> &'static str {
        match self {
            Elevator::Sudo { .. } => "sudo",
            Elevator::Runuser => "runuser",
        }
    }

    fn prefix_args(self, owner: &str) -> Vec<String> {
        let mut args = Vec::new();
        match self {
            Elevator::Sudo { non_interactive } => {
                if non_interactive {
                    args.push("-n".to_string());
                }
                args.extend(["-u", owner, "-H", "--"].map(String::from));
            }
            Elevator::Runuser => {
                args.extend(["-u", owner, "--"].map(String::from));
            }
        }
        args
    }
}

pub struct ImpersonatingInvoker<R: CommandRunner> {
    runner: R,
    owner: Account,
    elevator: Elevator,
}

impl<R: CommandRunner> ImpersonatingInvoker<R> {
    pub fn new(runner: R, owner: Account, elevator: Elevator) -> Self {
        Self {
            runner,
            owner,
            elevator,
        }
    }

    pub fn wrap(&self, spec: &CommandSpec) -> CommandSpec {
        // sudo scrubs the environment, so overrides travel through env(1).
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
        inner.wrapped_by(
            self.elevator.program(),
            &self.elevator.prefix_args(&self.owner.name),
        )
    }
}

fn is_elevator_diagnostic(elevator: Elevator, output: &CommandOutput) -> bool {
    if output.success() {
        return false;
    }
    let prefix = format!("{}:", elevator.program());
    output
        .stderr_text()
        .lines()
        .next()
        .is_some_and(|line| line.starts_with(&prefix))
}

impl<R: CommandRunner> Invoker for ImpersonatingInvoker<R> {
    fn invoke(&self, spec: &CommandSpec) -> Result<CommandOutput, SetupError> {
        let wrapped = self.wrap(spec);
        debug!(owner = %self.owner.name, command = %wrapped.render(), "impersonating owner");
        let output = self.runner.run(&wrapped).map_err(|err| {
            SetupError::PrivilegeSwitch(format!(
                "failed to run `{}` as {}: {}",
                spec.render(),
                self.owner.name,
                err
            ))
        })?;
        if is_elevator_diagnostic(self.elevator, &output) {
            return Err(SetupError::PrivilegeSwitch(format!(
                "cannot run `{}` as {}: {}",
                spec.render(),
                self.owner.name,
                output.stderr_text()
            )));
        }
        Ok(output)
    }

    fn describe(&self) -> String {
        format!("as {} via {}", self.owner.name, self.elevator.program())
    }
}

/// Picks the invoker for the owner of `path`: direct when the effective uid
/// already owns it, impersonating otherwise.
pub fn select_invoker<'a, R: CommandRunner + 'a>(
    runner: R,
    path: &Path,
) -> Result<Box<dyn Invoker + 'a>, SetupError> {
    let ownership = ProcessOwnership::inspect(path)?;
    select_invoker_for(runner, &ownership, stdin_is_terminal())
}

pub fn select_invoker_for<'a, R: CommandRunner + 'a>(
    runner: R,
    ownership: &ProcessOwnership,
    interactive: bool,
) -> Result<Box<dyn Invoker + 'a>, SetupError> {
    if !ownership.requires_switch() {
        return Ok(Box::new(DirectInvoker::new(runner)));
    }
    let owner = ownership.owner_account()?;
    let elevator = Elevator::detect(ownership.current_uid, interactive)?;
    debug!(
        path = %ownership.path.display(),
        owner = %owner.name,
        current_uid = ownership.current_uid,
        "ownership mismatch, impersonating"
    );
    Ok(Box::new(ImpersonatingInvoker::new(runner, owner, elevator)))
}

pub fn run_as_owner<R: CommandRunner>(
    runner: &R,
    path: &Path,
    spec: &CommandSpec,
) -> Result<(i32, String), SetupError> {
    let invoker = select_invoker(runner, path)?;
    let output = invoker.invoke(spec)?;
    Ok((output.status_code, output.stdout_text()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::mock::{failed, ok, MockRunner};
    use crate::runner::SystemRunner;
    use tempfile::tempdir;

    fn pi() -> Account {
        Account {
            uid: 1000,
            gid: 1000,
            name: "pi".to_string(),
            home: PathBuf::from("/home/pi"),
        }
    }

    #[test]
    fn current_account_resolves_by_uid_and_name() {
        let account = account_by_uid(effective_uid()).expect("current account");
        let by_name = account_by_name(&account.name).expect("lookup by name");
        assert_eq!(account, by_name);
    }

    #[test]
    fn unknown_user_has_no_account() {
        assert!(account_by_name("homeway-no-such-user-42").is_none());
        assert!(account_by_name("bad\0name").is_none());
    }

    #[test]
    fn owned_path_needs_no_switch() {
        let dir = tempdir().unwrap();
        let ownership = ProcessOwnership::inspect(dir.path()).unwrap();
        assert!(!ownership.requires_switch());
        let invoker = select_invoker_for(SystemRunner, &ownership, false).unwrap();
        assert_eq!(invoker.describe(), "direct");
    }

    #[test]
    fn missing_path_is_a_privilege_switch_error() {
        let dir = tempdir().unwrap();
        let err = ProcessOwnership::inspect(&dir.path().join("gone")).unwrap_err();
        assert!(matches!(err, SetupError::PrivilegeSwitch(_)));
    }

    #[test]
    fn run_as_owner_runs_directly_for_own_path() {
        let dir = tempdir().unwrap();
        let spec = CommandSpec::new("sh")
            .arg("-c")
            .arg("echo owned; exit 4")
            .cwd(dir.path());
        let (code, stdout) = run_as_owner(&SystemRunner, dir.path(), &spec).unwrap();
        assert_eq!(code, 4);
        assert_eq!(stdout, "owned");
    }

    #[test]
    fn sudo_wrapping_targets_owner_and_carries_env() {
        let runner = MockRunner::default();
        let invoker = ImpersonatingInvoker::new(
            &runner,
            pi(),
            Elevator::Sudo {
                non_interactive: true,
            },
        );
        let spec = CommandSpec::new("git")
            .arg("pull")
            .env("GIT_TERMINAL_PROMPT", "0");
        invoker.invoke(&spec).unwrap();
        assert_eq!(
            runner.rendered(),
            vec!["sudo -n -u pi -H -- env GIT_TERMINAL_PROMPT=0 git pull"]
        );
        assert!(runner.calls()[0].env_overrides.is_empty());
    }

    #[test]
    fn runuser_wrapping_has_no_sudo_flags() {
        let runner = MockRunner::default();
        let invoker = ImpersonatingInvoker::new(&runner, pi(), Elevator::Runuser);
        invoker.invoke(&CommandSpec::new("git").arg("status")).unwrap();
        assert_eq!(runner.rendered(), vec!["runuser -u pi -- git status"]);
        assert_eq!(invoker.describe(), "as pi via runuser");
    }

    #[test]
    fn refused_impersonation_is_a_privilege_switch_error() {
        let runner = MockRunner::default();
        runner.push_output(failed(1, "sudo: a password is required\n"));
        let invoker = ImpersonatingInvoker::new(
            &runner,
            pi(),
            Elevator::Sudo {
                non_interactive: true,
            },
        );
        let err = invoker.invoke(&CommandSpec::new("git").arg("pull")).unwrap_err();
        assert!(matches!(err, SetupError::PrivilegeSwitch(_)));
        assert_eq!(err.exit_code(), 13);
    }

    #[test]
    fn command_failure_under_owner_is_returned_not_raised() {
        let runner = MockRunner::default();
        runner.push_output(failed(128, "fatal: not a git repository"));
        runner.push_output(ok("main"));
        let invoker = ImpersonatingInvoker::new(
            &runner,
            pi(),
            Elevator::Sudo {
                non_interactive: false,
            },
        );
        let output = invoker.invoke(&CommandSpec::new("git").arg("pull")).unwrap();
        assert_eq!(output.status_code, 128);
        assert_eq!(runner.rendered(), vec!["sudo -u pi -H -- git pull"]);
    }

    #[test]
    fn open_no_follow_refuses_symlinks() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, "keep\n").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        assert!(open_no_follow(&link, 0o644).is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "keep\n");

        let plain = dir.path().join("plain");
        fs::write(&plain, "stale").unwrap();
        open_no_follow(&plain, 0o644).unwrap();
        assert_eq!(fs::read_to_string(&plain).unwrap(), "");
    }

    #[test]
    fn impersonated_command_creates_files_owned_by_owner() {
        // Needs root and a real unprivileged account; skip otherwise.
        if effective_uid() != 0 || which::which("sudo").is_err() {
            return;
        }
        let Some(nobody) = account_by_name("nobody") else {
            return;
        };
        let dir = tempdir().unwrap();
        chown_file(&File::open(dir.path()).unwrap(), &nobody).unwrap();
        let marker = dir.path().join("marker");
        let spec = CommandSpec::new("touch").path_arg(&marker);
        let (code, _) = run_as_owner(&SystemRunner, dir.path(), &spec).unwrap();
        assert_eq!(code, 0);
        assert_eq!(fs::metadata(&marker).unwrap().uid(), nobody.uid);
    }
}
