use std::path::Path;

use serde::Serialize;
use tracing::info;

use crate::error::{SetupError, UpdateStage};
use crate::privilege::Invoker;
use crate::runner::{CommandOutput, CommandSpec};
use crate::settings::Update;

/// The newest published release, as seen by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseReference {
    pub tag: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub release: ReleaseReference,
    pub agent_exit_code: i32,
}

/// Advances the repository to the latest release, then hands over to the
/// normal provision and launch chain. Strictly linear; the first failing
/// stage aborts everything after it and nothing is retried.
pub struct UpdateController<'a> {
    invoker: &'a dyn Invoker,
    repo_root: &'a Path,
    settings: &'a Update,
}

impl<'a> UpdateController<'a> {
    /// `invoker` must act as the owner of `repo_root`.
    pub fn new(invoker: &'a dyn Invoker, repo_root: &'a Path, settings: &'a Update) -> Self {
        Self {
            invoker,
            repo_root,
            settings,
        }
    }

    pub fn run<F>(&self, chain: F) -> Result<UpdateReport, SetupError>
    where
        F: FnOnce(&ReleaseReference) -> Result<i32, SetupError>,
    {
        let release = self.advance()?;
        info!(stage = %UpdateStage::RunProvisionerAndLauncher, tag = %release.tag, "update stage");
        let agent_exit_code = chain(&release)?;
        Ok(UpdateReport {
            release,
            agent_exit_code,
        })
    }

    /// Every stage up to and including PULL.
    pub fn advance(&self) -> Result<ReleaseReference, SetupError> {
        let remote = self.settings.remote.as_str();
        let branch = self.settings.branch.as_str();

        self.stage(
            UpdateStage::FetchTags,
            &["fetch", "--tags", "--force", remote],
        )?;
        let release = self.resolve_latest()?;
        info!(tag = %release.tag, commit = %release.commit, "latest release resolved");
        // Local edits and untracked files are discarded unconditionally;
        // ignored files stay.
        self.stage(UpdateStage::ResetLocalState, &["reset", "--hard", "HEAD"])?;
        self.stage(UpdateStage::ResetLocalState, &["clean", "-fd"])?;
        self.stage(UpdateStage::CheckoutMain, &["checkout", branch])?;
        self.stage(UpdateStage::Pull, &["pull", "--ff-only", remote, branch])?;
        Ok(release)
    }

    fn resolve_latest(&self) -> Result<ReleaseReference, SetupError> {
        let tags = self.stage(
            UpdateStage::ResolveLatest,
            &["tag", "--list", "--sort=-version:refname"],
        )?;
        let tag = tags
            .stdout_text()
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                SetupError::stage(UpdateStage::ResolveLatest, "the remote has no release tags")
            })?;
        let commit = self
            .stage(UpdateStage::ResolveLatest, &["rev-list", "-n", "1", tag.as_str()])?
            .stdout_text();
        if commit.is_empty() {
            return Err(SetupError::stage(
                UpdateStage::ResolveLatest,
                format!("tag {tag} does not resolve to a commit"),
            ));
        }
        Ok(ReleaseReference { tag, commit })
    }

    fn stage(&self, stage: UpdateStage, args: &[&str]) -> Result<CommandOutput, SetupError> {
        info!(stage = %stage, invoker = %self.invoker.describe(), "update stage");
        let spec = CommandSpec::new("git")
            .args(args.iter().copied())
            .cwd(self.repo_root)
            .env("GIT_TERMINAL_PROMPT", "0");
        let output = self.invoker.invoke(&spec).map_err(|err| match err {
            // Impersonation problems keep their own code.
            SetupError::PrivilegeSwitch(_) => err,
            other => SetupError::stage(stage, other.to_string()),
        })?;
        if !output.success() {
            return Err(SetupError::stage(stage, output.failure_summary()));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privilege::DirectInvoker;
    use crate::runner::mock::{failed, ok, MockRunner};
    use crate::runner::SystemRunner;
    use std::fs;
    use std::path::PathBuf;
    use std::process::Command;
    use tempfile::tempdir;

    fn answer_tags(runner: &MockRunner, tags: &'static str) {
        runner.respond(move |spec| match spec.args.first().map(String::as_str) {
            Some("tag") => Some(ok(tags)),
            Some("rev-list") => Some(ok("3f2a9c1")),
            _ => None,
        });
    }

    #[test]
    fn stages_run_in_order_under_the_invoker() {
        let runner = MockRunner::default();
        answer_tags(&runner, "v1.4.0\nv1.3.2\n");
        let invoker = DirectInvoker::new(&runner);
        let settings = Update::default();
        let repo = Path::new("/srv/homeway");
        let report = UpdateController::new(&invoker, repo, &settings)
            .run(|release| {
                assert_eq!(release.tag, "v1.4.0");
                Ok(3)
            })
            .unwrap();
        assert_eq!(report.agent_exit_code, 3);
        assert_eq!(
            report.release,
            ReleaseReference {
                tag: "v1.4.0".into(),
                commit: "3f2a9c1".into()
            }
        );
        assert_eq!(
            runner.rendered(),
            vec![
                "git fetch --tags --force origin",
                "git tag --list --sort=-version:refname",
                "git rev-list -n 1 v1.4.0",
                "git reset --hard HEAD",
                "git clean -fd",
                "git checkout main",
                "git pull --ff-only origin main",
            ]
        );
        assert!(runner
            .calls()
            .iter()
            .all(|spec| spec.cwd.as_deref() == Some(repo)));
    }

    #[test]
    fn failing_stage_is_named_and_stops_the_chain() {
        let runner = MockRunner::default();
        answer_tags(&runner, "v1.0.0");
        runner.respond(|spec| {
            (spec.args.first().map(String::as_str) == Some("checkout"))
                .then(|| failed(1, "error: pathspec 'main' did not match"))
        });
        let invoker = DirectInvoker::new(&runner);
        let settings = Update::default();
        let err = UpdateController::new(&invoker, Path::new("/srv/homeway"), &settings)
            .run(|_| panic!("chain must not run after a failed stage"))
            .unwrap_err();
        match &err {
            SetupError::UpdateStage { stage, message } => {
                assert_eq!(*stage, UpdateStage::CheckoutMain);
                assert!(message.contains("pathspec"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(err.exit_code(), 15);
        assert!(!runner.rendered().iter().any(|cmd| cmd.contains("pull")));
    }

    #[test]
    fn no_tags_fails_resolve_latest() {
        let runner = MockRunner::default();
        answer_tags(&runner, "");
        let invoker = DirectInvoker::new(&runner);
        let settings = Update::default();
        let err = UpdateController::new(&invoker, Path::new("/srv/homeway"), &settings)
            .advance()
            .unwrap_err();
        assert!(err.to_string().contains("RESOLVE_LATEST"));
    }

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .output()
            .expect("run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// A bare remote with release v1.0.0 and a working clone of it.
    fn published_repo(root: &Path) -> (PathBuf, PathBuf) {
        git(root, &["init", "--bare", "--initial-branch=main", "remote.git"]);
        git(root, &["clone", "remote.git", "seed"]);
        let seed = root.join("seed");
        git(&seed, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        fs::write(seed.join("app.txt"), "v1\n").unwrap();
        git(&seed, &["add", "app.txt"]);
        git(&seed, &["commit", "-m", "v1"]);
        git(&seed, &["tag", "v1.0.0"]);
        git(&seed, &["push", "origin", "main", "--tags"]);
        git(root, &["clone", "remote.git", "work"]);
        (seed, root.join("work"))
    }

    fn publish(seed: &Path, tag: &str) -> String {
        git(seed, &["add", "-A"]);
        git(seed, &["commit", "-m", tag]);
        git(seed, &["tag", tag]);
        git(seed, &["push", "origin", "main", "--tags"]);
        git(seed, &["rev-parse", "HEAD"])
    }

    fn advance(work: &Path) -> Result<ReleaseReference, SetupError> {
        let invoker = DirectInvoker::new(SystemRunner);
        let settings = Update::default();
        UpdateController::new(&invoker, work, &settings).advance()
    }

    #[test]
    fn local_edits_do_not_survive_an_update() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempdir().unwrap();
        let (seed, work) = published_repo(dir.path());
        fs::write(seed.join("app.txt"), "v2\n").unwrap();
        let expected_head = publish(&seed, "v1.1.0");

        fs::write(work.join("app.txt"), "operator hack\n").unwrap();
        fs::write(work.join("stray.txt"), "scratch\n").unwrap();

        let release = advance(&work).unwrap();
        assert_eq!(release.tag, "v1.1.0");
        assert_eq!(release.commit, expected_head);
        assert_eq!(fs::read_to_string(work.join("app.txt")).unwrap(), "v2\n");
        assert!(!work.join("stray.txt").exists());
        assert_eq!(git(&work, &["status", "--porcelain"]), "");
        assert_eq!(git(&work, &["rev-parse", "HEAD"]), expected_head);
    }

    #[test]
    fn untracked_file_shadowing_a_release_file_does_not_block_pull() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempdir().unwrap();
        let (seed, work) = published_repo(dir.path());
        fs::write(seed.join("new.py"), "print('release')\n").unwrap();
        let expected_head = publish(&seed, "v1.1.0");

        fs::write(work.join("new.py"), "print('local')\n").unwrap();

        let release = advance(&work).unwrap();
        assert_eq!(release.commit, expected_head);
        assert_eq!(
            fs::read_to_string(work.join("new.py")).unwrap(),
            "print('release')\n"
        );
        assert_eq!(git(&work, &["rev-parse", "HEAD"]), expected_head);
    }
}
