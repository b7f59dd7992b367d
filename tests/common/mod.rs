#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

use agentq::config::{Config, ProviderConfig};

pub fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git command");
    if !out.status.success() {
        panic!(
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }
    String::from_utf8_lossy(&out.stdout).trim().to_owned()
}

/// A repository on `main` with one commit.
pub fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).expect("mkdir repo");
    git(dir, &["init", "-b", "main"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    std::fs::write(dir.join("README.md"), "hello\n").expect("write");
    git(dir, &["add", "."]);
    git(dir, &["commit", "-m", "init"]);
}

/// Config whose `sim` provider is `sh -c <script>`. Resume arguments land
/// in the script as `$0 = --resume` and `$1 = <session>`.
pub fn sim_config(project: &Path, worktrees: &Path, script: &str) -> Config {
    let mut cfg = Config::default();
    cfg.project_dir = project.to_path_buf();
    cfg.project_name = "demo".to_owned();
    cfg.provider = "sim".to_owned();
    cfg.worktree_dir = worktrees.to_string_lossy().into_owned();
    cfg.workers.stop_grace_secs = 1;
    cfg.workers.lock_timeout_secs = 5;
    cfg.providers.insert(
        "sim".to_owned(),
        ProviderConfig {
            executable: Some("sh".to_owned()),
            args: vec!["-c".to_owned(), script.to_owned()],
            ..ProviderConfig::default()
        },
    );
    cfg
}
