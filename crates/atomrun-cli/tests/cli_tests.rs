//! End-to-end tests of the `atomrun` binary.
//!
//! Each test writes a settings file into a scratch directory and runs the
//! built binary against it.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run")).unwrap();
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn write_settings(&self) -> PathBuf {
        let settings = format!(
            r#"databases:
  master:
    style: local
    path: {library}
run_directories:
  main: {run}
calculations:
  E_vs_r_scan:
    program: sh
    args: ["-c", "printf '{{\"energy\": -3.5}}' > results.json", "calc"]
runner:
  log_directory: {logs}
"#,
            library = self.path("library").display(),
            run = self.path("run").display(),
            logs = self.path("logs").display(),
        );
        let path = self.path("settings.yaml");
        std::fs::write(&path, settings).unwrap();
        path
    }

    fn add_job(&self, name: &str) {
        let dir = self.path("run").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("calc_E_vs_r_scan.in"), "r 2.0 6.0 0.1\n").unwrap();
    }

    fn atomrun(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_atomrun"))
            .args(args)
            .current_dir(self.dir.path())
            .env_remove("ATOMRUN_SETTINGS")
            .env_remove("ATOMRUN_LOG_DIR")
            .env_remove("ATOMRUN_BIDTRIES")
            .output()
            .unwrap()
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_help_lists_commands() {
    let ws = Workspace::new();
    let output = ws.atomrun(&["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["runner", "multi", "clean", "reposition", "sleep", "check-runners", "status", "serve"] {
        assert!(text.contains(command), "{command} missing from help");
    }
}

#[cfg(unix)]
#[test]
fn test_runner_drains_run_directory() {
    let ws = Workspace::new();
    let settings = ws.write_settings();
    ws.add_job("job-a");
    ws.add_job("job-b");

    let output = ws.atomrun(&["--settings", arg(&settings), "runner", "master", "main"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("No simulations left to run"));
    assert!(!ws.path("run/job-a").exists());
    assert!(!ws.path("run/job-b").exists());

    let status = ws.atomrun(&["--settings", arg(&settings), "status", "master"]);
    assert!(status.status.success(), "{}", stderr(&status));
    let text = stdout(&status);
    assert!(text.contains("calculation_E_vs_r_scan (2 records)"));

    let audit = ws.atomrun(&["--settings", arg(&settings), "check-runners"]);
    assert!(audit.status.success(), "{}", stderr(&audit));
    assert!(stdout(&audit).contains("finished"));
}

#[cfg(unix)]
#[test]
fn test_multi_runner_tasks() {
    let ws = Workspace::new();
    let settings = ws.write_settings();
    for i in 0..6 {
        ws.add_job(&format!("job-{i}"));
    }

    let output = ws.atomrun(&[
        "--settings",
        arg(&settings),
        "multi",
        "master",
        "main",
        "--workers",
        "3",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("6 finished"));
    assert_eq!(std::fs::read_dir(ws.path("run")).unwrap().count(), 0);
}

#[test]
fn test_unknown_database_fails() {
    let ws = Workspace::new();
    let settings = ws.write_settings();

    let output = ws.atomrun(&["--settings", arg(&settings), "runner", "nope", "main"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("Unknown database"));
}

#[test]
fn test_sleep_on_empty_directory() {
    let ws = Workspace::new();
    let settings = ws.write_settings();

    let output = ws.atomrun(&["--settings", arg(&settings), "sleep", "main", "1s", "1s"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("is empty"));

    let bad = ws.atomrun(&["--settings", arg(&settings), "sleep", "main", "soon", "1s"]);
    assert_eq!(bad.status.code(), Some(1));
    assert!(stderr(&bad).contains("Invalid duration"));
}

#[test]
fn test_check_runners_without_logs() {
    let ws = Workspace::new();
    let logs = ws.path("logs");
    std::fs::create_dir_all(&logs).unwrap();

    let output = ws.atomrun(&["check-runners", "--log-dir", arg(&logs)]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).contains("No runner logs found."));
}
