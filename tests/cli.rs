//! CLI test cases.
//!
//! None of these need `pdftocairo` or `tesseract`. They only exercise the
//! parts of a run that come before any external tool is started.

use std::{fs, path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use predicates::prelude::*;
use tempfile::TempDir;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("ocr-batch-runner").unwrap()
}

/// A data directory with a config file pointing at it.
struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new(manifest: &str) -> Workspace {
        let dir = TempDir::with_prefix("cli").unwrap();
        let data_dir = dir.path().join("data");
        fs::create_dir_all(data_dir.join("pdfs")).unwrap();
        fs::create_dir_all(data_dir.join("working")).unwrap();
        fs::write(data_dir.join("pdf_batch_allocation.csv"), manifest).unwrap();
        fs::write(
            dir.path().join("ocr_runner.toml"),
            format!("data_dir = {:?}\nworker_count = 2\n", data_dir.display().to_string()),
        )
        .unwrap();
        Workspace { dir }
    }

    fn data_dir(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn touch_pdf(&self, name: &str) {
        fs::write(self.data_dir().join("pdfs").join(name), b"%PDF-1.4").unwrap();
    }

    fn lock(&self, batch_id: u32) {
        fs::write(
            self.data_dir().join("working").join(format!("batch_{batch_id:02}.lock")),
            b"",
        )
        .unwrap();
    }

    fn cmd(&self, machine_id: Option<&str>) -> Command {
        let mut cmd = cmd();
        cmd.current_dir(self.dir.path())
            .env("HOME", self.dir.path())
            .env_remove("RUST_LOG")
            .arg("--config")
            .arg(self.dir.path().join("ocr_runner.toml"));
        match machine_id {
            Some(id) => cmd.env("OCR_MACHINE_ID", id),
            None => cmd.env_remove("OCR_MACHINE_ID"),
        };
        cmd
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }
}

const MANIFEST: &str = "path,batch_id,machine_allocation\n\
a.pdf,1,m1\n\
b.pdf,1,m1\n\
c.pdf,2,m1\n\
d.pdf,3,m2\n";

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema() {
    cmd()
        .args(["schema", "Config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("worker_count"));
    cmd()
        .args(["schema", "AllocationRecord"])
        .assert()
        .success()
        .stdout(predicate::str::contains("machine_allocation"));
}

#[test]
fn test_allocation_report() {
    let ws = Workspace::new(MANIFEST);
    ws.touch_pdf("a.pdf");
    ws.touch_pdf("c.pdf");
    ws.lock(2);
    ws.cmd(Some("m1"))
        .arg("allocation")
        .assert()
        .success()
        .stdout(
            "batch_id,documents,missing,locked\n\
             1,1,1,false\n\
             2,1,0,true\n",
        );
}

#[test]
fn test_config_json_uses_config_file() {
    let ws = Workspace::new(MANIFEST);
    let working_dir = ws.data_dir().join("working").display().to_string();
    ws.cmd(None)
        .args(["config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(working_dir))
        .stdout(predicate::str::contains("\"worker_count\": 2"));
}

#[test]
fn test_explicit_config_does_not_need_home() {
    let ws = Workspace::new(MANIFEST);
    let working_dir = ws.data_dir().join("working").display().to_string();
    ws.cmd(None)
        .env_remove("HOME")
        .args(["config", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(working_dir));
}

#[test]
fn test_run_with_all_batches_locked() {
    let ws = Workspace::new(MANIFEST);
    ws.touch_pdf("a.pdf");
    ws.lock(1);
    ws.lock(2);
    ws.cmd(Some("m1")).arg("run").assert().success();
    assert!(!ws.data_dir().join("working/batch_01").exists());
}

#[test]
fn test_run_without_machine_id_does_nothing() {
    let ws = Workspace::new(MANIFEST);
    ws.cmd(None).arg("run").assert().success();
    assert_eq!(fs::read_dir(ws.data_dir().join("working")).unwrap().count(), 0);
}

#[test]
fn test_run_rejects_malformed_manifest() {
    let ws = Workspace::new("path,batch\na.pdf,1\n");
    ws.cmd(Some("m1"))
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("machine_allocation"));
}

#[test]
fn test_log_file() {
    let ws = Workspace::new(MANIFEST);
    let log_path = ws.path("run.log");
    ws.cmd(None)
        .arg("--log-file")
        .arg(&log_path)
        .arg("config")
        .assert()
        .success();
    let log = fs::read_to_string(log_path).unwrap();
    assert!(log.contains("worker_count: 2"));
}
