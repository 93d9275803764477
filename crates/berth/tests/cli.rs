//! CLI behavior on the host launcher.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const MANIFEST: &str = r#"
containers:
  box:
    description: plain box
    setup:
    - !EnsureDir /data
    environ:
      GREETING: hello
commands:
  hello: !Command
    container: box
    description: write a marker into the project
    run: 'echo "$GREETING $1" > marker'
  env: !Command
    container: box
    environ: { X: command }
    run: 'test "$X" = cli'
  fail: !Command
    container: box
    run: exit 5
  _hidden: !Command
    container: box
    run: 'true'
  pair: !Supervise
    description: app with database
    kill-unresponsive-after: 0.5
    children:
      db: !Command { container: box, run: sleep 100 }
      app: !Command { container: box, run: exit 1 }
"#;

struct Project {
    temp: TempDir,
}

impl Project {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("project/sub/dir")).unwrap();
        fs::write(temp.path().join("project/berth.yaml"), MANIFEST).unwrap();
        Self { temp }
    }

    fn dir(&self) -> PathBuf {
        fs::canonicalize(self.temp.path().join("project")).unwrap()
    }

    fn state(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    fn berth(&self) -> Command {
        let mut cmd = Command::cargo_bin("berth").unwrap();
        cmd.current_dir(self.dir())
            .env_remove("BERTH_FILE")
            .env("BERTH_ROOT", self.state())
            .env("BERTH_ISOLATION", "host");
        cmd
    }

    fn marker(&self) -> Option<String> {
        fs::read_to_string(self.dir().join("marker")).ok()
    }
}

fn in_dir(mut cmd: Command, dir: &Path) -> Command {
    cmd.current_dir(dir);
    cmd
}

#[test]
fn list_hides_underscore_commands() {
    let project = Project::new();

    project
        .berth()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello"))
        .stdout(predicate::str::contains("app with database"))
        .stdout(predicate::str::contains("_hidden").not());

    project
        .berth()
        .args(["list", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("_hidden"));

    project
        .berth()
        .args(["list", "--containers"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plain box"))
        .stdout(predicate::str::contains("hello").not());
}

#[test]
fn base_dir_is_found_from_subdirectory() {
    let project = Project::new();
    let nested = project.dir().join("sub/dir");

    in_dir(project.berth(), &nested)
        .arg("base-dir")
        .assert()
        .success()
        .stdout(format!("{}\n", project.dir().display()));
}

#[test]
fn missing_manifest_names_the_stage() {
    let temp = tempfile::tempdir().unwrap();

    Command::cargo_bin("berth")
        .unwrap()
        .current_dir(temp.path())
        .env_remove("BERTH_FILE")
        .arg("--file")
        .arg(temp.path().join("berth.yaml"))
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("manifest:"));
}

#[test]
fn run_writes_into_project() {
    let project = Project::new();

    project
        .berth()
        .args(["run", "hello", "world"])
        .assert()
        .success();
    assert_eq!(project.marker().as_deref(), Some("hello world\n"));
}

#[test]
fn run_applies_overrides() {
    let project = Project::new();

    project.berth().args(["run", "env"]).assert().code(1);
    project
        .berth()
        .args(["run", "-E", "X=cli", "env"])
        .assert()
        .success();
}

#[test]
fn exit_code_mirrors_command() {
    let project = Project::new();

    project.berth().args(["run", "fail"]).assert().code(5);
}

#[test]
fn unknown_command_fails() {
    let project = Project::new();

    project
        .berth()
        .args(["run", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Command not found: nope"));
}

#[test]
fn supervised_group_reports_failed_child() {
    let project = Project::new();

    project
        .berth()
        .args(["run", "pair"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed:"))
        .stderr(predicate::str::contains("app"));
}

#[test]
fn build_prints_image_root() {
    let project = Project::new();

    let output = project
        .berth()
        .args(["build", "box"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let root = PathBuf::from(String::from_utf8(output).unwrap().trim());
    assert!(root.starts_with(project.state().join("images")));
    assert!(root.join("data").is_dir());

    project
        .berth()
        .args(["build", "box", "--print-digest"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("^sha256:[0-9a-f]{64}\n$").unwrap());
}

#[test]
fn clean_old_removes_superseded_images() {
    let project = Project::new();
    project.berth().args(["build", "box"]).assert().success();

    let manifest = project.dir().join("berth.yaml");
    let changed = fs::read_to_string(&manifest)
        .unwrap()
        .replace("- !EnsureDir /data", "- !EnsureDir /data\n    - !EnsureDir /cache");
    fs::write(&manifest, changed).unwrap();
    project.berth().args(["build", "box"]).assert().success();

    project
        .berth()
        .args(["clean", "--old"])
        .assert()
        .success()
        .stdout("Removed 1 old image(s)\n");
    project
        .berth()
        .args(["clean", "--old"])
        .assert()
        .success()
        .stdout("Removed 0 old image(s)\n");
}
