//! Interrupts delivered to berth while a command runs.

use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_manifest::Manifest;
use berth_runtime::{Runner, RuntimeConfig};
use berth_sandbox::{HostLauncher, Isolation, ProcessExit};

const MANIFEST: &str = r#"
containers:
  box: {}
commands:
  serve: !Command
    container: box
    run: 'touch serve.started && exec sleep 100'
"#;

#[test_log::test(tokio::test)]
async fn sigint_is_forwarded_to_the_command() {
    let temp = tempfile::tempdir().unwrap();
    let project = temp.path().join("project");
    fs::create_dir(&project).unwrap();
    let config = RuntimeConfig::default()
        .with_root(temp.path().join("state"))
        .with_isolation(Isolation::Host);
    let runner = Runner::with_launcher(config, Arc::new(HostLauncher::new()));
    let manifest = Manifest::from_yaml(MANIFEST, project.clone()).unwrap();

    let command = tokio::spawn(async move { runner.run(&manifest, "serve", &[], &[]).await });

    let marker = project.join("serve.started");
    let deadline = Instant::now() + Duration::from_secs(10);
    while !marker.exists() {
        assert!(Instant::now() < deadline, "command did not start");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // SAFETY: kill(2) on our own pid; the runner listens for SIGINT before
    // the command starts.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(libc::getpid(), libc::SIGINT) };
    assert_eq!(rc, 0);

    let exit = tokio::time::timeout(Duration::from_secs(10), command)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(exit, ProcessExit::Signaled(libc::SIGINT));
    assert_eq!(exit.code(), 130);
}
