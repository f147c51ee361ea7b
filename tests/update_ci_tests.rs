mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use hwci::job::Category;

use test_harness::{eventually, test_config, FakeToolchain, FakeTransport, TestServer, TOKEN};

const PULL: &str = "git pull --ff-only";

#[tokio::test]
async fn test_update_waits_for_queued_work() {
    let targets = TempDir::new().unwrap();
    std::fs::create_dir_all(targets.path().join("rivals")).unwrap();
    std::fs::write(targets.path().join("rivals/max78000.bin"), b"fw").unwrap();

    let mut config = test_config(&["ci@rig1", "ci@rig2"], &["ci@board1"]);
    config.distribution.targets_dir = targets.path().to_path_buf();
    let transport = FakeTransport::new();
    transport.set_run_delay(Duration::from_millis(200));
    let toolchain = Arc::new(FakeToolchain::new().with_delay(Duration::from_millis(200)));
    let server = TestServer::start(config, transport.clone(), toolchain).await;
    let ctx = server.ctx.clone();

    let update = async {
        let builds = ctx.builds();
        let attacks = ctx.queue(Category::Attack);
        eventually("work to be queued", || {
            builds.len() + builds.in_flight() == 2 && !attacks.is_drained()
        })
        .await;
        server.request(TOKEN, "update-ci", None).await
    };
    let (first, second, attack, update) = tokio::join!(
        server.request(TOKEN, "build-ours", Some("aa22e6b|alice|one|run-1")),
        server.request(TOKEN, "build-ours", Some("bb33f7c|bob|two|run-2")),
        server.request(TOKEN, "attack-target", Some("rivals")),
        update,
    );

    for output in [&first, &second, &attack] {
        assert!(output.ends_with("%*&0\n"), "output: {output}");
    }
    assert!(update.starts_with("[CONN] Updating CI\n[UPDATE] Waiting for queued jobs to finish...\n"));
    assert!(update.contains("[UPDATE] Updating ci@rig1..."));
    assert!(update.contains("[UPDATE] Updating ci@rig2..."));
    assert!(update.contains("[UPDATE] Updating ci@board1..."));
    assert!(update.contains("[UPDATE] All hosts updated!"));
    assert!(update.ends_with("%*&0\n"), "output: {update}");

    let execs = transport.execs();
    let last_run = execs
        .iter()
        .rposition(|e| e.command.contains("run-tests") || e.command.contains("run-attack"))
        .unwrap();
    let first_pull = execs.iter().position(|e| e.command.contains(PULL)).unwrap();
    assert!(first_pull > last_run, "hosts updated while work was running");
    assert_eq!(
        execs.iter().filter(|e| e.command.contains("run-")).count(),
        3
    );

    // TEST pool first, each pool in startup order
    let pulled: Vec<_> = execs
        .iter()
        .filter(|e| e.command.contains(PULL))
        .map(|e| e.host.as_str())
        .collect();
    assert_eq!(pulled, vec!["ci@rig1", "ci@rig2", "ci@board1"]);

    server.stop().await;
}

#[tokio::test]
async fn test_update_skips_disconnected_hosts() {
    let transport = FakeTransport::new();
    let server = TestServer::start(
        test_config(&["ci@rig1", "ci@rig2"], &[]),
        transport.clone(),
        Arc::new(FakeToolchain::new()),
    )
    .await;
    server.ctx.pool(Category::Test).retire("ci@rig1");

    let output = server.request(TOKEN, "update-ci", None).await;
    assert!(output.contains("[UPDATE] Skipping disconnected host ci@rig1"));
    assert!(!output.contains("[UPDATE] Updating ci@rig1..."));
    assert!(output.contains("[UPDATE] Updating ci@rig2..."));
    assert!(output.ends_with("%*&0\n"));

    let hosts: Vec<_> = transport.execs().into_iter().map(|e| e.host).collect();
    assert_eq!(hosts, vec!["ci@rig2".to_string()]);

    server.stop().await;
}

#[tokio::test]
async fn test_update_stops_at_first_failure() {
    let transport = FakeTransport::new();
    transport.fail_commands_containing(PULL);
    let server = TestServer::start(
        test_config(&["ci@rig1", "ci@rig2"], &[]),
        transport.clone(),
        Arc::new(FakeToolchain::new()),
    )
    .await;

    let output = server.request(TOKEN, "update-ci", None).await;
    assert!(output.contains("[UPDATE] Failed to update ci@rig1!"));
    assert!(output.contains("remote command failed"));
    assert!(!output.contains("ci@rig2"));
    assert!(output.ends_with("%*&1\n"), "output: {output}");
    assert_eq!(transport.execs().len(), 1);

    server.stop().await;
}
