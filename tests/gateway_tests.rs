mod test_harness;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use hwci::gateway::Gateway;
use hwci::job::Category;
use hwci::status::UpdateType;

use test_harness::{
    test_config, test_context, within, FakeToolchain, FakeTransport, TestServer, TOKEN,
};

async fn start(transport: Arc<FakeTransport>) -> TestServer {
    let targets = std::env::temp_dir();
    let mut config = test_config(&[], &[]);
    config.distribution.targets_dir = targets;
    TestServer::start(config, transport, Arc::new(FakeToolchain::new())).await
}

#[tokio::test]
async fn test_valid_build_request_is_queued() {
    let ctx = test_context(test_config(&["ci@rig1"], &[]));
    let gateway = Gateway::new(ctx.clone(), FakeTransport::new());

    let (client, server) = tokio::io::duplex(4096);
    let (server_read, server_write) = tokio::io::split(server);
    let handler = tokio::spawn(async move {
        gateway
            .handle("duplex".to_string(), server_read, server_write)
            .await
    });

    let (client_read, mut client_write) = tokio::io::split(client);
    let mut client_read = BufReader::new(client_read);
    client_write
        .write_all(format!("{TOKEN}|build-ours\n").as_bytes())
        .await
        .unwrap();
    let mut ack = String::new();
    within(client_read.read_line(&mut ack)).await.unwrap();
    assert_eq!(ack, "[CONN] Building our design\n");

    client_write
        .write_all(b"aa22e6b|alice|fix uart|run-1\n")
        .await
        .unwrap();
    within(handler).await.unwrap().unwrap();

    assert_eq!(ctx.builds().len(), 1);
    let latest = ctx.status().latest();
    assert_eq!(latest.update.kind, UpdateType::Queue);
    let queued = &latest.build.queue[0];
    let commit = queued.commit.as_ref().unwrap();
    assert_eq!(commit.hash, "aa22e6b");
    assert_eq!(commit.author, "alice");
    assert_eq!(commit.message, "fix uart");
    assert_eq!(commit.run_id, "run-1");
}

#[tokio::test]
async fn test_invalid_hash_is_rejected() {
    let server = start(FakeTransport::new()).await;

    let output = server
        .request(TOKEN, "build-ours", Some("ZZ22e6b|alice|fix uart|run-1"))
        .await;
    assert_eq!(
        output,
        "[CONN] Building our design\n[CONN] Invalid hash ZZ22e6b\n"
    );
    assert!(server.ctx.builds().is_drained());

    let output = server
        .request(TOKEN, "build-ours", Some("aa22e6b|alice|fix uart|../etc"))
        .await;
    assert!(output.ends_with("[CONN] Invalid run id ../etc\n"));

    let output = server
        .request(TOKEN, "build-ours", Some("aa22e6b|alice"))
        .await;
    assert!(output.ends_with("[CONN] Malformed frame, expected 4 fields\n"));
    assert!(server.ctx.builds().is_drained());

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_token_gets_no_response() {
    let server = start(FakeTransport::new()).await;

    let output = server
        .request("guess", "build-ours", Some("aa22e6b|alice|fix uart|run-1"))
        .await;
    assert_eq!(output, "");

    // the command is not even looked at
    let output = server.request("guess", "reboot", None).await;
    assert_eq!(output, "");
    assert!(server.ctx.builds().is_drained());

    server.stop().await;
}

#[tokio::test]
async fn test_team_path_traversal_is_rejected() {
    let server = start(FakeTransport::new()).await;

    let output = server
        .request(TOKEN, "attack-target", Some("team/evil"))
        .await;
    assert_eq!(
        output,
        "[CONN] Attacking target design\n[CONN] Invalid team team/evil\n"
    );

    let output = server
        .request(
            TOKEN,
            "attack-script",
            Some("team/evil|https://example.com/glitch.py"),
        )
        .await;
    assert!(output.ends_with("[CONN] Invalid team team/evil\n"));

    let output = server
        .request(TOKEN, "attack-target", Some(".."))
        .await;
    assert!(output.ends_with("[CONN] Invalid team ..\n"));

    assert!(server.ctx.queue(Category::Attack).is_drained());
    server.stop().await;
}

#[tokio::test]
async fn test_attack_script_url_is_validated() {
    let server = start(FakeTransport::new()).await;

    let output = server
        .request(TOKEN, "attack-script", Some("rivals|ftp://example.com/a.py"))
        .await;
    assert!(output.ends_with("[CONN] Invalid script url ftp://example.com/a.py\n"));

    let output = server
        .request(TOKEN, "attack-script", Some("rivals|not a url"))
        .await;
    assert!(output.ends_with("[CONN] Invalid script url not a url\n"));

    let output = server
        .request(TOKEN, "attack-script", Some("rivals"))
        .await;
    assert!(output.ends_with("[CONN] Malformed frame, expected 2 fields\n"));

    assert!(server.ctx.queue(Category::Attack).is_drained());
    server.stop().await;
}

#[tokio::test]
async fn test_attack_requests_are_queued() {
    let server = start(FakeTransport::new()).await;
    let ctx = server.ctx.clone();
    let addr = server.addr;

    // no attack hosts: the jobs stay queued and the clients stay connected
    let mut clients = Vec::new();
    for (command, payload) in [
        ("attack-target", "rivals"),
        ("attack-script", "rivals|https://example.com/glitch.py"),
    ] {
        let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        writer
            .write_all(format!("{TOKEN}|{command}").as_bytes())
            .await
            .unwrap();
        let mut ack = String::new();
        within(reader.read_line(&mut ack)).await.unwrap();
        writer.write_all(payload.as_bytes()).await.unwrap();
        clients.push((reader, writer));
    }

    let queue = ctx.queue(Category::Attack);
    test_harness::eventually("two attack jobs", || queue.in_flight() + queue.len() == 2).await;
    let latest = ctx.status().latest();
    assert_eq!(latest.update.kind, UpdateType::Queue);

    drop(clients);
    server.stop().await;
}

#[tokio::test]
async fn test_unknown_command_gets_diagnostic() {
    let server = start(FakeTransport::new()).await;

    let output = server.request(TOKEN, "reboot", None).await;
    assert_eq!(output, "[CONN] Unknown command reboot\n");

    // the listener survives bad clients
    let output = server.request(TOKEN, "update-ci", None).await;
    assert!(output.starts_with("[CONN] Updating CI\n"));
    assert!(output.ends_with("%*&0\n"));

    server.stop().await;
}
