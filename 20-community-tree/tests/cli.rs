use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use assert_cmd::Command as BinCommand;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(3);

fn binary() -> &'static Path {
    Path::new(env!("CARGO_BIN_EXE_community-node"))
}

fn roster_file(json: &str) -> Result<NamedTempFile> {
    let file = NamedTempFile::new()?;
    std::fs::write(file.path(), json)?;
    Ok(file)
}

const ROSTER: &str = r#"{
    "communities": [{
        "id": "c1",
        "name": "garden",
        "created_at": "1960-01-01T00:00:00Z",
        "self_key": "me",
        "members": [
            {"key": "me", "address": "127.0.0.1:1664", "joined_at": "2000-01-01T00:00:00Z"}
        ]
    }]
}"#;

#[test]
fn serve_fails_without_a_roster() {
    BinCommand::new(binary())
        .args(["serve", "--roster", "/nonexistent/roster.json"])
        .env("RUST_LOG", "off")
        .assert()
        .failure();
}

#[test]
fn serve_refuses_an_empty_roster() -> Result<()> {
    let roster = roster_file(r#"{"communities": []}"#)?;
    BinCommand::new(binary())
        .arg("serve")
        .arg("--roster")
        .arg(roster.path())
        .env("RUST_LOG", "off")
        .assert()
        .failure();
    Ok(())
}

#[test]
fn ping_fails_against_a_closed_port() -> Result<()> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);
    let target = addr.to_string();

    BinCommand::new(binary())
        .args(["ping", "--target", target.as_str(), "--community", "c1"])
        .env("RUST_LOG", "off")
        .assert()
        .failure();
    Ok(())
}

#[tokio::test]
async fn served_node_answers_ping() -> Result<()> {
    let roster = roster_file(ROSTER)?;
    let (mut node, mut stdout) = spawn_node(roster.path()).await?;
    let addr = read_listen_addr(&mut stdout).await?;

    let output = Command::new(binary())
        .args(["ping", "--target", addr.as_str(), "--community", "c1"])
        .env("RUST_LOG", "off")
        .output()
        .await
        .context("failed to run ping")?;
    assert!(output.status.success(), "ping failed: {output:?}");
    let stdout_text = String::from_utf8(output.stdout)?;
    assert_eq!(stdout_text.trim(), format!("PONG from {addr}"));

    let _ = node.kill().await;
    let _ = node.wait().await;
    Ok(())
}

async fn spawn_node(roster: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary());
    cmd.arg("serve")
        .arg("--roster")
        .arg(roster)
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG", "off")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd.spawn().context("failed to spawn node")?;
    let stdout = child
        .stdout
        .take()
        .context("node stdout missing after spawn")?;
    Ok((child, BufReader::new(stdout)))
}

async fn read_listen_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let mut line = String::new();
    let read = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("timed out waiting for the listening banner"))??;
    if read == 0 {
        return Err(anyhow!("node exited before listening"));
    }
    let addr = line
        .trim()
        .strip_prefix("node listening on ")
        .with_context(|| format!("unexpected banner: {line:?}"))?;
    Ok(addr.to_string())
}
