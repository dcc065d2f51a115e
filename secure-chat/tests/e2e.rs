use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(15);
const KEY_BITS: &str = "1024";

#[tokio::test]
async fn cli_secure_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("secure_chat");

    let (mut server_child, mut server_stdout) = spawn_server(&binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let mut alice = spawn_client(&binary, "alice", &addr).await?;
    // Once /users is answered, alice's join announcement is already out.
    alice.send_line("/users").await?;
    assert_eq!(read_line_expect(&mut alice.stdout, "alice users header").await?, "Clients in chat: 1");
    assert_eq!(read_line_expect(&mut alice.stdout, "alice users entry").await?, "alice");

    let mut bob = spawn_client(&binary, "bob", &addr).await?;
    let alice_sees_bob = read_line_expect(&mut alice.stdout, "waiting for alice join notice").await?;
    assert_eq!(alice_sees_bob, "*** New user: bob ***");

    // Bob switches to the encrypted channel.
    bob.send_line("/secure").await.context("bob secure")?;
    for expected in [
        "*** Got public key from server! ***",
        "*** Got session key ***",
        "*** Got verification from server! ***",
    ] {
        let line = read_line_expect(&mut bob.stdout, "waiting for bob handshake").await?;
        assert_eq!(line, expected);
    }

    alice.send_line("top secret").await.context("alice send line")?;
    let bob_hears_alice = read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears_alice, "<alice> top secret [ENCRYPTED]");

    bob.send_line("hi alice").await.context("bob send line")?;
    let alice_hears_bob =
        read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert_eq!(alice_hears_bob, "<bob> hi alice");

    // Alice quits; Bob receives the departure notice in clear.
    alice.send_line("/quit").await.context("alice send quit")?;
    let alice_bye = read_line_expect(&mut alice.stdout, "waiting for alice bye").await?;
    assert_eq!(alice_bye, "*** Bye alice ***");
    let bob_sees_departure =
        read_line_expect(&mut bob.stdout, "waiting for bob to see alice leave").await?;
    assert_eq!(bob_sees_departure, "*** User alice has left *** [UNENCRYPTED]");

    bob.send_line("/quit").await.context("bob send quit")?;
    let bob_bye = read_line_expect(&mut bob.stdout, "waiting for bob bye").await?;
    assert_eq!(bob_bye, "*** Bye bob *** [UNENCRYPTED]");

    alice.finish("alice client").await?;
    bob.finish("bob client").await?;

    // The server stays up after clients disconnect; terminate it manually.
    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

struct ClientProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ClientProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Closes stdin so the client's blocking stdin reader returns, then
    /// waits for a clean exit.
    async fn finish(self, name: &str) -> Result<()> {
        let ClientProcess {
            mut child, stdin, ..
        } = self;
        drop(stdin);
        ensure_success(&mut child, name).await
    }
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("server")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .arg("--key-bits")
        .arg(KEY_BITS)
        .env("NO_COLOR", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn spawn_client(binary: &Path, name: &str, addr: &str) -> Result<ClientProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("client")
        .arg("--name")
        .arg(name)
        .arg("--server")
        .arg(addr)
        .arg("--key-bits")
        .arg(KEY_BITS)
        .env("RUST_LOG", "warn")
        .env("NO_COLOR", "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn client {name}"))?;

    let stdin = child
        .stdin
        .take()
        .context("client stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("client stdout missing after spawn")?;

    let mut process = ClientProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    };

    let banner = read_line_expect(&mut process.stdout, "waiting for banner").await?;
    let prompt = read_line_expect(&mut process.stdout, "waiting for name prompt").await?;
    let welcome = read_line_expect(&mut process.stdout, "waiting for welcome").await?;
    if !banner.contains("secure-chat") || prompt != "Enter your name." {
        return Err(anyhow!("unexpected greeting: '{banner}' / '{prompt}'"));
    }
    if welcome != format!("Hello {name}! (Type \"/help\" for usage!)") {
        return Err(anyhow!("expected welcome for {name}, got '{welcome}'"));
    }

    Ok(process)
}

async fn read_line_expect(
    reader: &mut BufReader<ChildStdout>,
    description: &str,
) -> Result<String> {
    match read_line(reader).await {
        Ok(Some(line)) => Ok(line),
        Ok(None) => Err(anyhow!("{description}: stream closed")),
        Err(err) => Err(err.context(format!("{description}: failed to read line"))),
    }
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}

async fn ensure_success(child: &mut Child, name: &str) -> Result<()> {
    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to await {name} process"))?;
    if !status.success() {
        return Err(anyhow!("{name} exited with status {status}"));
    }
    Ok(())
}
