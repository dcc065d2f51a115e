use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    crypto::{CryptoProvider, RsaAesProvider},
    handshake::ClientChannel,
    protocol::{self, Line, write_line},
};

const ENCRYPT_FAILED: &str = "*** Encrypting failed! ***";

pub async fn run(config: ClientConfig) -> Result<()> {
    let stream = TcpStream::connect(&config.server)
        .await
        .with_context(|| format!("failed to connect to {}", config.server))?;
    info!("connected to {}", config.server);

    let crypto: Arc<dyn CryptoProvider> = Arc::new(RsaAesProvider::new(config.key_bits));
    let mut client = ChatClient::new(ClientChannel::generate(crypto).await);

    let (reader, writer) = stream.into_split();
    client
        .run(
            BufReader::new(reader),
            writer,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            config.name,
        )
        .await
}

/// What the terminal should do with one line from the server.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    pub display: Option<String>,
    pub reply: Option<String>,
    pub stop: bool,
}

pub struct ChatClient {
    channel: ClientChannel,
}

impl ChatClient {
    pub fn new(channel: ClientChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &ClientChannel {
        &self.channel
    }

    /// Interprets a line received from the server.
    pub fn handle_server_line(&mut self, raw: &str) -> Reaction {
        match Line::parse(raw) {
            Line::PublicKey(offer) => {
                self.channel.note_server_key(offer);
                Reaction {
                    display: Some("*** Got public key from server! ***".to_string()),
                    ..Reaction::default()
                }
            }
            Line::SessionKey(payload) => Reaction {
                reply: self
                    .channel
                    .accept_session_key(&payload)
                    .map(|line| line.to_string()),
                display: Some("*** Got session key ***".to_string()),
                stop: false,
            },
            Line::VerifyKey(ok) => {
                let verified = self.channel.confirm(ok);
                debug!(verified, "server answered the key verification");
                let display = if verified {
                    "*** Got verification from server! ***"
                } else {
                    "*** Server could not verify the session key ***"
                };
                Reaction {
                    display: Some(display.to_string()),
                    ..Reaction::default()
                }
            }
            _ => {
                let display = self.channel.open_incoming(raw);
                Reaction {
                    stop: protocol::is_bye(&display),
                    display: Some(display),
                    reply: None,
                }
            }
        }
    }

    /// Wire lines to send for one line of user input.
    pub fn prepare_outgoing(&mut self, input: &str) -> Vec<String> {
        let mut wire = vec![self.seal(input)];
        if Line::parse(input) == Line::Secure {
            wire.push(self.channel.begin().to_string());
        }
        wire
    }

    fn seal(&self, text: &str) -> String {
        match self.channel.seal(text) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(error = %err, "could not encrypt outgoing line");
                ENCRYPT_FAILED.to_string()
            }
        }
    }

    /// Runs until the server says bye or the connection drops. When `input`
    /// ends, `/quit` is sent and the loop waits for the server's goodbye.
    pub async fn run<R, W, I, O>(
        &mut self,
        server: R,
        mut writer: W,
        input: I,
        mut output: O,
        name: Option<String>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        if let Some(name) = name {
            write_line(&mut writer, &name).await?;
        }

        // `Lines::next_line` is cancel safe, a plain `read_line` inside
        // `select!` is not.
        let mut server = server.lines();
        let mut input = input.lines();
        let mut input_open = true;
        loop {
            select! {
                line = server.next_line() => {
                    let Some(line) = line? else {
                        print_line(&mut output, "*** Server closed the connection").await?;
                        break;
                    };
                    if !self.handle_line_from_server(&line, &mut writer, &mut output).await? {
                        break;
                    }
                }
                typed = input.next_line(), if input_open => {
                    match typed? {
                        Some(text) if text.trim().is_empty() => {}
                        Some(text) => self.send_input(&text, &mut writer).await?,
                        None => {
                            input_open = false;
                            self.send_input(protocol::QUIT, &mut writer).await?;
                        }
                    }
                }
            }
        }

        if let Err(err) = writer.shutdown().await {
            debug!(error = ?err, "failed to shut down connection cleanly");
        }
        Ok(())
    }

    async fn handle_line_from_server<W, O>(
        &mut self,
        line: &str,
        writer: &mut W,
        output: &mut O,
    ) -> Result<bool>
    where
        W: AsyncWrite + Unpin,
        O: AsyncWrite + Unpin,
    {
        let reaction = self.handle_server_line(line);
        if let Some(reply) = &reaction.reply {
            write_line(writer, reply).await?;
        }
        if let Some(display) = &reaction.display {
            print_line(output, display).await?;
        }
        Ok(!reaction.stop)
    }

    async fn send_input<W>(&mut self, text: &str, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        for wire in self.prepare_outgoing(text) {
            write_line(writer, &wire).await?;
        }
        Ok(())
    }
}

/// Terminal output. Unlike [`write_line`] it accepts any text, decrypted
/// payloads included.
async fn print_line<O>(output: &mut O, line: &str) -> io::Result<()>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}
