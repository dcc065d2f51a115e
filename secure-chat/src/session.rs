//! The per-connection chat loop.
//!
//! A session walks `Connecting -> Named -> Active <-> Handshaking -> Closing
//! -> Closed`. Whatever ends the loop (`/quit`, EOF, an I/O error or the idle
//! timeout) the session runs the same cleanup: announce the departure, send
//! the `*** Bye` line, leave the pool and shut the writer down.

use std::{io, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use tokio::io::AsyncBufRead;
use tracing::{debug, info, warn};

use crate::{
    handshake::SecureChannel,
    pool::{ConnectionPool, Outgoing, SessionHandle},
    protocol::{self, KeyOffer, Line, read_line},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Named,
    Active,
    Handshaking,
    Closing,
    Closed,
}

enum Flow {
    Continue,
    Quit,
}

pub struct ChatSession {
    handle: SessionHandle,
    pool: Arc<ConnectionPool>,
    channel: SecureChannel,
    idle_timeout: Option<Duration>,
    state: SessionState,
    /// Set once the join notice went out; only then is a leave announced.
    joined: bool,
}

impl ChatSession {
    /// `handle` must already be admitted to `pool`.
    pub fn new(handle: SessionHandle, pool: Arc<ConnectionPool>, channel: SecureChannel) -> Self {
        Self {
            handle,
            pool,
            channel,
            idle_timeout: None,
            state: SessionState::Connecting,
            joined: false,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session to completion. Cleanup happens on every path; the
    /// returned error only reports why the loop stopped.
    pub async fn run<R>(mut self, mut reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let result = self.drive(&mut reader).await;
        self.close().await;
        result
    }

    async fn drive<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.on_connect(reader).await?;

        loop {
            let Some(raw) = self.next_line(reader).await? else {
                debug!(session = self.handle.id(), "peer closed the connection");
                return Ok(());
            };
            if let Flow::Quit = self.on_line(&raw).await? {
                return Ok(());
            }
        }
    }

    async fn next_line<R>(&self, reader: &mut R) -> io::Result<Option<String>>
    where
        R: AsyncBufRead + Unpin,
    {
        match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read_line(reader))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "session idle timeout"))?,
            None => read_line(reader).await,
        }
    }

    async fn on_connect<R>(&mut self, reader: &mut R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.send(protocol::BANNER).await?;
        self.send(protocol::NAME_PROMPT).await?;

        let Some(name) = self.next_line(reader).await? else {
            bail!("connection closed before a name was given");
        };
        let name = name.trim().to_string();
        self.handle.set_name(name.clone());
        self.state = SessionState::Named;

        self.send(&protocol::welcome(&name)).await?;
        info!(session = self.handle.id(), %name, "new user");

        self.pool
            .broadcast_except(self.handle.id(), &Outgoing::Notice(protocol::joined(&name)))
            .await;
        self.joined = true;
        self.state = SessionState::Active;
        Ok(())
    }

    async fn on_line(&mut self, raw: &str) -> Result<Flow> {
        match self.channel.decode_inbound(raw) {
            Line::Quit => return Ok(Flow::Quit),
            Line::Help => {
                for line in protocol::HELP_TEXT {
                    self.send(line).await?;
                }
            }
            Line::Users => self.list_users().await?,
            Line::Secure => self.start_handshake().await?,
            Line::PublicKey(offer) => self.receive_peer_key(offer).await?,
            Line::SignedKey(signature) => self.receive_signature(&signature).await?,
            Line::SessionKey(_) => debug!(session = self.handle.id(), "ignoring client-sent session key"),
            line @ Line::VerifyKey(_) => self.relay(&line.to_string()).await,
            Line::Chat(text) => {
                if !text.trim().is_empty() {
                    self.relay(&text).await;
                }
            }
        }
        Ok(Flow::Continue)
    }

    async fn list_users(&self) -> io::Result<()> {
        let names = self.pool.list_usernames().await;
        self.send(&protocol::users_header(names.len())).await?;
        for name in names {
            self.send(&name).await?;
        }
        Ok(())
    }

    async fn start_handshake(&mut self) -> io::Result<()> {
        info!(session = self.handle.id(), name = self.name(), "user demands security");
        self.handle.output().set_key(None).await;
        let offer = self.channel.begin();
        self.state = match offer {
            Line::PublicKey(KeyOffer::Failed) => SessionState::Active,
            _ => SessionState::Handshaking,
        };
        self.send(&offer.to_string()).await
    }

    async fn receive_peer_key(&mut self, offer: KeyOffer) -> io::Result<()> {
        debug!(session = self.handle.id(), "received peer public key");
        match self.channel.accept_peer_key(offer) {
            Some(reply) => {
                if reply == Line::SessionKey(protocol::FAIL.to_string()) {
                    self.state = SessionState::Active;
                }
                self.send(&reply.to_string()).await
            }
            None => Ok(()),
        }
    }

    async fn receive_signature(&mut self, signature: &str) -> io::Result<()> {
        let Some(verdict) = self.channel.check_signature(signature) else {
            return Ok(());
        };
        self.state = SessionState::Active;

        if self.channel.is_secured() {
            info!(session = self.handle.id(), name = self.name(), "session key verified");
        } else {
            warn!(session = self.handle.id(), name = self.name(), "session key NOT verified");
        }
        // Chat after the verdict must already be sealed for this recipient.
        self.handle
            .output()
            .send_then_set_key(&verdict.to_string(), self.channel.active_key().cloned())
            .await
    }

    async fn relay(&self, text: &str) {
        let line = protocol::chat(self.name(), text);
        self.pool
            .broadcast_except(self.handle.id(), &Outgoing::Chat(line))
            .await;
    }

    async fn send(&self, line: &str) -> io::Result<()> {
        self.handle.output().send(line).await
    }

    fn name(&self) -> &str {
        self.handle.name().unwrap_or_default()
    }

    /// Idempotent. Sessions that never joined leave silently.
    pub async fn close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        if self.joined {
            let name = self.name().to_string();
            self.pool
                .broadcast_except(self.handle.id(), &Outgoing::Notice(protocol::left(&name)))
                .await;
            if let Err(err) = self.send(&protocol::bye(&name)).await {
                debug!(session = self.handle.id(), error = ?err, "could not send bye");
            }
            info!(session = self.handle.id(), %name, "removing user");
        }

        self.pool.remove(self.handle.id()).await;
        self.handle.output().shutdown().await;
        self.state = SessionState::Closed;
        let clients = self.pool.active_count().await;
        debug!(clients, "session closed");
    }
}
