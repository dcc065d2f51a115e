use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{info, warn};

use crate::{
    config::ServerConfig,
    crypto::{CryptoProvider, RsaAesProvider},
    handshake::SecureChannel,
    pool::{ConnectionPool, Outgoing, SessionHandle},
    protocol,
    session::ChatSession,
};

const SHUTDOWN_NOTICE: &str = "*** Server shutting down ***";

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

/// Everything a connection task needs, shared for the server's lifetime.
struct ServerState {
    pool: Arc<ConnectionPool>,
    crypto: Arc<dyn CryptoProvider>,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        let crypto: Arc<dyn CryptoProvider> = Arc::new(RsaAesProvider::new(config.key_bits));
        Self::with_crypto(listener, config, crypto)
    }

    pub fn with_crypto(
        listener: TcpListener,
        config: ServerConfig,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState {
                pool: Arc::new(ConnectionPool::new(config.capacity)),
                crypto,
                config,
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.state.pool)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &ServerState) {
    let clients = state.pool.active_count().await;
    info!(clients, "server shutting down");
    state
        .pool
        .broadcast(&Outgoing::Notice(SHUTDOWN_NOTICE.to_string()))
        .await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        handle_connection(stream, peer, state).await;
    });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ServerState>) {
    let (reader, writer) = stream.into_split();
    let handle = SessionHandle::new(
        state.pool.next_id(),
        Box::new(writer),
        Arc::clone(&state.crypto),
    );

    if !state.pool.admit(handle.clone()).await {
        warn!(%peer, capacity = state.pool.capacity(), "no slots free for new client");
        if let Err(err) = handle.output().send(protocol::SERVER_FULL).await {
            warn!(%peer, error = ?err, "could not notify rejected client");
        }
        handle.output().shutdown().await;
        return;
    }
    let clients = state.pool.active_count().await;
    info!(%peer, session = handle.id(), clients, "client accepted");

    let channel = SecureChannel::generate(Arc::clone(&state.crypto)).await;
    let session = ChatSession::new(handle, Arc::clone(&state.pool), channel)
        .with_idle_timeout(state.config.idle_timeout);

    if let Err(err) = session.run(BufReader::new(reader)).await {
        warn!(%peer, error = ?err, "client session closed with error");
    }
}
