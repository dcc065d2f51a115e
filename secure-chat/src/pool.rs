//! Fixed-capacity registry of connected sessions.
//!
//! The pool is the only state shared between connection tasks. Every
//! operation takes the one slot lock, so admission, removal and fan-out never
//! interleave. Broadcasts write into each recipient's output while the lock is
//! held: a peer that stops reading stalls the broadcasting session (and any
//! other pool operation) until its socket drains. There is no write timeout.
//!
//! Lock order is always pool, then a session's output. Sessions never touch
//! the pool while holding their own output lock.

use std::{
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{
    crypto::{CryptoProvider, SessionKey, encode_hex},
    protocol::write_line,
};

pub type SessionId = u64;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const ENCRYPT_FAILED: &str = "*** Encrypting failed! ***";

/// Write side of one session, plus the key its chat lines are sealed with.
pub struct SessionOutput {
    crypto: Arc<dyn CryptoProvider>,
    state: Mutex<OutputState>,
}

struct OutputState {
    writer: BoxedWriter,
    key: Option<SessionKey>,
    closed: bool,
}

impl SessionOutput {
    fn new(writer: BoxedWriter, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto,
            state: Mutex::new(OutputState {
                writer,
                key: None,
                closed: false,
            }),
        }
    }

    /// Sends a line as is. Used for banners, notices and control replies.
    pub async fn send(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        write_line(&mut state.writer, line).await
    }

    /// Sends a chat line, encrypted with this recipient's session key when
    /// its channel is secured.
    pub async fn deliver_chat(&self, line: &str) -> io::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let wire = match &state.key {
            Some(key) => match self.crypto.encrypt(key, line.as_bytes()) {
                Ok(sealed) => encode_hex(&sealed),
                Err(err) => {
                    warn!(error = %err, "could not encrypt chat line for recipient");
                    ENCRYPT_FAILED.to_string()
                }
            },
            None => line.to_string(),
        };
        write_line(&mut state.writer, &wire).await
    }

    /// Installs or clears the key used by [`SessionOutput::deliver_chat`].
    pub async fn set_key(&self, key: Option<SessionKey>) {
        self.state.lock().await.key = key;
    }

    /// Sends `line` in clear and then installs `key`, with no chat line able
    /// to slip in between.
    pub async fn send_then_set_key(&self, line: &str, key: Option<SessionKey>) -> io::Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        write_line(&mut state.writer, line).await?;
        state.key = key;
        Ok(())
    }

    pub async fn is_encrypting(&self) -> bool {
        self.state.lock().await.key.is_some()
    }

    /// Shuts the writer down. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.key = None;
        if let Err(err) = state.writer.shutdown().await {
            debug!(error = ?err, "writer shutdown failed");
        }
    }
}

struct HandleInner {
    id: SessionId,
    name: OnceLock<String>,
    output: SessionOutput,
}

/// Shared reference to one connected user. Cloning is cheap.
#[derive(Clone)]
pub struct SessionHandle(Arc<HandleInner>);

impl SessionHandle {
    pub fn new(id: SessionId, writer: BoxedWriter, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self(Arc::new(HandleInner {
            id,
            name: OnceLock::new(),
            output: SessionOutput::new(writer, crypto),
        }))
    }

    pub fn id(&self) -> SessionId {
        self.0.id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.get().map(String::as_str)
    }

    /// Sets the display name. Returns false if it was already set.
    pub fn set_name(&self, name: String) -> bool {
        self.0.name.set(name).is_ok()
    }

    pub fn output(&self) -> &SessionOutput {
        &self.0.output
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .finish()
    }
}

/// What a broadcast delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Server notice, always sent in clear.
    Notice(String),
    /// Chat line, sealed per recipient when that recipient is secured.
    Chat(String),
}

pub struct ConnectionPool {
    slots: Mutex<Vec<Option<SessionHandle>>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(vec![None; capacity]),
            capacity,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn next_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stores the session in the first free slot. Returns false, leaving
    /// the pool untouched, when it is full or already holds this session.
    pub async fn admit(&self, session: SessionHandle) -> bool {
        let mut slots = self.slots.lock().await;
        if slots.iter().flatten().any(|occupant| occupant.id() == session.id()) {
            return false;
        }
        match slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(session);
                true
            }
            None => false,
        }
    }

    /// Clears every slot held by `id`. Returns whether anything was removed.
    pub async fn remove(&self, id: SessionId) -> bool {
        let mut slots = self.slots.lock().await;
        let mut removed = false;
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|occupant| occupant.id() == id) {
                *slot = None;
                removed = true;
            }
        }
        removed
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        let slots = self.slots.lock().await;
        slots.iter().flatten().any(|occupant| occupant.id() == id)
    }

    /// Delivers `message` to every session except `sender`, in slot order.
    /// Returns how many deliveries succeeded.
    pub async fn broadcast_except(&self, sender: SessionId, message: &Outgoing) -> usize {
        self.fan_out(Some(sender), message).await
    }

    /// Delivers `message` to every session.
    pub async fn broadcast(&self, message: &Outgoing) -> usize {
        self.fan_out(None, message).await
    }

    async fn fan_out(&self, exclude: Option<SessionId>, message: &Outgoing) -> usize {
        let slots = self.slots.lock().await;
        let mut delivered = 0;
        for recipient in slots.iter().flatten() {
            if Some(recipient.id()) == exclude {
                continue;
            }
            let result = match message {
                Outgoing::Notice(text) => recipient.output().send(text).await,
                Outgoing::Chat(text) => recipient.output().deliver_chat(text).await,
            };
            match result {
                Ok(()) => delivered += 1,
                Err(err) => debug!(recipient = recipient.id(), error = ?err, "delivery failed"),
            }
        }
        delivered
    }

    pub async fn active_count(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.iter().flatten().count()
    }

    /// Names of every named session, in slot order.
    pub async fn list_usernames(&self) -> Vec<String> {
        let slots = self.slots.lock().await;
        slots
            .iter()
            .flatten()
            .filter_map(|occupant| occupant.name().map(str::to_string))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::tests::provider, protocol::read_line};
    use tokio::io::{BufReader, DuplexStream};

    fn crypto() -> Arc<dyn CryptoProvider> {
        Arc::new(provider())
    }

    fn member(pool: &ConnectionPool, name: &str) -> (SessionHandle, BufReader<DuplexStream>) {
        let (writer, reader) = tokio::io::duplex(4096);
        let handle = SessionHandle::new(pool.next_id(), Box::new(writer), crypto());
        handle.set_name(name.to_string());
        (handle, BufReader::new(reader))
    }

    #[tokio::test]
    async fn admits_until_capacity_without_evicting() {
        let pool = ConnectionPool::new(3);
        let mut members = Vec::new();
        let mut admitted = 0;
        for i in 0..5 {
            let (handle, reader) = member(&pool, &format!("user{i}"));
            if pool.admit(handle.clone()).await {
                admitted += 1;
            }
            members.push((handle, reader));
        }

        assert_eq!(admitted, 3);
        assert_eq!(pool.active_count().await, 3);
        assert_eq!(pool.list_usernames().await, vec!["user0", "user1", "user2"]);
        assert!(!pool.contains(members[3].0.id()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_fill_exactly_capacity() {
        let pool = Arc::new(ConnectionPool::new(3));
        let mut admissions = tokio::task::JoinSet::new();
        let mut readers = Vec::new();
        for i in 0..8 {
            let (handle, reader) = member(&pool, &format!("user{i}"));
            readers.push(reader);
            let pool = Arc::clone(&pool);
            admissions.spawn(async move { pool.admit(handle).await });
        }

        let mut admitted = 0;
        while let Some(result) = admissions.join_next().await {
            if result.expect("admission task") {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 3);
        assert_eq!(pool.active_count().await, 3);
        assert_eq!(pool.list_usernames().await.len(), 3);
    }

    #[tokio::test]
    async fn admitting_the_same_session_twice_is_rejected() {
        let pool = ConnectionPool::new(2);
        let (handle, _reader) = member(&pool, "alice");

        assert!(pool.admit(handle.clone()).await);
        assert!(!pool.admit(handle).await);
        assert_eq!(pool.active_count().await, 1);
    }

    #[tokio::test]
    async fn freed_slot_is_reused() {
        let pool = ConnectionPool::new(1);
        let (alice, _a) = member(&pool, "alice");
        let (bob, _b) = member(&pool, "bob");

        assert!(pool.admit(alice.clone()).await);
        assert!(!pool.admit(bob.clone()).await);
        assert!(pool.remove(alice.id()).await);
        assert!(pool.admit(bob).await);
        assert_eq!(pool.list_usernames().await, vec!["bob"]);
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let pool = ConnectionPool::new(3);
        let (alice, _a) = member(&pool, "alice");
        let (bob, _b) = member(&pool, "bob");
        let (stranger, _s) = member(&pool, "stranger");
        pool.admit(alice.clone()).await;
        pool.admit(bob.clone()).await;

        assert!(pool.remove(alice.id()).await);
        assert!(!pool.remove(alice.id()).await);
        assert!(!pool.remove(stranger.id()).await);
        assert_eq!(pool.list_usernames().await, vec!["bob"]);
    }

    #[tokio::test]
    async fn broadcast_skips_sender_and_reaches_everyone_else_once() {
        let pool = ConnectionPool::new(4);
        let (alice, mut alice_rx) = member(&pool, "alice");
        let (bob, mut bob_rx) = member(&pool, "bob");
        let (carol, mut carol_rx) = member(&pool, "carol");
        for handle in [&alice, &bob, &carol] {
            pool.admit(handle.clone()).await;
        }

        let delivered = pool
            .broadcast_except(alice.id(), &Outgoing::Chat("<alice> hello".into()))
            .await;
        pool.broadcast(&Outgoing::Notice("marker".into())).await;

        assert_eq!(delivered, 2);
        for reader in [&mut bob_rx, &mut carol_rx] {
            assert_eq!(read_line(reader).await.unwrap().as_deref(), Some("<alice> hello"));
            assert_eq!(read_line(reader).await.unwrap().as_deref(), Some("marker"));
        }
        assert_eq!(read_line(&mut alice_rx).await.unwrap().as_deref(), Some("marker"));
    }

    #[tokio::test]
    async fn chat_is_sealed_per_secured_recipient() {
        let pool = ConnectionPool::new(3);
        let (alice, _alice_rx) = member(&pool, "alice");
        let (bob, mut bob_rx) = member(&pool, "bob");
        let (carol, mut carol_rx) = member(&pool, "carol");
        for handle in [&alice, &bob, &carol] {
            pool.admit(handle.clone()).await;
        }

        let crypto = provider();
        let key = crypto.generate_session_key();
        bob.output().set_key(Some(key.clone())).await;
        assert!(bob.output().is_encrypting().await);

        pool.broadcast_except(alice.id(), &Outgoing::Chat("<alice> secret".into()))
            .await;

        let sealed = read_line(&mut bob_rx).await.unwrap().expect("bob line");
        let opened = crypto
            .decrypt(&key, &crate::crypto::decode_hex(&sealed).unwrap())
            .unwrap();
        assert_eq!(opened, b"<alice> secret");
        assert_eq!(
            read_line(&mut carol_rx).await.unwrap().as_deref(),
            Some("<alice> secret")
        );
    }

    #[tokio::test]
    async fn closed_output_refuses_delivery() {
        let pool = ConnectionPool::new(2);
        let (alice, _a) = member(&pool, "alice");
        let (bob, mut bob_rx) = member(&pool, "bob");
        pool.admit(alice.clone()).await;
        pool.admit(bob.clone()).await;

        bob.output().shutdown().await;
        bob.output().shutdown().await;

        let delivered = pool
            .broadcast_except(alice.id(), &Outgoing::Notice("late".into()))
            .await;
        assert_eq!(delivered, 0);
        assert_eq!(read_line(&mut bob_rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn name_is_set_once() {
        let pool = ConnectionPool::new(1);
        let (alice, _a) = member(&pool, "alice");
        assert!(!alice.set_name("mallory".into()));
        assert_eq!(alice.name(), Some("alice"));
    }
}
