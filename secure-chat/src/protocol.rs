use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

pub const QUIT: &str = "/quit";
pub const HELP: &str = "/help";
pub const USERS: &str = "/users";
pub const SECURE: &str = "/secure";

pub const PUBLIC_KEY_TAG: &str = "[public_key]";
pub const SESSION_KEY_TAG: &str = "[session_key]";
pub const SIGNED_KEY_TAG: &str = "[signed_key]";
pub const VERIFY_KEY_TAG: &str = "[verify_key]";

/// Failure literal carried in place of key material.
pub const FAIL: &str = "FAIL";
pub const OK: &str = "OK";

/// Substring both ends treat as the end-of-session marker.
pub const BYE_MARKER: &str = "*** Bye";

pub const ENCRYPTED_SUFFIX: &str = " [ENCRYPTED]";
pub const UNENCRYPTED_SUFFIX: &str = " [UNENCRYPTED]";

pub const BANNER: &str = "secure-chat 1.0 / RSA + AES session channel";
pub const NAME_PROMPT: &str = "Enter your name.";
pub const SERVER_FULL: &str = "*** Server full, try again later ***";
pub const HELP_TEXT: &[&str] = &[
    "Usage:",
    "To leave enter \"/quit\".",
    "For help type \"/help\".",
    "For user infos type \"/users\".",
    "To encrypt your messages type \"/secure\".",
];

/// Payload of a `[public_key]` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOffer {
    /// Hex encoded DER public key.
    Key(String),
    Failed,
}

/// One decoded wire line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Quit,
    Help,
    Users,
    Secure,
    PublicKey(KeyOffer),
    /// Hex of the session key encrypted to the receiver's public key.
    SessionKey(String),
    /// Hex of the signature over the session key digest, or `FAIL`.
    SignedKey(String),
    VerifyKey(bool),
    Chat(String),
}

impl Line {
    /// Classifies a raw line. Commands match by prefix in the order
    /// `/quit`, `/help`, `/users`, `/secure`; control tags follow; anything
    /// else is chat.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with(QUIT) {
            Line::Quit
        } else if raw.starts_with(HELP) {
            Line::Help
        } else if raw.starts_with(USERS) {
            Line::Users
        } else if raw.starts_with(SECURE) {
            Line::Secure
        } else if let Some(payload) = raw.strip_prefix(PUBLIC_KEY_TAG) {
            if payload.starts_with(FAIL) {
                Line::PublicKey(KeyOffer::Failed)
            } else {
                Line::PublicKey(KeyOffer::Key(payload.to_string()))
            }
        } else if let Some(payload) = raw.strip_prefix(SESSION_KEY_TAG) {
            Line::SessionKey(payload.to_string())
        } else if let Some(payload) = raw.strip_prefix(SIGNED_KEY_TAG) {
            Line::SignedKey(payload.to_string())
        } else if let Some(payload) = raw.strip_prefix(VERIFY_KEY_TAG) {
            Line::VerifyKey(payload.trim().eq_ignore_ascii_case(OK))
        } else {
            Line::Chat(raw.to_string())
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Line::Quit => f.write_str(QUIT),
            Line::Help => f.write_str(HELP),
            Line::Users => f.write_str(USERS),
            Line::Secure => f.write_str(SECURE),
            Line::PublicKey(KeyOffer::Key(hex)) => write!(f, "{PUBLIC_KEY_TAG}{hex}"),
            Line::PublicKey(KeyOffer::Failed) => write!(f, "{PUBLIC_KEY_TAG}{FAIL}"),
            Line::SessionKey(hex) => write!(f, "{SESSION_KEY_TAG}{hex}"),
            Line::SignedKey(hex) => write!(f, "{SIGNED_KEY_TAG}{hex}"),
            Line::VerifyKey(true) => write!(f, "{VERIFY_KEY_TAG}{OK}"),
            Line::VerifyKey(false) => write!(f, "{VERIFY_KEY_TAG}{FAIL}"),
            Line::Chat(text) => f.write_str(text),
        }
    }
}

pub fn welcome(name: &str) -> String {
    format!("Hello {name}! (Type \"/help\" for usage!)")
}

pub fn joined(name: &str) -> String {
    format!("*** New user: {name} ***")
}

pub fn left(name: &str) -> String {
    format!("*** User {name} has left ***")
}

pub fn bye(name: &str) -> String {
    format!("{BYE_MARKER} {name} ***")
}

pub fn chat(name: &str, text: &str) -> String {
    format!("<{name}> {text}")
}

pub fn users_header(count: usize) -> String {
    format!("Clients in chat: {count}")
}

pub fn is_bye(line: &str) -> bool {
    line.contains(BYE_MARKER)
}

/// Reads one line, without its terminator. `None` once the peer closed.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).await?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(LINE_ENDINGS).to_string()))
}

/// Writes `line` plus a newline and flushes. Lines may not embed a line break,
/// the framing has no escaping.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if line.contains(LINE_ENDINGS) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "line payload contains a line break",
        ));
    }
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
