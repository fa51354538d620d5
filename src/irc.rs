//! IRC connection shard
//!
//! One persistent TCP session to Twitch chat. The shard negotiates the
//! tags/commands/membership capabilities on connect, answers PING, and
//! surfaces registration and PRIVMSG events to the dispatcher. External
//! callers drive the socket through `ShardHandle` (join/part/say), which
//! serializes all writes.
//!
//! A lost connection reconnects after `min(2^attempts * 1s, 30s)` with a
//! freshly read credential; a rotation close is driven by the supervisor
//! and reconnects immediately without backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::TokenProvider;

/// Capabilities required for membership events, message tags, and
/// moderation commands.
const CAP_REQ: &str = "CAP REQ :twitch.tv/membership twitch.tv/tags twitch.tv/commands";

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Reconnect delay for the given attempt count.
pub fn reconnect_delay(attempts: u32) -> Duration {
    let secs = 1u64 << attempts.min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// A parsed IRC line
#[derive(Debug, Clone, PartialEq)]
pub struct IrcMessage {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Parse one wire line (without CRLF). Returns None for empty input.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return None;
        }

        let mut tags = HashMap::new();
        if let Some(after) = rest.strip_prefix('@') {
            let (raw_tags, tail) = after.split_once(' ')?;
            for pair in raw_tags.split(';') {
                match pair.split_once('=') {
                    Some((k, v)) => tags.insert(k.to_string(), unescape_tag(v)),
                    None => tags.insert(pair.to_string(), String::new()),
                };
            }
            rest = tail;
        }

        let mut prefix = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (p, tail) = after.split_once(' ')?;
            prefix = Some(p.to_string());
            rest = tail;
        }

        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };

        let mut words = head.split_ascii_whitespace();
        let command = words.next()?.to_string();
        let mut params: Vec<String> = words.map(str::to_string).collect();
        if let Some(trailing) = trailing {
            params.push(trailing.to_string());
        }

        Some(Self {
            tags,
            prefix,
            command,
            params,
        })
    }

    /// Login of the message author, from the prefix nick part.
    pub fn author_login(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// A chat line ready for dispatch
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub channel: String,
    pub author: String,
    pub text: String,
    pub tags: HashMap<String, String>,
}

/// Events a shard reports upward
#[derive(Debug)]
pub enum ShardEvent {
    /// Registration completed (RPL_WELCOME); channels must be re-joined.
    Registered { shard: usize },
    /// An inbound PRIVMSG
    Privmsg { shard: usize, message: ChatMessage },
}

/// Control commands accepted by a shard
#[derive(Debug)]
pub(crate) enum ShardCommand {
    Join(String),
    Part(String),
    Say { channel: String, text: String },
    /// Close and reconnect immediately with a fresh credential
    Rotate,
    /// Send QUIT with a farewell and stop
    Quit(String),
}

/// Handle used by the scheduler and dispatcher to drive one shard
#[derive(Clone)]
pub struct ShardHandle {
    pub id: usize,
    tx: mpsc::Sender<ShardCommand>,
}

impl ShardHandle {
    pub async fn join(&self, channel: &str) {
        let _ = self.tx.send(ShardCommand::Join(channel.to_lowercase())).await;
    }

    pub async fn part(&self, channel: &str) {
        let _ = self.tx.send(ShardCommand::Part(channel.to_lowercase())).await;
    }

    pub async fn say(&self, channel: &str, text: &str) {
        let _ = self
            .tx
            .send(ShardCommand::Say {
                channel: channel.to_lowercase(),
                text: text.to_string(),
            })
            .await;
    }

    pub async fn rotate(&self) {
        let _ = self.tx.send(ShardCommand::Rotate).await;
    }

    pub async fn quit(&self, farewell: &str) {
        let _ = self.tx.send(ShardCommand::Quit(farewell.to_string())).await;
    }
}

/// Build a handle whose commands land in a test-owned receiver.
#[cfg(test)]
pub(crate) fn test_shard(id: usize) -> (ShardHandle, mpsc::Receiver<ShardCommand>) {
    let (tx, rx) = mpsc::channel(64);
    (ShardHandle { id, tx }, rx)
}

/// How a session ended
enum SessionEnd {
    Quit,
    Rotated,
    Lost(String),
}

/// Spawn a shard task. Returns the control handle; events arrive on
/// `event_tx`.
pub fn spawn_shard(
    id: usize,
    addr: String,
    tokens: Arc<TokenProvider>,
    event_tx: mpsc::Sender<ShardEvent>,
) -> ShardHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    tokio::spawn(run_shard(id, addr, tokens, event_tx, cmd_rx));
    ShardHandle { id, tx: cmd_tx }
}

async fn run_shard(
    id: usize,
    addr: String,
    tokens: Arc<TokenProvider>,
    event_tx: mpsc::Sender<ShardEvent>,
    mut cmd_rx: mpsc::Receiver<ShardCommand>,
) {
    let mut attempts: u32 = 0;

    loop {
        let outcome = run_session(id, &addr, &tokens, &event_tx, &mut cmd_rx, &mut attempts).await;
        match outcome {
            Ok(SessionEnd::Quit) => {
                info!(shard = id, "shard stopped");
                return;
            }
            Ok(SessionEnd::Rotated) => {
                // Supervisor-driven close: reconnect right away, no backoff.
                info!(shard = id, "credential rotation, reconnecting");
                attempts = 0;
            }
            Ok(SessionEnd::Lost(reason)) => {
                let delay = reconnect_delay(attempts);
                warn!(shard = id, %reason, delay_secs = delay.as_secs(), "connection lost");
                attempts += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let delay = reconnect_delay(attempts);
                warn!(shard = id, error = %e, delay_secs = delay.as_secs(), "connect failed");
                attempts += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn run_session(
    id: usize,
    addr: &str,
    tokens: &Arc<TokenProvider>,
    event_tx: &mpsc::Sender<ShardEvent>,
    cmd_rx: &mut mpsc::Receiver<ShardCommand>,
    attempts: &mut u32,
) -> std::io::Result<SessionEnd> {
    let credential = match tokens.current().await {
        Some(c) => c,
        None => {
            return Ok(SessionEnd::Lost("no credential available".into()));
        }
    };

    let stream = TcpStream::connect(addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    debug!(shard = id, %addr, "connected, registering");
    write_half
        .write_all(
            format!(
                "{CAP_REQ}\r\nPASS {}\r\nNICK {}\r\nUSER {} 0 * :{}\r\n",
                credential.irc_pass(),
                credential.login,
                credential.login,
                credential.login,
            )
            .as_bytes(),
        )
        .await?;

    let mut registered = false;

    loop {
        tokio::select! {
            line = reader.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => return Ok(SessionEnd::Lost("server closed connection".into())),
                };
                let msg = match IrcMessage::parse(&line) {
                    Some(msg) => msg,
                    None => continue,
                };

                match msg.command.as_str() {
                    "PING" => {
                        let payload = msg.params.first().map(String::as_str).unwrap_or("");
                        write_half
                            .write_all(format!("PONG :{payload}\r\n").as_bytes())
                            .await?;
                    }
                    "001" => {
                        registered = true;
                        *attempts = 0;
                        info!(shard = id, login = %credential.login, "registered");
                        let _ = event_tx.send(ShardEvent::Registered { shard: id }).await;
                    }
                    "PRIVMSG" => {
                        if let Some(message) = chat_message(&msg) {
                            let _ = event_tx.send(ShardEvent::Privmsg { shard: id, message }).await;
                        }
                    }
                    "RECONNECT" => {
                        // Server-requested reconnect; treat as a lost link.
                        return Ok(SessionEnd::Lost("server requested reconnect".into()));
                    }
                    "NOTICE" => {
                        debug!(shard = id, params = ?msg.params, "server notice");
                        if !registered && msg.params.iter().any(|p| p.contains("authentication failed")) {
                            return Ok(SessionEnd::Lost("authentication failed".into()));
                        }
                    }
                    _ => {}
                }
            }
            cmd = cmd_rx.recv() => {
                let cmd = match cmd {
                    Some(cmd) => cmd,
                    None => return Ok(SessionEnd::Quit),
                };
                match cmd {
                    ShardCommand::Join(channel) => {
                        write_half.write_all(format!("JOIN #{channel}\r\n").as_bytes()).await?;
                    }
                    ShardCommand::Part(channel) => {
                        write_half.write_all(format!("PART #{channel}\r\n").as_bytes()).await?;
                    }
                    ShardCommand::Say { channel, text } => {
                        write_half
                            .write_all(format!("PRIVMSG #{channel} :{text}\r\n").as_bytes())
                            .await?;
                    }
                    ShardCommand::Rotate => {
                        // Silent close; the caller reconnects us at once.
                        return Ok(SessionEnd::Rotated);
                    }
                    ShardCommand::Quit(farewell) => {
                        let _ = write_half
                            .write_all(format!("QUIT :{farewell}\r\n").as_bytes())
                            .await;
                        return Ok(SessionEnd::Quit);
                    }
                }
            }
        }
    }
}

fn chat_message(msg: &IrcMessage) -> Option<ChatMessage> {
    let author = msg.author_login()?.to_lowercase();
    let channel = msg.params.first()?.trim_start_matches('#').to_lowercase();
    let text = msg.params.get(1)?.clone();
    Some(ChatMessage {
        channel,
        author,
        text,
        tags: msg.tags.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_privmsg() {
        let msg = IrcMessage::parse(":alice!alice@alice.tmi.twitch.tv PRIVMSG #streamer :hello world").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.author_login(), Some("alice"));
        assert_eq!(msg.params, vec!["#streamer", "hello world"]);
        assert!(msg.tags.is_empty());
    }

    #[test]
    fn test_parse_tagged_privmsg() {
        let line = "@badges=moderator/1,subscriber/12;mod=1;user-type=mod :bob!bob@bob.tmi.twitch.tv PRIVMSG #streamer :!eloward status";
        let msg = IrcMessage::parse(line).unwrap();
        assert_eq!(msg.tags.get("badges").unwrap(), "moderator/1,subscriber/12");
        assert_eq!(msg.tags.get("mod").unwrap(), "1");
        assert_eq!(msg.author_login(), Some("bob"));

        let chat = chat_message(&msg).unwrap();
        assert_eq!(chat.channel, "streamer");
        assert_eq!(chat.text, "!eloward status");
    }

    #[test]
    fn test_parse_ping() {
        let msg = IrcMessage::parse("PING :tmi.twitch.tv").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["tmi.twitch.tv"]);
    }

    #[test]
    fn test_parse_numeric_welcome() {
        let msg = IrcMessage::parse(":tmi.twitch.tv 001 elowardbot :Welcome, GLHF!").unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["elowardbot", "Welcome, GLHF!"]);
    }

    #[test]
    fn test_tag_unescaping() {
        let msg = IrcMessage::parse(
            "@system-msg=hi\\sthere\\:now;flag= :tmi.twitch.tv USERNOTICE #chan",
        )
        .unwrap();
        assert_eq!(msg.tags.get("system-msg").unwrap(), "hi there;now");
        assert_eq!(msg.tags.get("flag").unwrap(), "");
    }

    #[test]
    fn test_parse_empty_and_garbage() {
        assert!(IrcMessage::parse("").is_none());
        assert!(IrcMessage::parse("\r\n").is_none());
        // Tag section with no following space is malformed
        assert!(IrcMessage::parse("@badges=x").is_none());
    }

    #[test]
    fn test_reconnect_delay_caps_at_thirty_seconds() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(30), Duration::from_secs(30));
    }

    #[test]
    fn test_channel_lowercased_in_chat_message() {
        let msg = IrcMessage::parse(":Alice!a@a PRIVMSG #StreamerName :Hi").unwrap();
        let chat = chat_message(&msg).unwrap();
        assert_eq!(chat.channel, "streamername");
        assert_eq!(chat.author, "alice");
    }
}
