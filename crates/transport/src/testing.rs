//! In-process NNTP server for tests.
//!
//! Speaks just enough of the protocol for the client and the engines:
//! greeting, AUTHINFO, GROUP, POST, ARTICLE, STAT, QUIT. Failure injection
//! knobs cover the retry and redundancy properties: fail the next N posts,
//! delete stored articles, echo the `<posted>` placeholder, add latency.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use common::ServerProfile;

#[derive(Debug, Clone)]
pub struct StoredArticle {
    pub subject: String,
    pub body: Vec<u8>,
}

pub struct ServerState {
    articles: Mutex<HashMap<String, StoredArticle>>,
    posts_seen: AtomicU32,
    fetches_seen: AtomicU32,
    fail_posts: AtomicU32,
    /// POSTs beyond this budget answer 441; simulates a mid-upload kill.
    post_limit: AtomicU32,
    reject_auth: AtomicBool,
    echo_placeholder: AtomicBool,
    latency_ms: AtomicU64,
    next_id: AtomicU32,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            articles: Mutex::new(HashMap::new()),
            posts_seen: AtomicU32::new(0),
            fetches_seen: AtomicU32::new(0),
            fail_posts: AtomicU32::new(0),
            post_limit: AtomicU32::new(u32::MAX),
            reject_auth: AtomicBool::new(false),
            echo_placeholder: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            next_id: AtomicU32::new(0),
        }
    }
}

pub struct FakeNntpServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

impl FakeNntpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState::default());
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = handle_connection(socket, conn_state).await;
                });
            }
        });
        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// A profile pointed at this server: plaintext, small pool, short
    /// timeouts so tests stay snappy.
    pub fn profile(&self) -> ServerProfile {
        ServerProfile {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            tls: false,
            username: Some("tester".to_string()),
            password: Some("secret".to_string()),
            group: "alt.binaries.test".to_string(),
            posting_identity: "tester <tester@example.com>".to_string(),
            max_article: common::SEGMENT_SIZE,
            max_connections: 4,
            idle_timeout_secs: 300,
            connect_timeout_secs: 5,
            command_timeout_secs: 5,
            min_rate: 1024 * 1024,
        }
    }

    pub fn post_count(&self) -> u32 {
        self.state.posts_seen.load(Ordering::SeqCst)
    }

    /// ARTICLE commands served (found or not).
    pub fn fetch_count(&self) -> u32 {
        self.state.fetches_seen.load(Ordering::SeqCst)
    }

    /// Accept this many more successful POSTs, then 441 everything.
    pub fn limit_posts(&self, remaining: u32) {
        let current = self.state.posts_seen.load(Ordering::SeqCst);
        self.state
            .post_limit
            .store(current.saturating_add(remaining), Ordering::SeqCst);
    }

    pub fn clear_post_limit(&self) {
        self.state.post_limit.store(u32::MAX, Ordering::SeqCst);
    }

    pub fn article_count(&self) -> usize {
        self.state.articles.lock().expect("articles mutex").len()
    }

    pub fn message_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .articles
            .lock()
            .expect("articles mutex")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn article(&self, message_id: &str) -> Option<StoredArticle> {
        self.state
            .articles
            .lock()
            .expect("articles mutex")
            .get(message_id)
            .cloned()
    }

    /// Remove an article, simulating provider expiry.
    pub fn delete_article(&self, message_id: &str) -> bool {
        self.state
            .articles
            .lock()
            .expect("articles mutex")
            .remove(message_id)
            .is_some()
    }

    /// The next `n` POSTs answer 441.
    pub fn fail_next_posts(&self, n: u32) {
        self.state.fail_posts.store(n, Ordering::SeqCst);
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Answer POSTs with `240 <posted>` instead of a server-assigned id.
    pub fn echo_placeholder(&self, on: bool) {
        self.state.echo_placeholder.store(on, Ordering::SeqCst);
    }

    pub fn set_latency_ms(&self, ms: u64) {
        self.state.latency_ms.store(ms, Ordering::SeqCst);
    }
}

async fn write_line(socket: &mut (impl AsyncWriteExt + Unpin), line: &str) -> std::io::Result<()> {
    socket.write_all(line.as_bytes()).await?;
    socket.write_all(b"\r\n").await
}

async fn handle_connection(socket: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut reader = BufReader::new(read_half);

    write_line(&mut write_half, "200 fake news server ready").await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end().to_string();
        let upper = trimmed.to_ascii_uppercase();
        debug!(command = %trimmed, "fake server");

        let latency = state.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }

        if upper.starts_with("AUTHINFO USER") {
            write_line(&mut write_half, "381 password required").await?;
        } else if upper.starts_with("AUTHINFO PASS") {
            if state.reject_auth.load(Ordering::SeqCst) {
                write_line(&mut write_half, "481 authentication failed").await?;
            } else {
                write_line(&mut write_half, "281 authentication accepted").await?;
            }
        } else if upper == "CAPABILITIES" {
            write_line(&mut write_half, "101 capability list follows").await?;
            write_line(&mut write_half, "VERSION 2").await?;
            write_line(&mut write_half, "POST").await?;
            write_line(&mut write_half, "READER").await?;
            write_line(&mut write_half, ".").await?;
        } else if upper.starts_with("GROUP ") {
            let name = trimmed.split_whitespace().nth(1).unwrap_or("?");
            write_line(&mut write_half, &format!("211 0 0 0 {name}")).await?;
        } else if upper == "POST" {
            let pending_failures = state.fail_posts.load(Ordering::SeqCst);
            if pending_failures > 0 {
                state.fail_posts.store(pending_failures - 1, Ordering::SeqCst);
                write_line(&mut write_half, "441 posting failed").await?;
                continue;
            }
            if state.posts_seen.load(Ordering::SeqCst) >= state.post_limit.load(Ordering::SeqCst) {
                write_line(&mut write_half, "441 posting failed").await?;
                continue;
            }
            write_line(&mut write_half, "340 send article").await?;
            let (subject, suggested, body) = read_article(&mut reader).await?;
            state.posts_seen.fetch_add(1, Ordering::SeqCst);

            let (message_id, ack) = if state.echo_placeholder.load(Ordering::SeqCst) {
                (suggested, "240 <posted> article received".to_string())
            } else {
                let n = state.next_id.fetch_add(1, Ordering::SeqCst);
                let id = format!("<srv{n:06}@fake.test>");
                (id.clone(), format!("240 {id} article received"))
            };
            state
                .articles
                .lock()
                .expect("articles mutex")
                .insert(message_id, StoredArticle { subject, body });
            write_line(&mut write_half, &ack).await?;
        } else if upper.starts_with("ARTICLE ") {
            state.fetches_seen.fetch_add(1, Ordering::SeqCst);
            let id = trimmed.split_whitespace().nth(1).unwrap_or("");
            let article = state.articles.lock().expect("articles mutex").get(id).cloned();
            match article {
                Some(stored) => {
                    write_line(&mut write_half, &format!("220 0 {id} article follows")).await?;
                    write_line(&mut write_half, &format!("Subject: {}", stored.subject)).await?;
                    write_line(&mut write_half, &format!("Message-ID: {id}")).await?;
                    write_line(&mut write_half, "").await?;
                    // Dot-stuff the body on the way out.
                    for body_line in stored.body.split_inclusive(|&b| b == b'\n') {
                        if body_line.first() == Some(&b'.') {
                            write_half.write_all(b".").await?;
                        }
                        write_half.write_all(body_line).await?;
                    }
                    if !stored.body.ends_with(b"\n") {
                        write_half.write_all(b"\r\n").await?;
                    }
                    write_line(&mut write_half, ".").await?;
                }
                None => write_line(&mut write_half, "430 no such article").await?,
            }
        } else if upper.starts_with("STAT ") {
            let id = trimmed.split_whitespace().nth(1).unwrap_or("");
            let exists = state.articles.lock().expect("articles mutex").contains_key(id);
            if exists {
                write_line(&mut write_half, &format!("223 0 {id} exists")).await?;
            } else {
                write_line(&mut write_half, "430 no such article").await?;
            }
        } else if upper == "QUIT" {
            write_line(&mut write_half, "205 goodbye").await?;
            return Ok(());
        } else {
            write_line(&mut write_half, "500 command not recognized").await?;
        }
    }
}

/// Read a dot-terminated article submission: returns subject, the
/// suggested Message-ID from the headers, and the unstuffed body.
async fn read_article(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> std::io::Result<(String, String, Vec<u8>)> {
    let mut subject = String::new();
    let mut message_id = String::new();
    let mut body: Vec<u8> = Vec::new();
    let mut in_headers = true;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "client dropped mid-article",
            ));
        }
        if raw == b".\r\n" || raw == b".\n" {
            return Ok((subject, message_id, body));
        }
        if in_headers {
            let text = String::from_utf8_lossy(&raw);
            let header = text.trim_end();
            if header.is_empty() {
                in_headers = false;
                continue;
            }
            if let Some(value) = header.strip_prefix("Subject: ") {
                subject = value.to_string();
            } else if let Some(value) = header.strip_prefix("Message-ID: ") {
                message_id = value.to_string();
            }
        } else if raw.first() == Some(&b'.') {
            body.extend_from_slice(&raw[1..]);
        } else {
            body.extend_from_slice(&raw);
        }
    }
}
