//! In-process nsqd for exercising the wire client
//!
//! Speaks the part of the TCP protocol a client needs: `IDENTIFY` (with an
//! optional TLS upgrade), `SUB`, `RDY`, `FIN`, `REQ`, `TOUCH`, `NOP`, `CLS`
//! and `PUB`. Commands are recorded; messages queued with
//! [`FakeNsqd::deliver`] go to the first subscriber that sent a non-zero
//! `RDY`.

use crate::tls::{server_config, ClientAuth};
use rustls::ServerConfig;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

const FRAME_RESPONSE: i32 = 0;
const FRAME_ERROR: i32 = 1;
const FRAME_MESSAGE: i32 = 2;

/// Everything clients sent, in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recorded {
    pub user_agents: Vec<String>,
    /// Connections that upgraded to TLS
    pub tls_connections: usize,
    pub subscriptions: Vec<(String, String)>,
    pub published: Vec<(String, Vec<u8>)>,
    pub finished: Vec<String>,
    /// Message id and requested delay in milliseconds
    pub requeued: Vec<(String, u64)>,
    pub touched: Vec<String>,
}

struct Outgoing {
    body: Vec<u8>,
    attempts: u16,
}

struct Shared {
    recorded: Mutex<Recorded>,
    outbox: Mutex<VecDeque<Outgoing>>,
    rejected_topics: Mutex<Vec<String>>,
    ready: Notify,
    sequence: AtomicU64,
    tls: Option<Arc<ServerConfig>>,
}

impl Shared {
    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().expect("fake nsqd state poisoned")
    }

    fn next_outgoing(&self) -> Option<Outgoing> {
        self.outbox.lock().expect("fake nsqd outbox poisoned").pop_front()
    }

    fn is_rejected(&self, topic: &str) -> bool {
        self.rejected_topics
            .lock()
            .expect("fake nsqd state poisoned")
            .iter()
            .any(|t| t == topic)
    }
}

/// A fake nsqd listening on an ephemeral loopback port
pub struct FakeNsqd {
    address: String,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakeNsqd {
    /// Plain TCP nsqd
    pub async fn start() -> io::Result<Self> {
        Self::start_with(None).await
    }

    /// nsqd that upgrades to TLS when the client asks for it, presenting
    /// the `server.pem` fixture
    pub async fn start_tls(auth: ClientAuth) -> io::Result<Self> {
        Self::start_with(Some(server_config(auth))).await
    }

    async fn start_with(tls: Option<Arc<ServerConfig>>) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();

        let shared = Arc::new(Shared {
            recorded: Mutex::new(Recorded::default()),
            outbox: Mutex::new(VecDeque::new()),
            rejected_topics: Mutex::new(Vec::new()),
            ready: Notify::new(),
            sequence: AtomicU64::new(0),
            tls,
        });

        let task = tokio::spawn(accept_loop(listener, shared.clone()));
        Ok(Self {
            address,
            shared,
            task,
        })
    }

    /// `127.0.0.1:<port>`
    pub fn address(&self) -> &str {
        &self.address
    }

    /// `localhost:<port>`, the name the server certificate is issued for
    pub fn localhost_address(&self) -> String {
        let port = self.address.rsplit(':').next().unwrap_or_default();
        format!("localhost:{port}")
    }

    /// Queue a first delivery
    pub fn deliver(&self, body: impl Into<Vec<u8>>) {
        self.deliver_attempt(body, 1);
    }

    /// Queue a delivery carrying `attempts`
    pub fn deliver_attempt(&self, body: impl Into<Vec<u8>>, attempts: u16) {
        self.shared
            .outbox
            .lock()
            .expect("fake nsqd outbox poisoned")
            .push_back(Outgoing {
                body: body.into(),
                attempts,
            });
        self.shared.ready.notify_one();
    }

    /// Answer `PUB` to `topic` with a fatal `E_PUB_FAILED`
    pub fn reject_topic(&self, topic: &str) {
        self.shared
            .rejected_topics
            .lock()
            .expect("fake nsqd state poisoned")
            .push(topic.to_string());
    }

    pub fn recorded(&self) -> Recorded {
        self.shared.recorded().clone()
    }

    /// Poll until `done` holds; panics after `timeout`
    pub async fn wait_until(
        &self,
        timeout: Duration,
        done: impl Fn(&Recorded) -> bool,
    ) -> Recorded {
        let deadline = Instant::now() + timeout;
        loop {
            let recorded = self.recorded();
            if done(&recorded) {
                return recorded;
            }
            if Instant::now() >= deadline {
                panic!("fake nsqd condition not met within {timeout:?}: {recorded:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for FakeNsqd {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let mut connections = JoinSet::new();
    while let Ok((stream, _)) = listener.accept().await {
        let shared = shared.clone();
        connections.spawn(async move {
            if let Err(e) = serve(stream, shared).await {
                tracing::debug!(error = %e, "fake nsqd connection ended");
            }
        });
    }
}

fn protocol_error(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}

/// Read a command line byte by byte so nothing past it is buffered.
async fn read_raw_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == b'\n' {
            return String::from_utf8(line).map_err(|_| protocol_error("command is not UTF-8"));
        }
        line.push(byte);
    }
}

fn identify_response(tls: bool) -> String {
    format!(
        concat!(
            r#"{{"max_rdy_count":2500,"version":"1.3.0","max_msg_timeout":900000,"#,
            r#""msg_timeout":60000,"tls_v1":{},"deflate":false,"deflate_level":6,"#,
            r#""max_deflate_level":6,"snappy":false,"sample_rate":0,"auth_required":false,"#,
            r#""output_buffer_size":16384,"output_buffer_timeout":250}}"#
        ),
        tls
    )
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) -> io::Result<()> {
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    if &magic != b"  V2" {
        return Err(protocol_error("bad protocol magic"));
    }

    if read_raw_line(&mut stream).await? != "IDENTIFY" {
        return Err(protocol_error("expected IDENTIFY"));
    }
    let size = stream.read_u32().await?;
    let mut body = vec![0u8; size as usize];
    stream.read_exact(&mut body).await?;

    let identify: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| protocol_error("IDENTIFY body is not JSON"))?;
    let wants_tls = identify["tls_v1"].as_bool().unwrap_or(false);
    if let Some(agent) = identify["user_agent"].as_str() {
        shared.recorded().user_agents.push(agent.to_string());
    }

    let upgrade = shared.tls.clone().filter(|_| wants_tls);
    write_frame(&mut stream, FRAME_RESPONSE, identify_response(upgrade.is_some()).as_bytes())
        .await?;

    match upgrade {
        Some(config) => {
            let mut stream = TlsAcceptor::from(config).accept(stream).await?;
            write_frame(&mut stream, FRAME_RESPONSE, b"OK").await?;
            shared.recorded().tls_connections += 1;
            commands(stream, shared).await
        }
        None => commands(stream, shared).await,
    }
}

async fn commands<S>(stream: S, shared: Arc<Shared>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let writer = Arc::new(tokio::sync::Mutex::new(write));
    let mut reader = BufReader::new(read);
    let mut pusher = JoinSet::new();

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let parts: Vec<&str> = line.trim_end().split(' ').collect();

        match parts.as_slice() {
            ["SUB", topic, channel] => {
                shared
                    .recorded()
                    .subscriptions
                    .push((topic.to_string(), channel.to_string()));
                write_frame(&mut *writer.lock().await, FRAME_RESPONSE, b"OK").await?;
            }
            ["RDY", count] => {
                if *count != "0" && pusher.is_empty() {
                    pusher.spawn(push(writer.clone(), shared.clone()));
                }
            }
            ["FIN", id] => shared.recorded().finished.push(id.to_string()),
            ["REQ", id, delay] => {
                let delay = delay.parse().map_err(|_| protocol_error("bad REQ delay"))?;
                shared.recorded().requeued.push((id.to_string(), delay));
            }
            ["TOUCH", id] => shared.recorded().touched.push(id.to_string()),
            ["NOP"] => {}
            ["CLS"] => {
                write_frame(&mut *writer.lock().await, FRAME_RESPONSE, b"CLOSE_WAIT").await?;
            }
            ["PUB", topic] => {
                let size = reader.read_u32().await?;
                let mut body = vec![0u8; size as usize];
                reader.read_exact(&mut body).await?;

                if shared.is_rejected(topic) {
                    write_frame(&mut *writer.lock().await, FRAME_ERROR, b"E_PUB_FAILED").await?;
                    return Ok(());
                }
                shared.recorded().published.push((topic.to_string(), body));
                write_frame(&mut *writer.lock().await, FRAME_RESPONSE, b"OK").await?;
            }
            _ => {
                write_frame(&mut *writer.lock().await, FRAME_ERROR, b"E_INVALID").await?;
                return Err(protocol_error("unknown command"));
            }
        }
    }
}

async fn push<W>(writer: Arc<tokio::sync::Mutex<W>>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let Some(outgoing) = shared.next_outgoing() else {
            shared.ready.notified().await;
            continue;
        };

        let sequence = shared.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        let mut frame = Vec::with_capacity(26 + outgoing.body.len());
        frame.extend_from_slice(&timestamp.to_be_bytes());
        frame.extend_from_slice(&outgoing.attempts.to_be_bytes());
        frame.extend_from_slice(format!("{sequence:016x}").as_bytes());
        frame.extend_from_slice(&outgoing.body);

        if write_frame(&mut *writer.lock().await, FRAME_MESSAGE, &frame).await.is_err() {
            return;
        }
    }
}

async fn write_frame<W>(writer: &mut W, kind: i32, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let size = u32::try_from(body.len() + 4).map_err(|_| protocol_error("frame too large"))?;
    writer.write_u32(size).await?;
    writer.write_i32(kind).await?;
    writer.write_all(body).await?;
    writer.flush().await
}
