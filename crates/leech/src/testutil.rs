//! Loopback fixtures shared by the unit tests: metainfo built from content,
//! a one-shot-per-connection HTTP tracker, and a seeding peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use leech_proto::{Bitfield, Handshake, Message, MessageCodec, HANDSHAKE_LEN};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::metainfo::TorrentMeta;

pub(crate) fn sample_meta(announce: &str, content: &[u8], piece_length: u32) -> TorrentMeta {
    let pieces = content
        .chunks(piece_length as usize)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&Sha1::digest(chunk));
            hash
        })
        .collect();
    TorrentMeta {
        announce: announce.to_string(),
        name: "sample.bin".to_string(),
        piece_length,
        pieces,
        total_length: content.len() as u64,
        files: Vec::new(),
        info_hash: [0x42; 20],
    }
}

/// HTTP tracker answering each connection with the next canned response;
/// the last one repeats.
pub(crate) struct FakeTracker {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeTracker {
    pub(crate) async fn start(responses: Vec<(u16, Vec<u8>)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        let task = tokio::spawn(async move {
            let mut served = 0usize;
            while let Ok((mut sock, _)) = listener.accept().await {
                let (status, body) = responses[served.min(responses.len() - 1)].clone();
                served += 1;

                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let line = String::from_utf8_lossy(&head).lines().next().unwrap_or_default().to_string();
                log.lock().push(line);

                let reply = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    if status == 200 { "OK" } else { "Error" },
                    body.len()
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.write_all(&body).await;
                let _ = sock.shutdown().await;
            }
        });
        Self { addr, requests, task }
    }

    pub(crate) fn announce_url(&self) -> String {
        format!("http://{}/announce", self.addr)
    }

    pub(crate) fn hits(&self) -> usize {
        self.requests.lock().len()
    }

    /// Request lines, e.g. `GET /announce?info_hash=... HTTP/1.1`.
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

impl Drop for FakeTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Compact `peers` body listing the given loopback ports.
pub(crate) fn compact_response(interval: u32, ports: &[u16]) -> Vec<u8> {
    let mut body = format!("d8:intervali{}e5:peers{}:", interval, ports.len() * 6).into_bytes();
    for port in ports {
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.extend_from_slice(&port.to_be_bytes());
    }
    body.push(b'e');
    body
}

/// A peer holding `content`. Answers the handshake, advertises every piece,
/// unchokes on `interested` and serves every request. Returns the messages
/// it received once the other side hangs up.
pub(crate) async fn serve_seeder<S>(mut stream: S, meta: TorrentMeta, content: Arc<Vec<u8>>) -> Vec<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    if stream.read_exact(&mut buf).await.is_err() {
        return Vec::new();
    }
    let reply = Handshake::new(meta.info_hash, *b"-SD0001-seederseeder");
    if stream.write_all(&reply.encode()).await.is_err() {
        return Vec::new();
    }

    let mut framed = Framed::new(stream, MessageCodec::default());
    let bitfield = Bitfield::full(meta.num_pieces()).to_bytes();
    if framed.send(Message::Bitfield(bitfield.into())).await.is_err() {
        return Vec::new();
    }

    let mut seen = Vec::new();
    while let Some(Ok(msg)) = framed.next().await {
        let reply = match &msg {
            Message::Interested => Some(Message::Unchoke),
            Message::Request { index, begin, length } => {
                let start = *index as usize * meta.piece_length as usize + *begin as usize;
                let end = (start + *length as usize).min(content.len());
                Some(Message::Piece {
                    index: *index,
                    begin: *begin,
                    data: content[start..end].to_vec().into(),
                })
            }
            _ => None,
        };
        seen.push(msg);
        if let Some(reply) = reply {
            if framed.send(reply).await.is_err() {
                break;
            }
        }
    }
    seen
}

/// Loopback TCP seeder; counts the requests it has answered.
pub(crate) struct TcpSeeder {
    pub(crate) addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TcpSeeder {
    pub(crate) async fn start(meta: TorrentMeta, content: Arc<Vec<u8>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (counter, opened, finished) = (requests.clone(), accepted.clone(), closed.clone());
        let task = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                opened.fetch_add(1, Ordering::SeqCst);
                let meta = meta.clone();
                let content = content.clone();
                let counter = counter.clone();
                let finished = finished.clone();
                tokio::spawn(async move {
                    let seen = serve_seeder(sock, meta, content).await;
                    let n = seen.iter().filter(|m| matches!(m, Message::Request { .. })).count();
                    counter.fetch_add(n, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                });
            }
        });
        Self { addr, requests, accepted, closed, task }
    }

    /// Requests from sessions that have already disconnected.
    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// True once every accepted connection has been served to the end.
    pub(crate) fn idle(&self) -> bool {
        self.closed.load(Ordering::SeqCst) == self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for TcpSeeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
