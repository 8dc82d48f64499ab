//! Local websocket server and test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use speak_stream::audio_sink::{AudioError, AudioSink};
use speak_stream::endpoint::{EndpointError, EndpointProvider};
use speak_stream::protocol::{encode_binary_frame, PrefixHeader, WAV_HEADER_LEN};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}

/// Accepts websocket connections on an ephemeral local port.
pub struct MockServer {
    url: String,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let (tx, connections) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                match accept_async(stream).await {
                    Ok(ws) => {
                        if tx.send(ServerConnection { ws }).is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("MockServer: handshake failed: {}", e),
                }
            }
        });

        Self {
            url,
            connections,
            task,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(WAIT, self.connections.recv())
            .await
            .expect("no connection within timeout")
            .expect("server stopped")
    }

    /// Stops listening; later connection attempts are refused.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ServerConnection {
    ws: WebSocketStream<TcpStream>,
}

impl ServerConnection {
    /// Next outbound request sent by the client.
    pub async fn next_request(&mut self) -> Value {
        loop {
            let message = tokio::time::timeout(WAIT, self.ws.next())
                .await
                .expect("no request within timeout");
            match message {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for a request: {:?}", other),
            }
        }
    }

    pub async fn next_request_id(&mut self) -> u64 {
        self.next_request().await["request_id"].as_u64().unwrap()
    }

    pub async fn send_audio(&mut self, request_id: u64, part: u32, chunk: Option<u32>, payload: &[u8]) {
        let bytes = encode_binary_frame(&PrefixHeader::new(request_id, part, chunk), payload).unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    pub async fn send_end_of_stream(&mut self, request_id: u64) {
        self.send_audio(request_id, 0, None, &[]).await;
    }

    pub async fn send_status(&mut self, request_id: u64, status: &str) {
        let text = json!({ "request_id": request_id, "data": { "status": status } }).to_string();
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Sends a complete single-part response.
    pub async fn respond(&mut self, request_id: u64, millis: usize) {
        self.send_audio(request_id, 0, None, &wav(millis)).await;
        self.send_status(request_id, "ready").await;
        self.send_end_of_stream(request_id).await;
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// 16-bit mono WAV fragment lasting `millis` at 1 kHz.
pub fn wav(millis: usize) -> Vec<u8> {
    let data_len = millis * 2;
    let mut bytes = Vec::with_capacity(WAV_HEADER_LEN + data_len);
    bytes.extend_from_slice(b"RIFF");
    bytes.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    bytes.extend_from_slice(b"WAVEfmt ");
    bytes.extend_from_slice(&16u32.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1u16.to_le_bytes());
    bytes.extend_from_slice(&1000u32.to_le_bytes());
    bytes.extend_from_slice(&2000u32.to_le_bytes());
    bytes.extend_from_slice(&2u16.to_le_bytes());
    bytes.extend_from_slice(&16u16.to_le_bytes());
    bytes.extend_from_slice(b"data");
    bytes.extend_from_slice(&(data_len as u32).to_le_bytes());
    bytes.resize(WAV_HEADER_LEN + data_len, 0);
    bytes
}

/// Hands out the configured URLs in turn and counts fetches.
pub struct CountingProvider {
    urls: Vec<String>,
    fetches: AtomicUsize,
}

impl CountingProvider {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointProvider for CountingProvider {
    async fn fetch_url(&self) -> Result<String, EndpointError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        let url = self.urls[n.min(self.urls.len() - 1)].clone();
        Ok(url)
    }
}

/// An address nothing listens on.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/", addr)
}

/// Records which request each written fragment belonged to.
#[derive(Default)]
pub struct MemorySink {
    writes: Mutex<Vec<(u64, u32, Option<u32>)>>,
    clears: AtomicUsize,
}

impl MemorySink {
    pub fn writes(&self) -> Vec<(u64, u32, Option<u32>)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn request_order(&self) -> Vec<u64> {
        let mut order: Vec<u64> = Vec::new();
        for (request_id, _, _) in self.writes() {
            if order.last() != Some(&request_id) {
                order.push(request_id);
            }
        }
        order
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for MemorySink {
    async fn write_fragment(&self, prefix: &PrefixHeader, _payload: &[u8]) -> Result<(), AudioError> {
        self.writes
            .lock()
            .unwrap()
            .push((prefix.request_id, prefix.part_id, prefix.chunk_id));
        Ok(())
    }

    async fn clear(&self) -> Result<(), AudioError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn end_stream(&self) -> Result<(), AudioError> {
        Ok(())
    }
}
