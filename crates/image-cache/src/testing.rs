//! Scripted transport and a local HTTP server for tests

use crate::error::TransportError;
use crate::memory::png_bytes;
use crate::transport::{Download, Fetched, Transport};
use crate::types::Priority;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

/// Serves canned bodies, fails chosen URLs with a status, and counts calls.
///
/// A held transport parks every request until [`MockTransport::release`].
pub(crate) struct MockTransport {
    bodies: HashMap<String, (Bytes, Option<String>)>,
    failures: HashMap<String, u16>,
    download_dir: PathBuf,
    gate: Semaphore,
    fetches: AtomicUsize,
    downloads: AtomicUsize,
    served: AtomicUsize,
}

impl MockTransport {
    pub fn new(download_dir: PathBuf) -> Self {
        Self::with_gate(download_dir, Semaphore::MAX_PERMITS)
    }

    pub fn held(download_dir: PathBuf) -> Self {
        Self::with_gate(download_dir, 0)
    }

    fn with_gate(download_dir: PathBuf, permits: usize) -> Self {
        Self {
            bodies: HashMap::new(),
            failures: HashMap::new(),
            download_dir,
            gate: Semaphore::new(permits),
            fetches: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
        }
    }

    /// Serve a small PNG for `url`
    pub fn with_png(self, url: &str) -> Self {
        self.with_body(url, &png_bytes(2, 2), Some("image/png"))
    }

    pub fn with_body(mut self, url: &str, body: &[u8], mime_type: Option<&str>) -> Self {
        self.bodies.insert(
            url.to_string(),
            (Bytes::copy_from_slice(body), mime_type.map(str::to_string)),
        );
        self
    }

    pub fn with_failure(mut self, url: &str, status: u16) -> Self {
        self.failures.insert(url.to_string(), status);
        self
    }

    /// Let held requests through
    pub fn release(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    /// Requests that produced a response
    pub fn served_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    async fn respond(&self, url: &str) -> Result<Fetched, TransportError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| TransportError::Status(503))?;

        if let Some(status) = self.failures.get(url) {
            return Err(TransportError::Status(*status));
        }
        match self.bodies.get(url) {
            Some((data, mime_type)) => Ok(Fetched {
                data: data.clone(),
                mime_type: mime_type.clone(),
            }),
            None => Err(TransportError::Status(404)),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch(&self, url: &str, _priority: Priority) -> Result<Fetched, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let fetched = self.respond(url).await?;
        self.served.fetch_add(1, Ordering::SeqCst);
        Ok(fetched)
    }

    async fn download(&self, url: &str, _priority: Priority) -> Result<Download, TransportError> {
        let n = self.downloads.fetch_add(1, Ordering::SeqCst);
        let fetched = self.respond(url).await?;

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.download_dir.join(format!("download-{n}"));
        tokio::fs::write(&path, &fetched.data).await?;
        self.served.fetch_add(1, Ordering::SeqCst);

        Ok(Download {
            path,
            mime_type: fetched.mime_type,
            len: fetched.data.len() as u64,
        })
    }
}

/// Minimal HTTP/1.1 server on localhost that counts the requests it reads.
///
/// Every request gets the same PNG body. A stalling server promises twice
/// the body it sends and then never closes the connection.
pub(crate) struct TestServer {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::spawn(false).await
    }

    pub async fn stalling() -> Self {
        Self::spawn(true).await
    }

    async fn spawn(stall: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicUsize::new(0));
        let body = png_bytes(2, 2);

        let counter = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(respond(socket, body.clone(), Arc::clone(&counter), stall));
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path)
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

async fn respond(mut socket: TcpStream, body: Vec<u8>, counter: Arc<AtomicUsize>, stall: bool) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    counter.fetch_add(1, Ordering::SeqCst);

    let promised = if stall { body.len() * 2 } else { body.len() };
    let head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {promised}\r\nConnection: close\r\n\r\n"
    );
    if socket.write_all(head.as_bytes()).await.is_err() || socket.write_all(&body).await.is_err() {
        return;
    }
    if stall {
        std::future::pending::<()>().await;
    }
    let _ = socket.shutdown().await;
}
