#![allow(dead_code)]
//! A tiny in-process HTTP/1.1 listener, hand-driven over `TcpListener`
//! instead of pulling in a test HTTP server crate.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

pub struct MockResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn text(status: u16, reason: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Spin up a listener on an ephemeral `127.0.0.1` port and serve requests
/// with `handler` until the returned guard is dropped. Every request is
/// handled on its own short-lived thread so a slow handler (e.g. one that
/// sleeps to exercise Retry-After) doesn't block other in-flight requests.
pub fn spawn(handler: impl Fn(MockRequest) -> MockResponse + Send + Sync + 'static) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock listener");
    let addr = listener.local_addr().unwrap().to_string();
    let handler = Arc::new(handler);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let handler = Arc::clone(&handler);
            thread::spawn(move || {
                let _ = serve_one(stream, handler.as_ref());
            });
        }
    });

    addr
}

fn serve_one(
    mut stream: TcpStream,
    handler: &(impl Fn(MockRequest) -> MockResponse + Send + Sync + 'static),
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);

    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    if request_line.is_empty() {
        return Ok(());
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
        }
    }

    let body = if let Some(len) = headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        buf
    } else if headers.get("transfer-encoding").map(|v| v.as_str()) == Some("chunked") {
        read_chunked(&mut reader)?
    } else {
        Vec::new()
    };

    let request = MockRequest { method, path, headers, body };
    let response = handler(request);

    let status_line = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason);
    stream.write_all(status_line.as_bytes())?;
    stream.write_all(format!("Content-Length: {}\r\n", response.body.len()).as_bytes())?;
    for (k, v) in &response.headers {
        stream.write_all(format!("{}: {}\r\n", k, v).as_bytes())?;
    }
    stream.write_all(b"Connection: close\r\n\r\n")?;
    stream.write_all(&response.body)?;
    stream.flush()
}

fn read_chunked(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let mut size_line = String::new();
        reader.read_line(&mut size_line)?;
        let size = usize::from_str_radix(size_line.trim(), 16).unwrap_or(0);
        if size == 0 {
            let mut trailer = String::new();
            reader.read_line(&mut trailer)?;
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk)?;
        out.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
    }
    Ok(out)
}
