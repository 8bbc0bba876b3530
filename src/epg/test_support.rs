//! In-process HTTP responder for downloader and refresh tests

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub(crate) const SAMPLE_GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <channel id="cbc.ca"><display-name>CBC Toronto (CBLT-DT)</display-name></channel>
  <channel id="ctv.ca"><display-name>CTV</display-name></channel>
  <programme start="20240115100000 +0000" stop="20240115110000 +0000" channel="cbc.ca"><title>Morning</title></programme>
  <programme start="20240115110000 +0000" stop="20240115120000 +0000" channel="cbc.ca"><title>Noon</title></programme>
  <programme start="20240115090000 +0000" stop="20240115130000 +0000" channel="ctv.ca"><title>Marathon</title></programme>
</tv>"#;

pub(crate) const OTHER_GUIDE: &str = r#"<tv>
  <channel id="tsn.ca"><display-name>TSN</display-name></channel>
  <programme start="20240115100000 +0000" stop="20240115120000 +0000" channel="tsn.ca"><title>Hockey</title></programme>
</tv>"#;

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    /// 200 with Content-Length and optional validators
    Full {
        body: String,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// 200 with a chunked body, so the length is unknown up front
    Chunked(String),
    NotModified,
    Status(u16),
    /// 200 that trickles a large body slowly
    Slow,
}

impl Reply {
    pub(crate) fn full(body: &str, etag: &str) -> Self {
        Reply::Full {
            body: body.to_string(),
            etag: Some(etag.to_string()),
            last_modified: Some("Mon, 15 Jan 2024 12:00:00 GMT".to_string()),
        }
    }
}

pub(crate) struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    /// Serve `replies` in order, one per connection; the last one repeats
    pub(crate) fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        thread::spawn(move || {
            let mut served = 0usize;
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let head = read_head(&mut stream);
                seen.lock().unwrap().push(head);
                let reply = replies
                    .get(served)
                    .or_else(|| replies.last())
                    .cloned()
                    .unwrap_or(Reply::Status(404));
                served += 1;
                thread::spawn(move || {
                    let _ = respond(&mut stream, reply);
                });
            }
        });

        Self { addr, requests }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Request heads received so far, lowercased
    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

/// A URL nothing listens on
pub(crate) fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/guide.xml")
}

fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&head).to_lowercase()
}

fn respond(stream: &mut TcpStream, reply: Reply) -> std::io::Result<()> {
    match reply {
        Reply::Full {
            body,
            etag,
            last_modified,
        } => {
            let mut head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/xml\r\nContent-Length: {}\r\nConnection: close\r\n",
                body.len()
            );
            if let Some(etag) = etag {
                head.push_str(&format!("ETag: {etag}\r\n"));
            }
            if let Some(lm) = last_modified {
                head.push_str(&format!("Last-Modified: {lm}\r\n"));
            }
            head.push_str("\r\n");
            stream.write_all(head.as_bytes())?;
            stream.write_all(body.as_bytes())?;
        }
        Reply::Chunked(body) => {
            stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: application/xml\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
            )?;
            for piece in body.as_bytes().chunks(64) {
                stream.write_all(format!("{:x}\r\n", piece.len()).as_bytes())?;
                stream.write_all(piece)?;
                stream.write_all(b"\r\n")?;
            }
            stream.write_all(b"0\r\n\r\n")?;
        }
        Reply::NotModified => {
            stream.write_all(b"HTTP/1.1 304 Not Modified\r\nConnection: close\r\n\r\n")?;
        }
        Reply::Status(code) => {
            stream.write_all(
                format!("HTTP/1.1 {code} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )?;
        }
        Reply::Slow => {
            let chunk = [b' '; 1024];
            let total = chunk.len() * 500;
            stream.write_all(
                format!("HTTP/1.1 200 OK\r\nContent-Length: {total}\r\nConnection: close\r\n\r\n")
                    .as_bytes(),
            )?;
            for _ in 0..500 {
                stream.write_all(&chunk)?;
                stream.flush()?;
                thread::sleep(Duration::from_millis(20));
            }
        }
    }
    stream.flush()
}
