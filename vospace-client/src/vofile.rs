//! A single logical HTTP exchange (one node read, write, or metadata
//! round-trip) presented as a small stream with an explicit status-code
//! state machine, built over `reqwest::blocking`.

use std::io::Read as _;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::credential::send_with_connect_retry;
use crate::error::Error;
use crate::uri;

/// A single mode enum, collapsing the
/// string-or-integer-flag dual meaning some VOSpace client implementations
/// give `open`'s mode argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    Append,
    Delete,
    Head,
}

impl OpenMode {
    pub fn http_method(self) -> reqwest::Method {
        match self {
            Self::Read => reqwest::Method::GET,
            Self::Write => reqwest::Method::PUT,
            Self::Append => reqwest::Method::POST,
            Self::Delete => reqwest::Method::DELETE,
            Self::Head => reqwest::Method::HEAD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

const DEFAULT_CLOSE_CODES: &[u16] = &[200, 201, 202, 206, 302, 303, 416, 503];

/// A `std::io::Read` over an `mpsc` channel of chunks, the blocking-thread
/// equivalent of bridging a producer and an HTTP body through a bounded
/// channel: a background thread feeds the request body while the caller
/// pushes chunks into it via repeated `write()` calls.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    current: std::io::Cursor<Vec<u8>>,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            current: std::io::Cursor::new(Vec::new()),
        }
    }
}

impl std::io::Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let n = self.current.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.rx.recv() {
                Ok(chunk) => self.current = std::io::Cursor::new(chunk),
                Err(_) => return Ok(0),
            }
        }
    }
}

type UploadResult = Result<reqwest::blocking::Response, reqwest::Error>;

pub struct VOFile<'a> {
    http: &'a reqwest::blocking::Client,
    config: &'a ClientConfig,
    url: String,
    method: OpenMode,
    size: Option<u64>,
    fpos: u64,
    response: Option<reqwest::blocking::Response>,
    write_tx: Option<mpsc::SyncSender<Vec<u8>>>,
    write_handle: Option<thread::JoinHandle<UploadResult>>,
    closed: bool,
}

impl<'a> VOFile<'a> {
    /// Open a new exchange. For `Read`/`Head`/`Delete` the request is sent
    /// (and response headers received) immediately, matching a blocking
    /// `reqwest::send()`. For `Write`/`Append`, the request body is a
    /// `Read` adapter over a channel so the caller can push chunks via
    /// repeated [`VOFile::write`] calls before [`VOFile::close`] finalizes
    /// the upload.
    pub fn open(
        http: &'a reqwest::blocking::Client,
        config: &'a ClientConfig,
        url: String,
        method: OpenMode,
        size: Option<u64>,
        range: Option<String>,
    ) -> Result<Self, Error> {
        let mut file = Self {
            http,
            config,
            url,
            method,
            size,
            fpos: 0,
            response: None,
            write_tx: None,
            write_handle: None,
            closed: false,
        };
        match method {
            OpenMode::Write | OpenMode::Append => file.start_streaming_write()?,
            _ => file.start_immediate(range)?,
        }
        Ok(file)
    }

    pub fn tell(&self) -> u64 {
        self.fpos
    }

    pub fn seek(&mut self, offset: i64, whence: SeekWhence) {
        self.fpos = match whence {
            SeekWhence::Current => (self.fpos as i64 + offset).max(0) as u64,
            SeekWhence::Start => offset.max(0) as u64,
            SeekWhence::End => (self.size.unwrap_or(0) as i64 - offset).max(0) as u64,
        };
    }

    fn host(&self) -> String {
        uri::parse(&self.url).authority
    }

    fn build_request(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let mut req = self
            .http
            .request(self.method.http_method(), url)
            .header("Accept", "*/*")
            .header("User-Agent", concat!("vospace-client/", env!("CARGO_PKG_VERSION")));

        if matches!(self.method, OpenMode::Write | OpenMode::Append | OpenMode::Delete) {
            if let Some(size) = self.size {
                req = req.header("Content-Length", size.to_string());
            }
            let content_type = if matches!(self.method, OpenMode::Write) {
                guess_mime_type(url)
            } else {
                "text/xml"
            };
            req = req.header("Content-Type", content_type);
        }

        req
    }

    fn start_immediate(&mut self, range: Option<String>) -> Result<(), Error> {
        let host = self.host();
        let url = self.url.clone();
        let resp = send_with_connect_retry(self.config, &host, || {
            let mut req = self.build_request(&url);
            if let Some(r) = &range {
                req = req.header("Range", r.clone());
            }
            req
        })?;
        tracing::debug!(status = resp.status().as_u16(), url = %self.url, "opened");
        self.response = Some(resp);
        Ok(())
    }

    fn start_streaming_write(&mut self) -> Result<(), Error> {
        let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(4);
        let body = match self.size {
            Some(len) => reqwest::blocking::Body::sized(ChannelReader::new(rx), len),
            None => reqwest::blocking::Body::new(ChannelReader::new(rx)),
        };
        let request = self.build_request(&self.url).body(body);
        let handle = thread::spawn(move || request.send());
        self.write_tx = Some(tx);
        self.write_handle = Some(handle);
        Ok(())
    }

    /// Emit one chunk. The actual chunked-encoding framing is left to
    /// hyper; when the upload's total length isn't known ahead of time the
    /// body streams as `Transfer-Encoding: chunked` on the wire.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::NotConnected { url: self.url.clone() });
        }
        let tx = self
            .write_tx
            .as_ref()
            .ok_or_else(|| Error::NotConnected { url: self.url.clone() })?;
        tx.send(buf.to_vec())
            .map_err(|_| Error::NotConnected { url: self.url.clone() })?;
        Ok(buf.len())
    }

    /// Read up to `max` bytes of body (`max == 0` reads to completion),
    /// dispatching on the response status -- redirects and 503s recurse
    /// into a fresh `read` after reopening the exchange.
    pub fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let status = self.status_code();
        match status {
            416 => Ok(Vec::new()),
            200 => self.read_body(max),
            206 => {
                let bytes = self.read_body(max)?;
                self.fpos += bytes.len() as u64;
                Ok(bytes)
            }
            404 => Err(Error::NotFound { url: self.url.clone() }),
            401 => Err(Error::PermissionDenied {
                detail: self.url.clone(),
            }),
            302 | 303 => {
                let location = self
                    .response
                    .as_ref()
                    .and_then(|r| r.headers().get(reqwest::header::LOCATION))
                    .and_then(|v| v.to_str().ok())
                    .map(|s| s.to_string())
                    .ok_or_else(|| Error::NotFound { url: self.url.clone() })?;
                self.url = location;
                self.method = OpenMode::Read;
                self.start_immediate(None)?;
                self.read(max)
            }
            503 => {
                let wait = self
                    .response
                    .as_ref()
                    .and_then(|r| r.headers().get(reqwest::header::RETRY_AFTER))
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(self.config.default_retry_after);
                tracing::error!(url = %self.url, wait = ?wait, "got 503, server busy");
                thread::sleep(wait);
                self.start_immediate(None)?;
                self.read(max)
            }
            409 => {
                let body = self
                    .response
                    .take()
                    .map(|r| r.text().unwrap_or_default())
                    .unwrap_or_default();
                if body.contains("DuplicateNode") {
                    Err(Error::AlreadyExists { url: self.url.clone() })
                } else {
                    Err(Error::Unexpected {
                        status: 409,
                        reason: body,
                        url: self.url.clone(),
                    })
                }
            }
            other => {
                let reason = self
                    .response
                    .take()
                    .map(|r| r.text().unwrap_or_default())
                    .unwrap_or_default();
                Err(Error::Unexpected {
                    status: other,
                    reason,
                    url: self.url.clone(),
                })
            }
        }
    }

    fn read_body(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let resp = self
            .response
            .as_mut()
            .ok_or_else(|| Error::NotConnected { url: self.url.clone() })?;
        if max == 0 {
            let mut buf = Vec::new();
            resp.read_to_end(&mut buf)?;
            return Ok(buf);
        }
        let mut buf = vec![0u8; max];
        let n = resp.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn status_code(&self) -> u16 {
        self.response.as_ref().map(|r| r.status().as_u16()).unwrap_or(0)
    }

    /// Send the terminating zero-length chunk (by dropping the channel
    /// sender, ending the upload thread's body stream) and check the
    /// response status. Idempotent: a second call is a no-op, same as the
    /// original.
    pub fn close(&mut self) -> Result<(), Error> {
        self.close_with_codes(DEFAULT_CLOSE_CODES)
    }

    pub fn close_with_codes(&mut self, codes: &[u16]) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.finalize()?;
        self.checkstatus(codes)
    }

    /// Join the upload thread (if any) and stash its response, without
    /// running `checkstatus`. Exposed so callers that need the raw status
    /// code rather than an accept/reject verdict (`move`, whose success
    /// test is "was the status exactly 200") can finalize the exchange
    /// without close()'s code-list semantics getting in the way.
    pub(crate) fn finalize(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Some(tx) = self.write_tx.take() {
            drop(tx);
        }
        if let Some(handle) = self.write_handle.take() {
            match handle.join() {
                Ok(Ok(resp)) => self.response = Some(resp),
                Ok(Err(e)) => return Err(Error::Transport(e)),
                Err(_) => {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "upload thread panicked",
                    )))
                }
            }
        }
        Ok(())
    }

    /// The raw HTTP status code of the current response, or `0` if none
    /// has been received yet.
    pub fn status(&self) -> u16 {
        self.status_code()
    }

    fn checkstatus(&mut self, codes: &[u16]) -> Result<(), Error> {
        let status = self.status_code();
        tracing::debug!(status, url = %self.url, "checkstatus");
        if codes.contains(&status) {
            if let Some(resp) = &self.response {
                if let Some(len) = resp.content_length() {
                    self.size = Some(len);
                }
            }
            return Ok(());
        }
        match status {
            404 => Err(Error::NotFound { url: self.url.clone() }),
            401 => Err(Error::PermissionDenied {
                detail: self.url.clone(),
            }),
            409 => {
                let body = self
                    .response
                    .take()
                    .map(|r| r.text().unwrap_or_default())
                    .unwrap_or_default();
                if body.contains("DuplicateNode") {
                    Err(Error::AlreadyExists { url: self.url.clone() })
                } else {
                    Err(Error::Unexpected {
                        status,
                        reason: body,
                        url: self.url.clone(),
                    })
                }
            }
            _ => {
                let body = self
                    .response
                    .take()
                    .map(|r| r.text().unwrap_or_default())
                    .unwrap_or_default();
                Err(Error::Unexpected {
                    status,
                    reason: body,
                    url: self.url.clone(),
                })
            }
        }
    }
}

/// A small static lookup, standing in for `mimetypes.guess_type` -- this
/// crate has no general-purpose MIME database dependency, and VOSpace only
/// ever cares about a handful of extensions.
fn guess_mime_type(url: &str) -> &'static str {
    let ext = url.rsplit('.').next().unwrap_or("");
    match ext.to_ascii_lowercase().as_str() {
        "xml" => "text/xml",
        "txt" => "text/plain",
        "fits" | "fit" => "application/fits",
        "gz" => "application/gzip",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_type_from_extension() {
        assert_eq!(guess_mime_type("vos://a/b/c.xml"), "text/xml");
        assert_eq!(guess_mime_type("vos://a/b/c.fits"), "application/fits");
        assert_eq!(guess_mime_type("vos://a/b/c"), "application/octet-stream");
    }

    #[test]
    fn seek_from_current_never_goes_negative() {
        let mut fpos_holder = 0u64;
        // seek logic is exercised indirectly through VOFile in the
        // integration tests; here we just pin the saturating-at-zero
        // behaviour of the arithmetic VOFile::seek uses.
        let offset: i64 = -10;
        fpos_holder = (fpos_holder as i64 + offset).max(0) as u64;
        assert_eq!(fpos_holder, 0);
    }
}
