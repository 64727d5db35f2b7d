//! Smart HTTP transport.
//!
//! Requests are buffered up to `post_buffer` bytes and sent with a fixed
//! length; larger requests switch to a chunked streaming body. Response
//! bodies are pumped by a worker thread through a bounded channel so that the
//! reading side can observe cancellation while a read is pending.

use super::{Connection, Service, Transport};
use crate::advertisement::ProtocolVersion;
use crate::config::{ClientConfig, HttpConfig};
use crate::context::Context;
use crate::pktline::{PktLine, PktLineReader};
use crate::{GitError, Result};
use reqwest::blocking::{Body, Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::io::{self, Cursor, Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

/// How often blocked readers and writers look at their context.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Chunks in flight between the caller and a worker thread.
const CHANNEL_DEPTH: usize = 8;

/// Size of the chunks a response is pumped in.
const CHUNK_SIZE: usize = 64 * 1024;

/// Talks to a smart HTTP server such as `git http-backend`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    url: String,
    client: Client,
    post_buffer: usize,
}

impl HttpTransport {
    /// Creates a transport for the repository at `url`.
    pub fn new(url: &str, config: &ClientConfig) -> Result<Self> {
        let client = build_client(&config.http)?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            post_buffer: config.http.post_buffer,
        })
    }

    fn info_refs(&self, ctx: &Context, service: Service, version: ProtocolVersion) -> Result<Box<dyn Read + Send>> {
        ctx.check()?;
        let url = format!("{}/info/refs?service={}", self.url, service);
        tracing::debug!(url = %url, %version, "requesting advertisement");

        let mut request = self.client.get(&url);
        if version == ProtocolVersion::V2 && service == Service::UploadPack {
            request = request.header("Git-Protocol", version.git_protocol());
        }
        let expected = format!("application/x-{service}-advertisement");
        let body = ResponseReader::spawn(ctx.clone(), url, expected, move || request.send());
        strip_service_preamble(Box::new(body))
    }

    fn rpc(&self, ctx: &Context, service: Service, version: ProtocolVersion) -> RpcConnection {
        let url = format!("{}/{}", self.url, service);
        let mut request = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, format!("application/x-{service}-request"))
            .header(ACCEPT, format!("application/x-{service}-result"));
        if version == ProtocolVersion::V2 {
            request = request.header("Git-Protocol", version.git_protocol());
        }
        RpcConnection {
            ctx: ctx.clone(),
            url,
            expected: format!("application/x-{service}-result"),
            request: Some(request),
            post_buffer: self.post_buffer,
            pending: Vec::new(),
            stream: None,
            response: None,
        }
    }
}

fn build_client(config: &HttpConfig) -> Result<Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.extra_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GitError::Transport(format!("invalid header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| GitError::Transport(format!("invalid header value: {e}")))?;
        headers.insert(name, value);
    }
    Ok(Client::builder()
        .user_agent(config.user_agent.clone())
        .default_headers(headers)
        .connect_timeout(config.connect_timeout())
        .timeout(config.timeout())
        .build()?)
}

impl Transport for HttpTransport {
    fn url(&self) -> &str {
        &self.url
    }

    fn advertise_refs(
        &self,
        ctx: &Context,
        service: Service,
        version: ProtocolVersion,
    ) -> Result<Box<dyn Read + Send>> {
        self.info_refs(ctx, service, version)
    }

    fn upload_pack(&self, ctx: &Context, version: ProtocolVersion) -> Result<Box<dyn Connection>> {
        ctx.check()?;
        Ok(Box::new(self.rpc(ctx, Service::UploadPack, version)))
    }

    fn receive_pack(&self, ctx: &Context) -> Result<Box<dyn Connection>> {
        let advertisement = self.info_refs(ctx, Service::ReceivePack, ProtocolVersion::V1)?;
        let mut conn = self.rpc(ctx, Service::ReceivePack, ProtocolVersion::V1);
        conn.response = Some(advertisement);
        Ok(Box::new(conn))
    }
}

/// Removes the `# service=<name>` line and its flush that HTTP servers put in
/// front of v0/v1 advertisements. v2 responses carry no preamble.
fn strip_service_preamble(body: Box<dyn Read + Send>) -> Result<Box<dyn Read + Send>> {
    let mut reader = PktLineReader::new(body);
    let first = reader.read_line()?;
    if first.as_str().is_some_and(|line| line.starts_with("# service=")) {
        match reader.read_line()? {
            PktLine::Flush => {}
            other => {
                return Err(GitError::Protocol(format!(
                    "expected flush after service line, got {other:?}"
                )))
            }
        }
        return Ok(Box::new(reader.into_inner()));
    }
    Ok(Box::new(Cursor::new(first.encode()).chain(reader.into_inner())))
}

fn check_response(url: &str, expected: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status != StatusCode::OK {
        return Err(GitError::Transport(format!("{url}: HTTP {status}")));
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(expected) {
        return Err(GitError::Transport(format!(
            "{url}: unexpected content type {content_type:?}, is this a smart HTTP server?"
        )));
    }
    Ok(response)
}

/// Reads a response body pumped by a worker thread.
struct ResponseReader {
    ctx: Context,
    rx: Receiver<io::Result<Vec<u8>>>,
    chunk: Vec<u8>,
    pos: usize,
    done: bool,
}

impl ResponseReader {
    /// Runs `send` on a worker thread and streams the body of its response.
    fn spawn<F>(ctx: Context, url: String, expected: String, send: F) -> Self
    where
        F: FnOnce() -> reqwest::Result<Response> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
        std::thread::spawn(move || {
            let response = send()
                .map_err(GitError::from)
                .and_then(|response| check_response(&url, &expected, response));
            let mut response = match response {
                Ok(response) => response,
                Err(e) => {
                    let _ = tx.send(Err(e.into()));
                    return;
                }
            };
            loop {
                let mut chunk = vec![0u8; CHUNK_SIZE];
                match response.read(&mut chunk) {
                    Ok(0) => return,
                    Ok(n) => {
                        chunk.truncate(n);
                        // The reader hung up; dropping the response closes the connection.
                        if tx.send(Ok(chunk)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            }
        });
        Self {
            ctx,
            rx,
            chunk: Vec::new(),
            pos: 0,
            done: false,
        }
    }
}

impl Read for ResponseReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            if self.done {
                return Ok(0);
            }
            self.ctx.check()?;
            match self.rx.recv_timeout(POLL_INTERVAL) {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => self.done = true,
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Request body fed from a channel, for requests larger than the post buffer.
struct ChannelBody {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for ChannelBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.chunk.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// A stateless POST exchange.
struct RpcConnection {
    ctx: Context,
    url: String,
    expected: String,
    request: Option<RequestBuilder>,
    post_buffer: usize,
    pending: Vec<u8>,
    stream: Option<SyncSender<Vec<u8>>>,
    response: Option<Box<dyn Read + Send>>,
}

impl RpcConnection {
    /// Starts the POST with `body`, replacing the current response source.
    fn start(&mut self, body: Body) -> io::Result<()> {
        let request = self.request.take().ok_or_else(|| {
            io::Error::other(GitError::Transport("request already sent".to_string()))
        })?;
        tracing::debug!(url = %self.url, "sending request");
        let reader = ResponseReader::spawn(
            self.ctx.clone(),
            self.url.clone(),
            self.expected.clone(),
            move || request.body(body).send(),
        );
        self.response = Some(Box::new(reader));
        Ok(())
    }

    /// Hands a chunk to the streaming body, giving up when cancelled.
    fn send_chunk(&mut self, mut chunk: Vec<u8>) -> io::Result<()> {
        let Some(tx) = self.stream.as_ref() else {
            return Ok(());
        };
        loop {
            match tx.try_send(chunk) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    self.ctx.check()?;
                    chunk = back;
                    std::thread::sleep(POLL_INTERVAL / 5);
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(io::Error::other(GitError::Transport(format!(
                        "{}: request body closed by the server",
                        self.url
                    ))))
                }
            }
        }
    }
}

impl Write for RpcConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ctx.check()?;
        if self.stream.is_some() {
            self.send_chunk(buf.to_vec())?;
            return Ok(buf.len());
        }
        if self.request.is_none() {
            return Err(io::Error::other(GitError::Transport(
                "request already finished".to_string(),
            )));
        }
        self.pending.extend_from_slice(buf);
        if self.pending.len() > self.post_buffer {
            let (tx, rx) = mpsc::sync_channel(CHANNEL_DEPTH);
            self.start(Body::new(ChannelBody {
                rx,
                chunk: Vec::new(),
                pos: 0,
            }))?;
            self.stream = Some(tx);
            let pending = std::mem::take(&mut self.pending);
            self.send_chunk(pending)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Read for RpcConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.response.is_none() {
            self.end_request()?;
        }
        match self.response.as_mut() {
            Some(response) => response.read(buf),
            None => Ok(0),
        }
    }
}

impl Connection for RpcConnection {
    fn end_request(&mut self) -> Result<()> {
        self.ctx.check()?;
        if self.stream.take().is_some() {
            // Dropping the sender ends the chunked body.
            return Ok(());
        }
        if self.request.is_some() {
            let body = std::mem::take(&mut self.pending);
            self.start(Body::from(body))?;
        }
        Ok(())
    }

    /// Sends a request that is still pending, then reads what is left of
    /// the response so that a failed POST is reported here.
    fn close(mut self: Box<Self>) -> Result<()> {
        self.ctx.check()?;
        if self.stream.is_some() || (self.request.is_some() && !self.pending.is_empty()) {
            self.end_request()?;
        }
        if self.request.is_none() {
            if let Some(mut response) = self.response.take() {
                io::copy(&mut response, &mut io::sink())?;
            }
        }
        Ok(())
    }
}
