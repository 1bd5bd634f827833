//! Blocking client for the script service.
//!
//! Requests are written as single lines; replies are indented JSON objects,
//! so the client decodes them from the socket as a stream of JSON values
//! rather than line by line. Replies whose `reply_id` does not match the
//! outstanding request are skipped.

use std::io::{self, BufReader, BufWriter, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::de::{IoRead, StreamDeserializer};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::protocol::encode_request;

/// Errors produced by the [`Client`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error while talking to the service.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A reply could not be decoded.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    /// The service stopped the request at its step budget.
    #[error("request {request_id} did not finish within the step budget")]
    Timeout {
        /// Id of the request.
        request_id: i64,
        /// Error text, set when rendering rather than computing timed out.
        detail: Option<String>,
    },
    /// The script failed to compile or raised an error.
    #[error("request {request_id} failed: {message}")]
    Remote {
        /// Id of the request.
        request_id: i64,
        /// Error reported by the service.
        message: String,
    },
    /// The service closed the connection before replying.
    #[error("connection closed before a reply arrived")]
    Disconnected,
}

/// One decoded response envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    /// A step budget ran out.
    pub timeout: bool,
    /// The rendered result.
    #[serde(default)]
    pub result: Value,
    /// Error text, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// Echoed request id; `None` for unattributable protocol errors.
    #[serde(default)]
    pub reply_id: Option<i64>,
}

/// Synchronous client over one TCP connection.
pub struct Client {
    writer: BufWriter<TcpStream>,
    replies: StreamDeserializer<'static, IoRead<BufReader<TcpStream>>, Reply>,
    next_request_id: i64,
}

impl Client {
    /// Connect to a running service.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect(candidate) {
                Ok(stream) => return Self::from_stream(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(ClientError::Io(last_err.unwrap_or_else(|| {
            io::Error::new(ErrorKind::AddrNotAvailable, "no address resolved")
        })))
    }

    /// Connect, retrying refused connections until `timeout` elapses.
    ///
    /// Useful when the service is started alongside the client.
    pub fn connect_waiting<A: ToSocketAddrs + Clone>(
        addr: A,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::connect(addr.clone()) {
                Err(ClientError::Io(err))
                    if err.kind() == ErrorKind::ConnectionRefused && Instant::now() < deadline =>
                {
                    debug!("service not accepting yet; retrying");
                    thread::sleep(Duration::from_millis(50));
                }
                other => return other,
            }
        }
    }

    fn from_stream(stream: TcpStream) -> Result<Self, ClientError> {
        stream.set_nodelay(true)?;
        let reader = BufReader::new(stream.try_clone()?);
        let replies = serde_json::Deserializer::from_reader(reader).into_iter::<Reply>();
        Ok(Self {
            writer: BufWriter::new(stream),
            replies,
            next_request_id: 0,
        })
    }

    /// Bound how long to wait for a reply; `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.writer.get_ref().set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send `code` and return the raw reply.
    pub fn issue(&mut self, code: &str) -> Result<Reply, ClientError> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let mut line = encode_request(request_id, code);
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;

        loop {
            let reply = match self.replies.next() {
                None => return Err(ClientError::Disconnected),
                Some(Err(err)) if err.is_eof() => return Err(ClientError::Disconnected),
                Some(Err(err)) if err.is_io() => return Err(ClientError::Io(err.into())),
                Some(Err(err)) => return Err(ClientError::Json(err)),
                Some(Ok(reply)) => reply,
            };
            if reply.reply_id == Some(request_id) {
                return Ok(reply);
            }
            debug!(expected = request_id, got = ?reply.reply_id, "skipping unrelated reply");
        }
    }

    /// Send `code` and return its result, mapping timeouts and errors.
    pub fn execute(&mut self, code: &str) -> Result<Value, ClientError> {
        let reply = self.issue(code)?;
        let request_id = reply.reply_id.unwrap_or_default();
        if reply.timeout {
            return Err(ClientError::Timeout {
                request_id,
                detail: reply.error,
            });
        }
        if let Some(message) = reply.error {
            return Err(ClientError::Remote {
                request_id,
                message,
            });
        }
        Ok(reply.result)
    }

    /// Round-trip `return 2+2` and check the answer.
    pub fn test_connection(&mut self) -> Result<bool, ClientError> {
        let result = self.execute("return 2+2")?;
        Ok(result.as_f64() == Some(4.0))
    }
}
