// Server connection
//
// Newline-delimited JSON over the local socket or TCP.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;
use voltron_core::{Config, Request, Response};

pub type Reader = Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>;
pub type Writer = Box<dyn AsyncWrite + Unpin + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Unix(PathBuf),
    Tcp(String),
}

impl Transport {
    /// Command line first, then configuration. TCP wins when both are set.
    pub fn resolve(socket: Option<PathBuf>, tcp: Option<String>, config: &Config) -> Result<Self> {
        if let Some(addr) = tcp.or_else(|| config.server.tcp.clone()) {
            return Ok(Self::Tcp(addr));
        }
        match socket.or_else(|| config.server.unix_socket.clone()) {
            Some(path) => Ok(Self::Unix(path)),
            None => bail!("No server address: pass --socket or --tcp"),
        }
    }
}

pub struct Client {
    lines: Reader,
    writer: Writer,
    next_id: u64,
}

impl Client {
    pub async fn connect(transport: &Transport) -> Result<Self> {
        let (reader, writer): (Box<dyn AsyncRead + Unpin + Send>, Writer) = match transport {
            Transport::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .with_context(|| format!("Failed to connect to {}", path.display()))?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Transport::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("Failed to connect to {}", addr))?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        debug!("connected to {:?}", transport);
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
        })
    }

    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next response line, `None` when the server closes the connection.
    pub async fn read_response(&mut self) -> Result<Option<Response>> {
        match self.lines.next_line().await? {
            Some(line) => {
                let response = serde_json::from_str(&line)
                    .with_context(|| format!("Bad response from server: {}", line))?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    /// Send a request and wait for the response carrying its id.
    pub async fn call(&mut self, mut request: Request) -> Result<Response> {
        let id = self.next_id;
        self.next_id += 1;
        request.id = Some(json!(id));
        self.send_line(&request.to_wire().to_string()).await?;
        loop {
            let Some(response) = self.read_response().await? else {
                bail!("Server closed the connection");
            };
            if response.id == Some(Value::from(id)) {
                return Ok(response);
            }
            debug!("skipping unrelated response {:?}", response.id);
        }
    }

    pub fn into_parts(self) -> (Reader, Writer) {
        (self.lines, self.writer)
    }
}
