//! Host-side client library.
//!
//! Applications link against this instead of speaking the socket protocol
//! directly: [`CpcHandle::init`] connects and validates the daemon,
//! [`CpcHandle::open_endpoint`] yields a [`CpcEndpoint`] carrying discrete
//! payloads. Link resets surface as events on [`CpcHandle::reset_events`]
//! rather than a process-global callback; after one, call
//! [`CpcHandle::init`] again and reopen endpoints.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};

use crate::core::{EP_RESERVED, EP_SECURITY, EP_SYSTEM, LIBRARY_API_VERSION};
use crate::server::{read_message, write_message, ExchangeKind, ExchangeMessage};

/// Errors surfaced to client applications.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The daemon speaks a different socket protocol version.
    #[error("daemon protocol version {daemon} does not match library version {library}")]
    VersionMismatch {
        /// Version reported by the daemon.
        daemon: u8,
        /// Version compiled into this library.
        library: u8,
    },

    /// The endpoint cannot be opened right now; retry later.
    #[error("endpoint {0} not available, retry later")]
    Again(u8),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The daemon closed the endpoint (remote close, reset or fault).
    #[error("endpoint connection lost")]
    ConnectionLost,

    /// The daemon answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error on a daemon socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handle to one daemon instance.
pub struct CpcHandle {
    ctrl: Mutex<UnixStream>,
    instance_dir: PathBuf,
    max_write: usize,
}

impl CpcHandle {
    /// Connect to the daemon and validate versions.
    ///
    /// `socket_dir` and `instance` must match the daemon's configuration.
    pub async fn init(socket_dir: &Path, instance: &str) -> Result<Self, ClientError> {
        let instance_dir = socket_dir.join("cpcd").join(instance);
        let ctrl_path = instance_dir.join("ctrl.cpcd.sock");
        let stream = UnixStream::connect(&ctrl_path).await?;

        let mut handle = Self {
            ctrl: Mutex::new(stream),
            instance_dir,
            max_write: 0,
        };

        // Register for reset signalling before anything else, mirroring the
        // daemon's expectation that every client has a pid on file.
        handle
            .request(ExchangeMessage::new(
                ExchangeKind::SetPid,
                0,
                (std::process::id() as i32).to_le_bytes().to_vec(),
            ))
            .await?;

        let reply = handle
            .request(ExchangeMessage::new(
                ExchangeKind::MaxWriteSizeQuery,
                0,
                Vec::new(),
            ))
            .await?;
        let bytes = reply
            .payload
            .get(..4)
            .ok_or_else(|| ClientError::Protocol("short max-write reply".into()))?;
        handle.max_write = u32::from_le_bytes(bytes.try_into().unwrap()) as usize;

        let reply = handle
            .request(ExchangeMessage::new(
                ExchangeKind::VersionQuery,
                0,
                vec![LIBRARY_API_VERSION],
            ))
            .await?;
        let daemon = reply
            .payload
            .first()
            .copied()
            .ok_or_else(|| ClientError::Protocol("short version reply".into()))?;
        if daemon != LIBRARY_API_VERSION {
            return Err(ClientError::VersionMismatch {
                daemon,
                library: LIBRARY_API_VERSION,
            });
        }

        Ok(handle)
    }

    /// Largest payload accepted per write.
    pub fn max_write_size(&self) -> usize {
        self.max_write
    }

    /// Open an endpoint and connect to its data socket.
    ///
    /// Only a TX window of 1 is supported. A [`ClientError::Again`] means
    /// the daemon is not ready (link down, security session pending, or the
    /// peer endpoint closed); the call may be retried.
    pub async fn open_endpoint(&self, id: u8, tx_window: u8) -> Result<CpcEndpoint, ClientError> {
        if tx_window != 1 {
            return Err(ClientError::InvalidArgument("only a tx window of 1 is supported"));
        }
        if id == EP_SYSTEM || id == EP_SECURITY || id == EP_RESERVED {
            return Err(ClientError::InvalidArgument("reserved endpoint id"));
        }

        let reply = self
            .request(ExchangeMessage::new(
                ExchangeKind::OpenEndpointQuery,
                id,
                Vec::new(),
            ))
            .await?;
        if reply.payload.first().copied() != Some(1) {
            return Err(ClientError::Again(id));
        }

        let path = self.instance_dir.join(format!("ep{id}.cpcd.sock"));
        let mut stream = UnixStream::connect(&path).await?;

        // The daemon acks the connection before any payload flows.
        let Some(body) = read_message(&mut stream).await? else {
            return Err(ClientError::Again(id));
        };
        let ack = ExchangeMessage::decode(&body)
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        if ack.kind != ExchangeKind::OpenEndpointQuery {
            return Err(ClientError::Protocol("unexpected open ack".into()));
        }

        Ok(CpcEndpoint {
            id,
            stream,
            max_write: self.max_write,
        })
    }

    /// Close an endpoint. Closing an already-closed endpoint succeeds.
    pub async fn close_endpoint(&self, id: u8) -> Result<(), ClientError> {
        let reply = self
            .request(ExchangeMessage::new(
                ExchangeKind::CloseEndpointQuery,
                id,
                Vec::new(),
            ))
            .await?;
        if reply.payload.first().copied() == Some(1) {
            Ok(())
        } else {
            Err(ClientError::InvalidArgument("endpoint cannot be closed"))
        }
    }

    /// Read the daemon's state code for an endpoint.
    pub async fn endpoint_state(&self, id: u8) -> Result<u8, ClientError> {
        let reply = self
            .request(ExchangeMessage::new(
                ExchangeKind::EndpointStatusQuery,
                id,
                Vec::new(),
            ))
            .await?;
        reply
            .payload
            .first()
            .copied()
            .ok_or_else(|| ClientError::Protocol("short status reply".into()))
    }

    /// Subscribe to link-reset events.
    ///
    /// The daemon raises SIGUSR1 on a link reset; this converts it into a
    /// typed event stream. Subscribe once at startup, then re-init on each
    /// event.
    pub fn reset_events() -> std::io::Result<mpsc::UnboundedReceiver<()>> {
        let mut signal =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while signal.recv().await.is_some() {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// One request/response exchange on the control socket.
    ///
    /// The mutex serializes concurrent callers so replies cannot interleave.
    async fn request(&self, msg: ExchangeMessage) -> Result<ExchangeMessage, ClientError> {
        let mut ctrl = self.ctrl.lock().await;
        write_message(&mut *ctrl, &msg.encode()).await?;
        let Some(body) = read_message(&mut *ctrl).await? else {
            return Err(ClientError::ConnectionLost);
        };
        ExchangeMessage::decode(&body).map_err(|e| ClientError::Protocol(e.to_string()))
    }
}

/// An open endpoint connection.
pub struct CpcEndpoint {
    id: u8,
    stream: UnixStream,
    max_write: usize,
}

impl CpcEndpoint {
    /// Endpoint id.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Read the next payload. [`ClientError::ConnectionLost`] on EOF.
    pub async fn read(&mut self) -> Result<Vec<u8>, ClientError> {
        match read_message(&mut self.stream).await? {
            Some(payload) => Ok(payload),
            None => Err(ClientError::ConnectionLost),
        }
    }

    /// Write one payload as a discrete message.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), ClientError> {
        if data.len() > self.max_write {
            return Err(ClientError::InvalidArgument("payload exceeds max write size"));
        }
        write_message(&mut self.stream, data).await?;
        Ok(())
    }
}
