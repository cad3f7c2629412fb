//! ServerCore: the host-facing socket surface.
//!
//! One control socket per daemon instance plus one lazily created data
//! socket per endpoint, all message-preserving unix sockets under
//! `<dir>/cpcd/<instance>/`. The control socket accepts many clients; each
//! data socket accepts one, whose traffic is proxied to the engine.

mod message;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use message::{read_message, write_message, ExchangeKind, ExchangeMessage, MessageError};

use crate::core::{Error, LIBRARY_API_VERSION, MAX_WRITE_SIZE};
use crate::engine::{EngineHandle, EngineNotice};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory under which the per-instance socket directory is created.
    pub socket_dir: PathBuf,
    /// Daemon instance name.
    pub instance: String,
}

impl ServerConfig {
    /// Directory holding this instance's sockets.
    pub fn instance_dir(&self) -> PathBuf {
        self.socket_dir.join("cpcd").join(&self.instance)
    }

    /// Path of the control socket.
    pub fn ctrl_path(&self) -> PathBuf {
        self.instance_dir().join("ctrl.cpcd.sock")
    }

    /// Path of an endpoint's data socket.
    pub fn endpoint_path(&self, id: u8) -> PathBuf {
        self.instance_dir().join(format!("ep{id}.cpcd.sock"))
    }
}

#[derive(Clone)]
struct Shared {
    cfg: ServerConfig,
    engine: EngineHandle,
    pids: Arc<Mutex<HashSet<i32>>>,
    listeners: Arc<Mutex<HashSet<u8>>>,
}

/// Run the server until the engine goes away.
///
/// Consumes the engine notice stream: link resets fan out as SIGUSR1 to
/// every registered client pid.
pub async fn run(
    engine: EngineHandle,
    mut notices: mpsc::UnboundedReceiver<EngineNotice>,
    cfg: ServerConfig,
) -> Result<(), Error> {
    let dir = cfg.instance_dir();
    std::fs::create_dir_all(&dir)?;

    let ctrl_path = cfg.ctrl_path();
    let _ = std::fs::remove_file(&ctrl_path);
    let ctrl_listener = UnixListener::bind(&ctrl_path)?;
    info!(path = %ctrl_path.display(), "control socket ready");

    let shared = Shared {
        cfg,
        engine,
        pids: Arc::new(Mutex::new(HashSet::new())),
        listeners: Arc::new(Mutex::new(HashSet::new())),
    };

    let accept_shared = shared.clone();
    tokio::spawn(async move {
        loop {
            match ctrl_listener.accept().await {
                Ok((stream, _)) => {
                    let shared = accept_shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_ctrl_client(shared, stream).await {
                            debug!(error = %e, "control client ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                    break;
                }
            }
        }
    });

    while let Some(notice) = notices.recv().await {
        match notice {
            EngineNotice::LinkUp => debug!("link up"),
            EngineNotice::LinkReset => signal_reset(&shared),
            EngineNotice::EndpointDown { id } => debug!(endpoint = id, "endpoint down"),
        }
    }
    Ok(())
}

/// SIGUSR1 every registered client; they re-init through the library.
fn signal_reset(shared: &Shared) {
    let pids = shared.pids.lock().expect("pid set poisoned");
    for &pid in pids.iter() {
        debug!(pid, "signalling link reset");
        // SAFETY: plain kill(2) with a valid signal number.
        unsafe {
            libc::kill(pid, libc::SIGUSR1);
        }
    }
}

async fn serve_ctrl_client(shared: Shared, mut stream: UnixStream) -> Result<(), Error> {
    while let Some(body) = read_message(&mut stream).await? {
        let msg = match ExchangeMessage::decode(&body) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "bad control message");
                continue;
            }
        };

        let reply = match msg.kind {
            ExchangeKind::VersionQuery => ExchangeMessage::new(
                ExchangeKind::VersionQuery,
                0,
                vec![LIBRARY_API_VERSION],
            ),
            ExchangeKind::MaxWriteSizeQuery => ExchangeMessage::new(
                ExchangeKind::MaxWriteSizeQuery,
                0,
                (MAX_WRITE_SIZE as u32).to_le_bytes().to_vec(),
            ),
            ExchangeKind::SetPid => {
                if let Some(bytes) = msg.payload.get(..4) {
                    let pid = i32::from_le_bytes(bytes.try_into().unwrap());
                    shared.pids.lock().expect("pid set poisoned").insert(pid);
                    debug!(pid, "client registered");
                }
                ExchangeMessage::new(ExchangeKind::SetPid, 0, Vec::new())
            }
            ExchangeKind::OpenEndpointQuery => {
                let can_open = shared
                    .engine
                    .open_query(msg.endpoint)
                    .await
                    .unwrap_or(false);
                if can_open {
                    ensure_endpoint_listener(&shared, msg.endpoint)?;
                }
                ExchangeMessage::new(
                    ExchangeKind::OpenEndpointQuery,
                    msg.endpoint,
                    vec![u8::from(can_open)],
                )
            }
            ExchangeKind::CloseEndpointQuery => {
                let ok = shared.engine.close(msg.endpoint).await.unwrap_or(false);
                ExchangeMessage::new(
                    ExchangeKind::CloseEndpointQuery,
                    msg.endpoint,
                    vec![u8::from(ok)],
                )
            }
            ExchangeKind::EndpointStatusQuery => {
                let state = shared.engine.status(msg.endpoint).await.unwrap_or(0);
                ExchangeMessage::new(ExchangeKind::EndpointStatusQuery, msg.endpoint, vec![state])
            }
        };

        write_message(&mut stream, &reply.encode()).await?;
    }
    Ok(())
}

/// Create the data socket for `id` on first use.
fn ensure_endpoint_listener(shared: &Shared, id: u8) -> Result<(), Error> {
    {
        let mut listeners = shared.listeners.lock().expect("listener set poisoned");
        if !listeners.insert(id) {
            return Ok(());
        }
    }

    let path = shared.cfg.endpoint_path(id);
    let _ = std::fs::remove_file(&path);
    let listener = UnixListener::bind(&path)?;
    info!(endpoint = id, path = %path.display(), "endpoint socket ready");

    let shared = shared.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_endpoint_client(shared, id, stream).await {
                            debug!(endpoint = id, error = %e, "endpoint client ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(endpoint = id, error = %e, "endpoint accept failed");
                    break;
                }
            }
        }
    });
    Ok(())
}

async fn serve_endpoint_client(
    shared: Shared,
    id: u8,
    mut stream: UnixStream,
) -> Result<(), Error> {
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Bytes>();
    if let Err(e) = shared.engine.attach(id, sink_tx).await {
        // A second client, or a faulted endpoint: refuse by closing.
        debug!(endpoint = id, error = %e, "attach refused");
        return Ok(());
    }

    // Daemon -> client open ack: empty OpenEndpointQuery.
    let ack = ExchangeMessage::new(ExchangeKind::OpenEndpointQuery, id, Vec::new());
    write_message(&mut stream, &ack.encode()).await?;

    let (mut reader, mut writer) = stream.into_split();
    loop {
        tokio::select! {
            inbound = read_message(&mut reader) => match inbound? {
                Some(data) => {
                    if data.len() > MAX_WRITE_SIZE {
                        warn!(endpoint = id, len = data.len(), "client write too large, dropping");
                        continue;
                    }
                    if shared.engine.write(id, Bytes::from(data)).is_err() {
                        break;
                    }
                }
                None => {
                    // Client closed its socket: begin the endpoint close.
                    let _ = shared.engine.detach(id);
                    break;
                }
            },
            outbound = sink_rx.recv() => match outbound {
                Some(payload) => write_message(&mut writer, &payload).await?,
                // Engine dropped the sink: endpoint closed or link reset.
                None => break,
            },
        }
    }
    Ok(())
}
