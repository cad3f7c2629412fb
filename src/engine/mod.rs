//! The protocol engine: endpoint state machines, ARQ, reset synchronization
//! and the event loop that drives them.
//!
//! One engine task owns every endpoint, the driver, the framer and the
//! timers. It never blocks: all I/O is async, timers live in a deadline
//! min-heap, and crypto is delegated to the security worker. Everything
//! else in the daemon talks to it through [`EngineHandle`].

mod endpoint;
mod retransmit;
mod timer;

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub use endpoint::{Endpoint, EndpointState, FaultReason};
pub use retransmit::{PendingFrame, RetransmitQueue, TimeoutAction};
pub use timer::{TimerId, TimerQueue};

use crate::core::{
    EngineError, Error, SecurityError, ACK_TIMEOUT, AEAD_TAG_SIZE, DEFAULT_WINDOW, ENDPOINT_COUNT,
    EP_RESERVED, EP_SECURITY, EP_SYSTEM, MAX_PAYLOAD_SIZE, SEQ_MOD, SHUTDOWN_GRACE,
    VIOLATION_THRESHOLD, VIOLATION_WINDOW,
};
use crate::crypto::{HandshakeMessage, SecurityHandle, SessionState};
use crate::driver::Driver;
use crate::link::{
    Control, DecodeEvent, Frame, FrameDecoder, FrameHeader, SupervisoryFunction,
    UnnumberedFunction,
};
use crate::system::{
    DiscoveryStep, PendingQuery, PropertyId, SystemChannel, SystemCommand, PROTOCOL_VERSION,
};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// TX window applied to user endpoints.
    pub tx_window: u8,
    /// Encrypt user-endpoint payloads.
    pub encryption: bool,
    /// Run the reset/discovery sequence against the secondary at startup.
    pub reset_sequence: bool,
    /// Identifier of our binding key, checked against the secondary's.
    pub key_id: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_window: DEFAULT_WINDOW,
            encryption: false,
            reset_sequence: true,
            key_id: None,
        }
    }
}

/// Requests accepted by the engine.
pub enum Command {
    /// Can a client open this endpoint? Consults the secondary.
    OpenQuery {
        /// Endpoint id.
        endpoint: u8,
        /// Reply: true when the client may proceed to connect.
        reply: oneshot::Sender<bool>,
    },
    /// A client connected to the endpoint socket.
    Attach {
        /// Endpoint id.
        endpoint: u8,
        /// Channel on which received payloads are delivered to the client.
        sink: mpsc::UnboundedSender<Bytes>,
        /// Reply with the attach outcome.
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    /// A client submitted a payload.
    Write {
        /// Endpoint id.
        endpoint: u8,
        /// Payload bytes.
        data: Bytes,
    },
    /// The client's socket went away.
    Detach {
        /// Endpoint id.
        endpoint: u8,
    },
    /// Explicit close request from the control socket. Idempotent.
    Close {
        /// Endpoint id.
        endpoint: u8,
        /// Reply: true on success (including closing an already-closed one).
        reply: oneshot::Sender<bool>,
    },
    /// Report the endpoint's state code.
    Status {
        /// Endpoint id.
        endpoint: u8,
        /// Reply with [`EndpointState::code`].
        reply: oneshot::Sender<u8>,
    },
    /// Graceful shutdown: U-Reset every open endpoint, wait for U-Acks.
    Shutdown {
        /// Resolved when the engine has wound down.
        done: oneshot::Sender<()>,
    },
}

/// Events the engine surfaces to the server layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineNotice {
    /// Discovery finished; endpoints may be opened.
    LinkUp,
    /// The link was reset; registered clients must be signalled.
    LinkReset,
    /// An endpoint left the Open state; its client socket should close.
    EndpointDown {
        /// Endpoint id.
        id: u8,
    },
}

/// Cloneable handle for submitting [`Command`]s to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.tx.send(cmd).map_err(|_| EngineError::EngineGone)
    }

    /// Ask whether `endpoint` can be opened right now.
    pub async fn open_query(&self, endpoint: u8) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::OpenQuery { endpoint, reply })?;
        rx.await.map_err(|_| EngineError::EngineGone)
    }

    /// Attach a client delivery channel to `endpoint`.
    pub async fn attach(
        &self,
        endpoint: u8,
        sink: mpsc::UnboundedSender<Bytes>,
    ) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Attach {
            endpoint,
            sink,
            reply,
        })?;
        rx.await.map_err(|_| EngineError::EngineGone)?
    }

    /// Submit a client payload for transmission.
    pub fn write(&self, endpoint: u8, data: Bytes) -> Result<(), EngineError> {
        self.send(Command::Write { endpoint, data })
    }

    /// Signal that the client socket for `endpoint` is gone.
    pub fn detach(&self, endpoint: u8) -> Result<(), EngineError> {
        self.send(Command::Detach { endpoint })
    }

    /// Close `endpoint`. Closing a closed endpoint succeeds.
    pub async fn close(&self, endpoint: u8) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Close { endpoint, reply })?;
        rx.await.map_err(|_| EngineError::EngineGone)
    }

    /// Read the endpoint's state code.
    pub async fn status(&self, endpoint: u8) -> Result<u8, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { endpoint, reply })?;
        rx.await.map_err(|_| EngineError::EngineGone)
    }

    /// Gracefully shut the engine down.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Shutdown { done })?;
        rx.await.map_err(|_| EngineError::EngineGone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Down,
    WaitResetAck,
    Discovery,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HsStage {
    AwaitingId,
    AwaitingEphemeral,
    AwaitingSessionId(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Retransmit(u8),
    DelayedAck(u8),
    ResetRetry,
    Rekey,
    ShutdownDeadline,
}

/// The protocol engine. Create with [`Engine::new`], drive with
/// [`Engine::run`] on a current-thread runtime.
pub struct Engine<D> {
    driver: D,
    decoder: FrameDecoder,
    cfg: EngineConfig,
    endpoints: Vec<Endpoint>,
    timers: TimerQueue<TimerKind>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    notices: mpsc::UnboundedSender<EngineNotice>,
    security: Option<SecurityHandle>,
    session_state: SessionState,
    hs: Option<HsStage>,
    sys: SystemChannel,
    link: LinkState,
    violations: VecDeque<Instant>,
    shutdown_done: Option<oneshot::Sender<()>>,
    stopped: bool,
}

impl<D: Driver> Engine<D> {
    /// Build an engine over `driver`.
    pub fn new(
        driver: D,
        cfg: EngineConfig,
        security: Option<SecurityHandle>,
    ) -> (Self, EngineHandle, mpsc::UnboundedReceiver<EngineNotice>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let mut endpoints = Vec::with_capacity(ENDPOINT_COUNT);
        for id in 0..ENDPOINT_COUNT {
            let id = id as u8;
            let encrypted = cfg.encryption && id != EP_SYSTEM && id != EP_SECURITY;
            let window = if id == EP_SYSTEM || id == EP_SECURITY {
                DEFAULT_WINDOW
            } else {
                cfg.tx_window
            };
            let mut ep = Endpoint::new(id, window, encrypted);
            if id == EP_SYSTEM || id == EP_SECURITY {
                // Internal endpoints are always open; the engine is their client.
                ep.state = EndpointState::Open;
            }
            endpoints.push(ep);
        }

        let engine = Self {
            driver,
            decoder: FrameDecoder::new(MAX_PAYLOAD_SIZE),
            cfg,
            endpoints,
            timers: TimerQueue::new(),
            cmd_rx,
            notices: notice_tx,
            security,
            session_state: SessionState::NotReady,
            hs: None,
            sys: SystemChannel::new(),
            link: LinkState::Down,
            violations: VecDeque::new(),
            shutdown_done: None,
            stopped: false,
        };
        (engine, EngineHandle { tx: cmd_tx }, notice_rx)
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self) -> Result<(), Error> {
        self.start_link(true).await?;

        let mut buf = vec![0u8; 8192];
        while !self.stopped {
            let deadline = self.timers.next_deadline();
            let sleep_target = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await?,
                    None => break,
                },

                read = self.driver.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "driver closed",
                        )));
                    }
                    self.decoder.extend(&buf[..n]);
                    while let Some(event) = self.decoder.next_event() {
                        self.handle_decode_event(event).await?;
                    }
                }

                _ = sleep_until(sleep_target), if deadline.is_some() => {
                    let now = Instant::now();
                    while let Some(kind) = self.timers.pop_expired(now) {
                        self.handle_timer(kind).await?;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Link bring-up, reset, violations
    // =========================================================================

    async fn start_link(&mut self, send_reset: bool) -> Result<(), Error> {
        if self.cfg.reset_sequence && send_reset {
            debug!("requesting secondary reset");
            self.link = LinkState::WaitResetAck;
            self.send_unnumbered(
                EP_SYSTEM,
                UnnumberedFunction::Information,
                SystemCommand::Reset { seq: 0 }.encode(),
            )
            .await?;
            self.timers.arm(TimerKind::ResetRetry, Duration::from_secs(1));
        } else if self.cfg.reset_sequence {
            self.begin_discovery(DiscoveryStep::ProtocolVersion).await?;
        } else {
            self.link_up().await?;
        }
        Ok(())
    }

    async fn begin_discovery(&mut self, step: DiscoveryStep) -> Result<(), Error> {
        self.link = LinkState::Discovery;
        let cmd = self
            .sys
            .issue(step.property(), PendingQuery::Discovery(step));
        self.queue_write(EP_SYSTEM, cmd.encode()).await
    }

    async fn link_up(&mut self) -> Result<(), Error> {
        info!("link up");
        self.link = LinkState::Up;
        let _ = self.notices.send(EngineNotice::LinkUp);
        if self.security.is_some() && self.session_state == SessionState::NotReady {
            self.start_handshake().await?;
        }
        Ok(())
    }

    /// Tear down all endpoint state after a link-level reset.
    ///
    /// `peer_initiated` distinguishes a secondary that already reset itself
    /// (go straight to discovery) from a locally forced reset (ask the
    /// secondary to reset first).
    async fn link_reset(&mut self, peer_initiated: bool) -> Result<(), Error> {
        warn!(peer_initiated, "link reset");

        self.timers.clear();
        self.sys.clear();
        self.hs = None;
        self.violations.clear();

        for id in 0..ENDPOINT_COUNT {
            let ep = &mut self.endpoints[id];
            ep.retransmit_timer = None;
            ep.ack_timer = None;
            ep.pending_writes.clear();
            ep.awaiting_uack = false;
            ep.reset_sequencing();
            let id = id as u8;
            if id == EP_SYSTEM || id == EP_SECURITY {
                continue;
            }
            let had_client = ep.sink.take().is_some();
            if ep.state != EndpointState::Closed {
                ep.state = EndpointState::Closed;
                let _ = self.notices.send(EngineNotice::EndpointDown { id });
            } else if had_client {
                let _ = self.notices.send(EngineNotice::EndpointDown { id });
            }
        }

        let _ = self.notices.send(EngineNotice::LinkReset);

        if let Some(security) = &self.security {
            self.session_state = SessionState::NotReady;
            security.reset_session().await?;
        }

        self.start_link(!peer_initiated).await
    }

    /// Count a protocol violation; too many in a short window reset the link.
    async fn record_violation(&mut self, what: &str) -> Result<(), Error> {
        warn!(what, "protocol violation");
        let now = Instant::now();
        self.violations.push_back(now);
        while let Some(&front) = self.violations.front() {
            if now.duration_since(front) > VIOLATION_WINDOW {
                self.violations.pop_front();
            } else {
                break;
            }
        }
        if self.violations.len() >= VIOLATION_THRESHOLD {
            self.link_reset(false).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Commands from the server layer
    // =========================================================================

    async fn handle_command(&mut self, cmd: Command) -> Result<(), Error> {
        match cmd {
            Command::OpenQuery { endpoint, reply } => self.handle_open_query(endpoint, reply).await,
            Command::Attach {
                endpoint,
                sink,
                reply,
            } => self.handle_attach(endpoint, sink, reply).await,
            Command::Write { endpoint, data } => self.handle_write(endpoint, data).await,
            Command::Detach { endpoint } => self.begin_close(endpoint).await,
            Command::Close { endpoint, reply } => {
                let ok = if endpoint == EP_SYSTEM || endpoint == EP_SECURITY {
                    false
                } else {
                    match self.endpoints[endpoint as usize].state {
                        EndpointState::Closed => true,
                        _ => {
                            self.begin_close(endpoint).await?;
                            true
                        }
                    }
                };
                let _ = reply.send(ok);
                Ok(())
            }
            Command::Status { endpoint, reply } => {
                let _ = reply.send(self.endpoints[endpoint as usize].state.code());
                Ok(())
            }
            Command::Shutdown { done } => self.begin_shutdown(done).await,
        }
    }

    async fn handle_open_query(
        &mut self,
        id: u8,
        reply: oneshot::Sender<bool>,
    ) -> Result<(), Error> {
        let refusal = if id == EP_SYSTEM || id == EP_SECURITY || id == EP_RESERVED {
            Some("reserved endpoint")
        } else if self.link != LinkState::Up {
            Some("link not up")
        } else if self.cfg.encryption && self.session_state != SessionState::Initialized {
            // Retriable: the client may ask again once the session is up.
            Some("session not ready")
        } else if self.endpoints[id as usize].sink.is_some() {
            Some("already connected")
        } else if matches!(self.endpoints[id as usize].state, EndpointState::Error(_)) {
            Some("endpoint faulted")
        } else {
            None
        };

        if let Some(reason) = refusal {
            debug!(endpoint = id, reason, "open refused");
            let _ = reply.send(false);
            return Ok(());
        }

        // Gate on the peer endpoint actually being open over there.
        let cmd = self.sys.issue(
            PropertyId::EndpointState(id),
            PendingQuery::EndpointOpenCheck {
                endpoint: id,
                reply,
            },
        );
        self.queue_write(EP_SYSTEM, cmd.encode()).await
    }

    async fn handle_attach(
        &mut self,
        id: u8,
        sink: mpsc::UnboundedSender<Bytes>,
        reply: oneshot::Sender<Result<(), EngineError>>,
    ) -> Result<(), Error> {
        if id == EP_SYSTEM || id == EP_SECURITY || id == EP_RESERVED {
            let _ = reply.send(Err(EngineError::ReservedEndpoint(id)));
            return Ok(());
        }
        {
            let ep = &mut self.endpoints[id as usize];
            if ep.sink.is_some() {
                let _ = reply.send(Err(EngineError::AlreadyConnected(id)));
                return Ok(());
            }
            if let EndpointState::Error(_) = ep.state {
                let _ = reply.send(Err(EngineError::BadState {
                    id,
                    state: ep.state.name(),
                }));
                return Ok(());
            }
            ep.sink = Some(sink);
            ep.state = EndpointState::Open;
            ep.reset_sequencing();
            ep.pending_writes.clear();
            ep.awaiting_uack = true;
        }
        info!(endpoint = id, "endpoint opened");
        self.send_unnumbered(id, UnnumberedFunction::Reset, Vec::new())
            .await?;
        let _ = reply.send(Ok(()));
        Ok(())
    }

    async fn handle_write(&mut self, id: u8, data: Bytes) -> Result<(), Error> {
        let limit = if self.endpoints[id as usize].encrypted {
            MAX_PAYLOAD_SIZE - AEAD_TAG_SIZE
        } else {
            MAX_PAYLOAD_SIZE
        };
        if data.len() > limit {
            warn!(endpoint = id, len = data.len(), "oversized write dropped");
            return Ok(());
        }
        let ep = &mut self.endpoints[id as usize];
        if ep.state != EndpointState::Open {
            debug!(endpoint = id, state = ep.state.name(), "write on non-open endpoint dropped");
            return Ok(());
        }
        ep.pending_writes.push_back(data.to_vec());
        self.pump_endpoint(id).await
    }

    /// Move an endpoint into Closing and start the U-Reset handshake.
    async fn begin_close(&mut self, id: u8) -> Result<(), Error> {
        {
            let ep = &mut self.endpoints[id as usize];
            match ep.state {
                EndpointState::Open | EndpointState::ConnectionLost => {}
                _ => return Ok(()),
            }
            ep.state = EndpointState::Closing;
            ep.sink = None;
            ep.pending_writes.clear();
            ep.awaiting_uack = true;
            if let Some(t) = ep.retransmit_timer.take() {
                self.timers.cancel(t);
            }
            if let Some(t) = ep.ack_timer.take() {
                self.timers.cancel(t);
            }
        }
        debug!(endpoint = id, "closing");
        self.send_unnumbered(id, UnnumberedFunction::Reset, Vec::new())
            .await
    }

    fn complete_close(&mut self, id: u8) {
        let ep = &mut self.endpoints[id as usize];
        ep.state = EndpointState::Closed;
        ep.sink = None;
        ep.pending_writes.clear();
        ep.awaiting_uack = false;
        ep.reset_sequencing();
        if let Some(t) = ep.retransmit_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(t) = ep.ack_timer.take() {
            self.timers.cancel(t);
        }
        info!(endpoint = id, "endpoint closed");
        let _ = self.notices.send(EngineNotice::EndpointDown { id });
    }

    /// Terminal failure of an endpoint: close it and notify the client.
    fn fault_endpoint(&mut self, id: u8, state: EndpointState) {
        error!(endpoint = id, state = state.name(), "endpoint faulted");
        let ep = &mut self.endpoints[id as usize];
        ep.state = state;
        ep.sink = None;
        ep.pending_writes.clear();
        ep.awaiting_uack = false;
        ep.retransmit.clear();
        if let Some(t) = ep.retransmit_timer.take() {
            self.timers.cancel(t);
        }
        if let Some(t) = ep.ack_timer.take() {
            self.timers.cancel(t);
        }
        let _ = self.notices.send(EngineNotice::EndpointDown { id });
    }

    async fn begin_shutdown(&mut self, done: oneshot::Sender<()>) -> Result<(), Error> {
        info!("shutdown requested");
        self.shutdown_done = Some(done);
        let mut pending = false;
        for id in 0..ENDPOINT_COUNT as u8 {
            if id == EP_SYSTEM || id == EP_SECURITY {
                continue;
            }
            if self.endpoints[id as usize].state == EndpointState::Open {
                self.begin_close(id).await?;
                pending = true;
            }
        }
        if pending {
            self.timers.arm(TimerKind::ShutdownDeadline, SHUTDOWN_GRACE);
        } else {
            self.finish_shutdown();
        }
        Ok(())
    }

    fn finish_shutdown(&mut self) {
        if let Some(done) = self.shutdown_done.take() {
            let _ = done.send(());
        }
        self.stopped = true;
    }

    fn check_shutdown_progress(&mut self) {
        if self.shutdown_done.is_none() {
            return;
        }
        let all_closed = (0..ENDPOINT_COUNT as u8)
            .filter(|&id| id != EP_SYSTEM && id != EP_SECURITY)
            .all(|id| {
                !matches!(
                    self.endpoints[id as usize].state,
                    EndpointState::Open | EndpointState::Closing
                )
            });
        if all_closed {
            self.finish_shutdown();
        }
    }

    // =========================================================================
    // Send path
    // =========================================================================

    async fn send_raw(&mut self, wire: &[u8]) -> Result<(), Error> {
        self.driver.write_all(wire).await?;
        Ok(())
    }

    async fn send_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let wire = frame.encode()?;
        self.send_raw(&wire).await
    }

    async fn send_unnumbered(
        &mut self,
        id: u8,
        func: UnnumberedFunction,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.send_frame(Frame::unnumbered(id, func, payload)).await
    }

    async fn send_supervisory(
        &mut self,
        id: u8,
        func: SupervisoryFunction,
        ack: u8,
    ) -> Result<(), Error> {
        if let Some(t) = self.endpoints[id as usize].ack_timer.take() {
            self.timers.cancel(t);
        }
        self.send_frame(Frame::supervisory(id, func, ack)).await
    }

    /// Queue a payload on an internal endpoint and push it through the ARQ.
    async fn queue_write(&mut self, id: u8, payload: Vec<u8>) -> Result<(), Error> {
        self.endpoints[id as usize].pending_writes.push_back(payload);
        self.pump_endpoint(id).await
    }

    /// Drain an endpoint's pending writes into the TX window.
    async fn pump_endpoint(&mut self, id: u8) -> Result<(), Error> {
        loop {
            let (encrypted, expected_rx) = {
                let ep = &self.endpoints[id as usize];
                if ep.state != EndpointState::Open
                    || ep.awaiting_uack
                    || !ep.can_send()
                    || ep.pending_writes.is_empty()
                {
                    return Ok(());
                }
                (ep.encrypted, ep.expected_rx)
            };

            if encrypted && self.session_state != SessionState::Initialized {
                // Backpressured until the handshake or rekey completes.
                return Ok(());
            }

            let payload = self.endpoints[id as usize]
                .pending_writes
                .pop_front()
                .expect("checked nonempty");
            let seq = self.endpoints[id as usize].take_seq();

            let (frame_payload, rekey_due) = if encrypted {
                let header = FrameHeader {
                    address: id,
                    length: (payload.len() + AEAD_TAG_SIZE) as u16,
                    control: Control::Information {
                        seq,
                        ack: expected_rx,
                        poll: true,
                    },
                }
                .to_bytes();
                let security = self.security.as_ref().expect("encrypted endpoint without worker");
                match security.encrypt(id, header, payload.clone()).await {
                    Ok((ciphertext, rekey_due)) => (ciphertext, rekey_due),
                    Err(SecurityError::CounterExhausted) => {
                        // Undo the claim and hold the write until rekeyed.
                        let ep = &mut self.endpoints[id as usize];
                        ep.seq = seq;
                        ep.pending_writes.push_front(payload);
                        self.schedule_rekey();
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                (payload, false)
            };

            let frame = Frame::information(id, seq, expected_rx, true, frame_payload);
            let wire = frame.encode()?;

            {
                let ep = &mut self.endpoints[id as usize];
                ep.retransmit.push(seq, wire.clone());
                if let Some(t) = ep.ack_timer.take() {
                    // This frame piggybacks the ack.
                    self.timers.cancel(t);
                }
            }
            if self.endpoints[id as usize].retransmit_timer.is_none() {
                let rto = self.endpoints[id as usize].retransmit.rto();
                let timer = self.timers.arm(TimerKind::Retransmit(id), rto);
                self.endpoints[id as usize].retransmit_timer = Some(timer);
            }

            trace!(endpoint = id, seq, "tx I-frame");
            self.send_raw(&wire).await?;

            if rekey_due {
                self.schedule_rekey();
            }
        }
    }

    async fn pump_all(&mut self) -> Result<(), Error> {
        for id in 0..ENDPOINT_COUNT as u8 {
            if !self.endpoints[id as usize].pending_writes.is_empty() {
                self.pump_endpoint(id).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Receive path
    // =========================================================================

    async fn handle_decode_event(&mut self, event: DecodeEvent) -> Result<(), Error> {
        match event {
            DecodeEvent::Frame(frame) => self.handle_frame(frame).await,
            DecodeEvent::CorruptPayload { header } => {
                // Header CRC held, so the ack field is trustworthy even
                // though the payload is not.
                if let Some(ack) = header.control.ack() {
                    self.process_ack(header.address, ack).await?;
                }
                if let Control::Information { .. } = header.control {
                    let expected = self.endpoints[header.address as usize].expected_rx;
                    debug!(endpoint = header.address, "corrupt payload, sending REJ");
                    self.send_supervisory(header.address, SupervisoryFunction::Reject, expected)
                        .await?;
                }
                Ok(())
            }
            DecodeEvent::Garbage { discarded } => {
                trace!(discarded, "framer discarded bytes");
                Ok(())
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), Error> {
        match frame.control {
            Control::Information { .. } => self.handle_iframe(frame).await,
            Control::Supervisory { func, ack, poll: _ } => {
                self.process_ack(frame.address, ack).await?;
                match func {
                    SupervisoryFunction::ReceiveReady => Ok(()),
                    SupervisoryFunction::Reject => self.handle_reject(frame.address, ack).await,
                }
            }
            Control::Unnumbered { func, .. } => match func {
                UnnumberedFunction::Information => {
                    if frame.address != EP_SYSTEM {
                        return self.record_violation("U-Information off the system endpoint").await;
                    }
                    self.on_system_notification(frame.payload).await
                }
                UnnumberedFunction::Reset => self.on_peer_reset(frame.address).await,
                UnnumberedFunction::Ack => self.on_peer_uack(frame.address).await,
                UnnumberedFunction::PollFinal => {
                    let expected = self.endpoints[frame.address as usize].expected_rx;
                    self.send_supervisory(
                        frame.address,
                        SupervisoryFunction::ReceiveReady,
                        expected,
                    )
                    .await
                }
            },
        }
    }

    async fn handle_iframe(&mut self, frame: Frame) -> Result<(), Error> {
        let id = frame.address;
        let Control::Information { seq, ack, .. } = frame.control else {
            unreachable!("handle_iframe called with a non-I frame");
        };

        let internal = id == EP_SYSTEM || id == EP_SECURITY;
        if !internal && self.endpoints[id as usize].state != EndpointState::Open {
            return self.record_violation("I-frame for closed endpoint").await;
        }

        self.process_ack(id, ack).await?;

        let (expected, window) = {
            let ep = &self.endpoints[id as usize];
            (ep.expected_rx, ep.tx_window)
        };
        let distance = seq.wrapping_sub(expected) % SEQ_MOD;

        if distance == 0 {
            self.deliver_in_order(frame).await
        } else if distance <= window {
            // A gap: something before this frame was lost.
            debug!(endpoint = id, seq, expected, "gap, sending REJ");
            self.send_supervisory(id, SupervisoryFunction::Reject, expected)
                .await
        } else {
            // Behind us: a duplicate of something already delivered.
            trace!(endpoint = id, seq, "duplicate I-frame");
            self.send_supervisory(id, SupervisoryFunction::ReceiveReady, expected)
                .await
        }
    }

    async fn deliver_in_order(&mut self, frame: Frame) -> Result<(), Error> {
        let id = frame.address;
        let encrypted = self.endpoints[id as usize].encrypted;

        let plaintext = if encrypted {
            // The AAD is the header exactly as it arrived.
            let header = frame.header();
            match self.decrypt_payload(id, header, frame.payload).await? {
                Some(plaintext) => plaintext,
                None => return Ok(()), // incident handled
            }
        } else {
            frame.payload
        };

        {
            let ep = &mut self.endpoints[id as usize];
            ep.expected_rx = (ep.expected_rx + 1) % SEQ_MOD;
        }

        match id {
            EP_SYSTEM => self.on_system_iframe(plaintext).await?,
            EP_SECURITY => self.on_handshake_message(plaintext).await?,
            _ => {
                let gone = {
                    let ep = &self.endpoints[id as usize];
                    match &ep.sink {
                        Some(sink) => sink.send(Bytes::from(plaintext)).is_err(),
                        None => false,
                    }
                };
                if gone {
                    debug!(endpoint = id, "client sink gone, closing");
                    self.begin_close(id).await?;
                    return Ok(());
                }
            }
        }

        // Ack soon even if no data flows the other way.
        if self.endpoints[id as usize].ack_timer.is_none() {
            let timer = self.timers.arm(TimerKind::DelayedAck(id), ACK_TIMEOUT);
            self.endpoints[id as usize].ack_timer = Some(timer);
        }
        Ok(())
    }

    /// Decrypt an in-order payload. Returns `None` after accounting a
    /// security incident (REJ already sent, fault applied if over threshold).
    async fn decrypt_payload(
        &mut self,
        id: u8,
        header: FrameHeader,
        payload: Vec<u8>,
    ) -> Result<Option<Vec<u8>>, Error> {
        if self.session_state != SessionState::Initialized {
            // Encrypted traffic before the session exists cannot be
            // authenticated; drop it.
            return self.record_violation("encrypted frame before session").await.map(|_| None);
        }

        // Reconstruct the exact wire header the peer authenticated. Its
        // control field came off the wire; only seq/ack vary and those are
        // part of the received header, so rebuild from the received values.
        let security = self.security.as_ref().expect("encrypted endpoint without worker");
        match security.decrypt(id, header.to_bytes(), payload).await {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(SecurityError::AuthenticationFailed) => {
                let expected = self.endpoints[id as usize].expected_rx;
                self.send_supervisory(id, SupervisoryFunction::Reject, expected)
                    .await?;
                let over = self.endpoints[id as usize].record_incident(Instant::now());
                warn!(endpoint = id, "AEAD authentication failure");
                if over {
                    self.fault_endpoint(id, EndpointState::Error(FaultReason::SecurityIncident));
                    // The session itself is suspect: force a fresh handshake.
                    if let Some(security) = &self.security {
                        security.reset_session().await?;
                    }
                    self.session_state = SessionState::NotReady;
                    self.start_handshake().await?;
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn process_ack(&mut self, id: u8, ack: u8) -> Result<(), Error> {
        let released = self.endpoints[id as usize].retransmit.ack_through(ack);
        if released == 0 {
            return Ok(());
        }
        trace!(endpoint = id, ack, released, "ack released frames");
        {
            let ep = &mut self.endpoints[id as usize];
            if let Some(t) = ep.retransmit_timer.take() {
                self.timers.cancel(t);
            }
        }
        if !self.endpoints[id as usize].retransmit.is_empty() {
            let rto = self.endpoints[id as usize].retransmit.rto();
            let timer = self.timers.arm(TimerKind::Retransmit(id), rto);
            self.endpoints[id as usize].retransmit_timer = Some(timer);
        }
        // Window room opened: wake blocked writers.
        self.pump_endpoint(id).await
    }

    async fn handle_reject(&mut self, id: u8, ack: u8) -> Result<(), Error> {
        let wires = self.endpoints[id as usize].retransmit.reject_from(ack);
        if wires.is_empty() {
            // REJ for something already acked: ignore.
            return Ok(());
        }
        debug!(endpoint = id, ack, frames = wires.len(), "REJ, retransmitting");
        for wire in wires {
            self.send_raw(&wire).await?;
        }
        // The retransmit clock restarts from now.
        {
            let ep = &mut self.endpoints[id as usize];
            if let Some(t) = ep.retransmit_timer.take() {
                self.timers.cancel(t);
            }
        }
        let rto = self.endpoints[id as usize].retransmit.rto();
        let timer = self.timers.arm(TimerKind::Retransmit(id), rto);
        self.endpoints[id as usize].retransmit_timer = Some(timer);
        Ok(())
    }

    // =========================================================================
    // Reset synchronization
    // =========================================================================

    async fn on_peer_reset(&mut self, id: u8) -> Result<(), Error> {
        debug!(endpoint = id, "peer U-Reset");
        self.send_unnumbered(id, UnnumberedFunction::Ack, Vec::new())
            .await?;

        let internal = id == EP_SYSTEM || id == EP_SECURITY;
        let (was_awaiting, state, has_client) = {
            let ep = &mut self.endpoints[id as usize];
            let was_awaiting = ep.awaiting_uack;
            // The received reset is authoritative: our own in-flight
            // U-Reset no longer expects a U-Ack.
            ep.awaiting_uack = false;
            (was_awaiting, ep.state, ep.sink.is_some())
        };

        if state == EndpointState::Closing {
            self.complete_close(id);
            self.check_shutdown_progress();
            return Ok(());
        }

        {
            let ep = &mut self.endpoints[id as usize];
            ep.reset_sequencing();
            if let Some(t) = ep.retransmit_timer.take() {
                self.timers.cancel(t);
            }
            if let Some(t) = ep.ack_timer.take() {
                self.timers.cancel(t);
            }
        }

        if internal {
            return Ok(());
        }

        if state == EndpointState::Open {
            if has_client || was_awaiting {
                // Re-opened: sequence numbers start over, traffic resumes.
                self.pump_endpoint(id).await?;
            } else {
                self.endpoints[id as usize].state = EndpointState::Closed;
            }
        }
        Ok(())
    }

    async fn on_peer_uack(&mut self, id: u8) -> Result<(), Error> {
        let (awaiting, state) = {
            let ep = &self.endpoints[id as usize];
            (ep.awaiting_uack, ep.state)
        };
        if !awaiting {
            return Ok(());
        }
        self.endpoints[id as usize].awaiting_uack = false;
        match state {
            EndpointState::Closing => {
                self.complete_close(id);
                self.check_shutdown_progress();
            }
            EndpointState::Open => {
                // Open handshake finished; release held writes.
                self.pump_endpoint(id).await?;
            }
            _ => {}
        }
        Ok(())
    }

    // =========================================================================
    // System endpoint traffic
    // =========================================================================

    async fn on_system_iframe(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let cmd = match SystemCommand::decode(&payload) {
            Ok(cmd) => cmd,
            Err(e) => return self.record_violation(&format!("system command: {e}")).await,
        };
        match cmd {
            SystemCommand::PropertyIs { seq, prop, value } => {
                self.on_property_is(seq, prop, value).await
            }
            SystemCommand::Noop { .. } => Ok(()),
            other => {
                debug!(?other, "unhandled system command");
                Ok(())
            }
        }
    }

    async fn on_property_is(
        &mut self,
        seq: u8,
        prop: PropertyId,
        value: Vec<u8>,
    ) -> Result<(), Error> {
        let Some(pending) = self.sys.take(seq) else {
            debug!(seq, ?prop, "PropertyIs without a matching query");
            return Ok(());
        };
        match pending {
            PendingQuery::EndpointOpenCheck { endpoint, reply } => {
                let open = value.first().copied() == Some(EndpointState::Open.code());
                if !open {
                    debug!(endpoint, "peer endpoint not open");
                }
                let _ = reply.send(open);
                Ok(())
            }
            PendingQuery::Discovery(step) => {
                match step {
                    DiscoveryStep::ProtocolVersion => {
                        let version = value
                            .get(..4)
                            .map(|b| u32::from_le_bytes(b.try_into().unwrap()));
                        if version != Some(PROTOCOL_VERSION) {
                            warn!(?version, expected = PROTOCOL_VERSION, "protocol version mismatch");
                        }
                    }
                    DiscoveryStep::Capabilities => {
                        debug!(capabilities = ?value, "secondary capabilities");
                    }
                    DiscoveryStep::RxCapability => {
                        debug!(rx_capability = ?value, "secondary rx capability");
                    }
                }
                match step.next() {
                    Some(next) => self.begin_discovery(next).await,
                    None => self.link_up().await,
                }
            }
        }
    }

    async fn on_system_notification(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let cmd = match SystemCommand::decode(&payload) {
            Ok(cmd) => cmd,
            Err(e) => return self.record_violation(&format!("system notification: {e}")).await,
        };
        match cmd {
            SystemCommand::PropertyIs {
                prop: PropertyId::LastResetCause,
                value,
                ..
            } => {
                if self.link == LinkState::WaitResetAck {
                    let cause = value
                        .get(..4)
                        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                        .unwrap_or(0);
                    info!(cause, "secondary reset complete");
                    self.begin_discovery(DiscoveryStep::ProtocolVersion).await
                } else {
                    // The secondary reset underneath us.
                    self.link_reset(true).await
                }
            }
            SystemCommand::PropertyIs {
                prop: PropertyId::EndpointState(id),
                value,
                ..
            } => {
                let remote_open = value.first().copied() == Some(EndpointState::Open.code());
                if !remote_open && self.endpoints[id as usize].state == EndpointState::Open {
                    info!(endpoint = id, "peer closed endpoint");
                    self.complete_close(id);
                }
                Ok(())
            }
            other => {
                debug!(?other, "unhandled system notification");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Security handshake
    // =========================================================================

    async fn start_handshake(&mut self) -> Result<(), Error> {
        if self.security.is_none() {
            return Ok(());
        }
        info!("starting security handshake");
        self.session_state = SessionState::Initializing;
        self.hs = Some(HsStage::AwaitingId);
        self.queue_write(EP_SECURITY, HandshakeMessage::RequestId.encode())
            .await
    }

    /// Flag that the session must rekey. The event loop picks it up on the
    /// next timer sweep, keeping the send path free of re-entrant pumping.
    fn schedule_rekey(&mut self) {
        if self.session_state == SessionState::Initialized {
            self.session_state = SessionState::Resetting;
            self.timers.arm(TimerKind::Rekey, Duration::ZERO);
        }
    }

    async fn start_rekey(&mut self) -> Result<(), Error> {
        if self.session_state != SessionState::Resetting || self.hs.is_some() {
            return Ok(());
        }
        info!("starting rekey");
        let security = self.security.as_ref().expect("rekey without worker");
        let public = security.rekey().await?;
        self.hs = Some(HsStage::AwaitingEphemeral);
        self.queue_write(EP_SECURITY, HandshakeMessage::EphemeralPublic { public }.encode())
            .await
    }

    async fn on_handshake_message(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        let msg = match HandshakeMessage::decode(&payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "bad handshake message");
                return Ok(());
            }
        };
        let Some(security) = self.security.clone() else {
            return Ok(());
        };

        match (self.hs, msg) {
            (Some(HsStage::AwaitingId), HandshakeMessage::IdResponse { key_id }) => {
                if let Some(expected) = self.cfg.key_id {
                    if key_id != expected {
                        let (got, want) = (format!("{key_id:016x}"), format!("{expected:016x}"));
                        error!(key_id = %got, expected = %want, "secondary bound to a different key");
                        self.hs = None;
                        self.session_state = SessionState::NotReady;
                        return Ok(());
                    }
                }
                let public = security.init_session().await?;
                self.hs = Some(HsStage::AwaitingEphemeral);
                self.queue_write(
                    EP_SECURITY,
                    HandshakeMessage::EphemeralPublic { public }.encode(),
                )
                .await
            }
            (Some(HsStage::AwaitingEphemeral), HandshakeMessage::EphemeralResponse { public }) => {
                let session_id = security.complete(public).await?;
                self.hs = Some(HsStage::AwaitingSessionId(session_id));
                self.queue_write(
                    EP_SECURITY,
                    HandshakeMessage::SessionIdExchange { id: session_id }.encode(),
                )
                .await
            }
            (Some(HsStage::AwaitingSessionId(ours)), HandshakeMessage::SessionIdExchange { id }) => {
                if id != ours {
                    warn!("session id mismatch, restarting handshake");
                    security.reset_session().await?;
                    self.session_state = SessionState::NotReady;
                    self.hs = None;
                    return self.start_handshake().await;
                }
                let sid = format!("{id:016x}");
                info!(session_id = %sid, "security session initialized");
                self.session_state = SessionState::Initialized;
                self.hs = None;
                // Release everything that was backpressured on the session.
                self.pump_all().await
            }
            (stage, msg) => {
                debug!(?stage, ?msg, "handshake message out of order");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn handle_timer(&mut self, kind: TimerKind) -> Result<(), Error> {
        match kind {
            TimerKind::Retransmit(id) => {
                self.endpoints[id as usize].retransmit_timer = None;
                let action = self.endpoints[id as usize].retransmit.on_timeout();
                match action {
                    TimeoutAction::Resend(wire) => {
                        debug!(endpoint = id, "retransmit timeout, resending");
                        self.send_raw(&wire).await?;
                        let rto = self.endpoints[id as usize].retransmit.rto();
                        let timer = self.timers.arm(TimerKind::Retransmit(id), rto);
                        self.endpoints[id as usize].retransmit_timer = Some(timer);
                    }
                    TimeoutAction::Exhausted => {
                        if id == EP_SYSTEM || id == EP_SECURITY {
                            // The control plane is unreachable: the link is dead.
                            error!(
                                endpoint = id,
                                "control endpoint exhausted retries ({})",
                                EndpointState::Error(FaultReason::FaultNoAck).name()
                            );
                            self.link_reset(false).await?;
                        } else {
                            self.fault_endpoint(id, EndpointState::ConnectionLost);
                        }
                    }
                    TimeoutAction::Idle => {}
                }
                Ok(())
            }
            TimerKind::DelayedAck(id) => {
                self.endpoints[id as usize].ack_timer = None;
                let expected = self.endpoints[id as usize].expected_rx;
                self.send_supervisory(id, SupervisoryFunction::ReceiveReady, expected)
                    .await
            }
            TimerKind::Rekey => self.start_rekey().await,
            TimerKind::ResetRetry => {
                if self.link == LinkState::WaitResetAck {
                    debug!("re-requesting secondary reset");
                    self.send_unnumbered(
                        EP_SYSTEM,
                        UnnumberedFunction::Information,
                        SystemCommand::Reset { seq: 0 }.encode(),
                    )
                    .await?;
                    self.timers.arm(TimerKind::ResetRetry, Duration::from_secs(1));
                }
                Ok(())
            }
            TimerKind::ShutdownDeadline => {
                warn!("shutdown grace period expired");
                self.finish_shutdown();
                Ok(())
            }
        }
    }
}
