//! End-to-end scenarios against a scripted secondary.
//!
//! The engine runs over one end of an in-process pipe; the test plays the
//! secondary on the other end with its own framer. Time is paused, so
//! retransmission and delayed-ack timers fire deterministically, and the
//! script tolerates the delayed RRs and duplicate retransmissions they
//! produce.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use cpcd::core::{AEAD_TAG_SIZE, EP_SECURITY, EP_SYSTEM, MAX_PAYLOAD_SIZE, REKEY_THRESHOLD};
use cpcd::crypto::{
    construct_nonce, derive_session, open, seal, BindingKey, Direction, EphemeralKeypair,
    HandshakeMessage, SecurityHandle, SessionKey,
};
use cpcd::driver::{pipe_driver, PipeDriver};
use cpcd::engine::{Engine, EngineConfig, EngineHandle, EngineNotice, EndpointState};
use cpcd::link::{
    Control, DecodeEvent, Frame, FrameDecoder, FrameHeader, SupervisoryFunction,
    UnnumberedFunction,
};
use cpcd::system::{PropertyId, SystemCommand};

const WAIT: Duration = Duration::from_secs(10);

/// The test's half of the link: a framer plus per-endpoint sequencing.
struct Secondary {
    io: PipeDriver,
    decoder: FrameDecoder,
    tx_seq: HashMap<u8, u8>,
    rx_seq: HashMap<u8, u8>,
    session: Option<SecondarySession>,
}

/// The secondary's view of the security session.
struct SecondarySession {
    key: SessionKey,
    tx_counter: u64,
    rx_counter: u64,
}

impl Secondary {
    fn new(io: PipeDriver) -> Self {
        Self {
            io,
            decoder: FrameDecoder::new(MAX_PAYLOAD_SIZE),
            tx_seq: HashMap::new(),
            rx_seq: HashMap::new(),
            session: None,
        }
    }

    async fn next_event(&mut self) -> DecodeEvent {
        loop {
            if let Some(event) = self.decoder.next_event() {
                return event;
            }
            let mut buf = [0u8; 4096];
            let n = self.io.read(&mut buf).await.expect("link read");
            assert!(n > 0, "engine closed the link");
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn next_frame(&mut self) -> Frame {
        loop {
            match timeout(WAIT, self.next_event())
                .await
                .expect("timed out waiting for frame")
            {
                DecodeEvent::Frame(frame) => return frame,
                DecodeEvent::Garbage { .. } => continue,
                DecodeEvent::CorruptPayload { header } => {
                    panic!("unexpected corrupt payload from engine: {header:?}")
                }
            }
        }
    }

    /// Next frame that is not a supervisory ack.
    async fn next_content_frame(&mut self) -> Frame {
        loop {
            let frame = self.next_frame().await;
            if !matches!(frame.control, Control::Supervisory { .. }) {
                return frame;
            }
        }
    }

    /// Wait for an RR on `endpoint`, skipping acks for other endpoints.
    async fn expect_rr(&mut self, endpoint: u8) -> u8 {
        loop {
            let frame = self.next_frame().await;
            match frame.control {
                Control::Supervisory {
                    func: SupervisoryFunction::ReceiveReady,
                    ack,
                    ..
                } if frame.address == endpoint => return ack,
                Control::Supervisory { .. } => continue,
                other => panic!("expected RR on endpoint {endpoint}, got {other:?}"),
            }
        }
    }

    /// Wait for a REJ on `endpoint`, skipping RRs.
    async fn expect_reject(&mut self, endpoint: u8) -> u8 {
        loop {
            let frame = self.next_frame().await;
            match frame.control {
                Control::Supervisory {
                    func: SupervisoryFunction::Reject,
                    ack,
                    ..
                } if frame.address == endpoint => return ack,
                Control::Supervisory { .. } => continue,
                other => panic!("expected REJ on endpoint {endpoint}, got {other:?}"),
            }
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.expect("link write");
    }

    async fn send_frame(&mut self, frame: Frame) {
        let wire = frame.encode().expect("encode");
        self.send_raw(&wire).await;
    }

    /// Build an I-frame from this side's sequencing state.
    fn make_iframe(&mut self, endpoint: u8, payload: Vec<u8>) -> Frame {
        let seq = self.tx_seq.entry(endpoint).or_insert(0);
        let frame_seq = *seq;
        *seq = (*seq + 1) % 8;
        let ack = *self.rx_seq.entry(endpoint).or_insert(0);
        Frame::information(endpoint, frame_seq, ack, true, payload)
    }

    async fn send_iframe(&mut self, endpoint: u8, payload: Vec<u8>) {
        let frame = self.make_iframe(endpoint, payload);
        self.send_frame(frame).await;
    }

    async fn send_rr(&mut self, endpoint: u8) {
        let ack = *self.rx_seq.entry(endpoint).or_insert(0);
        self.send_frame(Frame::supervisory(
            endpoint,
            SupervisoryFunction::ReceiveReady,
            ack,
        ))
        .await;
    }

    /// Wait for the next in-order I-frame on `endpoint` and return its
    /// payload. Duplicate retransmissions and traffic on other endpoints
    /// are skipped.
    async fn expect_iframe(&mut self, endpoint: u8) -> Vec<u8> {
        loop {
            let frame = self.next_content_frame().await;
            if frame.address != endpoint {
                continue;
            }
            let Control::Information { seq, .. } = frame.control else {
                panic!("expected I-frame on endpoint {endpoint}, got {frame:?}");
            };
            let expected = self.rx_seq.entry(endpoint).or_insert(0);
            if seq != *expected {
                continue; // retransmission of something already consumed
            }
            *expected = (*expected + 1) % 8;
            return frame.payload;
        }
    }

    async fn expect_uframe(&mut self, endpoint: u8, func: UnnumberedFunction) {
        let frame = self.next_content_frame().await;
        assert_eq!(frame.address, endpoint);
        assert_eq!(
            frame.control,
            Control::Unnumbered { func, poll: false },
            "expected {func:?}"
        );
    }

    /// Answer the engine's endpoint-state query with `open`.
    async fn answer_open_check(&mut self, endpoint: u8, open: bool) {
        let payload = self.expect_iframe(EP_SYSTEM).await;
        let cmd = SystemCommand::decode(&payload).expect("system command");
        let SystemCommand::PropertyGet { seq, prop } = cmd else {
            panic!("expected PropertyGet, got {cmd:?}");
        };
        assert_eq!(prop, PropertyId::EndpointState(endpoint));
        let state = if open {
            EndpointState::Open.code()
        } else {
            EndpointState::Closed.code()
        };
        let reply = SystemCommand::PropertyIs {
            seq,
            prop,
            value: vec![state],
        };
        self.send_iframe(EP_SYSTEM, reply.encode()).await;
    }

    /// Answer the open-endpoint handshake: U-Reset in, U-Ack out.
    async fn answer_endpoint_reset(&mut self, endpoint: u8) {
        self.expect_uframe(endpoint, UnnumberedFunction::Reset).await;
        // Sequence numbers restart on both sides.
        self.tx_seq.insert(endpoint, 0);
        self.rx_seq.insert(endpoint, 0);
        self.send_frame(Frame::unnumbered(
            endpoint,
            UnnumberedFunction::Ack,
            Vec::new(),
        ))
        .await;
    }

    /// Play the secondary's side of the security handshake.
    async fn answer_handshake(&mut self, binding: &[u8; 32], key_id: u64) {
        let payload = self.expect_iframe(EP_SECURITY).await;
        assert_eq!(
            HandshakeMessage::decode(&payload).unwrap(),
            HandshakeMessage::RequestId
        );
        self.send_iframe(EP_SECURITY, HandshakeMessage::IdResponse { key_id }.encode())
            .await;
        self.answer_rekey(binding).await;
    }

    /// Ephemeral exchange + session id confirmation: the tail of the
    /// handshake, and the whole of a rekey.
    async fn answer_rekey(&mut self, binding: &[u8; 32]) {
        let payload = self.expect_iframe(EP_SECURITY).await;
        let HandshakeMessage::EphemeralPublic { public: host_public } =
            HandshakeMessage::decode(&payload).unwrap()
        else {
            panic!("expected EphemeralPublic");
        };

        let eph = EphemeralKeypair::generate();
        let our_public = eph.public();
        let shared = eph.diffie_hellman(&host_public);
        let (key, id) = derive_session(binding, &shared).unwrap();
        self.session = Some(SecondarySession {
            key,
            tx_counter: 0,
            rx_counter: 0,
        });

        self.send_iframe(
            EP_SECURITY,
            HandshakeMessage::EphemeralResponse { public: our_public }.encode(),
        )
        .await;

        let payload = self.expect_iframe(EP_SECURITY).await;
        let HandshakeMessage::SessionIdExchange { id: host_id } =
            HandshakeMessage::decode(&payload).unwrap()
        else {
            panic!("expected SessionIdExchange");
        };
        assert_eq!(host_id, id, "both sides must derive the same session id");
        self.send_iframe(
            EP_SECURITY,
            HandshakeMessage::SessionIdExchange { id }.encode(),
        )
        .await;
    }

    /// Receive and decrypt the next in-order data frame on `endpoint`.
    async fn expect_encrypted(&mut self, endpoint: u8) -> Vec<u8> {
        loop {
            let frame = self.next_content_frame().await;
            if frame.address != endpoint {
                continue;
            }
            let Control::Information { seq, .. } = frame.control else {
                panic!("expected I-frame, got {frame:?}");
            };
            let expected = self.rx_seq.entry(endpoint).or_insert(0);
            if seq != *expected {
                continue;
            }
            *expected = (*expected + 1) % 8;

            let aad = frame.header().to_bytes();
            let session = self.session.as_mut().expect("no session");
            let nonce = construct_nonce(endpoint, Direction::HostToSecondary, session.rx_counter);
            session.rx_counter += 1;
            return open(&session.key, &nonce, &aad, &frame.payload).expect("decrypt");
        }
    }

    /// Encrypt and send one data frame on `endpoint`.
    async fn send_encrypted(&mut self, endpoint: u8, plaintext: &[u8]) {
        let seq_entry = self.tx_seq.entry(endpoint).or_insert(0);
        let seq = *seq_entry;
        *seq_entry = (*seq_entry + 1) % 8;
        let ack = *self.rx_seq.entry(endpoint).or_insert(0);

        let control = Control::Information {
            seq,
            ack,
            poll: true,
        };
        let header = FrameHeader {
            address: endpoint,
            length: (plaintext.len() + AEAD_TAG_SIZE) as u16,
            control,
        };
        let session = self.session.as_mut().expect("no session");
        let nonce = construct_nonce(endpoint, Direction::SecondaryToHost, session.tx_counter);
        session.tx_counter += 1;
        let ciphertext = seal(&session.key, &nonce, &header.to_bytes(), plaintext).expect("seal");

        self.send_frame(Frame {
            address: endpoint,
            control,
            payload: ciphertext,
        })
        .await;
    }
}

struct Harness {
    handle: EngineHandle,
    notices: mpsc::UnboundedReceiver<EngineNotice>,
    secondary: Secondary,
    security: Option<SecurityHandle>,
}

fn start_engine(cfg: EngineConfig, security: Option<SecurityHandle>) -> Harness {
    let (daemon_end, secondary_end) = pipe_driver();
    let (engine, handle, notices) = Engine::new(daemon_end, cfg, security.clone());
    tokio::spawn(async move {
        let _ = engine.run().await;
    });
    Harness {
        handle,
        notices,
        secondary: Secondary::new(secondary_end),
        security,
    }
}

fn plaintext_config() -> EngineConfig {
    EngineConfig {
        reset_sequence: false,
        ..EngineConfig::default()
    }
}

/// Engine with encryption on; the secondary side gets a copy of the binding
/// secret, as binding mode would provision in production.
fn secured_engine() -> (Harness, [u8; 32], u64) {
    let secret = [0x42u8; 32];
    let binding = BindingKey::from_bytes(secret);
    let key_id = binding.key_id();
    let security = SecurityHandle::spawn(binding);
    let cfg = EngineConfig {
        encryption: true,
        key_id: Some(key_id),
        ..plaintext_config()
    };
    (start_engine(cfg, Some(security)), secret, key_id)
}

/// Open endpoint `id` end to end and return the delivery channel.
async fn open_endpoint(h: &mut Harness, id: u8) -> mpsc::UnboundedReceiver<Bytes> {
    let (query, ()) = tokio::join!(
        h.handle.open_query(id),
        h.secondary.answer_open_check(id, true)
    );
    assert!(query.unwrap(), "open query refused");

    let (sink_tx, sink_rx) = mpsc::unbounded_channel();
    let (attach, ()) = tokio::join!(
        h.handle.attach(id, sink_tx),
        h.secondary.answer_endpoint_reset(id)
    );
    attach.unwrap();
    sink_rx
}

// =============================================================================
// Scenario: open + echo
// =============================================================================

#[tokio::test(start_paused = true)]
async fn open_and_echo() {
    let mut h = start_engine(plaintext_config(), None);
    let mut rx = open_endpoint(&mut h, 3).await;

    h.handle.write(3, Bytes::from_static(b"ping")).unwrap();

    // Exactly one I-frame out: seq 0, and the first ack after reset is 0.
    let frame = h.secondary.next_content_frame().await;
    assert_eq!(frame.address, 3);
    assert_eq!(
        frame.control,
        Control::Information {
            seq: 0,
            ack: 0,
            poll: true
        }
    );
    assert_eq!(frame.payload, b"ping");
    h.secondary.rx_seq.insert(3, 1);

    // Echo it back, piggybacking the ack.
    h.secondary.send_iframe(3, b"ping".to_vec()).await;

    let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(&delivered[..], b"ping");

    // The engine acks our echo within the delayed-ack window.
    assert_eq!(h.secondary.expect_rr(3).await, 1);
}

// =============================================================================
// Scenario: corrupt payload -> REJ -> retransmit, delivered exactly once
// =============================================================================

#[tokio::test(start_paused = true)]
async fn corrupt_payload_rejected_and_retransmitted() {
    let mut h = start_engine(plaintext_config(), None);
    let mut rx = open_endpoint(&mut h, 3).await;

    // Two clean frames from the secondary.
    for payload in [b"one".as_slice(), b"two".as_slice()] {
        h.secondary.send_iframe(3, payload.to_vec()).await;
        let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&delivered[..], payload);
    }

    // Third frame (seq 2) goes out with a flipped payload byte.
    let frame = h.secondary.make_iframe(3, b"three".to_vec());
    let mut wire = frame.encode().unwrap();
    wire[7 + 2] ^= 0x01; // third payload byte, after the 7-byte header
    h.secondary.send_raw(&wire).await;

    // Receiver rejects at the expected sequence.
    assert_eq!(h.secondary.expect_reject(3).await, 2);

    // Retransmit the same seq intact; it must arrive exactly once.
    h.secondary.send_frame(frame).await;
    let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(&delivered[..], b"three");
    assert!(rx.try_recv().is_err(), "payload delivered more than once");
}

// =============================================================================
// Scenario: ack timeout -> retransmit backoff -> ConnectionLost
// =============================================================================

#[tokio::test(start_paused = true)]
async fn ack_timeout_faults_endpoint() {
    let mut h = start_engine(plaintext_config(), None);
    let mut rx = open_endpoint(&mut h, 4).await;

    h.handle.write(4, Bytes::from_static(b"x")).unwrap();

    // Original send plus five backoff retransmissions, all seq 0.
    for attempt in 0..6 {
        let frame = h.secondary.next_content_frame().await;
        assert_eq!(
            frame.control,
            Control::Information {
                seq: 0,
                ack: 0,
                poll: true
            },
            "attempt {attempt}"
        );
    }

    // Silence exhausts the retries; the endpoint reports ConnectionLost
    // and the client sees EOF.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    assert_eq!(
        h.handle.status(4).await.unwrap(),
        EndpointState::ConnectionLost.code()
    );
}

// =============================================================================
// Scenario: peer reset mid-traffic
// =============================================================================

#[tokio::test(start_paused = true)]
async fn peer_reset_mid_traffic() {
    let cfg = EngineConfig {
        tx_window: 2,
        ..plaintext_config()
    };
    let mut h = start_engine(cfg, None);
    let _rx = open_endpoint(&mut h, 4).await;

    // Two outstanding I-frames, never acked.
    h.handle.write(4, Bytes::from_static(b"a")).unwrap();
    h.handle.write(4, Bytes::from_static(b"b")).unwrap();
    let f0 = h.secondary.next_content_frame().await;
    let f1 = h.secondary.next_content_frame().await;
    assert!(matches!(f0.control, Control::Information { seq: 0, .. }));
    assert!(matches!(f1.control, Control::Information { seq: 1, .. }));

    // Secondary resets the endpoint underneath them.
    h.secondary
        .send_frame(Frame::unnumbered(4, UnnumberedFunction::Reset, Vec::new()))
        .await;
    h.secondary.expect_uframe(4, UnnumberedFunction::Ack).await;
    h.secondary.tx_seq.insert(4, 0);
    h.secondary.rx_seq.insert(4, 0);

    // Client still attached, so the endpoint reopened with fresh sequence
    // numbers: a new write starts at seq 0 with ack 0.
    h.handle.write(4, Bytes::from_static(b"fresh")).unwrap();
    let frame = h.secondary.expect_iframe(4).await;
    assert_eq!(frame, b"fresh");
    assert_eq!(h.secondary.rx_seq[&4], 1, "write after reset used seq 0");
}

// =============================================================================
// Scenario: link reset notifies clients
// =============================================================================

#[tokio::test(start_paused = true)]
async fn link_reset_closes_endpoints_and_notifies() {
    let mut h = start_engine(plaintext_config(), None);
    let mut rx = open_endpoint(&mut h, 5).await;

    // Unsolicited reset-cause notification while the link is up: the
    // secondary rebooted underneath us.
    let notification = SystemCommand::PropertyIs {
        seq: 0,
        prop: PropertyId::LastResetCause,
        value: 2u32.to_le_bytes().to_vec(),
    };
    h.secondary
        .send_frame(Frame::unnumbered(
            EP_SYSTEM,
            UnnumberedFunction::Information,
            notification.encode(),
        ))
        .await;

    // Endpoint torn down, client sees EOF, reset notice emitted.
    assert!(timeout(WAIT, rx.recv()).await.unwrap().is_none());
    let mut saw_reset = false;
    while let Ok(Some(notice)) = timeout(WAIT, h.notices.recv()).await {
        if notice == EngineNotice::LinkReset {
            saw_reset = true;
            break;
        }
    }
    assert!(saw_reset, "LinkReset notice not emitted");
    assert_eq!(
        h.handle.status(5).await.unwrap(),
        EndpointState::Closed.code()
    );
}

// =============================================================================
// Scenario: security handshake gates writes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn handshake_gates_encrypted_writes() {
    let (mut h, binding, key_id) = secured_engine();

    // Before the session is up, opening an endpoint is refused (retriable);
    // the engine answers without consulting the secondary.
    assert!(!h.handle.open_query(5).await.unwrap());

    h.secondary.answer_handshake(&binding, key_id).await;

    // Now the open proceeds and an encrypted write round-trips.
    let mut rx = open_endpoint(&mut h, 5).await;
    h.handle.write(5, Bytes::from_static(b"secret")).unwrap();
    let plaintext = h.secondary.expect_encrypted(5).await;
    assert_eq!(plaintext, b"secret");

    h.secondary.send_encrypted(5, b"reply").await;
    let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(&delivered[..], b"reply");
}

// =============================================================================
// Scenario: rekey at the nonce threshold
// =============================================================================

#[tokio::test(start_paused = true)]
async fn rekey_before_nonce_exhaustion() {
    let (mut h, binding, key_id) = secured_engine();
    let security = h.security.clone().expect("secured engine has a worker");

    h.secondary.answer_handshake(&binding, key_id).await;
    let _rx = open_endpoint(&mut h, 5).await;

    // Park the TX counter two frames shy of the rekey threshold.
    security.force_tx_counter(REKEY_THRESHOLD - 2).await.unwrap();
    h.secondary.session.as_mut().unwrap().rx_counter = REKEY_THRESHOLD - 2;

    // Submit a burst of writes; the engine must rekey mid-burst and deliver
    // every payload exactly once, never reusing a nonce.
    let total = 20u8;
    for i in 0..total {
        h.handle.write(5, Bytes::from(vec![i])).unwrap();
    }

    let mut received = Vec::new();
    // Two frames under the old key bring the counter to the threshold.
    for _ in 0..2 {
        let pt = h.secondary.expect_encrypted(5).await;
        received.push(pt[0]);
        h.secondary.send_rr(5).await;
    }

    // The engine initiates a rekey; remaining writes are backpressured
    // until it completes, then flow under the fresh key and counters.
    h.secondary.answer_rekey(&binding).await;
    for _ in 2..total {
        let pt = h.secondary.expect_encrypted(5).await;
        received.push(pt[0]);
        h.secondary.send_rr(5).await;
    }

    let expected: Vec<u8> = (0..total).collect();
    assert_eq!(received, expected, "all writes delivered in order, exactly once");
}

// =============================================================================
// Idempotence and duplicate absorption
// =============================================================================

#[tokio::test(start_paused = true)]
async fn close_is_idempotent() {
    let mut h = start_engine(plaintext_config(), None);
    let _rx = open_endpoint(&mut h, 6).await;

    let (closed, ()) = tokio::join!(h.handle.close(6), h.secondary.answer_endpoint_reset(6));
    assert!(closed.unwrap());

    // Let the engine drain the peer's U-Ack before poking it again.
    tokio::time::sleep(Duration::from_millis(10)).await;

    // Closing an already-closed endpoint is a no-op success.
    assert!(h.handle.close(6).await.unwrap());
    assert_eq!(
        h.handle.status(6).await.unwrap(),
        EndpointState::Closed.code()
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_seq_absorbed_silently() {
    let mut h = start_engine(plaintext_config(), None);
    let mut rx = open_endpoint(&mut h, 3).await;

    let frame = h.secondary.make_iframe(3, b"once".to_vec());
    h.secondary.send_frame(frame.clone()).await;
    let delivered = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(&delivered[..], b"once");

    // Resend the identical frame: absorbed and re-acked, not delivered.
    h.secondary.send_frame(frame).await;
    assert_eq!(h.secondary.expect_rr(3).await, 1);
    assert!(rx.try_recv().is_err(), "duplicate was delivered");
}
