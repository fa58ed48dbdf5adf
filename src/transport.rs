//! # Overlay Transport
//!
//! Authenticated QUIC connections between mesh peers.
//!
//! ## Connection lifecycle
//!
//! ```text
//! Disconnected ──► Handshaking ──► PinValidating ──► Authenticated ──► Ready
//!                       │                │                 │             │
//!                       └────────────────┴────────► Failed  └──► Closed ◄┘
//! ```
//!
//! | State | What happens |
//! |-------|--------------|
//! | `Handshaking` | QUIC + mutual TLS 1.3 with self-signed Ed25519 certificates |
//! | `PinValidating` | fingerprint of the responder certificate checked against the pin store |
//! | `Authenticated` | initiator proved its identity on the secured channel |
//! | `Ready` | first contact pinned; request streams may be opened |
//!
//! A pin mismatch closes the connection before any application frame is sent.
//!
//! ## Application handshake
//!
//! The initiator opens the first stream and sends a `Handshake` signed over
//! `peer_id || responder_fingerprint || timestamp`. Binding the responder's
//! fingerprint means the signature is useless on any other channel. The responder
//! checks that the claimed key is the one in the client certificate and that the
//! claimed peer id is that key's hash.
//!
//! ## Requests
//!
//! Every request is one bidirectional stream carrying one framed [`Envelope`] each
//! way. Streams on a connection are independent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use quinn::{ClientConfig, Connection, Endpoint};
use tracing::{debug, info, trace, warn};

use crate::bootstrap::DescriptorSlot;
use crate::crypto::{
    GENERIC_SERVER_NAME, HANDSHAKE_SIGNATURE_DOMAIN, RemoteCertificate, peer_id_to_sni, remote_certificate,
    sign_with_domain, verify_with_domain,
};
use crate::descriptor::{PeerAddr, PeerDescriptor};
use crate::error::{MeshError, SecurityViolation};
use crate::frame::{read_message, write_message};
use crate::identity::{Keypair, PeerId, now_ms};
use crate::messages::{Envelope, HandshakeAck, HandshakeRequest, OverlayMessage};
use crate::pins::{PinCheck, PinStore};

/// Handshake timestamps further than this from the local clock are refused.
const HANDSHAKE_MAX_SKEW_MS: u64 = 5 * 60 * 1000;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_PIN_MISMATCH: u32 = 1;
const CLOSE_HANDSHAKE_REJECTED: u32 = 2;
const CLOSE_NORMAL: u32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    PinValidating,
    Authenticated,
    Ready,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Handshaking)
                | (Handshaking, PinValidating)
                | (PinValidating, Authenticated)
                | (Authenticated, Ready)
                | (Handshaking | PinValidating | Authenticated, Failed)
                | (Authenticated | Ready, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Lifecycle tracker for one connection attempt.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<ConnectionState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            trace!(from = ?*state, to = ?next, "connection state");
            *state = next;
            true
        } else {
            false
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Active connection accounting
// ============================================================================

/// Counts live overlay connections in both directions.
#[derive(Clone, Debug, Default)]
pub struct ConnectionCounter {
    active: Arc<AtomicUsize>,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            active: self.active.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Handshake
// ============================================================================

pub fn build_handshake(
    keypair: &Keypair,
    responder_fingerprint: &str,
    descriptor: Option<PeerDescriptor>,
) -> HandshakeRequest {
    let peer_id = keypair.peer_id();
    let timestamp = now_ms();
    let payload = HandshakeRequest::signed_payload(&peer_id, responder_fingerprint, timestamp);
    HandshakeRequest {
        peer_id,
        public_key: keypair.public_key_bytes(),
        timestamp,
        descriptor,
        signature: sign_with_domain(keypair, HANDSHAKE_SIGNATURE_DOMAIN, &payload),
    }
}

/// Responder-side checks on an initiator's handshake.
pub fn verify_handshake(
    request: &HandshakeRequest,
    client_cert: &RemoteCertificate,
    local_fingerprint: &str,
    now_ms: u64,
) -> Result<(), SecurityViolation> {
    if PeerId::from_public_key(&request.public_key) != request.peer_id
        || request.public_key != client_cert.public_key
    {
        return Err(SecurityViolation::IdentityMismatch);
    }
    if request.timestamp.abs_diff(now_ms) > HANDSHAKE_MAX_SKEW_MS {
        return Err(SecurityViolation::Replay {
            peer: request.peer_id.to_hex(),
        });
    }
    let payload = HandshakeRequest::signed_payload(&request.peer_id, local_fingerprint, request.timestamp);
    verify_with_domain(&request.public_key, HANDSHAKE_SIGNATURE_DOMAIN, &payload, &request.signature)?;
    Ok(())
}

/// Initiator side of the application handshake, on an already secured connection.
pub async fn perform_client_handshake(
    connection: &Connection,
    keypair: &Keypair,
    responder_fingerprint: &str,
    descriptor: Option<PeerDescriptor>,
    max_frame_len: usize,
) -> Result<HandshakeAck, MeshError> {
    let request = build_handshake(keypair, responder_fingerprint, descriptor);
    let envelope = Envelope::new(OverlayMessage::Handshake(request));

    let exchange = async {
        let (mut send, mut recv) = connection.open_bi().await?;
        write_message(&mut send, &envelope).await?;
        send.finish().map_err(|e| MeshError::transient(format!("stream: {e}")))?;
        read_message::<_, Envelope>(&mut recv, max_frame_len)
            .await
            .ok_or_else(|| MeshError::protocol("no handshake reply"))
    };
    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, exchange).await??;

    match reply.body {
        OverlayMessage::HandshakeAck(ack) if reply.nonce == envelope.nonce => Ok(ack),
        OverlayMessage::HandshakeAck(_) => Err(MeshError::protocol("handshake reply nonce mismatch")),
        other => Err(MeshError::protocol(format!("expected handshake-ack, got {}", other.kind()))),
    }
}

/// An inbound connection that completed the application handshake.
pub struct AcceptedPeer {
    pub remote: RemoteCertificate,
    /// Verified descriptor the initiator presented, if any.
    pub descriptor: Option<PeerDescriptor>,
}

/// Responder side: read the first stream, verify it, answer with an ack.
pub async fn accept_handshake(
    connection: &Connection,
    local_id: PeerId,
    local_fingerprint: &str,
    local_descriptor: Option<PeerDescriptor>,
    max_frame_len: usize,
) -> Result<AcceptedPeer, MeshError> {
    let remote = remote_certificate(connection)
        .ok_or_else(|| MeshError::protocol("client presented no usable certificate"))?;

    let (mut send, mut recv) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connection.accept_bi()).await??;
    let envelope = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_message::<_, Envelope>(&mut recv, max_frame_len))
        .await?
        .ok_or_else(|| MeshError::protocol("no handshake frame"))?;

    let OverlayMessage::Handshake(request) = envelope.body else {
        connection.close(CLOSE_HANDSHAKE_REJECTED.into(), b"handshake required");
        return Err(MeshError::protocol("first frame was not a handshake"));
    };

    let verdict = verify_handshake(&request, &remote, local_fingerprint, now_ms());
    let ack = HandshakeAck {
        peer_id: local_id,
        accepted: verdict.is_ok(),
        reason: verdict.as_ref().err().map(|e| e.to_string()),
        descriptor: local_descriptor,
    };
    write_message(&mut send, &Envelope::reply_to(&envelope.nonce, OverlayMessage::HandshakeAck(ack))).await?;
    let _ = send.finish();

    if let Err(violation) = verdict {
        warn!(
            event = "security",
            remote = %connection.remote_address(),
            peer = %remote.peer_id.short(),
            error = %violation,
            "rejecting overlay handshake"
        );
        // Let the ack reach the peer before tearing down.
        let _ = tokio::time::timeout(Duration::from_millis(200), send.stopped()).await;
        connection.close(CLOSE_HANDSHAKE_REJECTED.into(), b"handshake rejected");
        return Err(violation.into());
    }

    let descriptor = request
        .descriptor
        .filter(|d| d.peer_id == remote.peer_id && d.verify().is_ok());
    Ok(AcceptedPeer { remote, descriptor })
}

// ============================================================================
// Outbound connections
// ============================================================================

/// Dials peers and produces [`OverlayConnection`]s that are pinned and authenticated.
pub struct OverlayTransport {
    endpoint: Endpoint,
    client_config: ClientConfig,
    keypair: Keypair,
    local_descriptor: DescriptorSlot,
    pins: Arc<PinStore>,
    counter: ConnectionCounter,
    max_frame_len: usize,
    request_timeout: Duration,
}

impl OverlayTransport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: Endpoint,
        client_config: ClientConfig,
        keypair: Keypair,
        local_descriptor: DescriptorSlot,
        pins: Arc<PinStore>,
        counter: ConnectionCounter,
        max_frame_len: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            client_config,
            keypair,
            local_descriptor,
            pins,
            counter,
            max_frame_len,
            request_timeout,
        }
    }

    pub fn pins(&self) -> &Arc<PinStore> {
        &self.pins
    }

    pub async fn connect(&self, addr: &PeerAddr) -> Result<OverlayConnection, MeshError> {
        let socket: SocketAddr = addr
            .addr
            .parse()
            .map_err(|_| MeshError::invalid(format!("not a socket address: {}", addr.addr)))?;
        let state = StateCell::new();

        state.advance(ConnectionState::Handshaking);
        let sni = match &addr.peer_id {
            Some(id) => peer_id_to_sni(id),
            None => GENERIC_SERVER_NAME.to_string(),
        };
        let connecting = self
            .endpoint
            .connect_with(self.client_config.clone(), socket, &sni)
            .inspect_err(|_| {
                state.advance(ConnectionState::Failed);
            })?;
        let connection = match connecting.await {
            Ok(c) => c,
            Err(e) => {
                state.advance(ConnectionState::Failed);
                return Err(e.into());
            }
        };

        state.advance(ConnectionState::PinValidating);
        let Some(remote) = remote_certificate(&connection) else {
            state.advance(ConnectionState::Failed);
            connection.close(CLOSE_HANDSHAKE_REJECTED.into(), b"no certificate");
            return Err(MeshError::protocol("responder presented no usable certificate"));
        };
        if let Some(expected) = addr.peer_id
            && expected != remote.peer_id
        {
            state.advance(ConnectionState::Failed);
            connection.close(CLOSE_HANDSHAKE_REJECTED.into(), b"identity mismatch");
            return Err(SecurityViolation::IdentityMismatch.into());
        }

        let identifier = addr.identifier();
        let pin = self
            .pins
            .check_pin(&identifier, &remote.fingerprint)
            .map_err(|e| MeshError::transient(format!("pin store: {e:#}")))?;
        if pin == PinCheck::Mismatch {
            state.advance(ConnectionState::Failed);
            connection.close(CLOSE_PIN_MISMATCH.into(), b"pin mismatch");
            return Err(SecurityViolation::PinMismatch { identifier }.into());
        }

        let descriptor = self.local_descriptor.read().clone();
        let ack = match perform_client_handshake(
            &connection,
            &self.keypair,
            &remote.fingerprint,
            descriptor,
            self.max_frame_len,
        )
        .await
        {
            Ok(ack) => ack,
            Err(e) => {
                state.advance(ConnectionState::Failed);
                connection.close(CLOSE_HANDSHAKE_REJECTED.into(), b"handshake failed");
                return Err(e);
            }
        };
        if !ack.accepted || ack.peer_id != remote.peer_id {
            state.advance(ConnectionState::Failed);
            connection.close(CLOSE_HANDSHAKE_REJECTED.into(), b"handshake rejected");
            return Err(MeshError::protocol(format!(
                "handshake rejected: {}",
                ack.reason.as_deref().unwrap_or("identity mismatch")
            )));
        }
        state.advance(ConnectionState::Authenticated);

        if pin == PinCheck::NotPinned {
            self.pins
                .set_pin(&identifier, &remote.fingerprint)
                .map_err(|e| MeshError::transient(format!("pin store: {e:#}")))?;
        }
        state.advance(ConnectionState::Ready);

        let remote_descriptor = ack
            .descriptor
            .filter(|d| d.peer_id == remote.peer_id && d.verify().is_ok());
        info!(peer = %remote.peer_id.short(), addr = %socket, "overlay connection ready");

        Ok(OverlayConnection {
            connection,
            remote_addr: PeerAddr::new(addr.addr.clone(), Some(remote.peer_id)),
            remote,
            remote_descriptor,
            state,
            max_frame_len: self.max_frame_len,
            request_timeout: self.request_timeout,
            _guard: self.counter.guard(),
        })
    }
}

/// A `Ready` connection to an authenticated peer.
pub struct OverlayConnection {
    connection: Connection,
    remote: RemoteCertificate,
    remote_addr: PeerAddr,
    remote_descriptor: Option<PeerDescriptor>,
    state: StateCell,
    max_frame_len: usize,
    request_timeout: Duration,
    _guard: ConnectionGuard,
}

impl OverlayConnection {
    pub fn peer_id(&self) -> PeerId {
        self.remote.peer_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.remote.fingerprint
    }

    /// The address dialed, with the authenticated peer id attached.
    pub fn peer_addr(&self) -> &PeerAddr {
        &self.remote_addr
    }

    pub fn remote_descriptor(&self) -> Option<&PeerDescriptor> {
        self.remote_descriptor.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        if self.connection.close_reason().is_some() {
            self.state.advance(ConnectionState::Closed);
        }
        self.state.get()
    }

    pub fn is_usable(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// One request/response exchange on a fresh stream.
    pub async fn request(&self, body: OverlayMessage) -> Result<OverlayMessage, MeshError> {
        if !self.is_usable() {
            return Err(MeshError::transient("connection is closed"));
        }
        let envelope = Envelope::new(body);
        let kind = envelope.body.kind();

        let exchange = async {
            let (mut send, mut recv) = self.connection.open_bi().await?;
            write_message(&mut send, &envelope).await?;
            send.finish().map_err(|e| MeshError::transient(format!("stream: {e}")))?;
            read_message::<_, Envelope>(&mut recv, self.max_frame_len)
                .await
                .ok_or_else(|| MeshError::protocol(format!("no reply to {kind}")))
        };
        let reply = tokio::time::timeout(self.request_timeout, exchange).await??;

        if reply.nonce != envelope.nonce {
            return Err(MeshError::protocol("reply nonce does not match request"));
        }
        match reply.body {
            OverlayMessage::Error(e) => Err(MeshError::protocol(format!("peer refused {kind}: {}", e.message))),
            body => Ok(body),
        }
    }

    pub fn close(&self) {
        debug!(peer = %self.remote.peer_id.short(), "closing overlay connection");
        self.connection.close(CLOSE_NORMAL.into(), b"closed");
        self.state.advance(ConnectionState::Closed);
    }
}

impl Drop for OverlayConnection {
    fn drop(&mut self) {
        if self.connection.close_reason().is_none() {
            self.connection.close(CLOSE_NORMAL.into(), b"dropped");
        }
    }
}
