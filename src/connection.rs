//! The per-connection FSM (spec §4.3, §5, §9 design notes).
//!
//! A peer owns up to two `Connection`s at once (one outgoing, one incoming)
//! while collision resolution is pending; ordinarily only one exists.
//! `Connection` owns its transport outright — no back-reference to the
//! peer — so a callback that outlives the connection simply can't run: the
//! `Result` it would have acted on is checked against current state first,
//! per the "late callback" design note.

use std::fmt;

use bgp_rs::{Message, Notification, Open, OpenCapability, OpenParameter};
use log::{debug, trace, warn};

use crate::error::EngineError;
use crate::event::DecisionEvent;
use crate::timer::{BgpTimer, Jitter};
use crate::transport::BgpTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    Close,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            ConnState::Idle => "Idle",
            ConnState::Connect => "Connect",
            ConnState::Active => "Active",
            ConnState::OpenSent => "OpenSent",
            ConnState::OpenConfirm => "OpenConfirm",
            ConnState::Established => "Established",
            ConnState::Close => "Close",
        };
        write!(f, "{}", word)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// What the connection did on this turn of `drive_once`.
#[derive(Debug)]
pub enum ConnEvent {
    /// A message other than Open/Keepalive that the peer layer must react
    /// to (Update, RouteRefresh, or a Notification received from the peer).
    Message(Message),
    Established,
    /// The queued Notification was transmitted; the connection is now Idle.
    NotificationFlushed,
    /// The Connect-state connect-retry timer fired (spec §4.3 "Connect |
    /// connect-retry fires"): the caller must retry the outbound TCP
    /// connect. A connection can't do this itself — it has no access to
    /// the remote address or a way to construct a fresh transport.
    RetryConnect,
    /// Nothing externally visible happened this turn (e.g. a keepalive was
    /// sent, or the connect-retry timer re-armed an Active-state attempt).
    NoOp,
}

/// The bit for each outstanding packet kind a connection owes the wire, in
/// send-priority order (spec §5 ordering guarantee (a)).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PendingPackets(u8);

const PENDING_NOTIFICATION: u8 = 1 << 4;
const PENDING_OPEN: u8 = 1 << 3;
const PENDING_KEEPALIVE: u8 = 1 << 2;
const PENDING_UPDATE: u8 = 1 << 1;
const PENDING_ROUTE_REFRESH: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Notification,
    Open,
    Keepalive,
    Update,
    RouteRefresh,
}

impl PendingPackets {
    fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }

    fn clear_all(&mut self) {
        self.0 = 0;
    }

    /// Highest-priority outstanding packet, if any. At most one is sent per
    /// wake, matching the "one in-flight type per wake" ordering guarantee.
    fn highest_priority(&self) -> Option<PendingKind> {
        if self.0 & PENDING_NOTIFICATION != 0 {
            Some(PendingKind::Notification)
        } else if self.0 & PENDING_OPEN != 0 {
            Some(PendingKind::Open)
        } else if self.0 & PENDING_KEEPALIVE != 0 {
            Some(PendingKind::Keepalive)
        } else if self.0 & PENDING_UPDATE != 0 {
            Some(PendingKind::Update)
        } else if self.0 & PENDING_ROUTE_REFRESH != 0 {
            Some(PendingKind::RouteRefresh)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationPacket {
    pub code: u8,
    pub subcode: u8,
    pub data: Vec<u8>,
}

/// The pieces of peer configuration a connection needs to build its own
/// Open message and to validate the peer's.
#[derive(Debug, Clone, Copy)]
pub struct OpenParams {
    pub local_id: u32,
    pub local_as: u32,
    pub hold_time: u16,
    pub remote_as: u32,
}

pub struct Connection {
    pub state: ConnState,
    pub direction: Direction,
    transport: Option<Box<dyn BgpTransport>>,
    pub connect_retry_timer: BgpTimer,
    pub hold_timer: BgpTimer,
    pub keepalive_timer: BgpTimer,
    pending: PendingPackets,
    pub notification: Option<NotificationPacket>,
    /// The `(code, subcode)` of the last Notification this connection
    /// queued via `bgp_error`, kept past `to_idle`'s clearing of
    /// `notification` so the peer can still record it once the flush
    /// completes (spec §4.6 `store_error` for BgpTx).
    pub last_notification_sent: Option<(u8, u8)>,
    pub negotiated_hold_time: u16,
    pub remote_id: Option<u32>,
    decision: DecisionEvent,
}

impl Connection {
    pub fn new(direction: Direction) -> Self {
        Self {
            state: ConnState::Idle,
            direction,
            transport: None,
            connect_retry_timer: BgpTimer::new(),
            hold_timer: BgpTimer::new(),
            keepalive_timer: BgpTimer::new(),
            pending: PendingPackets::default(),
            notification: None,
            last_notification_sent: None,
            negotiated_hold_time: 0,
            remote_id: None,
            decision: DecisionEvent::new(),
        }
    }

    /// Attaches the peer's decision event, so entering Idle can schedule a
    /// re-check of peer-level state (spec §4.3 "Entering Idle ... schedules
    /// the peer's decision event").
    pub fn attach_decision(&mut self, decision: DecisionEvent) {
        self.decision = decision;
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    /// Idle -> Connect/Active with the transport already in hand (spec
    /// §4.3 "Idle | start"), for the already-connected/already-accepted
    /// case. The caller is responsible for actually opening the TCP socket
    /// or accepting the inbound one; this only records the resulting state.
    pub fn start(
        &mut self,
        transport: Box<dyn BgpTransport>,
        passive: bool,
        connect_retry_time: u16,
        start_delay_time: u16,
        jitter: &dyn Jitter,
    ) {
        self.transport = Some(transport);
        self.await_connection(passive, connect_retry_time, start_delay_time, jitter);
    }

    /// Idle -> Connect/Active without a transport in hand yet (spec §4.3
    /// "Idle | start"): used when the transport isn't ready when the state
    /// transition happens — a passive peer with nothing to attach until an
    /// inbound connection arrives, or an active peer about to attempt
    /// `TcpStream::connect` whose outcome isn't known yet. Arming the
    /// connect-retry timer here, ahead of that attempt, is what lets a
    /// failed/slow connect still get driven and retried.
    pub fn await_connection(
        &mut self,
        passive: bool,
        connect_retry_time: u16,
        start_delay_time: u16,
        jitter: &dyn Jitter,
    ) {
        if passive {
            self.state = ConnState::Active;
            self.connect_retry_timer
                .arm(start_delay_time.max(1), jitter);
        } else {
            self.state = ConnState::Connect;
            self.connect_retry_timer.arm(connect_retry_time, jitter);
        }
    }

    /// Attaches a transport to a connection already in Connect/Active (spec
    /// §4.3 "Connect | TCP connected"), without touching its state or
    /// timers — the caller follows up with `on_connected`.
    pub fn attach_transport(&mut self, transport: Box<dyn BgpTransport>) {
        self.transport = Some(transport);
    }

    /// TCP connected (spec: "Connect | TCP connected"): send Open, stop the
    /// connect-retry timer, arm the hold timer at the configured initial
    /// value pending negotiation.
    pub async fn on_connected(
        &mut self,
        params: &OpenParams,
        initial_hold_time: u16,
        jitter: &dyn Jitter,
    ) -> Result<(), EngineError> {
        self.connect_retry_timer.stop();
        self.send_open(params).await?;
        self.hold_timer.arm(initial_hold_time, jitter);
        self.state = ConnState::OpenSent;
        Ok(())
    }

    /// Inbound connection accepted into this (previously Idle/Active) slot
    /// (spec §4.4): attach the transport and send our own Open.
    pub async fn on_inbound_accepted(
        &mut self,
        transport: Box<dyn BgpTransport>,
        params: &OpenParams,
        initial_hold_time: u16,
        jitter: &dyn Jitter,
    ) -> Result<(), EngineError> {
        self.transport = Some(transport);
        self.connect_retry_timer.stop();
        self.send_open(params).await?;
        self.hold_timer.arm(initial_hold_time, jitter);
        self.state = ConnState::OpenSent;
        Ok(())
    }

    async fn send_open(&mut self, params: &OpenParams) -> Result<(), EngineError> {
        let open = Open {
            version: 4,
            peer_asn: if params.local_as < 65535 {
                params.local_as as u16
            } else {
                23456
            },
            hold_timer: params.hold_time,
            identifier: params.local_id,
            parameters: vec![OpenParameter::Capabilities(vec![OpenCapability::FourByteASN(
                params.local_as,
            )])],
        };
        trace!("sending OPEN (asn={}, hold={})", params.local_as, params.hold_time);
        self.send(Message::Open(open)).await
    }

    async fn send(&mut self, message: Message) -> Result<(), EngineError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| EngineError::Other("send on a detached connection".into()))?;
        transport.send(message).await.map_err(EngineError::from)
    }

    /// Records a protocol error, queues its Notification, and moves the
    /// connection to Close. A no-op on a connection already in Close, so a
    /// late-arriving error from a stale callback can never resurrect it
    /// (spec §5 re-check rule, testable property 5).
    pub fn bgp_error(&mut self, code: u8, subcode: u8) {
        if self.state == ConnState::Close {
            return;
        }
        warn!("connection entering Close: notification ({}, {})", code, subcode);
        self.hold_timer.stop();
        self.keepalive_timer.stop();
        self.connect_retry_timer.stop();
        self.notification = Some(NotificationPacket {
            code,
            subcode,
            data: Vec::new(),
        });
        self.last_notification_sent = Some((code, subcode));
        self.pending.set(PENDING_NOTIFICATION);
        self.state = ConnState::Close;
    }

    /// Releases timers, socket, and queued state, and returns the
    /// connection to Idle (spec §4.3 "Entering Idle"), scheduling the
    /// peer's decision event so it re-checks whatever prompted this.
    pub fn to_idle(&mut self) {
        self.hold_timer.stop();
        self.keepalive_timer.stop();
        self.connect_retry_timer.stop();
        self.transport = None;
        self.pending.clear_all();
        self.notification = None;
        self.negotiated_hold_time = 0;
        self.remote_id = None;
        self.state = ConnState::Idle;
        self.decision.schedule();
    }

    /// Processes a received Open (spec §4.3 OpenSent row; collision
    /// arbitration itself is the caller's job via [`Self::remote_id`]).
    fn process_open(&mut self, open: &Open, expected_remote_as: u32) -> Result<(), EngineError> {
        let remote_as = asn_from_open(open);
        if remote_as != expected_remote_as {
            return Err(EngineError::OpenAsnMismatch {
                received: remote_as,
                expected: expected_remote_as,
            });
        }
        self.remote_id = Some(open.identifier);
        self.negotiated_hold_time = open.hold_timer;
        if self.negotiated_hold_time > 0 {
            self.keepalive_timer.arm(self.negotiated_hold_time / 3, &crate::timer::ThreadRngJitter);
            self.hold_timer.arm(self.negotiated_hold_time, &crate::timer::ThreadRngJitter);
        } else {
            self.hold_timer.stop();
            self.keepalive_timer.stop();
        }
        Ok(())
    }

    /// Drives one turn of the connection's event loop: waits for whichever
    /// of {incoming message, hold timer, keepalive timer, connect-retry
    /// timer} fires first and reacts per the spec §4.3 transition table.
    pub async fn drive_once(
        &mut self,
        params: &OpenParams,
        jitter: &dyn Jitter,
    ) -> Result<ConnEvent, EngineError> {
        if self.state == ConnState::Close {
            if let Some(kind) = self.pending.highest_priority() {
                if kind == PendingKind::Notification {
                    if let Some(notif) = self.notification.take() {
                        self.send(Message::Notification(Notification {
                            major_err_code: notif.code,
                            minor_err_code: notif.subcode,
                            data: notif.data,
                        }))
                        .await?;
                    }
                    self.pending.clear(PENDING_NOTIFICATION);
                }
            }
            self.to_idle();
            return Ok(ConnEvent::NotificationFlushed);
        }

        tokio::select! {
            result = recv_or_pending(&mut self.transport) => {
                match result {
                    Ok(Some(message)) => self.handle_message(message, params, jitter).await,
                    Ok(None) => {
                        self.bgp_error(6, 0);
                        Ok(ConnEvent::NoOp)
                    }
                    Err(err) => {
                        self.to_idle();
                        Err(EngineError::from(err))
                    }
                }
            }
            _ = self.connect_retry_timer.tick(), if matches!(self.state, ConnState::Connect | ConnState::Active) => {
                debug!("connect-retry fired in {}", self.state);
                match self.state {
                    ConnState::Connect => Ok(ConnEvent::RetryConnect),
                    _ => {
                        let nominal = self.connect_retry_timer.nominal_secs();
                        self.connect_retry_timer.arm(nominal.max(1), jitter);
                        Ok(ConnEvent::NoOp)
                    }
                }
            }
            _ = self.hold_timer.tick(), if self.hold_timer.is_armed() => {
                match self.state {
                    ConnState::Established => {
                        self.hold_timer.arm(10, jitter);
                        Ok(ConnEvent::NoOp)
                    }
                    _ => {
                        self.bgp_error(4, 0);
                        Ok(ConnEvent::NoOp)
                    }
                }
            }
            _ = self.keepalive_timer.tick(), if self.keepalive_timer.is_armed() => {
                self.pending.set(PENDING_KEEPALIVE);
                let nominal = self.keepalive_timer.nominal_secs();
                self.keepalive_timer.arm(nominal, jitter);
                self.send(Message::KeepAlive).await?;
                self.pending.clear(PENDING_KEEPALIVE);
                Ok(ConnEvent::NoOp)
            }
        }
    }

    async fn handle_message(
        &mut self,
        message: Message,
        params: &OpenParams,
        jitter: &dyn Jitter,
    ) -> Result<ConnEvent, EngineError> {
        match (self.state, message) {
            (ConnState::OpenSent, Message::Open(open)) => {
                if let Err(err) = self.process_open(&open, params.remote_as) {
                    self.bgp_error(2, 2);
                    return Err(err);
                }
                self.send(Message::KeepAlive).await?;
                self.state = ConnState::OpenConfirm;
                Ok(ConnEvent::NoOp)
            }
            (ConnState::Active, Message::Open(open)) => {
                // Inbound-only Active->OpenSent is handled by the listener
                // attaching the transport before this branch is reachable;
                // a bare Open here means the peer replied before our own
                // went out, which is a protocol error under our model.
                let _ = open;
                self.bgp_error(5, 0);
                Ok(ConnEvent::NoOp)
            }
            (ConnState::OpenConfirm, Message::KeepAlive) => {
                self.state = ConnState::Established;
                self.hold_timer.arm(self.negotiated_hold_time.max(1), jitter);
                Ok(ConnEvent::Established)
            }
            (ConnState::Established, Message::KeepAlive) => {
                self.hold_timer.arm(self.negotiated_hold_time.max(1), jitter);
                Ok(ConnEvent::NoOp)
            }
            (ConnState::Established, Message::Update(update)) => {
                self.hold_timer.arm(self.negotiated_hold_time.max(1), jitter);
                Ok(ConnEvent::Message(Message::Update(update)))
            }
            (ConnState::Established, Message::RouteRefresh(rr)) => {
                self.hold_timer.arm(self.negotiated_hold_time.max(1), jitter);
                Ok(ConnEvent::Message(Message::RouteRefresh(rr)))
            }
            (_, Message::Notification(notif)) => {
                debug!(
                    "peer sent NOTIFICATION ({}, {})",
                    notif.major_err_code, notif.minor_err_code
                );
                self.to_idle();
                Ok(ConnEvent::Message(Message::Notification(notif)))
            }
            (state, other) => {
                warn!("unexpected message in {}: {:?}", state, other);
                self.bgp_error(fsm_err_for_state(state), 0);
                Ok(ConnEvent::NoOp)
            }
        }
    }
}

async fn recv_or_pending(
    transport: &mut Option<Box<dyn BgpTransport>>,
) -> Result<Option<Message>, std::io::Error> {
    match transport {
        Some(t) => t.recv().await,
        None => std::future::pending().await,
    }
}

fn fsm_err_for_state(state: ConnState) -> u8 {
    match state {
        ConnState::OpenSent => 1,
        ConnState::OpenConfirm => 2,
        ConnState::Established => 3,
        _ => 0,
    }
}

fn asn_from_open(open: &Open) -> u32 {
    open.parameters
        .iter()
        .flat_map(|p| match p {
            OpenParameter::Capabilities(caps) => caps.clone(),
            _ => vec![],
        })
        .find_map(|c| match c {
            OpenCapability::FourByteASN(asn) => Some(asn),
            _ => None,
        })
        .unwrap_or(u32::from(open.peer_asn))
}
