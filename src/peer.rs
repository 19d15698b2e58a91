//! The peer instance (spec §3, §4.2, §4.6, §6): the per-neighbor lifecycle
//! that owns a peer's two connection slots, its back-off state, and its
//! status reporting, and drives them against the shared collaborators
//! (listening endpoint, object lock, neighbor cache, RIB importer).

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use bgp_rs::Message;
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::config::PeerConfig;
use crate::connection::{ConnEvent, Connection, Direction, OpenParams};
use crate::error::{EngineError, LastError, MiscReason};
use crate::event::DecisionEvent;
use crate::listener::{ListeningEndpoint, Md5KeyStore};
use crate::neighbor::{NeighborCache, Reachability};
use crate::objectlock::{LockGuard, LockKey, ObjectLock};
use crate::rib::RibImporter;
use crate::timer::{BgpTimer, ThreadRngJitter};
use crate::transport::{BgpTransport, WireTransport};

/// Where the peer is in its own (not connection-level) lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupState {
    Prepare,
    Connect,
    ConnectNoCap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Down,
    Start,
    Up,
    Stop,
}

pub struct PeerInstance {
    pub config: Arc<PeerConfig>,
    pub status: PeerStatus,
    pub startup_state: StartupState,
    pub outgoing: Connection,
    pub incoming: Connection,
    /// Which slot (if any) is the established session.
    pub active_session: Option<Direction>,
    pub startup_timer: BgpTimer,
    pub decision: DecisionEvent,
    pub startup_delay: u16,
    pub last_proto_error: Option<Instant>,
    pub last_error: LastError,
    object_lock: Option<LockGuard>,
    local_id: u32,
    incoming_rx: Option<mpsc::UnboundedReceiver<TcpStream>>,
    neighbor_rx: Option<watch::Receiver<Reachability>>,
    /// Set while the peer is Down solely because its next hop isn't
    /// reachable yet, so `run`'s idle-shutdown check doesn't mistake
    /// "waiting for a neighbor" for "administratively stopped".
    awaiting_neighbor: bool,
    poll_timer: BgpTimer,
}

impl PeerInstance {
    pub fn new(config: Arc<PeerConfig>) -> Self {
        let local_id = match config.local_router_id {
            IpAddr::V4(v4) => u32::from(v4),
            IpAddr::V6(_) => 0,
        };
        let decision = DecisionEvent::new();
        let mut outgoing = Connection::new(Direction::Outgoing);
        outgoing.attach_decision(decision.clone());
        let mut incoming = Connection::new(Direction::Incoming);
        incoming.attach_decision(decision.clone());
        Self {
            config,
            status: PeerStatus::Down,
            startup_state: StartupState::Prepare,
            outgoing,
            incoming,
            active_session: None,
            startup_timer: BgpTimer::new(),
            decision,
            startup_delay: 0,
            last_proto_error: None,
            last_error: LastError::none(),
            object_lock: None,
            local_id,
            incoming_rx: None,
            neighbor_rx: None,
            awaiting_neighbor: false,
            poll_timer: BgpTimer::new(),
        }
    }

    /// Runs the spec §4.2 "on start" sequence: acquires the object lock,
    /// subscribes to next-hop reachability, and either waits for the
    /// neighbor to come up or proceeds into Prepare -> Connect/Active.
    pub async fn start(
        &mut self,
        locks: &dyn ObjectLock,
        neighbors: &dyn NeighborCache,
        listener: &ListeningEndpoint,
        bind_addr: SocketAddr,
        md5: &dyn Md5KeyStore,
    ) {
        let next_hop = self.config.multihop_via.unwrap_or(self.config.remote_ip);
        let key = LockKey::bgp(self.config.remote_ip, self.config.dest_port);
        self.object_lock = Some(locks.acquire(key).await);
        self.neighbor_rx = neighbors.watch(next_hop);

        match neighbors.neigh_find(next_hop, false).await {
            None | Some(Reachability::Unreachable) => {
                self.last_error = LastError::misc(MiscReason::InvalidNextHop);
                self.status = PeerStatus::Down;
                self.awaiting_neighbor = true;
                warn!(
                    "peer {} waiting: next hop {} unreachable",
                    self.config.remote_ip, next_hop
                );
                return;
            }
            Some(Reachability::Reachable) => {}
        }

        self.open_and_initiate(listener, bind_addr, md5).await;
    }

    /// Acquires the shared listening socket, installs the peer's MD5 key if
    /// one is configured, and enters Start (spec §4.2 "proceed to
    /// start_neighbor"). Split out of `start` so reachability transitions
    /// noticed later (neighbor-cache notification, while Prepare) can
    /// re-enter at this point without re-running the lock/reachability
    /// checks.
    async fn open_and_initiate(
        &mut self,
        listener: &ListeningEndpoint,
        bind_addr: SocketAddr,
        md5: &dyn Md5KeyStore,
    ) {
        self.awaiting_neighbor = false;
        match listener.acquire(bind_addr, self.config.remote_ip).await {
            Ok(rx) => self.incoming_rx = Some(rx),
            Err(err) => {
                self.last_error = LastError::socket(err.raw_os_error().unwrap_or(0));
                self.status = PeerStatus::Down;
                warn!("peer {} disabled: {}", self.config.remote_ip, err);
                return;
            }
        }

        if let Some(password) = &self.config.password {
            if let Err(err) = md5.install_key(self.config.remote_ip, password) {
                warn!("peer {} failed to install MD5 key: {}", self.config.remote_ip, err);
                self.last_error = LastError::misc(MiscReason::InvalidMd5);
                self.status = PeerStatus::Down;
                return;
            }
        }

        self.status = PeerStatus::Start;
        self.startup_state = if self.config.capabilities {
            StartupState::Prepare
        } else {
            StartupState::ConnectNoCap
        };
        let jitter = ThreadRngJitter;
        if self.startup_delay > 0 {
            self.startup_timer.arm(self.startup_delay, &jitter);
        } else {
            self.enter_connect(&jitter).await;
        }
    }

    /// spec §4.2 "becoming unreachable while Start or Up": records the loss
    /// and closes any active connection, without going through `shutdown`'s
    /// ManDown classification (this is neighbor loss, not an admin action).
    fn stop_for_neighbor_loss(&mut self) {
        warn!("peer {} next hop no longer reachable, stopping", self.config.remote_ip);
        self.last_error = LastError::misc(MiscReason::NeighborLost);
        self.awaiting_neighbor = true;
        if let Some(direction) = self.active_session {
            let conn = match direction {
                Direction::Outgoing => &mut self.outgoing,
                Direction::Incoming => &mut self.incoming,
            };
            conn.bgp_error(6, 6);
        } else {
            self.outgoing.to_idle();
            self.incoming.to_idle();
        }
        self.status = PeerStatus::Down;
        self.decision.schedule();
    }

    async fn enter_connect(&mut self, jitter: &dyn crate::timer::Jitter) {
        self.startup_state = StartupState::Connect;
        self.outgoing.await_connection(
            self.config.passive,
            self.config.connect_retry_time,
            self.config.start_delay_time,
            jitter,
        );
        if self.config.passive {
            return;
        }
        match TcpStream::connect(SocketAddr::new(self.config.remote_ip, self.config.dest_port))
            .await
        {
            Ok(stream) => match WireTransport::new(stream) {
                Ok(transport) => {
                    self.outgoing.attach_transport(Box::new(transport));
                    let params = self.open_params();
                    if let Err(err) = self
                        .outgoing
                        .on_connected(&params, self.config.initial_hold_time, jitter)
                        .await
                    {
                        warn!("{} failed to send OPEN: {}", self.config.remote_ip, err);
                        self.outgoing.to_idle();
                    }
                }
                Err(err) => warn!("{} transport setup failed: {}", self.config.remote_ip, err),
            },
            Err(err) => {
                // connect-retry is already armed by `await_connection` above;
                // `drive_once` retries via `ConnEvent::RetryConnect` once it fires.
                debug!("{} connect attempt failed: {}", self.config.remote_ip, err);
            }
        }
    }

    fn open_params(&self) -> OpenParams {
        OpenParams {
            local_id: self.local_id,
            local_as: self.config.local_as,
            hold_time: self.config.hold_time,
            remote_as: self.config.remote_as,
        }
    }

    /// Attaches an inbound connection accepted by the shared listener
    /// (spec §4.4 acceptance preconditions are checked by the caller).
    pub async fn attach_incoming(&mut self, transport: Box<dyn BgpTransport>) {
        let jitter = ThreadRngJitter;
        let params = self.open_params();
        if let Err(err) = self
            .incoming
            .on_inbound_accepted(transport, &params, self.config.initial_hold_time, &jitter)
            .await
        {
            warn!("{} inbound OPEN failed: {}", self.config.remote_ip, err);
            self.incoming.to_idle();
        }
    }

    /// Runs collision arbitration once both slots have a negotiated remote
    /// id (spec §4.4): the locally-larger BGP identifier wins, equal ids
    /// close the incoming connection as an engine-policy tie-break.
    pub fn resolve_collision(&mut self) {
        let (Some(_), Some(remote_id)) = (self.outgoing.remote_id, self.incoming.remote_id) else {
            return;
        };
        // Both slots negotiated with the same peer, so its identifier is
        // the same on either connection; the comparison is local vs. that
        // single remote id (spec §4.4).
        if self.local_id > remote_id {
            self.incoming.bgp_error(6, 7);
        } else if self.local_id < remote_id {
            self.outgoing.bgp_error(6, 7);
        } else {
            warn!(
                "peer {}: local and remote BGP identifiers are equal; closing incoming as tie-break",
                self.config.remote_ip
            );
            self.incoming.bgp_error(6, 7);
        }
    }

    pub async fn process_event(&mut self, direction: Direction, event: ConnEvent) {
        match event {
            ConnEvent::Established => {
                if self.active_session.is_some() && self.active_session != Some(direction) {
                    self.resolve_collision();
                    return;
                }
                self.active_session = Some(direction);
                self.status = PeerStatus::Up;
                info!("peer {} session established ({:?})", self.config.remote_ip, direction);
            }
            ConnEvent::NotificationFlushed => {
                let conn = match direction {
                    Direction::Outgoing => &self.outgoing,
                    Direction::Incoming => &self.incoming,
                };
                if let Some((code, subcode)) = conn.last_notification_sent {
                    self.store_error(direction, LastError::bgp_tx(code, subcode));
                }
                if self.active_session == Some(direction) {
                    self.active_session = None;
                    if self.status == PeerStatus::Up {
                        self.status = PeerStatus::Stop;
                        info!("peer {} session down", self.config.remote_ip);
                    }
                }
            }
            ConnEvent::Message(Message::Notification(notif)) => {
                self.store_error(
                    direction,
                    LastError::bgp_rx(notif.major_err_code, notif.minor_err_code),
                );
            }
            ConnEvent::Message(_) | ConnEvent::NoOp | ConnEvent::RetryConnect => {}
        }
    }

    /// spec §4.6 `store_error`: updates `last_error` unless the peer is
    /// already Stop (so we keep whatever error caused that), or the peer is
    /// Up and this error came from a connection other than the active
    /// session (a stale/losing connection's errors don't matter while the
    /// session is running on the other slot).
    fn store_error(&mut self, direction: Direction, error: LastError) {
        if self.status == PeerStatus::Stop {
            return;
        }
        if self.status == PeerStatus::Up && self.active_session != Some(direction) {
            return;
        }
        self.last_error = error;
    }

    /// Drives this peer to completion: runs the §4.2 start sequence, then
    /// loops driving whichever of {outgoing connection, incoming
    /// connection, inbound socket, startup timer, neighbor reachability,
    /// poll timer, decision event, shutdown signal} is ready, until
    /// `shutdown` fires. Returns `self` so the caller (the engine) can
    /// inspect final status after the task exits.
    pub async fn run(
        mut self,
        locks: Arc<dyn ObjectLock>,
        neighbors: Arc<dyn NeighborCache>,
        rib: Arc<dyn RibImporter>,
        listener: ListeningEndpoint,
        bind_addr: SocketAddr,
        md5: Arc<dyn Md5KeyStore>,
        poll_interval: u16,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        if !self.config.enabled {
            return self;
        }
        self.start(
            locks.as_ref(),
            neighbors.as_ref(),
            &listener,
            bind_addr,
            md5.as_ref(),
        )
        .await;
        if poll_interval > 0 {
            self.poll_timer.arm(poll_interval, &ThreadRngJitter);
        }

        loop {
            if *shutdown.borrow() {
                self.shutdown(2);
            }

            let jitter = ThreadRngJitter;
            let params = self.open_params();
            tokio::select! {
                event = self.outgoing.drive_once(&params, &jitter), if self.outgoing.is_attached() || self.outgoing.state != crate::connection::ConnState::Idle => {
                    match event {
                        Ok(ConnEvent::RetryConnect) => self.enter_connect(&jitter).await,
                        Ok(event) => self.process_event(Direction::Outgoing, event).await,
                        Err(err) => {
                            warn!("{} outgoing connection error: {}", self.config.remote_ip, err);
                            if let EngineError::Transport(io_err) = &err {
                                self.store_error(Direction::Outgoing, LastError::socket(io_err.raw_os_error().unwrap_or(0)));
                            }
                            self.update_startup_delay(Instant::now(), 1);
                        }
                    }
                }
                event = self.incoming.drive_once(&params, &jitter), if self.incoming.is_attached() || self.incoming.state != crate::connection::ConnState::Idle => {
                    match event {
                        Ok(ConnEvent::RetryConnect) => {}
                        Ok(event) => self.process_event(Direction::Incoming, event).await,
                        Err(err) => {
                            warn!("{} incoming connection error: {}", self.config.remote_ip, err);
                            if let EngineError::Transport(io_err) = &err {
                                self.store_error(Direction::Incoming, LastError::socket(io_err.raw_os_error().unwrap_or(0)));
                            }
                            self.update_startup_delay(Instant::now(), 1);
                        }
                    }
                }
                accepted = recv_incoming(&mut self.incoming_rx), if self.incoming.state == crate::connection::ConnState::Idle || self.incoming.state == crate::connection::ConnState::Active => {
                    if let Some(stream) = accepted {
                        match WireTransport::new(stream) {
                            Ok(transport) => self.attach_incoming(Box::new(transport)).await,
                            Err(err) => warn!("{} inbound accept failed: {}", self.config.remote_ip, err),
                        }
                    }
                }
                _ = self.startup_timer.tick(), if self.startup_timer.is_armed() => {
                    self.enter_connect(&jitter).await;
                }
                reachability = wait_for_neighbor_change(&mut self.neighbor_rx), if self.neighbor_rx.is_some() => {
                    if let Some(reachability) = reachability {
                        match reachability {
                            Reachability::Reachable if self.awaiting_neighbor => {
                                info!("peer {} next hop reachable, starting", self.config.remote_ip);
                                self.open_and_initiate(&listener, bind_addr, md5.as_ref()).await;
                            }
                            Reachability::Unreachable if matches!(self.status, PeerStatus::Start | PeerStatus::Up) => {
                                self.stop_for_neighbor_loss();
                            }
                            _ => {}
                        }
                    }
                }
                _ = self.poll_timer.tick(), if self.poll_timer.is_armed() => {
                    self.poll_timer.arm(poll_interval, &ThreadRngJitter);
                    self.decision.schedule();
                }
                _ = self.decision.wait() => {
                    self.check_route_limit(rib.as_ref(), Instant::now());
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        self.shutdown(2);
                    }
                }
            }

            if self.status == PeerStatus::Down
                && !self.awaiting_neighbor
                && self.outgoing.state == crate::connection::ConnState::Idle
                && self.incoming.state == crate::connection::ConnState::Idle
            {
                break;
            }
        }

        if self.incoming_rx.is_some() {
            if self.config.password.is_some() {
                if let Err(err) = md5.remove_key(self.config.remote_ip) {
                    warn!("peer {} failed to remove MD5 key: {}", self.config.remote_ip, err);
                }
            }
            listener.release(self.config.remote_ip).await;
        }
        self.object_lock = None;
        self
    }

    /// spec §4.2 "on shutdown requested".
    fn shutdown(&mut self, subcode: u8) {
        self.last_error = LastError::man_down();
        self.startup_delay = 0;
        self.status = PeerStatus::Down;
        self.awaiting_neighbor = false;
        if let Some(direction) = self.active_session {
            let conn = match direction {
                Direction::Outgoing => &mut self.outgoing,
                Direction::Incoming => &mut self.incoming,
            };
            conn.bgp_error(6, subcode);
        } else {
            self.outgoing.to_idle();
            self.incoming.to_idle();
        }
        self.decision.schedule();
    }

    /// Records a connection error and applies back-off (spec §4.6), unless
    /// the code is Cease (6), which is excluded from back-off accounting.
    pub fn update_startup_delay(&mut self, now: Instant, code: u8) {
        let amnesia = self.config.error_amnesia_time as u64;
        let elapsed_ok = self
            .last_proto_error
            .map(|last| now.duration_since(last).as_secs() >= amnesia)
            .unwrap_or(true);
        if elapsed_ok {
            self.startup_delay = 0;
        }
        self.last_proto_error = Some(now);
        if code == 6 {
            return;
        }
        if self.config.disable_after_error {
            self.startup_delay = 0;
            self.status = PeerStatus::Down;
            return;
        }
        self.startup_delay = if self.startup_delay == 0 {
            self.config.error_delay_time_min
        } else {
            (self.startup_delay.saturating_mul(2)).min(self.config.error_delay_time_max)
        };
    }

    /// spec §4.7: when the RIB importer reports the route count crossing
    /// `route_limit`, shuts the peer down with Notification (6, 1) and
    /// records (AutoDown, RouteLimitExceeded).
    pub fn check_route_limit(&mut self, rib: &dyn RibImporter, now: Instant) {
        let Some(limit) = self.config.route_limit else {
            return;
        };
        if rib.imported_route_count() <= limit {
            return;
        }
        self.last_error = LastError::auto_down(crate::error::AutoDownReason::RouteLimitExceeded);
        // Route-limit back-off applies even though the wire Notification
        // code is 6 (Cease) — §4.7 is an explicit exception to the usual
        // "code 6 skips back-off" rule in §4.6.
        self.update_startup_delay(now, 0);
        if let Some(direction) = self.active_session {
            let conn = match direction {
                Direction::Outgoing => &mut self.outgoing,
                Direction::Incoming => &mut self.incoming,
            };
            conn.bgp_error(6, 1);
        }
    }

    /// spec §6 `reconfigure`: "same" iff every field but the password is
    /// byte-identical and the passwords string-compare equal.
    pub fn reconfigure(&mut self, new_config: Arc<PeerConfig>) -> bool {
        let same = self.config.unchanged_except_password(&new_config);
        self.config = new_config;
        same
    }

    /// spec §6 status string.
    pub fn status_string(&self) -> String {
        let message = self.last_error.describe();
        if self.status == PeerStatus::Down {
            message
        } else {
            let state = self.highest_conn_state();
            if message.is_empty() {
                state.to_string()
            } else {
                format!("{} {}", state, message)
            }
        }
    }

    fn highest_conn_state(&self) -> crate::connection::ConnState {
        use crate::connection::ConnState::*;
        fn rank(s: crate::connection::ConnState) -> u8 {
            match s {
                Idle => 0,
                Close => 1,
                Active => 2,
                Connect => 3,
                OpenSent => 4,
                OpenConfirm => 5,
                Established => 6,
            }
        }
        if rank(self.outgoing.state) >= rank(self.incoming.state) {
            self.outgoing.state
        } else {
            self.incoming.state
        }
    }
}

async fn recv_incoming(rx: &mut Option<mpsc::UnboundedReceiver<TcpStream>>) -> Option<TcpStream> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_for_neighbor_change(
    rx: &mut Option<watch::Receiver<Reachability>>,
) -> Option<Reachability> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow()),
            Err(_) => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

impl fmt::Display for PeerInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Peer {} {}>", self.config.remote_ip, self.status_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AutoDownReason;
    use std::net::Ipv4Addr;

    fn config() -> Arc<PeerConfig> {
        Arc::new(PeerConfig {
            local_as: 65010,
            remote_as: 65020,
            remote_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            interface: None,
            source_addr: None,
            local_router_id: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            enabled: true,
            passive: false,
            hold_time: 90,
            initial_hold_time: 90,
            connect_retry_time: 120,
            keepalive_time: 30,
            dest_port: 179,
            multihop_via: None,
            multihop_ttl: 1,
            capabilities: true,
            enable_as4: true,
            enable_refresh: true,
            route_refresh: true,
            rr_client: false,
            rs_client: false,
            rr_cluster_id: None,
            password: None,
            route_limit: Some(100),
            start_delay_time: 5,
            error_amnesia_time: 300,
            error_delay_time_min: 60,
            error_delay_time_max: 300,
            disable_after_error: false,
            missing_lladdr: crate::config::MissingLladdrPolicy::Ignore,
        })
    }

    #[test]
    fn back_off_doubles_within_amnesia_window_and_caps() {
        let mut peer = PeerInstance::new(config());
        let t0 = Instant::now();
        peer.update_startup_delay(t0, 1);
        assert_eq!(peer.startup_delay, 60);
        peer.update_startup_delay(t0, 1);
        assert_eq!(peer.startup_delay, 120);
        peer.update_startup_delay(t0, 1);
        assert_eq!(peer.startup_delay, 240);
        peer.update_startup_delay(t0, 1);
        assert_eq!(peer.startup_delay, 300, "capped at error_delay_time_max");
    }

    #[test]
    fn cease_notifications_do_not_affect_back_off() {
        let mut peer = PeerInstance::new(config());
        peer.update_startup_delay(Instant::now(), 6);
        assert_eq!(peer.startup_delay, 0);
    }

    #[test]
    fn reconfigure_reports_same_when_only_password_changed() {
        let mut peer = PeerInstance::new(config());
        let mut updated = (*config()).clone();
        updated.password = Some("secret".into());
        assert!(peer.reconfigure(Arc::new(updated)));
    }

    #[test]
    fn reconfigure_reports_different_when_hold_time_changed() {
        let mut peer = PeerInstance::new(config());
        let mut updated = (*config()).clone();
        updated.hold_time = 30;
        assert!(!peer.reconfigure(Arc::new(updated)));
    }

    #[test]
    fn status_string_matches_route_limit_scenario() {
        let mut peer = PeerInstance::new(config());
        peer.last_error = LastError::auto_down(AutoDownReason::RouteLimitExceeded);
        peer.status = PeerStatus::Down;
        assert_eq!(peer.status_string(), "Automatic shutdown: Route limit exceeded");
    }
}
