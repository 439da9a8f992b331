//! The daemon core: one owner for every table, timer and state machine.
//!
//! Transports and the reaper turn the outside world into [`EngineEvent`]s;
//! the engine handles each one to completion, routes what the layers hand
//! back to each other, and leaves datagrams to send in its outbox.
//!
//! ```text
//!  datagrams ─┐                 ┌─▶ DomainEngine ──group requests──▶ ServiceEngine
//!  heartbeats ┼─▶ Engine::handle┤        ▲                               │
//!  control    │                 │        └──────── group changes ────────┘
//!  exits ─────┘                 └─▶ FailoverEngine ──actions──▶ node state / worker
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use avail_core::alarm::{AlarmEventType, AlarmSeverity, AlarmTrend, ProbableCause};
use avail_core::*;
use avail_domain::{
    DomainChange, DomainContext, DomainEngine, DomainOutput, DomainSettings, DomainTimer, LocalGroupState, NodeChange,
};
use avail_failover::{
    comm_fault, FailoverAction, FailoverContext, FailoverEngine, FailoverSettings, FailoverTimer, StayFailedMarker,
};
use avail_msg::{
    parse_auth_key, ControlRequest, Envelope, HeartbeatMsg, MsgStats, NotifyEvent, Payload, PeerSessions,
};
use avail_service::{GroupChange, ProcessLauncher, ServiceContext, ServiceEngine, ServiceSettings, ServiceTimer};
use avail_state::Tables;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A peer whose node hellos stop for this long no longer counts as alive.
const HELLO_ALIVE_WINDOW: Duration = Duration::from_secs(3);
/// Bound on routing rounds for a single input.
const MAX_ROUTE_ROUNDS: usize = 64;

// ── Timer tags ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTag {
    Service(ServiceTimer),
    Domain(DomainTimer),
    Failover(FailoverTimer),
}

impl From<ServiceTimer> for TimerTag {
    fn from(t: ServiceTimer) -> Self {
        TimerTag::Service(t)
    }
}

impl From<DomainTimer> for TimerTag {
    fn from(t: DomainTimer) -> Self {
        TimerTag::Domain(t)
    }
}

impl From<FailoverTimer> for TimerTag {
    fn from(t: FailoverTimer) -> Self {
        TimerTag::Failover(t)
    }
}

// ── Inputs and outputs ──────────────────────────────────────────

#[derive(Debug)]
pub enum EngineEvent {
    /// Raw node/domain message received on a messaging interface.
    Datagram { interface: String, bytes: Vec<u8> },
    /// Raw heartbeat received on a messaging interface.
    Heartbeat { interface: String, bytes: Vec<u8> },
    ProcessExit { pid: u32, code: i32 },
    Control(ControlRequest),
    Notify(NotifyEvent),
    LinkChange { kind: InterfaceKind, up: bool },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// `to: None` goes to every peer.
    Peer { to: Option<String>, envelope: Envelope },
    Heartbeat(HeartbeatMsg),
    ControlReply(ControlRequest),
}

struct InterfaceKey {
    kind: InterfaceKind,
    key: Vec<u8>,
}

// ── Engine ──────────────────────────────────────────────────────

pub struct Engine {
    local: String,
    peer: Option<String>,
    instance: Uuid,
    seq: u64,

    tables: Tables,
    timers: TimerRegistry<TimerTag>,
    dispatch_budget: usize,

    services: ServiceEngine,
    domains: DomainEngine,
    failover: FailoverEngine,

    service_settings: ServiceSettings,
    domain_settings: DomainSettings,
    failover_settings: FailoverSettings,

    launcher: Arc<dyn ProcessLauncher + Send + Sync>,
    marker: Box<dyn StayFailedMarker>,
    worker: Option<WorkerThread>,
    disable_peer_command: Option<String>,
    alarms: AlarmManager,

    keys: HashMap<String, InterfaceKey>,
    sessions: PeerSessions,
    stats: MsgStats,

    domain_out: DomainOutput,
    failover_actions: Vec<FailoverAction>,
    pending_groups: Vec<GroupChange>,
    node_changes: Arc<Mutex<Vec<NodeChange>>>,
    outbox: Vec<Output>,

    last_peer_hello: Option<Instant>,
    stopped: bool,
}

impl Engine {
    pub fn new(
        config: &AvailConfig,
        tables: Tables,
        launcher: Arc<dyn ProcessLauncher + Send + Sync>,
        marker: Box<dyn StayFailedMarker>,
        alarm_sink: Arc<dyn AlarmSink>,
        worker: Option<WorkerThread>,
    ) -> AvailResult<Self> {
        let mut keys = HashMap::new();
        for iface in &config.messaging.interfaces {
            keys.insert(
                iface.name.clone(),
                InterfaceKey {
                    kind: iface.kind,
                    key: parse_auth_key(&iface.auth_key)?,
                },
            );
        }
        let mut kinds: Vec<InterfaceKind> = config.messaging.interfaces.iter().map(|i| i.kind).collect();
        kinds.sort();
        kinds.dedup();

        let failover_settings = FailoverSettings::from_config(config);
        let mut domains = DomainEngine::new();
        let node_changes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&node_changes);
        domains.nodes_mut().observers_mut().register(move |change: &NodeChange| {
            let mut queue = match sink.lock() {
                Ok(queue) => queue,
                Err(poisoned) => {
                    warn!("node change queue poisoned, recovering");
                    poisoned.into_inner()
                }
            };
            queue.push(change.clone());
        });

        Ok(Self {
            local: config.node.name.clone(),
            peer: config.node.peer.clone(),
            instance: Uuid::new_v4(),
            seq: 0,
            tables,
            timers: TimerRegistry::new(),
            dispatch_budget: config.timers.dispatch_budget.max(1),
            services: ServiceEngine::new(),
            domains,
            failover: FailoverEngine::new(&failover_settings, &kinds),
            service_settings: ServiceSettings::from_config(config),
            domain_settings: DomainSettings::from_config(config),
            failover_settings,
            launcher,
            marker,
            worker,
            disable_peer_command: config.paths.disable_peer_command.clone(),
            alarms: AlarmManager::new(alarm_sink),
            keys,
            sessions: PeerSessions::new(),
            stats: MsgStats::default(),
            domain_out: DomainOutput::default(),
            failover_actions: Vec::new(),
            pending_groups: Vec::new(),
            node_changes,
            outbox: Vec::new(),
            last_peer_hello: None,
            stopped: false,
        })
    }

    pub fn start(&mut self) -> AvailResult<()> {
        let changes = self.with_domain(|d, cx| d.start(cx))?;
        log_domain_changes(&changes);
        self.with_failover(|f, cx| f.start(cx))?;
        info!(node = %self.local, instance = %self.instance, "engine started");
        self.route()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn stats(&self) -> &MsgStats {
        &self.stats
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Move the timer clock to wall time before handling an input.
    pub fn set_clock(&mut self, now: Instant) {
        self.timers.set_now(now);
    }

    pub fn take_outbox(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outbox)
    }

    // ── Event handling ────────────────────────────────────────────

    pub fn handle(&mut self, event: EngineEvent) -> AvailResult<()> {
        if self.stopped {
            debug!(?event, "engine stopped, event dropped");
            return Ok(());
        }
        let result = match event {
            EngineEvent::Datagram { interface, bytes } => self.datagram(&interface, &bytes),
            EngineEvent::Heartbeat { interface, bytes } => self.heartbeat(&interface, &bytes),
            EngineEvent::ProcessExit { pid, code } => self.with_services(|s, cx| s.process_exit(cx, pid, code)),
            EngineEvent::Control(request) => self.control(request),
            EngineEvent::Notify(notify) => {
                debug!(service = %notify.service, origin = %notify.origin, event = ?notify.event, "service notify");
                self.with_services(|s, cx| s.sync_event(cx, &notify.service, notify.event))
            }
            EngineEvent::LinkChange { kind, up } => self.link_changed(kind, up),
            EngineEvent::Shutdown => self.shutdown(),
        };
        let routed = self.route();
        result.and(routed)
    }

    /// Fire due timers, at most the configured budget. Returns how many
    /// fired.
    pub fn dispatch_timers(&mut self, now: Instant) -> AvailResult<usize> {
        self.timers.set_now(now);
        let mut fired = 0;
        while fired < self.dispatch_budget {
            let Some((id, tag)) = self.timers.pop_due() else {
                break;
            };
            fired += 1;
            let result = match &tag {
                TimerTag::Service(t) => self.with_services(|s, cx| s.timer_fired(cx, id, t)),
                TimerTag::Domain(t) => self
                    .with_domain(|d, cx| d.timer_fired(cx, id, t))
                    .map(|changes| log_domain_changes(&changes))
                    .and_then(|()| self.check_peer_hello(t)),
                TimerTag::Failover(t) => self.with_failover(|f, cx| f.timer_fired(cx, id, t)),
            };
            if let Err(e) = result {
                error!(timer = %id, ?tag, error = %e, "timer callback failed");
            }
            self.route()?;
        }
        Ok(fired)
    }

    fn datagram(&mut self, interface: &str, bytes: &[u8]) -> AvailResult<()> {
        let key = self
            .keys
            .get(interface)
            .ok_or_else(|| AvailError::not_found(format!("messaging interface '{interface}'")))?;
        let envelope = match avail_msg::decode(bytes, &key.key) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.stats.record_decode_error(&e);
                debug!(%interface, error = %e, "message dropped");
                return Ok(());
            }
        };
        self.message(envelope)
    }

    fn message(&mut self, envelope: Envelope) -> AvailResult<()> {
        if envelope.node_name == self.local {
            return Ok(());
        }
        let msg_type = envelope.msg_type();
        let verdict = self
            .sessions
            .accept(&envelope.node_name, envelope.instance, envelope.seq, msg_type.is_hello());
        self.stats.record_verdict(verdict);
        if !verdict.accepted() {
            debug!(from = %envelope.node_name, msg = msg_type.as_str(), ?verdict, "message rejected by session");
            return Ok(());
        }
        self.stats.record_rx(msg_type);

        if matches!(envelope.payload, Payload::NodeHello(_)) {
            self.last_peer_hello = Some(self.timers.now());
            self.with_failover(|f, cx| f.set_hello_alive(cx, true))?;
        }
        let from = envelope.node_name.clone();
        let changes = self.with_domain(|d, cx| d.message(cx, &from, &envelope.payload))?;
        log_domain_changes(&changes);
        Ok(())
    }

    fn heartbeat(&mut self, interface: &str, bytes: &[u8]) -> AvailResult<()> {
        let key = self
            .keys
            .get(interface)
            .ok_or_else(|| AvailError::not_found(format!("messaging interface '{interface}'")))?;
        let kind = key.kind;
        let msg = match HeartbeatMsg::decode(bytes, &key.key) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.record_decode_error(&e);
                debug!(%interface, error = %e, "heartbeat dropped");
                return Ok(());
            }
        };
        if msg.node_name == self.local {
            return Ok(());
        }
        self.with_failover(|f, cx| f.heartbeat_received(cx, kind, &msg))
    }

    fn control(&mut self, request: ControlRequest) -> AvailResult<()> {
        match request {
            ControlRequest::SetNode(set) => {
                info!(
                    node = %set.node, action = %set.action, admin = %set.admin,
                    oper = %set.oper, avail = %set.avail, origin = %set.origin,
                    "set node"
                );
                let change = self.with_domain(|d, cx| d.set_node(cx, &set.node, set.action, set.admin, set.oper, set.avail))?;
                if change.is_none() {
                    debug!(node = %set.node, "set node left the node unchanged");
                }
                self.outbox.push(Output::ControlReply(ControlRequest::ack(&set)));
                Ok(())
            }
            ControlRequest::SetNodeAck(set) => {
                debug!(node = %set.node, seqno = set.seqno, "stray set node ack ignored");
                Ok(())
            }
            ControlRequest::RestartService {
                service,
                skip_dependents,
                origin,
                ..
            } => {
                info!(%service, skip_dependents, %origin, "restart service");
                self.with_services(|s, cx| s.restart_service(cx, &service, skip_dependents))
            }
        }
    }

    fn link_changed(&mut self, kind: InterfaceKind, up: bool) -> AvailResult<()> {
        let state = if up {
            InterfaceState::Enabled
        } else {
            InterfaceState::Disabled
        };
        info!(interface = %kind, up, "link change");

        let mut affected = Vec::new();
        for key in self.tables.domain_interfaces.keys() {
            let Some(row) = self.tables.domain_interfaces.read(&key) else {
                continue;
            };
            if row.kind != kind {
                continue;
            }
            let domain = row.domain.clone();
            if self.tables.domain_interfaces.update(&key, |r| r.state = state)? {
                affected.push(domain);
            }
        }
        affected.sort();
        affected.dedup();
        for domain in affected {
            let change = self.with_domain(|d, cx| d.interface_changed(cx, &domain))?;
            log_domain_changes(change.as_slice());
        }

        if up {
            self.alarms.clear(AlarmId::InterfaceDown, kind.as_str());
        } else {
            self.alarms.raise(Alarm {
                id: AlarmId::InterfaceDown,
                entity: kind.as_str().to_string(),
                event_type: AlarmEventType::Communication,
                probable_cause: ProbableCause::CommunicationSubsystemFailure,
                severity: AlarmSeverity::Major,
                trend: AlarmTrend::More,
                text: format!("{kind} interface down"),
            })?;
        }
        self.with_failover(|f, cx| f.link_changed(cx, kind, up))
    }

    fn shutdown(&mut self) -> AvailResult<()> {
        info!("engine shutting down");
        let result = self.with_services(|s, cx| s.shutdown(cx));
        self.services.clear_observers();
        self.domains.nodes_mut().observers_mut().clear();
        if let Some(mut worker) = self.worker.take() {
            worker.shutdown();
        }
        self.stopped = true;
        result
    }

    /// Runs on the node hello tick: clears the hello-alive flag once the
    /// peer has been quiet too long.
    fn check_peer_hello(&mut self, tag: &DomainTimer) -> AvailResult<()> {
        if *tag != DomainTimer::NodeHello {
            return Ok(());
        }
        let now = self.timers.now();
        let stale = self
            .last_peer_hello
            .is_none_or(|at| now.saturating_duration_since(at) >= HELLO_ALIVE_WINDOW);
        if stale {
            self.with_failover(|f, cx| f.set_hello_alive(cx, false))?;
        }
        Ok(())
    }

    // ── Layer contexts ────────────────────────────────────────────

    fn with_services<F>(&mut self, f: F) -> AvailResult<()>
    where
        F: FnOnce(&mut ServiceEngine, &mut ServiceContext<'_, TimerTag>) -> AvailResult<Vec<GroupChange>>,
    {
        let mut cx = ServiceContext::new(
            &mut self.tables,
            &mut self.timers,
            self.launcher.as_ref(),
            &self.service_settings,
        );
        let changes = f(&mut self.services, &mut cx)?;
        self.pending_groups.extend(changes);
        Ok(())
    }

    fn with_domain<R, F>(&mut self, f: F) -> AvailResult<R>
    where
        F: FnOnce(&mut DomainEngine, &mut DomainContext<'_, TimerTag>) -> AvailResult<R>,
    {
        let mut cx = DomainContext::new(&mut self.tables, &mut self.timers, &self.domain_settings, &mut self.domain_out);
        f(&mut self.domains, &mut cx)
    }

    fn with_failover<R, F>(&mut self, f: F) -> AvailResult<R>
    where
        F: FnOnce(&mut FailoverEngine, &mut FailoverContext<'_, TimerTag>) -> AvailResult<R>,
    {
        let host = self.schedule_state_of(Some(&self.local));
        let peer = self.schedule_state_of(self.peer.as_deref());
        self.failover.set_schedule_states(host, peer);
        let mut cx = FailoverContext::new(
            &mut self.timers,
            self.marker.as_mut(),
            &self.failover_settings,
            &mut self.failover_actions,
        );
        f(&mut self.failover, &mut cx)
    }

    fn schedule_state_of(&self, node: Option<&str>) -> NodeScheduleState {
        node.and_then(|n| self.tables.nodes.read(n))
            .map(|n| n.schedule_state)
            .unwrap_or(NodeScheduleState::Unknown)
    }

    // ── Routing ───────────────────────────────────────────────────

    /// Hand every layer's output to its consumer until nothing is left.
    fn route(&mut self) -> AvailResult<()> {
        for _ in 0..MAX_ROUTE_ROUNDS {
            for action in std::mem::take(&mut self.failover_actions) {
                if let Err(e) = self.apply_failover_action(&action) {
                    error!(?action, error = %e, "failover action failed");
                }
            }

            for change in std::mem::take(&mut self.pending_groups) {
                self.group_changed(change)?;
            }

            let out = self.domain_out.take();
            for msg in out.messages {
                self.queue_peer(msg.to, msg.payload);
            }
            for request in out.group_requests {
                info!(domain = %request.domain, group = %request.group, action = %request.action, "group request");
                let result = self.with_services(|s, cx| s.group_action(cx, &request.group, request.action));
                if let Err(e) = result {
                    warn!(group = %request.group, error = %e, "group request failed");
                }
            }

            for change in drain_node_changes(&self.node_changes) {
                self.node_changed(&change)?;
            }

            if self.failover_actions.is_empty() && self.pending_groups.is_empty() && self.domain_out.is_empty() {
                return Ok(());
            }
        }
        warn!(rounds = MAX_ROUTE_ROUNDS, "routing did not settle");
        Ok(())
    }

    fn queue_peer(&mut self, to: Option<String>, payload: Payload) {
        self.seq += 1;
        let envelope = Envelope::new(self.instance, self.seq, &self.local, payload);
        self.stats.record_tx(envelope.msg_type());
        self.outbox.push(Output::Peer { to, envelope });
    }

    fn group_changed(&mut self, change: GroupChange) -> AvailResult<()> {
        let reason_text = self
            .tables
            .service_groups
            .read(&change.group)
            .map(|g| g.reason_text.clone())
            .unwrap_or_default();
        let state = LocalGroupState {
            group: change.group.clone(),
            state: change.state,
            status: change.status,
            condition: change.condition,
            health: change.health,
            reason_text,
        };
        let pushed = self.with_domain(|d, cx| d.local_group_changed(cx, &state))?;
        debug!(group = %change.group, state = %change.state, status = %change.status, pushed, "group change routed");

        if change.status == GroupStatus::Failed {
            self.alarms.raise(Alarm {
                id: AlarmId::ServiceGroupState,
                entity: change.group.clone(),
                event_type: AlarmEventType::ProcessingError,
                probable_cause: ProbableCause::UnderlyingResourceUnavailable,
                severity: AlarmSeverity::Critical,
                trend: AlarmTrend::More,
                text: format!("service group {} failed: {}", change.group, state.reason_text),
            })?;
        } else {
            self.alarms.clear(AlarmId::ServiceGroupState, &change.group);
        }
        if change.reboot_requested {
            error!(group = %change.group, "fatal group failure requests a node reboot");
        }
        Ok(())
    }

    fn node_changed(&mut self, change: &NodeChange) -> AvailResult<()> {
        debug!(node = %change.node, admin = %change.admin, oper = %change.oper, avail = %change.avail, "node change");
        let enabled = change.oper == OperState::Enabled
            && matches!(change.avail, AvailStatus::Available | AvailStatus::Degraded);
        if enabled && self.peer.as_deref() == Some(change.node.as_str()) {
            self.with_failover(|f, cx| f.node_enabled(cx))?;
        }
        Ok(())
    }

    fn node_event(&mut self, node: &str, oper: OperState, avail: AvailStatus) -> AvailResult<()> {
        let (admin, cur_oper, cur_avail) = {
            let row = self.tables.nodes.get(node)?;
            (row.admin, row.oper, row.avail)
        };
        if cur_oper == oper && cur_avail == avail {
            return Ok(());
        }
        self.with_domain(|d, cx| d.set_node(cx, node, NodeSetAction::Event, admin, oper, avail))?;
        Ok(())
    }

    fn apply_failover_action(&mut self, action: &FailoverAction) -> AvailResult<()> {
        debug!(?action, "failover action");
        match action {
            FailoverAction::ActivateHost => {
                if let Some(peer) = self.peer.clone() {
                    let (admin, oper, avail) = {
                        let row = self.tables.nodes.get(&peer)?;
                        (row.admin, row.oper, row.avail)
                    };
                    self.with_domain(|d, cx| d.set_node(cx, &peer, NodeSetAction::SwactForce, admin, oper, avail))?;
                }
                self.with_domain(|d, cx| d.run_scheduler(cx))?;
            }
            FailoverAction::DisablePeer => {
                let Some(peer) = self.peer.clone() else {
                    debug!("no peer to disable");
                    return Ok(());
                };
                self.node_event(&peer, OperState::Disabled, AvailStatus::Failed)?;
                self.disable_peer_externally(&peer)?;
            }
            FailoverAction::DisableHost => {
                let local = self.local.clone();
                self.node_event(&local, OperState::Disabled, AvailStatus::Failed)?;
            }
            FailoverAction::SwactToPeer => {
                let local = self.local.clone();
                let (admin, oper, avail) = {
                    let row = self.tables.nodes.get(&local)?;
                    (row.admin, row.oper, row.avail)
                };
                self.with_domain(|d, cx| d.set_node(cx, &local, NodeSetAction::Swact, admin, oper, avail))?;
            }
            FailoverAction::SetDegraded(flags) => {
                let local = self.local.clone();
                let row = self.tables.nodes.get(&local)?;
                if row.oper == OperState::Enabled && row.avail != AvailStatus::Failed {
                    let avail = if flags & comm_fault::INTERFACE_MASK != 0 {
                        AvailStatus::Degraded
                    } else {
                        AvailStatus::Available
                    };
                    self.node_event(&local, OperState::Enabled, avail)?;
                }
            }
            FailoverAction::QueryClusterInfo => {
                log_not_implemented("cluster-info-query");
                debug!("no cluster view of the peer available");
            }
            FailoverAction::SendHeartbeat { if_state } => {
                self.outbox
                    .push(Output::Heartbeat(HeartbeatMsg::alive(&self.local, *if_state)));
            }
            FailoverAction::RaiseAlarm { reason } => {
                self.alarms.raise(Alarm {
                    id: AlarmId::NodeFailover,
                    entity: self.local.clone(),
                    event_type: AlarmEventType::Communication,
                    probable_cause: ProbableCause::CommunicationSubsystemFailure,
                    severity: AlarmSeverity::Critical,
                    trend: AlarmTrend::More,
                    text: reason.clone(),
                })?;
            }
            FailoverAction::ClearAlarm => self.alarms.clear(AlarmId::NodeFailover, &self.local),
        }
        Ok(())
    }

    fn disable_peer_externally(&self, peer: &str) -> AvailResult<()> {
        let (Some(command), Some(worker)) = (self.disable_peer_command.clone(), self.worker.as_ref()) else {
            return Ok(());
        };
        let peer = peer.to_string();
        worker.enqueue_priority(move || {
            match std::process::Command::new(&command).arg(&peer).status() {
                Ok(status) if status.success() => info!(%peer, %command, "peer disabled"),
                Ok(status) => warn!(%peer, %command, code = ?status.code(), "disable peer command failed"),
                Err(e) => error!(%peer, %command, error = %e, "disable peer command did not run"),
            }
        })
    }
}

fn log_domain_changes(changes: &[DomainChange]) {
    for change in changes {
        info!(
            domain = %change.domain,
            from = %change.prev_state,
            to = %change.state,
            leader = %change.leader,
            "service domain state change"
        );
    }
}

/// Take every queued node change, recovering the queue if an observer
/// panicked while holding it.
fn drain_node_changes(queue: &Mutex<Vec<NodeChange>>) -> Vec<NodeChange> {
    let mut guard = match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("node change queue poisoned, recovering queued changes");
            poisoned.into_inner()
        }
    };
    std::mem::take(&mut *guard)
}
