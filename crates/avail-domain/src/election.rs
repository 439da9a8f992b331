//! Service-domain leader election.
//!
//! A domain leaves `initial` once one of its interfaces is enabled, waits one
//! `wait_interval` collecting hellos, then either follows a known leader or
//! holds an election over itself and every live neighbor. Only the leader
//! runs the scheduler for the domain.

use std::cmp::Reverse;
use std::time::Duration;

use avail_core::*;
use avail_msg::message::DomainHello;
use avail_msg::Payload;
use avail_state::DomainRecord;
use serde::Serialize;
use tracing::{debug, info};

use crate::context::{DomainContext, DomainTimer};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainChange {
    pub domain: String,
    pub prev_state: DomainState,
    pub state: DomainState,
    pub leader: String,
}

#[derive(Debug, Clone, Copy)]
enum Input<'m> {
    InterfaceEnabled,
    InterfaceDisabled,
    Hello(&'m DomainHello),
    NeighborAgeout(&'m str),
    WaitExpired,
    ChangingLeader,
}

impl Input<'_> {
    fn event(&self) -> DomainEvent {
        match self {
            Input::InterfaceEnabled => DomainEvent::InterfaceEnabled,
            Input::InterfaceDisabled => DomainEvent::InterfaceDisabled,
            Input::Hello(_) => DomainEvent::Hello,
            Input::NeighborAgeout(_) => DomainEvent::NeighborAgeout,
            Input::WaitExpired => DomainEvent::WaitExpired,
            Input::ChangingLeader => DomainEvent::ChangingLeader,
        }
    }
}

/// Election rank: higher generation, then higher priority, then the
/// lexicographically lower name.
/// Interval in hello wire form. Config bounds intervals to `u32`; rows
/// created elsewhere saturate instead of wrapping.
fn wire_ms(ms: u64) -> u32 {
    u32::try_from(ms).unwrap_or(u32::MAX)
}

fn rank(generation: u32, priority: u32, name: &str) -> (u32, u32, Reverse<&str>) {
    (generation, priority, Reverse(name))
}

#[derive(Debug, Default)]
pub struct DomainFsm;

impl DomainFsm {
    pub fn new() -> Self {
        Self
    }

    /// Re-evaluate interface state for `name` after a link change.
    pub fn interface_changed<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        name: &str,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        let enabled = cx
            .tables
            .domain_interfaces_of(name)
            .iter()
            .any(|i| i.state == InterfaceState::Enabled);
        let input = if enabled {
            Input::InterfaceEnabled
        } else {
            Input::InterfaceDisabled
        };
        self.handle(cx, name, input)
    }

    pub fn hello_received<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        hello: &DomainHello,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        self.handle(cx, &hello.domain, Input::Hello(hello))
    }

    pub fn neighbor_ageout<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        name: &str,
        node: &str,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        self.handle(cx, name, Input::NeighborAgeout(node))
    }

    /// Give up the current role and run the election again.
    pub fn changing_leader<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        name: &str,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        self.handle(cx, name, Input::ChangingLeader)
    }

    pub fn timer_fired<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        id: TimerId,
        tag: &DomainTimer,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        match tag {
            DomainTimer::Hello(name) => {
                let Some(domain) = cx.tables.domains.read(name) else {
                    return Ok(None);
                };
                if domain.hello_timer != Some(id) {
                    debug!(domain = %name, timer = %id, "stale hello timer");
                    return Ok(None);
                }
                self.send_hello(cx, name)?;
                Ok(None)
            }
            DomainTimer::Wait(name) => {
                let Some(domain) = cx.tables.domains.read(name) else {
                    return Ok(None);
                };
                if domain.wait_timer != Some(id) {
                    debug!(domain = %name, timer = %id, "stale wait timer");
                    return Ok(None);
                }
                cx.tables.domains.update(name, |d| d.wait_timer = None)?;
                self.handle(cx, name, Input::WaitExpired)
            }
            _ => Ok(None),
        }
    }

    pub fn send_hello<T>(&self, cx: &mut DomainContext<'_, T>, name: &str) -> AvailResult<()> {
        let domain = cx.tables.domains.get(name)?;
        let avail = cx
            .tables
            .nodes
            .read(&cx.settings.local_node)
            .map(|n| n.avail)
            .unwrap_or(AvailStatus::Unknown);
        let hello = DomainHello {
            domain: domain.name.clone(),
            node: cx.settings.local_node.clone(),
            orchestration: domain.orchestration,
            designation: domain.designation,
            generation: domain.generation,
            priority: domain.priority,
            avail,
            hello_interval_ms: wire_ms(domain.hello_interval_ms),
            dead_interval_ms: wire_ms(domain.dead_interval_ms),
            wait_interval_ms: wire_ms(domain.wait_interval_ms),
            exchange_interval_ms: wire_ms(domain.exchange_interval_ms),
            leader: domain.leader.clone(),
        };
        cx.out.send(None, Payload::DomainHello(hello));
        Ok(())
    }

    fn handle<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        name: &str,
        input: Input<'_>,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        let domain = cx.tables.domains.get(name)?.clone();
        if !domain.enabled {
            debug!(domain = %name, event = %input.event(), "domain disabled, event ignored");
            return Ok(None);
        }
        let local = cx.settings.local_node.clone();

        let next = match (domain.state, input) {
            (DomainState::Initial, Input::InterfaceDisabled) => None,
            (_, Input::InterfaceDisabled) => Some((DomainState::Initial, String::new())),
            (DomainState::Initial, Input::InterfaceEnabled) => {
                if domain.priority == 0 {
                    Some((DomainState::Other, String::new()))
                } else {
                    Some((DomainState::Waiting, String::new()))
                }
            }
            (DomainState::Waiting, Input::Hello(hello)) => {
                if !hello.leader.is_empty() && hello.leader != domain.leader {
                    debug!(domain = %name, leader = %hello.leader, from = %hello.node, "leader learned");
                    cx.tables.domains.update(name, |d| d.leader = hello.leader.clone())?;
                }
                None
            }
            (DomainState::Waiting, Input::WaitExpired) => Some(self.elect(cx, &domain)),
            (DomainState::Leader, Input::Hello(hello)) => {
                let better = rank(hello.generation, hello.priority, &hello.node)
                    > rank(domain.generation, domain.priority, &local);
                let mismatch = !hello.leader.is_empty() && hello.leader != local;
                if better || mismatch {
                    info!(domain = %name, from = %hello.node, better, mismatch, "leadership contested");
                    Some((DomainState::Waiting, String::new()))
                } else {
                    None
                }
            }
            (DomainState::Backup, Input::Hello(hello)) => {
                if hello.leader == local {
                    info!(domain = %name, from = %hello.node, "peer names us leader, re-electing");
                    Some((DomainState::Waiting, String::new()))
                } else {
                    None
                }
            }
            (DomainState::Backup, Input::NeighborAgeout(node)) if node == domain.leader => {
                info!(domain = %name, leader = %node, "leader aged out, re-electing");
                Some((DomainState::Waiting, String::new()))
            }
            (DomainState::Leader | DomainState::Backup, Input::ChangingLeader) => {
                Some((DomainState::Waiting, String::new()))
            }
            (state, input) => {
                debug!(domain = %name, %state, event = %input.event(), "no election change");
                None
            }
        };

        let Some((state, leader)) = next else {
            return Ok(None);
        };
        self.enter(cx, &domain, state, leader)
    }

    /// Follow a known, still-claiming leader unless preempting it; otherwise
    /// pick the best of ourselves and every live neighbor.
    fn elect<T>(&self, cx: &DomainContext<'_, T>, domain: &DomainRecord) -> (DomainState, String) {
        let local = cx.settings.local_node.as_str();
        let neighbors = cx.tables.domain_neighbors(&domain.name);
        let claimed = neighbors.iter().find(|n| {
            n.node == domain.leader
                && n.node != local
                && n.state != NeighborState::Down
                && n.designation == Designation::Leader
        });
        let hold = match claimed {
            None => true,
            Some(leader) => domain.preempt || domain.generation > leader.generation,
        };
        if !hold {
            return (DomainState::Backup, domain.leader.clone());
        }

        let mut best = (rank(domain.generation, domain.priority, local), local);
        for n in neighbors
            .iter()
            .filter(|n| n.state != NeighborState::Down && n.priority > 0)
        {
            let candidate = (rank(n.generation, n.priority, &n.node), n.node.as_str());
            if candidate.0 > best.0 {
                best = candidate;
            }
        }
        let winner = best.1.to_string();
        if winner == local {
            (DomainState::Leader, winner)
        } else {
            (DomainState::Backup, winner)
        }
    }

    fn enter<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        domain: &DomainRecord,
        state: DomainState,
        leader: String,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        let name = domain.name.clone();
        let mut wait_timer = domain.wait_timer;
        let mut hello_timer = domain.hello_timer;
        cx.timers.disarm_slot(&mut wait_timer);

        match state {
            DomainState::Initial => cx.timers.disarm_slot(&mut hello_timer),
            DomainState::Waiting => {
                wait_timer = Some(cx.timers.arm(
                    format!("{name}:wait"),
                    Duration::from_millis(domain.wait_interval_ms),
                    DomainTimer::Wait(name.clone()),
                )?);
            }
            _ => {}
        }
        if state != DomainState::Initial && hello_timer.is_none() {
            hello_timer = Some(cx.timers.arm_periodic(
                format!("{name}:hello"),
                Duration::from_millis(domain.hello_interval_ms),
                DomainTimer::Hello(name.clone()),
            )?);
        }

        cx.tables.domains.update(&name, |d| {
            d.state = state;
            d.designation = state.into();
            d.leader = leader.clone();
            d.wait_timer = wait_timer;
            d.hello_timer = hello_timer;
        })?;
        info!(domain = %name, from = %domain.state, to = %state, leader = %leader, "domain state change");

        if state != DomainState::Initial {
            self.send_hello(cx, &name)?;
        }
        Ok(Some(DomainChange {
            domain: name,
            prev_state: domain.state,
            state,
            leader,
        }))
    }
}
