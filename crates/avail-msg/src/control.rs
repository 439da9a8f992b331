//! Text protocols of the local control and notify sockets.
//!
//! Both are comma-delimited datagrams prefixed by a `1,1` version/revision
//! pair:
//!
//! ```text
//! 1,1,<seqno>,SET_NODE,<origin>,<node>,<action>,<admin>,<oper>,<avail>
//! 1,1,<seqno>,SET_NODE_ACK,<origin>,<node>,<action>,<admin>,<oper>,<avail>
//! 1,1,<seqno>,RESTART_SERVICE,<origin>,<service>[,skip-dep]
//! 1,1,SERVICE_EVENT,<origin>,<service>,<sync-start|sync-end>
//! ```

use std::fmt;

use avail_core::{AdminState, AvailStatus, NodeSetAction, OperState};

use crate::error::{MsgError, MsgResult};

const VERSION: &str = "1";
const REVISION: &str = "1";
const SKIP_DEP: &str = "skip-dep";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetNode {
    pub seqno: u32,
    pub origin: String,
    pub node: String,
    pub action: NodeSetAction,
    pub admin: AdminState,
    pub oper: OperState,
    pub avail: AvailStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    SetNode(SetNode),
    SetNodeAck(SetNode),
    RestartService {
        seqno: u32,
        origin: String,
        service: String,
        skip_dependents: bool,
    },
}

fn field<'a>(fields: &[&'a str], index: usize, name: &str) -> MsgResult<&'a str> {
    fields
        .get(index)
        .copied()
        .filter(|f| !f.is_empty())
        .ok_or_else(|| MsgError::BadText(format!("missing {name}")))
}

fn parse_enum<T: std::str::FromStr>(value: &str, name: &str) -> MsgResult<T> {
    value
        .parse()
        .map_err(|_| MsgError::BadText(format!("invalid {name} '{value}'")))
}

fn check_version(fields: &[&str]) -> MsgResult<()> {
    let version = field(fields, 0, "version")?;
    let revision = field(fields, 1, "revision")?;
    if version != VERSION || revision != REVISION {
        return Err(MsgError::BadText(format!(
            "unsupported version {version}.{revision}"
        )));
    }
    Ok(())
}

impl ControlRequest {
    pub fn parse(text: &str) -> MsgResult<Self> {
        let fields: Vec<&str> = text.trim_end_matches(['\0', '\n']).split(',').collect();
        check_version(&fields)?;
        let seqno: u32 = field(&fields, 2, "seqno")?
            .parse()
            .map_err(|_| MsgError::BadText("invalid seqno".into()))?;
        let kind = field(&fields, 3, "type")?;
        let origin = field(&fields, 4, "origin")?.to_string();

        match kind {
            "SET_NODE" | "SET_NODE_ACK" => {
                let set = SetNode {
                    seqno,
                    origin,
                    node: field(&fields, 5, "node")?.to_string(),
                    action: parse_enum(field(&fields, 6, "action")?, "action")?,
                    admin: parse_enum(field(&fields, 7, "admin")?, "admin")?,
                    oper: parse_enum(field(&fields, 8, "oper")?, "oper")?,
                    avail: parse_enum(field(&fields, 9, "avail")?, "avail")?,
                };
                Ok(if kind == "SET_NODE" {
                    ControlRequest::SetNode(set)
                } else {
                    ControlRequest::SetNodeAck(set)
                })
            }
            "RESTART_SERVICE" => Ok(ControlRequest::RestartService {
                seqno,
                origin,
                service: field(&fields, 5, "service")?.to_string(),
                skip_dependents: fields.get(6).is_some_and(|p| *p == SKIP_DEP),
            }),
            other => Err(MsgError::BadText(format!("unknown request '{other}'"))),
        }
    }

    /// The acknowledgement a daemon sends back for a SET_NODE.
    pub fn ack(set: &SetNode) -> Self {
        ControlRequest::SetNodeAck(set.clone())
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlRequest::SetNode(s) | ControlRequest::SetNodeAck(s) => {
                let kind = if matches!(self, ControlRequest::SetNode(_)) {
                    "SET_NODE"
                } else {
                    "SET_NODE_ACK"
                };
                write!(
                    f,
                    "{VERSION},{REVISION},{},{kind},{},{},{},{},{},{}",
                    s.seqno, s.origin, s.node, s.action, s.admin, s.oper, s.avail
                )
            }
            ControlRequest::RestartService {
                seqno,
                origin,
                service,
                skip_dependents,
            } => {
                write!(f, "{VERSION},{REVISION},{seqno},RESTART_SERVICE,{origin},{service}")?;
                if *skip_dependents {
                    write!(f, ",{SKIP_DEP}")?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    SyncStart,
    SyncEnd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyEvent {
    pub origin: String,
    pub service: String,
    pub event: SyncEvent,
}

impl NotifyEvent {
    pub fn parse(text: &str) -> MsgResult<Self> {
        let fields: Vec<&str> = text.trim_end_matches(['\0', '\n']).split(',').collect();
        check_version(&fields)?;
        let kind = field(&fields, 2, "type")?;
        if kind != "SERVICE_EVENT" {
            return Err(MsgError::BadText(format!("unknown notify '{kind}'")));
        }
        let event = match field(&fields, 5, "event")? {
            "sync-start" => SyncEvent::SyncStart,
            "sync-end" => SyncEvent::SyncEnd,
            other => return Err(MsgError::BadText(format!("unknown event '{other}'"))),
        };
        Ok(Self {
            origin: field(&fields, 3, "origin")?.to_string(),
            service: field(&fields, 4, "service")?.to_string(),
            event,
        })
    }
}

impl fmt::Display for NotifyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let event = match self.event {
            SyncEvent::SyncStart => "sync-start",
            SyncEvent::SyncEnd => "sync-end",
        };
        write!(
            f,
            "{VERSION},{REVISION},SERVICE_EVENT,{},{},{event}",
            self.origin, self.service
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_node() {
        let req = ControlRequest::parse("1,1,42,SET_NODE,mtce,controller-1,swact,unlocked,enabled,available")
            .unwrap();
        let ControlRequest::SetNode(set) = &req else {
            panic!("expected SET_NODE, got {req:?}");
        };
        assert_eq!(set.seqno, 42);
        assert_eq!(set.action, NodeSetAction::Swact);
        assert_eq!(set.avail, AvailStatus::Available);
        assert_eq!(
            req.to_string(),
            "1,1,42,SET_NODE,mtce,controller-1,swact,unlocked,enabled,available"
        );
    }

    #[test]
    fn ack_echoes_fields() {
        let req = ControlRequest::parse("1,1,7,SET_NODE,mtce,c0,lock,locked,disabled,none").unwrap();
        let ControlRequest::SetNode(set) = req else {
            panic!("expected SET_NODE");
        };
        assert_eq!(
            ControlRequest::ack(&set).to_string(),
            "1,1,7,SET_NODE_ACK,mtce,c0,lock,locked,disabled,none"
        );
    }

    #[test]
    fn parses_restart_service_with_skip_dep() {
        let req = ControlRequest::parse("1,1,3,RESTART_SERVICE,sm-api,haproxy,skip-dep").unwrap();
        assert_eq!(
            req,
            ControlRequest::RestartService {
                seqno: 3,
                origin: "sm-api".into(),
                service: "haproxy".into(),
                skip_dependents: true,
            }
        );
    }

    #[test]
    fn rejects_other_versions_and_bad_values() {
        assert!(ControlRequest::parse("2,0,1,SET_NODE,a,b,lock,locked,enabled,none").is_err());
        assert!(ControlRequest::parse("1,1,1,SET_NODE,a,b,explode,locked,enabled,none").is_err());
        assert!(ControlRequest::parse("1,1,1,SET_NODE,a,b").is_err());
    }

    #[test]
    fn parses_notify() {
        let ev = NotifyEvent::parse("1,1,SERVICE_EVENT,drbd,drbd-pg,sync-start\0").unwrap();
        assert_eq!(ev.service, "drbd-pg");
        assert_eq!(ev.event, SyncEvent::SyncStart);
        assert_eq!(ev.to_string(), "1,1,SERVICE_EVENT,drbd,drbd-pg,sync-start");
    }
}
