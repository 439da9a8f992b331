//! Node and service-domain messages: header, payloads, encode and decode.
//!
//! Every message starts with the common header:
//!
//! ```text
//! version u16 | revision u16 | max_supported_version u16 | max_supported_revision u16
//! msg_len u16 | msg_type u16 | flags u64 | instance uuid[16] | seq u64
//! node_name [32] | auth_type u32 | auth_vector [64]
//! ```
//!
//! The auth vector is an HMAC-SHA512 over the whole encoded message with
//! the vector itself zeroed.

use avail_core::*;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use uuid::Uuid;

use crate::codec::{Reader, Writer};
use crate::error::{MsgError, MsgResult};

type HmacSha512 = Hmac<Sha512>;

pub const MSG_VERSION: u16 = 1;
pub const MSG_REVISION: u16 = 1;
pub const MSG_FLAG_ACK: u64 = 0x1;
pub const MSG_MAX_SIZE: usize = 1024;
pub const NAME_LEN: usize = NODE_NAME_MAX;
pub const REASON_LEN: usize = 128;
pub const AUTH_VECTOR_LEN: usize = 64;

pub const HEADER_LEN: usize = 2 * 6 + 8 + 16 + 8 + NAME_LEN + 4 + AUTH_VECTOR_LEN;
const MSG_LEN_OFFSET: usize = 8;
const AUTH_VECTOR_OFFSET: usize = HEADER_LEN - AUTH_VECTOR_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    NodeHello = 1,
    NodeUpdate = 2,
    NodeSwact = 3,
    NodeSwactAck = 4,
    DomainHello = 5,
    DomainPause = 6,
    DomainExchangeStart = 7,
    DomainExchange = 8,
    DomainMemberRequest = 9,
    DomainMemberUpdate = 10,
}

impl MsgType {
    pub const ALL: [MsgType; 10] = [
        MsgType::NodeHello,
        MsgType::NodeUpdate,
        MsgType::NodeSwact,
        MsgType::NodeSwactAck,
        MsgType::DomainHello,
        MsgType::DomainPause,
        MsgType::DomainExchangeStart,
        MsgType::DomainExchange,
        MsgType::DomainMemberRequest,
        MsgType::DomainMemberUpdate,
    ];

    pub fn from_u16(v: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| *t as u16 == v)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::NodeHello => "node-hello",
            MsgType::NodeUpdate => "node-update",
            MsgType::NodeSwact => "node-swact",
            MsgType::NodeSwactAck => "node-swact-ack",
            MsgType::DomainHello => "service-domain-hello",
            MsgType::DomainPause => "service-domain-pause",
            MsgType::DomainExchangeStart => "service-domain-exchange-start",
            MsgType::DomainExchange => "service-domain-exchange",
            MsgType::DomainMemberRequest => "service-domain-member-request",
            MsgType::DomainMemberUpdate => "service-domain-member-update",
        }
    }

    /// Hellos are the only messages that may (re)establish a peer session.
    pub fn is_hello(&self) -> bool {
        matches!(self, MsgType::NodeHello | MsgType::DomainHello)
    }
}

// ── Payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct NodeHello {
    pub node_name: String,
    pub admin: AdminState,
    pub oper: OperState,
    pub avail: AvailStatus,
    pub ready: ReadyState,
    pub state_uuid: Uuid,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub node_name: String,
    pub admin: AdminState,
    pub oper: OperState,
    pub avail: AvailStatus,
    pub ready: ReadyState,
    pub old_state_uuid: Uuid,
    pub state_uuid: Uuid,
    pub uptime_secs: u64,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeSwact {
    pub request_id: u64,
    pub node_name: String,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainHello {
    pub domain: String,
    pub node: String,
    pub orchestration: Orchestration,
    pub designation: Designation,
    pub generation: u32,
    pub priority: u32,
    pub avail: AvailStatus,
    pub hello_interval_ms: u32,
    pub dead_interval_ms: u32,
    pub wait_interval_ms: u32,
    pub exchange_interval_ms: u32,
    pub leader: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DomainPause {
    pub domain: String,
    pub node: String,
    pub pause_interval_ms: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeStart {
    pub domain: String,
    pub node: String,
    pub exchange_node: String,
    pub exchange_seq: u32,
}

/// One paginated assignment record. An empty `member_name` carries no
/// record (used for the final message when nothing remains to send).
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub domain: String,
    pub node: String,
    pub exchange_node: String,
    pub exchange_seq: u32,
    pub member_id: i64,
    pub member_name: String,
    pub desired_state: GroupState,
    pub state: GroupState,
    pub status: GroupStatus,
    pub condition: GroupCondition,
    pub health: i64,
    pub reason_text: String,
    pub more_members: bool,
    pub last_received_member_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberRequest {
    pub domain: String,
    pub node: String,
    pub member_node: String,
    pub member_id: i64,
    pub member_name: String,
    pub action: GroupAction,
    pub action_flags: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberUpdate {
    pub domain: String,
    pub node: String,
    pub member_node: String,
    pub member_id: i64,
    pub member_name: String,
    pub desired_state: GroupState,
    pub state: GroupState,
    pub status: GroupStatus,
    pub condition: GroupCondition,
    pub health: i64,
    pub reason_text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    NodeHello(NodeHello),
    NodeUpdate(NodeUpdate),
    NodeSwact(NodeSwact),
    NodeSwactAck(NodeSwact),
    DomainHello(DomainHello),
    DomainPause(DomainPause),
    ExchangeStart(ExchangeStart),
    Exchange(Exchange),
    MemberRequest(MemberRequest),
    MemberUpdate(MemberUpdate),
}

impl Payload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Payload::NodeHello(_) => MsgType::NodeHello,
            Payload::NodeUpdate(_) => MsgType::NodeUpdate,
            Payload::NodeSwact(_) => MsgType::NodeSwact,
            Payload::NodeSwactAck(_) => MsgType::NodeSwactAck,
            Payload::DomainHello(_) => MsgType::DomainHello,
            Payload::DomainPause(_) => MsgType::DomainPause,
            Payload::ExchangeStart(_) => MsgType::DomainExchangeStart,
            Payload::Exchange(_) => MsgType::DomainExchange,
            Payload::MemberRequest(_) => MsgType::DomainMemberRequest,
            Payload::MemberUpdate(_) => MsgType::DomainMemberUpdate,
        }
    }
}

/// A decoded message: the header fields callers care about plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: u16,
    pub revision: u16,
    pub flags: u64,
    pub instance: Uuid,
    pub seq: u64,
    pub node_name: String,
    pub auth_type: AuthType,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(instance: Uuid, seq: u64, node_name: impl Into<String>, payload: Payload) -> Self {
        Self {
            version: MSG_VERSION,
            revision: MSG_REVISION,
            flags: 0,
            instance,
            seq,
            node_name: node_name.into(),
            auth_type: AuthType::HmacSha512,
            payload,
        }
    }

    pub fn msg_type(&self) -> MsgType {
        self.payload.msg_type()
    }
}

// ── Encode ────────────────────────────────────────────────────────

fn write_payload(w: &mut Writer, payload: &Payload) -> MsgResult<()> {
    match payload {
        Payload::NodeHello(p) => {
            w.fixed_str("node_name", &p.node_name, NAME_LEN)?;
            w.u32(p.admin.code());
            w.u32(p.oper.code());
            w.u32(p.avail.code());
            w.u32(p.ready.code());
            w.uuid(&p.state_uuid);
            w.u64(p.uptime_secs);
        }
        Payload::NodeUpdate(p) => {
            w.fixed_str("node_name", &p.node_name, NAME_LEN)?;
            w.u32(p.admin.code());
            w.u32(p.oper.code());
            w.u32(p.avail.code());
            w.u32(p.ready.code());
            w.uuid(&p.old_state_uuid);
            w.uuid(&p.state_uuid);
            w.u64(p.uptime_secs);
            w.bool(p.force);
        }
        Payload::NodeSwact(p) | Payload::NodeSwactAck(p) => {
            w.u64(p.request_id);
            w.fixed_str("node_name", &p.node_name, NAME_LEN)?;
            w.bool(p.force);
        }
        Payload::DomainHello(p) => {
            w.fixed_str("domain", &p.domain, NAME_LEN)?;
            w.fixed_str("node", &p.node, NAME_LEN)?;
            w.u32(p.orchestration.code());
            w.u32(p.designation.code());
            w.u32(p.generation);
            w.u32(p.priority);
            w.u32(p.avail.code());
            w.u32(p.hello_interval_ms);
            w.u32(p.dead_interval_ms);
            w.u32(p.wait_interval_ms);
            w.u32(p.exchange_interval_ms);
            w.fixed_str("leader", &p.leader, NAME_LEN)?;
        }
        Payload::DomainPause(p) => {
            w.fixed_str("domain", &p.domain, NAME_LEN)?;
            w.fixed_str("node", &p.node, NAME_LEN)?;
            w.u32(p.pause_interval_ms);
        }
        Payload::ExchangeStart(p) => {
            w.fixed_str("domain", &p.domain, NAME_LEN)?;
            w.fixed_str("node", &p.node, NAME_LEN)?;
            w.fixed_str("exchange_node", &p.exchange_node, NAME_LEN)?;
            w.u32(p.exchange_seq);
        }
        Payload::Exchange(p) => {
            w.fixed_str("domain", &p.domain, NAME_LEN)?;
            w.fixed_str("node", &p.node, NAME_LEN)?;
            w.fixed_str("exchange_node", &p.exchange_node, NAME_LEN)?;
            w.u32(p.exchange_seq);
            w.i64(p.member_id);
            w.fixed_str("member_name", &p.member_name, NAME_LEN)?;
            w.u32(p.desired_state.code());
            w.u32(p.state.code());
            w.u32(p.status.code());
            w.u32(p.condition.code());
            w.i64(p.health);
            w.fixed_str("reason_text", &p.reason_text, REASON_LEN)?;
            w.bool(p.more_members);
            w.i64(p.last_received_member_id);
        }
        Payload::MemberRequest(p) => {
            w.fixed_str("domain", &p.domain, NAME_LEN)?;
            w.fixed_str("node", &p.node, NAME_LEN)?;
            w.fixed_str("member_node", &p.member_node, NAME_LEN)?;
            w.i64(p.member_id);
            w.fixed_str("member_name", &p.member_name, NAME_LEN)?;
            w.u32(p.action.code());
            w.u64(p.action_flags);
        }
        Payload::MemberUpdate(p) => {
            w.fixed_str("domain", &p.domain, NAME_LEN)?;
            w.fixed_str("node", &p.node, NAME_LEN)?;
            w.fixed_str("member_node", &p.member_node, NAME_LEN)?;
            w.i64(p.member_id);
            w.fixed_str("member_name", &p.member_name, NAME_LEN)?;
            w.u32(p.desired_state.code());
            w.u32(p.state.code());
            w.u32(p.status.code());
            w.u32(p.condition.code());
            w.i64(p.health);
            w.fixed_str("reason_text", &p.reason_text, REASON_LEN)?;
        }
    }
    Ok(())
}

/// Compute the auth vector over `message` (whose vector must be zeroed).
pub fn auth_vector(key: &[u8], message: &[u8]) -> [u8; AUTH_VECTOR_LEN] {
    let mut out = [0u8; AUTH_VECTOR_LEN];
    // Hmac accepts keys of any length, so this cannot fail.
    if let Ok(mut mac) = <HmacSha512 as Mac>::new_from_slice(key) {
        mac.update(message);
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

/// Decode a configured shared key. `hex:` prefixed keys are hex-decoded,
/// anything else is used as raw bytes.
pub fn parse_auth_key(text: &str) -> MsgResult<Vec<u8>> {
    match text.strip_prefix("hex:") {
        Some(encoded) => {
            hex::decode(encoded).map_err(|e| MsgError::BadText(format!("auth key: {e}")))
        }
        None => Ok(text.as_bytes().to_vec()),
    }
}

/// Constant-time check of a received auth vector.
pub(crate) fn verify_auth(key: &[u8], message: &[u8], vector: &[u8]) -> bool {
    match <HmacSha512 as Mac>::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(message);
            mac.verify_slice(vector).is_ok()
        }
        Err(_) => false,
    }
}

pub fn encode(envelope: &Envelope, key: &[u8]) -> MsgResult<Vec<u8>> {
    let mut w = Writer::with_capacity(MSG_MAX_SIZE);
    w.u16(envelope.version);
    w.u16(envelope.revision);
    w.u16(MSG_VERSION);
    w.u16(MSG_REVISION);
    w.u16(0); // msg_len, patched below
    w.u16(envelope.msg_type() as u16);
    w.u64(envelope.flags);
    w.uuid(&envelope.instance);
    w.u64(envelope.seq);
    w.fixed_str("node_name", &envelope.node_name, NAME_LEN)?;
    w.u32(envelope.auth_type.code());
    w.zeros(AUTH_VECTOR_LEN);
    write_payload(&mut w, &envelope.payload)?;

    let len = w.len();
    if len > MSG_MAX_SIZE {
        return Err(MsgError::TooLarge(len));
    }
    w.set_u16_at(MSG_LEN_OFFSET, len as u16);
    if envelope.auth_type == AuthType::HmacSha512 {
        let vector = auth_vector(key, w.as_slice());
        w.set_slice_at(AUTH_VECTOR_OFFSET, &vector);
    }
    Ok(w.into_vec())
}

// ── Decode ────────────────────────────────────────────────────────

fn read_payload(r: &mut Reader<'_>, msg_type: MsgType) -> MsgResult<Payload> {
    let payload = match msg_type {
        MsgType::NodeHello => Payload::NodeHello(NodeHello {
            node_name: r.fixed_str(NAME_LEN)?,
            admin: r.code("admin", AdminState::from_code)?,
            oper: r.code("oper", OperState::from_code)?,
            avail: r.code("avail", AvailStatus::from_code)?,
            ready: r.code("ready", ReadyState::from_code)?,
            state_uuid: r.uuid()?,
            uptime_secs: r.u64()?,
        }),
        MsgType::NodeUpdate => Payload::NodeUpdate(NodeUpdate {
            node_name: r.fixed_str(NAME_LEN)?,
            admin: r.code("admin", AdminState::from_code)?,
            oper: r.code("oper", OperState::from_code)?,
            avail: r.code("avail", AvailStatus::from_code)?,
            ready: r.code("ready", ReadyState::from_code)?,
            old_state_uuid: r.uuid()?,
            state_uuid: r.uuid()?,
            uptime_secs: r.u64()?,
            force: r.bool()?,
        }),
        MsgType::NodeSwact | MsgType::NodeSwactAck => {
            let swact = NodeSwact {
                request_id: r.u64()?,
                node_name: r.fixed_str(NAME_LEN)?,
                force: r.bool()?,
            };
            if msg_type == MsgType::NodeSwact {
                Payload::NodeSwact(swact)
            } else {
                Payload::NodeSwactAck(swact)
            }
        }
        MsgType::DomainHello => Payload::DomainHello(DomainHello {
            domain: r.fixed_str(NAME_LEN)?,
            node: r.fixed_str(NAME_LEN)?,
            orchestration: r.code("orchestration", Orchestration::from_code)?,
            designation: r.code("designation", Designation::from_code)?,
            generation: r.u32()?,
            priority: r.u32()?,
            avail: r.code("avail", AvailStatus::from_code)?,
            hello_interval_ms: r.u32()?,
            dead_interval_ms: r.u32()?,
            wait_interval_ms: r.u32()?,
            exchange_interval_ms: r.u32()?,
            leader: r.fixed_str(NAME_LEN)?,
        }),
        MsgType::DomainPause => Payload::DomainPause(DomainPause {
            domain: r.fixed_str(NAME_LEN)?,
            node: r.fixed_str(NAME_LEN)?,
            pause_interval_ms: r.u32()?,
        }),
        MsgType::DomainExchangeStart => Payload::ExchangeStart(ExchangeStart {
            domain: r.fixed_str(NAME_LEN)?,
            node: r.fixed_str(NAME_LEN)?,
            exchange_node: r.fixed_str(NAME_LEN)?,
            exchange_seq: r.u32()?,
        }),
        MsgType::DomainExchange => Payload::Exchange(Exchange {
            domain: r.fixed_str(NAME_LEN)?,
            node: r.fixed_str(NAME_LEN)?,
            exchange_node: r.fixed_str(NAME_LEN)?,
            exchange_seq: r.u32()?,
            member_id: r.i64()?,
            member_name: r.fixed_str(NAME_LEN)?,
            desired_state: r.code("desired_state", GroupState::from_code)?,
            state: r.code("state", GroupState::from_code)?,
            status: r.code("status", GroupStatus::from_code)?,
            condition: r.code("condition", GroupCondition::from_code)?,
            health: r.i64()?,
            reason_text: r.fixed_str(REASON_LEN)?,
            more_members: r.bool()?,
            last_received_member_id: r.i64()?,
        }),
        MsgType::DomainMemberRequest => Payload::MemberRequest(MemberRequest {
            domain: r.fixed_str(NAME_LEN)?,
            node: r.fixed_str(NAME_LEN)?,
            member_node: r.fixed_str(NAME_LEN)?,
            member_id: r.i64()?,
            member_name: r.fixed_str(NAME_LEN)?,
            action: r.code("action", GroupAction::from_code)?,
            action_flags: r.u64()?,
        }),
        MsgType::DomainMemberUpdate => Payload::MemberUpdate(MemberUpdate {
            domain: r.fixed_str(NAME_LEN)?,
            node: r.fixed_str(NAME_LEN)?,
            member_node: r.fixed_str(NAME_LEN)?,
            member_id: r.i64()?,
            member_name: r.fixed_str(NAME_LEN)?,
            desired_state: r.code("desired_state", GroupState::from_code)?,
            state: r.code("state", GroupState::from_code)?,
            status: r.code("status", GroupStatus::from_code)?,
            condition: r.code("condition", GroupCondition::from_code)?,
            health: r.i64()?,
            reason_text: r.fixed_str(REASON_LEN)?,
        }),
    };
    Ok(payload)
}

/// Decode and authenticate a message.
///
/// When `key` is non-empty the message must carry a valid HMAC-SHA512
/// vector; anything else is `BadAuth`.
pub fn decode(buf: &[u8], key: &[u8]) -> MsgResult<Envelope> {
    if buf.len() > MSG_MAX_SIZE {
        return Err(MsgError::TooLarge(buf.len()));
    }
    let mut r = Reader::new(buf);
    let version = r.u16()?;
    let revision = r.u16()?;
    let _max_version = r.u16()?;
    let _max_revision = r.u16()?;
    if version > MSG_VERSION || (version == MSG_VERSION && revision > MSG_REVISION) {
        return Err(MsgError::BadVersion { version, revision });
    }
    let msg_len = r.u16()? as usize;
    if msg_len != buf.len() {
        return Err(MsgError::Truncated {
            need: msg_len,
            have: buf.len(),
        });
    }
    let raw_type = r.u16()?;
    let msg_type =
        MsgType::from_u16(raw_type).ok_or(MsgError::UnknownType(u32::from(raw_type)))?;
    let flags = r.u64()?;
    let instance = r.uuid()?;
    let seq = r.u64()?;
    let node_name = r.fixed_str(NAME_LEN)?;
    let auth_type = r.code("auth_type", AuthType::from_code)?;
    r.skip(AUTH_VECTOR_LEN)?;

    if !key.is_empty() {
        if auth_type != AuthType::HmacSha512 {
            return Err(MsgError::BadAuth);
        }
        let mut zeroed = buf.to_vec();
        zeroed[AUTH_VECTOR_OFFSET..HEADER_LEN].fill(0);
        if !verify_auth(key, &zeroed, &buf[AUTH_VECTOR_OFFSET..HEADER_LEN]) {
            return Err(MsgError::BadAuth);
        }
    }

    let payload = read_payload(&mut r, msg_type)?;
    Ok(Envelope {
        version,
        revision,
        flags,
        instance,
        seq,
        node_name,
        auth_type,
        payload,
    })
}
