//! Heartbeat messages exchanged between peer controllers every interval.
//!
//! ```text
//! version u16 | revision u16 | msg_len u16 | msg_type u16 | node_name [32]
//! auth_type u32 | auth_vector [64] | payload
//! ```
//!
//! `alive` has no payload. `alive-rev2` carries the sender's view of its
//! own interfaces as a bitmap (`msg_size u16`, `if_state u32`).

use avail_core::AuthType;

use crate::codec::{Reader, Writer};
use crate::error::{MsgError, MsgResult};
use crate::message::{auth_vector, verify_auth, AUTH_VECTOR_LEN, MSG_REVISION, MSG_VERSION, NAME_LEN};

pub const HEARTBEAT_HEADER_LEN: usize = 2 * 4 + NAME_LEN + 4 + AUTH_VECTOR_LEN;
const HB_LEN_OFFSET: usize = 4;
const HB_AUTH_OFFSET: usize = HEARTBEAT_HEADER_LEN - AUTH_VECTOR_LEN;

/// Lower three bits of the interface bitmap: set means the interface is down.
pub mod if_state {
    pub const CLUSTER_HOST_DOWN: u32 = 0x1;
    pub const MGMT_DOWN: u32 = 0x2;
    pub const OAM_DOWN: u32 = 0x4;
    pub const MASK: u32 = 0x7;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatPayload {
    Alive,
    AliveRev2 { if_state: u32 },
}

impl HeartbeatPayload {
    fn type_code(&self) -> u16 {
        match self {
            HeartbeatPayload::Alive => 1,
            HeartbeatPayload::AliveRev2 { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMsg {
    pub node_name: String,
    pub payload: HeartbeatPayload,
}

impl HeartbeatMsg {
    pub fn alive(node_name: impl Into<String>, if_state: u32) -> Self {
        Self {
            node_name: node_name.into(),
            payload: HeartbeatPayload::AliveRev2 {
                if_state: if_state & if_state::MASK,
            },
        }
    }

    /// Peer interface bitmap, zero for the legacy `alive` payload.
    pub fn if_state(&self) -> u32 {
        match self.payload {
            HeartbeatPayload::Alive => 0,
            HeartbeatPayload::AliveRev2 { if_state } => if_state,
        }
    }

    pub fn encode(&self, key: &[u8]) -> MsgResult<Vec<u8>> {
        let auth = if key.is_empty() {
            AuthType::None
        } else {
            AuthType::HmacSha512
        };
        let mut w = Writer::with_capacity(HEARTBEAT_HEADER_LEN + 8);
        w.u16(MSG_VERSION);
        w.u16(MSG_REVISION);
        w.u16(0);
        w.u16(self.payload.type_code());
        w.fixed_str("node_name", &self.node_name, NAME_LEN)?;
        w.u32(auth.code());
        w.zeros(AUTH_VECTOR_LEN);
        if let HeartbeatPayload::AliveRev2 { if_state } = self.payload {
            w.u16(6);
            w.u32(if_state);
        }
        let len = w.len();
        w.set_u16_at(HB_LEN_OFFSET, len as u16);
        if auth == AuthType::HmacSha512 {
            let vector = auth_vector(key, w.as_slice());
            w.set_slice_at(HB_AUTH_OFFSET, &vector);
        }
        Ok(w.into_vec())
    }

    pub fn decode(buf: &[u8], key: &[u8]) -> MsgResult<Self> {
        let mut r = Reader::new(buf);
        let version = r.u16()?;
        let revision = r.u16()?;
        if version != MSG_VERSION {
            return Err(MsgError::BadVersion { version, revision });
        }
        let len = r.u16()? as usize;
        if len != buf.len() {
            return Err(MsgError::Truncated {
                need: len,
                have: buf.len(),
            });
        }
        let msg_type = r.u16()?;
        let node_name = r.fixed_str(NAME_LEN)?;
        let auth = r.code("auth_type", AuthType::from_code)?;
        r.skip(AUTH_VECTOR_LEN)?;

        if !key.is_empty() {
            if auth != AuthType::HmacSha512 {
                return Err(MsgError::BadAuth);
            }
            let mut zeroed = buf.to_vec();
            zeroed[HB_AUTH_OFFSET..HEARTBEAT_HEADER_LEN].fill(0);
            if !verify_auth(key, &zeroed, &buf[HB_AUTH_OFFSET..HEARTBEAT_HEADER_LEN]) {
                return Err(MsgError::BadAuth);
            }
        }

        let payload = match msg_type {
            1 => HeartbeatPayload::Alive,
            2 => {
                let _size = r.u16()?;
                HeartbeatPayload::AliveRev2 {
                    if_state: r.u32()? & if_state::MASK,
                }
            }
            other => return Err(MsgError::UnknownType(u32::from(other))),
        };
        Ok(Self { node_name, payload })
    }
}
