//! Message counters. Dropped messages are counted here and go no further.

use std::collections::HashMap;

use serde::Serialize;

use crate::error::MsgError;
use crate::message::MsgType;
use crate::session::SeqVerdict;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct TypeCounters {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MsgStats {
    pub rx_total: u64,
    pub tx_total: u64,
    pub bad_auth: u64,
    pub bad_version: u64,
    pub malformed: u64,
    pub out_of_sequence: u64,
    pub sessions_invalidated: u64,
    pub per_type: HashMap<&'static str, TypeCounters>,
}

impl MsgStats {
    pub fn record_tx(&mut self, msg_type: MsgType) {
        self.tx_total += 1;
        self.per_type.entry(msg_type.as_str()).or_default().tx += 1;
    }

    pub fn record_rx(&mut self, msg_type: MsgType) {
        self.rx_total += 1;
        self.per_type.entry(msg_type.as_str()).or_default().rx += 1;
    }

    pub fn record_decode_error(&mut self, err: &MsgError) {
        match err {
            MsgError::BadAuth => self.bad_auth += 1,
            MsgError::BadVersion { .. } => self.bad_version += 1,
            _ => self.malformed += 1,
        }
    }

    pub fn record_verdict(&mut self, verdict: SeqVerdict) {
        match verdict {
            SeqVerdict::Accept => {}
            SeqVerdict::Invalidated => {
                self.sessions_invalidated += 1;
                self.out_of_sequence += 1;
            }
            SeqVerdict::Stale | SeqVerdict::NeedHello => self.out_of_sequence += 1,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.bad_auth + self.bad_version + self.malformed + self.out_of_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_are_classified() {
        let mut stats = MsgStats::default();
        stats.record_decode_error(&MsgError::BadAuth);
        stats.record_decode_error(&MsgError::BadVersion { version: 9, revision: 0 });
        stats.record_decode_error(&MsgError::UnknownType(77));
        stats.record_verdict(SeqVerdict::Invalidated);
        stats.record_verdict(SeqVerdict::Accept);
        stats.record_rx(MsgType::DomainHello);
        assert_eq!(stats.bad_auth, 1);
        assert_eq!(stats.bad_version, 1);
        assert_eq!(stats.sessions_invalidated, 1);
        assert_eq!(stats.dropped(), 4);
        assert_eq!(stats.per_type["service-domain-hello"].rx, 1);
    }
}
