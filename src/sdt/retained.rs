use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::sdt::seq::Seq;

/// A reliable wrapper that was sent and may be needed for retransmission
#[derive(Debug, Clone)]
pub struct RetainedWrap {
    pub tseq: Seq,
    pub rseq: Seq,
    /// The complete wrapper PDU as it was sent. This is a slice of the sent datagram, sharing
    ///  its buffer.
    pub pdu: Bytes,
    acks_owed: u32,
}

/// Reliable wrappers of a local channel in Rseq order, each with the number of members that
///  still owe an acknowledgement for it. Wrappers leave from the front once nobody owes an
///  acknowledgement for them.
#[derive(Debug, Default)]
pub struct RetainedWraps {
    wraps: VecDeque<RetainedWrap>,
}

impl RetainedWraps {
    pub fn push(&mut self, tseq: Seq, rseq: Seq, pdu: Bytes, acks_owed: u32) {
        if let Some(last) = self.wraps.back() {
            if !rseq.is_after(last.rseq) {
                warn!("retaining wrapper {} out of sequence after {} - this is a bug", rseq, last.rseq);
            }
        }
        self.wraps.push_back(RetainedWrap { tseq, rseq, pdu, acks_owed });
    }

    pub fn len(&self) -> usize {
        self.wraps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wraps.is_empty()
    }

    pub fn oldest_rseq(&self) -> Option<Seq> {
        self.wraps.front()
            .map(|w| w.rseq)
    }

    pub fn acks_owed(&self, rseq: Seq) -> Option<u32> {
        self.wraps.iter()
            .find(|w| w.rseq == rseq)
            .map(|w| w.acks_owed)
    }

    /// A member's acknowledged Rseq moved from `acked_before` to `acked_now`: every wrapper in
    ///  between is owed one acknowledgement less. Returns the number of wrappers purged.
    pub fn release_acks(&mut self, acked_before: Seq, acked_now: Seq) -> usize {
        for wrap in self.wraps.iter_mut() {
            if !wrap.rseq.is_after(acked_before) {
                continue;
            }
            if wrap.rseq.is_after(acked_now) {
                break;
            }
            if wrap.acks_owed == 0 {
                debug!("wrapper {} was already fully acknowledged", wrap.rseq);
                continue;
            }
            wrap.acks_owed -= 1;
        }
        self.purge()
    }

    fn purge(&mut self) -> usize {
        let mut num_purged = 0;
        while self.wraps.front().map(|w| w.acks_owed == 0).unwrap_or(false) {
            self.wraps.pop_front();
            num_purged += 1;
        }
        if num_purged > 0 {
            if let Some(stuck) = self.wraps.iter().skip(1).find(|w| w.acks_owed == 0) {
                debug!("wrapper {} is fully acknowledged but held by an older one", stuck.rseq);
            }
        }
        num_purged
    }

    /// wrappers with `first <= rseq <= last`
    pub fn in_range(&self, first: Seq, last: Seq) -> impl Iterator<Item = &RetainedWrap> {
        self.wraps.iter()
            .filter(move |w| w.rseq.is_in(first, last))
    }
}
