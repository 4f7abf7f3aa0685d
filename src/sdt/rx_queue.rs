use std::collections::VecDeque;

use bytes::Bytes;

use crate::sdt::seq::Seq;
use crate::wire::sdt_messages::WrapperHeader;

/// A received wrapper. The client block is a slice of the received datagram.
#[derive(Debug, Clone)]
pub struct RxWrap {
    pub header: WrapperHeader,
    pub reliable: bool,
    pub client_block: Bytes,
}
impl RxWrap {
    /// A reliable wrapper is next in line if it is the successor of the last reliable wrapper,
    ///  an unreliable one if no reliable wrapper is missing before it.
    pub fn is_deliverable(&self, channel_rseq: Seq) -> bool {
        if self.reliable {
            self.header.rseq == channel_rseq.next()
        }
        else {
            self.header.rseq == channel_rseq
        }
    }

    /// the last Rseq that must have been received before this wrapper can be delivered
    pub fn needs_rseq(&self) -> Seq {
        if self.reliable {
            self.header.rseq.prev()
        }
        else {
            self.header.rseq
        }
    }
}

/// Wrappers that arrived ahead of a gap, in Tseq order
#[derive(Debug, Default)]
pub struct RxQueue {
    wraps: VecDeque<RxWrap>,
}

impl RxQueue {
    /// returns `false` if a wrapper with the same Tseq is already queued
    pub fn insert(&mut self, wrap: RxWrap) -> bool {
        let tseq = wrap.header.tseq;
        let mut pos = self.wraps.len();
        for (i, queued) in self.wraps.iter().enumerate() {
            if queued.header.tseq == tseq {
                return false;
            }
            if queued.header.tseq.is_after(tseq) {
                pos = i;
                break;
            }
        }
        self.wraps.insert(pos, wrap);
        true
    }

    /// Removes and returns the next wrapper if it can be delivered. Queued wrappers that are
    ///  not newer than `channel_tseq` are stale and dropped on the way.
    pub fn pop_deliverable(&mut self, channel_tseq: Seq, channel_rseq: Seq) -> Option<RxWrap> {
        while let Some(front) = self.wraps.front() {
            if !front.header.tseq.is_after(channel_tseq) {
                self.wraps.pop_front();
                continue;
            }
            if front.is_deliverable(channel_rseq) {
                return self.wraps.pop_front();
            }
            return None;
        }
        None
    }

    /// the last missing Rseq, i.e. the end of the range to NAK, if anything is missing
    pub fn last_missing(&self, channel_rseq: Seq) -> Option<Seq> {
        self.wraps.iter()
            .map(|w| w.needs_rseq())
            .filter(|needed| needed.is_after(channel_rseq))
            .reduce(|a, b| a.max(b))
    }

    pub fn len(&self) -> usize {
        self.wraps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wraps.is_empty()
    }

    pub fn clear(&mut self) {
        self.wraps.clear();
    }
}
