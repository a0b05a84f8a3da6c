//! In-order delivery state kept by every peer.
//!
//! `history` is dense and append-only (seq 1, 2, 3, …); records arriving
//! ahead of `expected_seq` wait in a bounded out-of-order buffer until the
//! gap is filled by retransmission.

use std::collections::BTreeMap;

use crate::config::Limits;
use crate::ids::Seq;
use crate::proto::OrderRecord;

/// What to do with one inbound sequenced record.
#[derive(Debug, PartialEq)]
pub enum IngestOutcome {
    /// Deliver this contiguous run, in order. The head is the ingested
    /// record; the tail was drained from the buffer.
    Deliver(Vec<OrderRecord>),
    /// Out of order: buffered (or refused when the buffer is full).
    /// `resend_from` asks the leader to retransmit starting there.
    Buffered { resend_from: Option<Seq> },
    /// Already delivered or already buffered.
    Duplicate,
}

pub struct Replica {
    history: Vec<OrderRecord>,
    expected_seq: Seq,
    pending: BTreeMap<Seq, OrderRecord>,
    max_pending: usize,
    resend_interval_ms: u64,
    last_resend_ms: Option<u64>,
}

impl Replica {
    /// Rebuild from replayed log records. The log is validated dense before
    /// it gets here, so `expected_seq` is simply one past the end.
    pub fn from_records(records: Vec<OrderRecord>, limits: &Limits, resend_interval_ms: u64) -> Self {
        let expected_seq = Seq::new(records.len() as u64 + 1);
        Self {
            history: records,
            expected_seq,
            pending: BTreeMap::new(),
            max_pending: limits.max_pending_records,
            resend_interval_ms,
            last_resend_ms: None,
        }
    }

    /// Next sequence number to deliver.
    pub fn expected_seq(&self) -> Seq {
        self.expected_seq
    }

    /// Highest delivered sequence number, 0 when nothing was delivered yet.
    pub fn last_seq(&self) -> u64 {
        self.expected_seq.get() - 1
    }

    pub fn history(&self) -> &[OrderRecord] {
        &self.history
    }

    /// Delivered records with `seq >= from`, in ascending order.
    pub fn range_from(&self, from: Seq) -> &[OrderRecord] {
        let start = (from.get().max(1) - 1) as usize;
        if start >= self.history.len() {
            &[]
        } else {
            &self.history[start..]
        }
    }

    pub fn ingest(&mut self, record: OrderRecord, now_ms: u64) -> IngestOutcome {
        let seq = record.seq;
        if seq < self.expected_seq {
            return IngestOutcome::Duplicate;
        }

        if seq == self.expected_seq {
            let mut run = vec![record];
            loop {
                let next = Seq::new(self.expected_seq.get() + run.len() as u64);
                match self.pending.remove(&next) {
                    Some(buffered) => run.push(buffered),
                    None => break,
                }
            }
            for delivered in &run {
                self.history.push(delivered.clone());
            }
            self.expected_seq = Seq::new(self.expected_seq.get() + run.len() as u64);
            return IngestOutcome::Deliver(run);
        }

        if self.pending.contains_key(&seq) {
            return IngestOutcome::Duplicate;
        }

        if self.pending.len() < self.max_pending {
            self.pending.insert(seq, record);
            // First observation of a gap, or a grown buffer: ask right away.
            self.last_resend_ms = Some(now_ms);
            return IngestOutcome::Buffered {
                resend_from: Some(self.expected_seq),
            };
        }

        // Buffer full: refuse the record and nag the leader again, throttled.
        IngestOutcome::Buffered {
            resend_from: self.throttled_resend(now_ms),
        }
    }

    /// Periodic re-request while a gap persists.
    pub fn due_resend(&mut self, now_ms: u64) -> Option<Seq> {
        if self.pending.is_empty() {
            return None;
        }
        self.throttled_resend(now_ms)
    }

    /// Note that a catch-up request was just sent for other reasons
    /// (e.g. on reconnect), so periodic re-requests back off from now.
    pub fn note_resend_sent(&mut self, now_ms: u64) {
        self.last_resend_ms = Some(now_ms);
    }

    /// Buffered records are bound to a leadership; on an epoch change the
    /// new leader may assign those sequence numbers differently, so they
    /// must be re-fetched rather than drained.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn throttled_resend(&mut self, now_ms: u64) -> Option<Seq> {
        let due = match self.last_resend_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.resend_interval_ms,
        };
        if due {
            self.last_resend_ms = Some(now_ms);
            Some(self.expected_seq)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::ids::{Epoch, NodeId, PayloadId};

    fn record(seq: u64) -> OrderRecord {
        OrderRecord {
            epoch: Epoch::new(1),
            seq: Seq::new(seq),
            payload_id: PayloadId::new(format!("p{seq}")),
            submitter_id: NodeId::new(2),
            submitted_at_ms: 0,
            body: format!("order {seq}"),
        }
    }

    fn replica() -> Replica {
        Replica::from_records(Vec::new(), &Limits::default(), 500)
    }

    #[test]
    fn in_order_records_deliver_immediately() {
        let mut replica = replica();
        assert_eq!(
            replica.ingest(record(1), 0),
            IngestOutcome::Deliver(vec![record(1)])
        );
        assert_eq!(replica.expected_seq(), Seq::new(2));
        assert_eq!(replica.last_seq(), 1);
    }

    #[test]
    fn gap_buffers_then_drains_in_order() {
        let mut replica = replica();
        replica.ingest(record(1), 0);

        let outcome = replica.ingest(record(3), 10);
        assert_eq!(
            outcome,
            IngestOutcome::Buffered {
                resend_from: Some(Seq::new(2))
            }
        );
        assert_eq!(replica.pending_len(), 1);

        let outcome = replica.ingest(record(2), 20);
        assert_eq!(outcome, IngestOutcome::Deliver(vec![record(2), record(3)]));
        assert_eq!(replica.expected_seq(), Seq::new(4));
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn delivered_and_buffered_duplicates_are_noops() {
        let mut replica = replica();
        replica.ingest(record(1), 0);
        replica.ingest(record(3), 0);

        assert_eq!(replica.ingest(record(1), 10), IngestOutcome::Duplicate);
        assert_eq!(replica.ingest(record(3), 10), IngestOutcome::Duplicate);
    }

    #[test]
    fn full_buffer_refuses_and_rerequests() {
        let limits = Limits {
            max_pending_records: 1,
            ..Limits::default()
        };
        let mut replica = Replica::from_records(Vec::new(), &limits, 500);

        replica.ingest(record(3), 0);
        assert_eq!(replica.pending_len(), 1);

        // Refused, and the previous request at t=0 throttles this one.
        let outcome = replica.ingest(record(4), 100);
        assert_eq!(outcome, IngestOutcome::Buffered { resend_from: None });
        assert_eq!(replica.pending_len(), 1);

        // Past the throttle window the re-request goes out.
        let outcome = replica.ingest(record(4), 700);
        assert_eq!(
            outcome,
            IngestOutcome::Buffered {
                resend_from: Some(Seq::new(1))
            }
        );
    }

    #[test]
    fn periodic_rerequest_only_while_gap_persists() {
        let mut replica = replica();
        assert_eq!(replica.due_resend(1_000), None);

        replica.ingest(record(5), 1_000);
        assert_eq!(replica.due_resend(1_100), None);
        assert_eq!(replica.due_resend(1_600), Some(Seq::new(1)));
    }

    #[test]
    fn range_from_serves_catch_up() {
        let mut replica = replica();
        for seq in 1..=5 {
            replica.ingest(record(seq), 0);
        }

        let range = replica.range_from(Seq::new(3));
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].seq, Seq::new(3));
        assert!(replica.range_from(Seq::new(9)).is_empty());
    }

    #[test]
    fn recovery_resumes_after_replayed_records() {
        let records = vec![record(1), record(2), record(3)];
        let replica = Replica::from_records(records, &Limits::default(), 500);
        assert_eq!(replica.expected_seq(), Seq::new(4));
        assert_eq!(replica.last_seq(), 3);
    }
}
