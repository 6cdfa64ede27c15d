//! Out-of-order receive queue, one per established PCB.
//!
//! Shares its coalescing bookkeeping with IP reassembly (`netstack-ip::reassembly`): a sorted,
//! non-overlapping `Vec` of ranges, with eviction always from the tail and never touching the
//! entry that is contiguous with the delivery point (`rcv_nxt`).

use crate::seq;

const MAX_SEGMENTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutOfOrderSegment {
    pub seq: u32,
    pub data: Vec<u8>,
    pub fin: bool,
}

impl OutOfOrderSegment {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

#[derive(Default)]
pub struct OutOfOrderQueue {
    segments: Vec<OutOfOrderSegment>,
}

impl OutOfOrderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Inserts a segment already known to start at or after `rcv_nxt`, trimming it against
    /// `rcv_nxt` and the right edge (`rcv_nxt + rcv_wnd`), then trimming/discarding/coalescing
    /// existing entries so the queue remains strictly ordered and non-overlapping.
    pub fn insert(&mut self, seq_no: u32, data: Vec<u8>, fin: bool, rcv_nxt: u32, rcv_wnd: u32) {
        let right_edge = rcv_nxt.wrapping_add(rcv_wnd);

        let (mut seg_seq, mut seg_data, mut seg_fin) = (seq_no, data, fin);
        if seq::lt(seg_seq, rcv_nxt) {
            let skip = rcv_nxt.wrapping_sub(seg_seq) as usize;
            if skip >= seg_data.len() {
                return; // fully below rcv_nxt
            }
            seg_data.drain(..skip);
            seg_seq = rcv_nxt;
        }

        let seg_end = seg_seq.wrapping_add(seg_data.len() as u32);
        if seq::gt(seg_end, right_edge) {
            let overflow = seg_end.wrapping_sub(right_edge) as usize;
            let new_len = seg_data.len().saturating_sub(overflow);
            seg_data.truncate(new_len);
            seg_fin = false; // truncated before the FIN byte would have landed
        }

        if seg_data.is_empty() && !seg_fin {
            return;
        }

        let mut new_seg = OutOfOrderSegment {
            seq: seg_seq,
            data: seg_data,
            fin: seg_fin,
        };

        self.segments.retain(|existing| {
            let contained = seq::geq(existing.seq, new_seg.seq) && seq::leq(existing.end(), new_seg.end());
            !contained
        });

        for existing in self.segments.iter_mut() {
            if seq::lt(existing.seq, new_seg.seq) && seq::gt(existing.end(), new_seg.seq) {
                let keep = new_seg.seq.wrapping_sub(existing.seq) as usize;
                existing.data.truncate(keep);
                existing.fin = false;
            }
            if seq::gt(existing.end(), new_seg.seq)
                && seq::lt(existing.seq, new_seg.end())
                && seq::geq(existing.seq, new_seg.seq)
            {
                let skip = new_seg.end().wrapping_sub(existing.seq) as usize;
                if skip < existing.data.len() {
                    existing.data.drain(..skip);
                    existing.seq = new_seg.end();
                }
            }
        }

        let pos = self.segments.partition_point(|e| seq::lt(e.seq, new_seg.seq));
        self.segments.insert(pos, new_seg);

        self.coalesce();

        while self.segments.len() > MAX_SEGMENTS {
            self.evict_tail(rcv_nxt);
        }
    }

    fn coalesce(&mut self) {
        let mut i = 0;
        while i + 1 < self.segments.len() {
            if self.segments[i].end() == self.segments[i + 1].seq {
                let next = self.segments.remove(i + 1);
                self.segments[i].data.extend_from_slice(&next.data);
                self.segments[i].fin = next.fin;
            } else {
                i += 1;
            }
        }
    }

    fn evict_tail(&mut self, rcv_nxt: u32) {
        if self.segments.len() <= 1 {
            return;
        }
        if let Some(last) = self.segments.last() {
            if last.seq == rcv_nxt {
                return;
            }
        }
        self.segments.pop();
    }

    /// If the head of the queue is now contiguous with `rcv_nxt`, removes and returns it (bytes,
    /// whether it carries the FIN, new `rcv_nxt`). Caller loops until this returns `None`.
    pub fn take_contiguous(&mut self, rcv_nxt: u32) -> Option<(Vec<u8>, bool, u32)> {
        if self.segments.first().map(|s| s.seq) != Some(rcv_nxt) {
            return None;
        }
        let seg = self.segments.remove(0);
        let new_rcv_nxt = seg.end().wrapping_add(if seg.fin { 1 } else { 0 });
        Some((seg.data, seg.fin, new_rcv_nxt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_inserts_coalesce_into_contiguous_delivery() {
        let mut q = OutOfOrderQueue::new();
        let rcv_nxt = 0u32;
        let rcv_wnd = 64u32;

        // offsets delivered in order: 8(len8,FIN), 4(len8), 4(len10), 2(len14,FIN), 0(len4)
        q.insert(8, vec![0; 8], true, rcv_nxt, rcv_wnd);
        q.insert(4, vec![1; 8], false, rcv_nxt, rcv_wnd);
        q.insert(4, vec![2; 10], false, rcv_nxt, rcv_wnd);
        q.insert(2, vec![3; 14], true, rcv_nxt, rcv_wnd);

        assert!(q.take_contiguous(rcv_nxt).is_none());

        q.insert(0, vec![4; 4], false, rcv_nxt, rcv_wnd);

        let (data, fin, new_rcv_nxt) = q.take_contiguous(rcv_nxt).expect("should now be contiguous");
        assert_eq!(data.len(), 16);
        assert!(fin);
        assert_eq!(new_rcv_nxt, 17); // 16 data bytes + 1 for FIN
        assert!(q.is_empty());
    }

    #[test]
    fn segment_fully_below_rcv_nxt_is_dropped() {
        let mut q = OutOfOrderQueue::new();
        q.insert(0, vec![1; 10], false, 20, 64);
        assert!(q.is_empty());
    }

    #[test]
    fn overlapping_insert_trims_existing_tail() {
        let mut q = OutOfOrderQueue::new();
        q.insert(10, vec![1; 10], false, 0, 64); // [10,20)
        q.insert(5, vec![2; 10], false, 0, 64); // [5,15) overlaps head of [10,20)

        assert_eq!(q.len(), 2);
        assert_eq!(q.segments[0].seq, 5);
        assert_eq!(q.segments[0].data.len(), 10);
        assert_eq!(q.segments[1].seq, 15);
        assert_eq!(q.segments[1].data.len(), 5);
    }
}
