//! IP fragment reassembly.
//!
//! One [`Reassembly`] tracks every datagram currently being reassembled, keyed by the 3-tuple
//! that RFC 791 says identifies a set of fragments (source, destination, identification) plus
//! the protocol number. Each entry holds a sorted, non-overlapping `Vec` of fragments — the same
//! shape as `netstack-tcp`'s out-of-order queue, under the same eviction policy: always from the
//! tail (highest offset), never touching the fragment contiguous with offset 0.

use std::net::Ipv4Addr;

use etherparse::IpNumber;

/// Per-entry fragment cap. Guards against a single malicious/buggy sender exhausting the
/// reassembly budget with many small, non-contiguous fragments; real fragmentation of a
/// 65 515-byte datagram through a 1500-byte MTU produces far fewer than this.
const MAX_FRAGMENTS_PER_ENTRY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReassemblyKey {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub identification: u16,
    pub protocol: IpNumber,
}

struct Fragment {
    offset: usize,
    data: Vec<u8>,
    /// Whether this fragment had `MF = 0`, i.e. it carries the datagram's tail.
    last: bool,
}

struct Entry {
    key: ReassemblyKey,
    fragments: Vec<Fragment>,
    total_len: Option<usize>,
    age_ticks: u32,
}

impl Entry {
    fn new(key: ReassemblyKey) -> Self {
        Self {
            key,
            fragments: Vec::new(),
            total_len: None,
            age_ticks: 0,
        }
    }

    /// Inserts `fragment`, keeping `fragments` sorted by offset. Fragments that exactly
    /// duplicate one already held are dropped (retransmitted fragment, not an error).
    fn insert(&mut self, offset: usize, data: Vec<u8>, last: bool) {
        if self.fragments.iter().any(|f| f.offset == offset) {
            return;
        }

        if last {
            self.total_len = Some(offset + data.len());
        }

        let pos = self.fragments.partition_point(|f| f.offset < offset);
        self.fragments.insert(pos, Fragment { offset, data, last });

        while self.fragments.len() > MAX_FRAGMENTS_PER_ENTRY {
            self.evict_tail();
        }
    }

    /// Removes the highest-offset fragment, unless it's the one covering offset 0 — reassembly's
    /// delivery point never moves, unlike TCP's sliding `rcv_nxt`, so the same guard `ooseq.rs`
    /// applies against `rcv_nxt` applies here against the constant `0`.
    fn evict_tail(&mut self) {
        if self.fragments.len() <= 1 {
            return;
        }

        if let Some(last) = self.fragments.last() {
            if last.offset == 0 {
                return;
            }
        }

        self.fragments.pop();
    }

    /// If the held fragments now cover `[0, total_len)` with no gaps, assembles and returns the
    /// full payload.
    fn try_complete(&self) -> Option<Vec<u8>> {
        let total_len = self.total_len?;

        let mut out = Vec::with_capacity(total_len);
        for fragment in &self.fragments {
            if fragment.offset != out.len() {
                return None;
            }
            out.extend_from_slice(&fragment.data);
        }

        (out.len() == total_len).then_some(out)
    }
}

/// Tracks in-flight reassembly entries, bounded at `capacity` concurrent datagrams
/// (`MEMP_NUM_REASSDATA`). When capacity is exhausted and a fragment for a new datagram
/// arrives, the oldest entry is evicted to make room.
pub struct Reassembly {
    capacity: usize,
    entries: Vec<Entry>,
}

impl Reassembly {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
        }
    }

    /// Feeds one fragment in. Returns the fully reassembled payload once the last gap closes.
    pub fn insert(
        &mut self,
        key: ReassemblyKey,
        offset: usize,
        data: Vec<u8>,
        last: bool,
    ) -> Option<Vec<u8>> {
        let idx = match self.entries.iter().position(|e| e.key == key) {
            Some(idx) => idx,
            None => {
                if self.entries.len() >= self.capacity {
                    self.evict_oldest();
                }
                self.entries.push(Entry::new(key));
                self.entries.len() - 1
            }
        };

        self.entries[idx].insert(offset, data, last);

        if let Some(assembled) = self.entries[idx].try_complete() {
            self.entries.remove(idx);
            return Some(assembled);
        }

        None
    }

    fn evict_oldest(&mut self) {
        if let Some((idx, _)) = self
            .entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| e.age_ticks)
        {
            tracing::debug!("reassembly pool exhausted, evicting oldest entry");
            self.entries.remove(idx);
        }
    }

    /// Ages every entry by one tick (driven by the slow timer, `IP_REASS_MAXAGE` ticks), dropping
    /// and returning the key plus the offset-0 fragment (if held, for an ICMP time-exceeded
    /// reply) of any entry that has outlived `max_age_ticks`.
    pub fn age(&mut self, max_age_ticks: u32) -> Vec<(ReassemblyKey, Option<Vec<u8>>)> {
        let mut expired = Vec::new();

        self.entries.retain_mut(|entry| {
            entry.age_ticks += 1;
            if entry.age_ticks <= max_age_ticks {
                return true;
            }

            let first_fragment = entry
                .fragments
                .iter()
                .find(|f| f.offset == 0)
                .map(|f| f.data.clone());
            expired.push((entry.key, first_fragment));
            false
        });

        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ReassemblyKey {
        ReassemblyKey {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            identification: 42,
            protocol: IpNumber::UDP,
        }
    }

    #[test]
    fn completes_once_all_gaps_close_regardless_of_arrival_order() {
        let mut reass = Reassembly::new(4);

        assert!(reass.insert(key(), 1400, vec![3; 100], true).is_none());
        assert_eq!(reass.len(), 1);

        let result = reass.insert(key(), 0, vec![1; 1400], false);
        assert_eq!(result, Some([vec![1; 1400], vec![3; 100]].concat()));
        assert!(reass.is_empty());
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut reass = Reassembly::new(4);
        reass.insert(key(), 0, vec![1; 10], false);
        reass.insert(key(), 0, vec![9; 10], false);
        let result = reass.insert(key(), 10, vec![2; 5], true);
        assert_eq!(result, Some([vec![1; 10], vec![2; 5]].concat()));
    }

    #[test]
    fn aging_drops_entries_past_max_age() {
        let mut reass = Reassembly::new(4);
        reass.insert(key(), 0, vec![1; 10], false);

        assert!(reass.age(2).is_empty());
        assert!(reass.age(2).is_empty());
        let expired = reass.age(2);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, key());
        assert_eq!(expired[0].1, Some(vec![1; 10]));
        assert!(reass.is_empty());
    }

    #[test]
    fn capacity_exhaustion_evicts_oldest_entry() {
        let mut reass = Reassembly::new(1);

        let mut other_key = key();
        other_key.identification = 43;

        reass.insert(key(), 0, vec![1; 10], false);
        reass.age(100); // bump age so eviction preference is observable
        reass.insert(other_key, 0, vec![2; 10], false);

        assert_eq!(reass.len(), 1);
    }
}
