//! Buffer chain: reference-counted scatter-gather byte buffers with cheap header prepend/strip.
//!
//! Rather than a pointer graph, pbufs live in a fixed-capacity arena ([`slab::Slab`]) and are
//! addressed by [`PbufHandle`], a `Copy` index. A handle does not by
//! itself keep a node alive — only the node's own `ref_count` does (mirroring the pbuf
//! invariant `ref >= 1` while reachable). [`PbufArena::free`] walks the chain, decrementing each
//! node's `ref_count` and stopping as soon as a node's count does not reach zero, which is
//! exactly the "whole chain when ref reaches 0 on each node walked" rule.

use netstack_error::{Error, Result};
use slab::Slab;

/// How the node's backing storage was obtained. Only `Pool` pbufs are counted against the
/// fixed-capacity pool; `Ram` pbufs come from the heap and may grow their front slack by
/// reallocating. `Rom`/`Ref` model externally-owned, non-growable memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PbufType {
    Pool,
    Ram,
    Rom,
    Ref,
}

/// Reserved front slack for a freshly allocated pbuf, keyed by which headers the caller expects
/// to prepend along the packet's path. Sizes mirror the historical `PBUF_TRANSPORT` /
/// `PBUF_IP` / `PBUF_LINK` / `PBUF_RAW` reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// No header room reserved.
    Raw,
    /// Room for a link-layer (Ethernet) header.
    Link,
    /// Room for a link-layer header plus an IP header.
    Ip,
    /// Room for a link-layer header, an IP header, and the larger of a UDP/TCP header.
    Transport,
}

impl Layer {
    const ETH_HLEN: usize = 14;
    const IP_HLEN: usize = 20;
    const TCP_HLEN: usize = 20;

    fn header_reserve(self) -> usize {
        match self {
            Layer::Raw => 0,
            Layer::Link => Self::ETH_HLEN,
            Layer::Ip => Self::ETH_HLEN + Self::IP_HLEN,
            Layer::Transport => Self::ETH_HLEN + Self::IP_HLEN + Self::TCP_HLEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PbufHandle(usize);

struct PbufNode {
    storage: Vec<u8>,
    /// Offset of this node's payload within `storage`.
    start: usize,
    /// This node's own payload length.
    len: usize,
    /// `len + next.tot_len` (invariant 3 in the testable-properties list).
    tot_len: usize,
    next: Option<PbufHandle>,
    ref_count: u32,
    ptype: PbufType,
}

impl PbufNode {
    fn front_capacity(&self) -> usize {
        self.start
    }

    fn back_capacity(&self) -> usize {
        self.storage.len() - self.start - self.len
    }
}

/// Arena owning all live pbuf nodes. `pool_capacity` bounds only `PbufType::Pool` allocations;
/// `Ram` pbufs are unconstrained (they come from the heap, per the data model).
pub struct PbufArena {
    nodes: Slab<PbufNode>,
    pool_capacity: usize,
    pool_in_use: usize,
}

impl PbufArena {
    pub fn new(pool_capacity: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(pool_capacity),
            pool_capacity,
            pool_in_use: 0,
        }
    }

    pub fn pool_in_use(&self) -> usize {
        self.pool_in_use
    }

    pub fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// Allocates a single fresh pbuf node with `size` bytes of payload and front slack per
    /// `layer`.
    pub fn alloc(&mut self, layer: Layer, size: usize, ptype: PbufType) -> Result<PbufHandle> {
        if ptype == PbufType::Pool && self.pool_in_use >= self.pool_capacity {
            tracing::debug!(capacity = self.pool_capacity, "pbuf pool exhausted");
            return Err(Error::OutOfMemory);
        }

        let reserve = layer.header_reserve();
        let storage = vec![0u8; reserve + size];
        let node = PbufNode {
            storage,
            start: reserve,
            len: size,
            tot_len: size,
            next: None,
            ref_count: 1,
            ptype,
        };

        if ptype == PbufType::Pool {
            self.pool_in_use += 1;
        }

        Ok(PbufHandle(self.nodes.insert(node)))
    }

    /// Wraps caller-supplied bytes as a single-node `Ram` pbuf, copying them in. Used for `Rom`
    /// / `Ref`-style "wrap existing data" call sites; since this arena does not model raw
    /// external pointers, those types still copy but keep the `Rom`/`Ref` tag so `header()`'s
    /// capacity rule still applies to them.
    pub fn alloc_from_slice(&mut self, layer: Layer, data: &[u8], ptype: PbufType) -> Result<PbufHandle> {
        let handle = self.alloc(layer, data.len(), ptype)?;
        self.payload_mut(handle)
            .expect("just allocated")
            .copy_from_slice(data);
        Ok(handle)
    }

    /// Bumps the reference count of `handle`.
    pub fn bump_ref(&mut self, handle: PbufHandle) {
        if let Some(node) = self.nodes.get_mut(handle.0) {
            node.ref_count += 1;
        }
    }

    pub fn ref_count(&self, handle: PbufHandle) -> u32 {
        self.nodes.get(handle.0).map(|n| n.ref_count).unwrap_or(0)
    }

    /// Frees `handle`, decrementing ref counts down the chain and stopping once a node's count
    /// does not reach zero (invariant 4: a pbuf with `ref == 0` is unreachable from any list).
    pub fn free(&mut self, handle: PbufHandle) {
        let mut cur = Some(handle);

        while let Some(h) = cur {
            let Some(node) = self.nodes.get_mut(h.0) else {
                break;
            };

            node.ref_count = node.ref_count.saturating_sub(1);
            if node.ref_count > 0 {
                break;
            }

            let next = node.next;
            let removed = self.nodes.remove(h.0);
            if removed.ptype == PbufType::Pool {
                self.pool_in_use -= 1;
            }

            cur = next;
        }
    }

    pub fn len(&self, handle: PbufHandle) -> usize {
        self.nodes.get(handle.0).map(|n| n.len).unwrap_or(0)
    }

    pub fn tot_len(&self, handle: PbufHandle) -> usize {
        self.nodes.get(handle.0).map(|n| n.tot_len).unwrap_or(0)
    }

    pub fn next(&self, handle: PbufHandle) -> Option<PbufHandle> {
        self.nodes.get(handle.0).and_then(|n| n.next)
    }

    pub fn ptype(&self, handle: PbufHandle) -> Option<PbufType> {
        self.nodes.get(handle.0).map(|n| n.ptype)
    }

    pub fn payload(&self, handle: PbufHandle) -> Option<&[u8]> {
        self.nodes
            .get(handle.0)
            .map(|n| &n.storage[n.start..n.start + n.len])
    }

    pub fn payload_mut(&mut self, handle: PbufHandle) -> Option<&mut [u8]> {
        self.nodes
            .get_mut(handle.0)
            .map(|n| &mut n.storage[n.start..n.start + n.len])
    }

    /// Grows (`delta > 0`) or shrinks (`delta < 0`) the first node's payload front without
    /// copying when capacity permits. Fails for `Pool`/`Rom`/`Ref` nodes that lack reserved
    /// front capacity; `Ram` nodes reallocate instead of failing.
    pub fn header(&mut self, handle: PbufHandle, delta: isize) -> Result<()> {
        let node = self.nodes.get_mut(handle.0).ok_or(Error::IllegalArgument)?;

        if delta == 0 {
            return Ok(());
        }

        if delta > 0 {
            let grow = delta as usize;

            if node.front_capacity() >= grow {
                node.start -= grow;
                node.len += grow;
                node.tot_len += grow;
                return Ok(());
            }

            if node.ptype != PbufType::Ram {
                return Err(Error::Buffer);
            }

            // Reallocate with extra front slack, preserving existing bytes.
            let extra = grow - node.front_capacity();
            let mut new_storage = vec![0u8; node.storage.len() + extra];
            new_storage[extra..].copy_from_slice(&node.storage);
            node.storage = new_storage;
            node.start = 0;
            node.len += grow;
            node.tot_len += grow;

            return Ok(());
        }

        let shrink = (-delta) as usize;
        if shrink > node.len {
            return Err(Error::Buffer);
        }

        node.start += shrink;
        node.len -= shrink;
        node.tot_len -= shrink;

        Ok(())
    }

    /// Appends `tail`'s chain after `head`'s chain, transferring ownership of `tail` into
    /// `head` (no ref bump on `tail`). Returns `head` unchanged; callers must not use `tail`'s
    /// handle afterwards except implicitly through `head`.
    pub fn cat(&mut self, head: PbufHandle, tail: PbufHandle) {
        self.splice_onto_tail(head, tail, false);
    }

    /// Like [`Self::cat`] but bumps `tail`'s ref count, so the caller retains an independent
    /// reference to `tail` in addition to it being reachable through `head`.
    pub fn chain(&mut self, head: PbufHandle, tail: PbufHandle) {
        self.splice_onto_tail(head, tail, true);
    }

    fn splice_onto_tail(&mut self, head: PbufHandle, tail: PbufHandle, bump_tail_ref: bool) {
        let tail_tot_len = self.tot_len(tail);

        let mut cur = head;
        loop {
            let next = {
                let node = self.nodes.get_mut(cur.0).expect("handle in chain");
                node.tot_len += tail_tot_len;
                node.next
            };
            match next {
                Some(n) => cur = n,
                None => break,
            }
        }

        self.nodes.get_mut(cur.0).expect("tail node").next = Some(tail);

        if bump_tail_ref {
            self.bump_ref(tail);
        }
    }

    /// Unlinks `handle`'s chain after the first node, returning the detached remainder (if any).
    /// Ownership of the remainder's reference transfers to the caller.
    pub fn dechain(&mut self, handle: PbufHandle) -> Option<PbufHandle> {
        let node = self.nodes.get_mut(handle.0)?;
        let rest = node.next.take();
        node.tot_len = node.len;
        rest
    }

    /// Shrinks the chain from `handle` forward so its `tot_len` becomes `new_tot_len`. Trailing
    /// nodes beyond the new length are freed. Shrink only.
    pub fn realloc(&mut self, handle: PbufHandle, new_tot_len: usize) -> Result<()> {
        let current = self.tot_len(handle);
        if new_tot_len > current {
            return Err(Error::IllegalArgument);
        }

        let mut remaining = new_tot_len;
        let mut cur = handle;

        loop {
            let (node_len, next) = {
                let node = self.nodes.get_mut(cur.0).expect("handle in chain");
                (node.len, node.next)
            };

            if remaining <= node_len {
                let node = self.nodes.get_mut(cur.0).expect("handle in chain");
                node.len = remaining;
                node.tot_len = remaining;

                if let Some(next_handle) = node.next.take() {
                    self.free(next_handle);
                }

                return Ok(());
            }

            {
                let node = self.nodes.get_mut(cur.0).expect("handle in chain");
                node.tot_len = remaining;
            }
            remaining -= node_len;

            match next {
                Some(n) => cur = n,
                None => return Ok(()),
            }
        }
    }

    /// Copies `n` bytes starting at `offset` (within the chain's total length) into `dst`.
    /// Returns the number of bytes actually copied (may be less than `n` if the chain is
    /// shorter).
    pub fn copy_partial(&self, handle: PbufHandle, dst: &mut [u8], offset: usize) -> usize {
        let n = dst.len();
        let mut remaining_skip = offset;
        let mut written = 0;
        let mut cur = Some(handle);

        while let (Some(h), true) = (cur, written < n) {
            let Some(node) = self.nodes.get(h.0) else {
                break;
            };
            let payload = &node.storage[node.start..node.start + node.len];

            if remaining_skip >= payload.len() {
                remaining_skip -= payload.len();
            } else {
                let avail = payload.len() - remaining_skip;
                let take = avail.min(n - written);
                dst[written..written + take]
                    .copy_from_slice(&payload[remaining_skip..remaining_skip + take]);
                written += take;
                remaining_skip = 0;
            }

            cur = node.next;
        }

        written
    }

    /// Copies `src` into the chain starting at `handle`'s first byte, overwriting existing
    /// payload bytes across as many nodes as needed. `src` must fit within the chain's
    /// `tot_len`.
    pub fn take(&mut self, handle: PbufHandle, src: &[u8]) -> Result<()> {
        if src.len() > self.tot_len(handle) {
            return Err(Error::Buffer);
        }

        let mut cur = Some(handle);
        let mut offset = 0;

        while let (Some(h), true) = (cur, offset < src.len()) {
            let Some(node) = self.nodes.get_mut(h.0) else {
                break;
            };
            let payload = &mut node.storage[node.start..node.start + node.len];
            let take = payload.len().min(src.len() - offset);
            payload[..take].copy_from_slice(&src[offset..offset + take]);
            offset += take;
            cur = node.next;
        }

        Ok(())
    }

    /// Collects the full chain into a freshly-allocated `Vec`, for callers that need a
    /// contiguous view (e.g. checksum computation, handing off to a parser).
    pub fn to_contiguous(&self, handle: PbufHandle) -> Vec<u8> {
        let mut out = vec![0u8; self.tot_len(handle)];
        let n = self.copy_partial(handle, &mut out, 0);
        out.truncate(n);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tot_len_invariant_holds_after_chain() {
        let mut arena = PbufArena::new(16);
        let a = arena.alloc_from_slice(Layer::Raw, b"hello", PbufType::Pool).unwrap();
        let b = arena.alloc_from_slice(Layer::Raw, b" world", PbufType::Pool).unwrap();

        arena.cat(a, b);

        assert_eq!(arena.tot_len(a), 11);
        assert_eq!(arena.len(a), 5);
        assert_eq!(arena.next(a), Some(b));
    }

    #[test]
    fn free_walks_chain_and_stops_at_nonzero_ref() {
        let mut arena = PbufArena::new(16);
        let a = arena.alloc_from_slice(Layer::Raw, b"a", PbufType::Pool).unwrap();
        let b = arena.alloc_from_slice(Layer::Raw, b"b", PbufType::Pool).unwrap();
        arena.chain(a, b); // caller keeps its own ref to `b`

        assert_eq!(arena.ref_count(b), 2);

        arena.free(a); // drops a, decrements b's ref to 1, stops (b survives)
        assert_eq!(arena.pool_in_use(), 1);
        assert_eq!(arena.payload(b), Some(&b"b"[..]));

        arena.free(b);
        assert_eq!(arena.pool_in_use(), 0);
    }

    #[test]
    fn header_grow_within_reserved_capacity_does_not_copy_storage() {
        let mut arena = PbufArena::new(16);
        let p = arena.alloc(Layer::Transport, 10, PbufType::Pool).unwrap();

        arena.header(p, 20).unwrap();
        assert_eq!(arena.len(p), 30);
        assert_eq!(arena.tot_len(p), 30);
    }

    #[test]
    fn header_grow_beyond_capacity_fails_for_pool_type() {
        let mut arena = PbufArena::new(16);
        let p = arena.alloc(Layer::Raw, 10, PbufType::Pool).unwrap();

        let before_len = arena.len(p);
        let result = arena.header(p, 5);

        assert_eq!(result, Err(Error::Buffer));
        assert_eq!(arena.len(p), before_len, "pbuf left unchanged on failure");
    }

    #[test]
    fn header_grow_beyond_capacity_reallocates_for_ram_type() {
        let mut arena = PbufArena::new(16);
        let p = arena.alloc(Layer::Raw, 10, PbufType::Ram).unwrap();

        arena.header(p, 4).unwrap();
        assert_eq!(arena.len(p), 14);
    }

    #[test]
    fn copy_partial_reads_across_node_boundary() {
        let mut arena = PbufArena::new(16);
        let a = arena.alloc_from_slice(Layer::Raw, b"foo", PbufType::Pool).unwrap();
        let b = arena.alloc_from_slice(Layer::Raw, b"bar", PbufType::Pool).unwrap();
        arena.cat(a, b);

        let mut out = [0u8; 4];
        let n = arena.copy_partial(a, &mut out, 2);

        assert_eq!(n, 4);
        assert_eq!(&out, b"obar");
    }

    #[test]
    fn realloc_shrinks_and_frees_trailing_nodes() {
        let mut arena = PbufArena::new(16);
        let a = arena.alloc_from_slice(Layer::Raw, b"foo", PbufType::Pool).unwrap();
        let b = arena.alloc_from_slice(Layer::Raw, b"bar", PbufType::Pool).unwrap();
        arena.cat(a, b);

        arena.realloc(a, 2).unwrap();

        assert_eq!(arena.tot_len(a), 2);
        assert_eq!(arena.next(a), None);
        assert_eq!(arena.pool_in_use(), 1);
    }
}
