//! Per-worker query table: 65,536 slots, one per DNS transaction id.
//!
//! A slot's array index *is* the transaction id it represents, so correlation
//! is a direct index. Every slot is threaded onto exactly one of two
//! index-linked lists:
//!
//! - **outstanding** — allocated for a query in flight, newest at the head.
//!   The tail is therefore the oldest request, which is what timeout pruning
//!   walks from.
//! - **free** — available ids.
//!
//! All moves are O(1) link surgery. Callers hold the worker mutex around
//! every operation; the table itself has no interior locking.

/// Number of slots; the full 16-bit transaction id space.
pub const NUM_SLOTS: usize = 1 << 16;

/// Timestamp sentinel for a slot that is allocated but not yet transmitted.
/// A reply matching such a slot is unexpected by definition.
pub const UNSENT_US: u64 = u64::MAX;

/// Socket sentinel for a slot with no send recorded.
const NO_SOCKET: usize = usize::MAX;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Free,
    Outstanding,
}

struct Slot {
    /// Send time in epoch microseconds, or [`UNSENT_US`].
    sent_us: u64,
    /// Bank index of the socket the query went out on.
    socket: usize,
    /// Query text, kept only in verbose mode; released with the slot.
    desc: Option<String>,
    list: Membership,
    prev: u32,
    next: u32,
}

struct ListEnds {
    head: u32,
    tail: u32,
    len: usize,
}

impl ListEnds {
    const fn empty() -> Self {
        Self { head: NIL, tail: NIL, len: 0 }
    }
}

/// Outcome of correlating a reply id against the table.
#[derive(Debug)]
pub enum ReplyMatch {
    /// The slot was outstanding on the right socket; it has been released.
    Matched { sent_us: u64, desc: Option<String> },
    /// The id maps to a free slot — a duplicate, expired, or forged reply.
    NotOutstanding,
    /// The slot is allocated but was never transmitted.
    Unsent,
    /// The reply arrived on a different socket than the query left on.
    WrongSocket,
}

/// Raised by [`QueryTable::allocate`] when no free slot remains; the sender
/// treats it as backpressure.
#[derive(Debug, PartialEq, Eq)]
pub struct Exhausted;

pub struct QueryTable {
    slots: Vec<Slot>,
    outstanding: ListEnds,
    free: ListEnds,
}

impl QueryTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NUM_SLOTS);
        for i in 0..NUM_SLOTS {
            let prev = if i == 0 { NIL } else { (i - 1) as u32 };
            let next = if i + 1 == NUM_SLOTS { NIL } else { (i + 1) as u32 };
            slots.push(Slot {
                sent_us: UNSENT_US,
                socket: NO_SOCKET,
                desc: None,
                list: Membership::Free,
                prev,
                next,
            });
        }
        Self {
            slots,
            outstanding: ListEnds::empty(),
            free: ListEnds {
                head: 0,
                tail: (NUM_SLOTS - 1) as u32,
                len: NUM_SLOTS,
            },
        }
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len
    }

    pub fn free_len(&self) -> usize {
        self.free.len
    }

    /// Take the head of the free list and prepend it to outstanding with the
    /// unsent sentinel stamped. The returned id becomes the query's qid.
    pub fn allocate(&mut self) -> Result<u16, Exhausted> {
        let id = self.free.head;
        if id == NIL {
            return Err(Exhausted);
        }
        self.unlink(Membership::Free, id);
        self.push_front(Membership::Outstanding, id);
        let slot = &mut self.slots[id as usize];
        slot.sent_us = UNSENT_US;
        slot.socket = NO_SOCKET;
        slot.desc = None;
        Ok(id as u16)
    }

    /// Stamp the send. The slot stays at the head of outstanding, so the
    /// list remains ordered by send time.
    pub fn commit(&mut self, id: u16, now_us: u64, socket: usize, desc: Option<String>) {
        let slot = &mut self.slots[id as usize];
        debug_assert_eq!(slot.list, Membership::Outstanding);
        slot.sent_us = now_us;
        slot.socket = socket;
        slot.desc = desc;
    }

    /// Roll an allocation back before it was ever sent. The id goes to the
    /// *front* of the free list so the next allocation reuses it.
    pub fn release_to_front(&mut self, id: u16) {
        let id32 = u32::from(id);
        debug_assert_eq!(self.slots[id as usize].list, Membership::Outstanding);
        self.unlink(Membership::Outstanding, id32);
        self.push_front(Membership::Free, id32);
        let slot = &mut self.slots[id as usize];
        slot.sent_us = UNSENT_US;
        slot.socket = NO_SOCKET;
        slot.desc = None;
    }

    /// Retire a slot (completion or timeout): unlink from outstanding,
    /// append to the back of the free list, hand back what it carried.
    pub fn release_to_back(&mut self, id: u16) -> (u64, Option<String>) {
        let id32 = u32::from(id);
        debug_assert_eq!(self.slots[id as usize].list, Membership::Outstanding);
        self.unlink(Membership::Outstanding, id32);
        self.push_back(Membership::Free, id32);
        let slot = &mut self.slots[id as usize];
        let sent = slot.sent_us;
        let desc = slot.desc.take();
        slot.sent_us = UNSENT_US;
        slot.socket = NO_SOCKET;
        (sent, desc)
    }

    /// The tail of outstanding: the oldest request still in flight.
    pub fn oldest(&self) -> Option<(u16, u64)> {
        let id = self.outstanding.tail;
        if id == NIL {
            return None;
        }
        Some((id as u16, self.slots[id as usize].sent_us))
    }

    /// Correlate a reply. A match releases the slot to the back of the free
    /// list; every mismatch leaves the table untouched.
    pub fn match_reply(&mut self, id: u16, socket: usize) -> ReplyMatch {
        let slot = &self.slots[id as usize];
        if slot.list != Membership::Outstanding {
            return ReplyMatch::NotOutstanding;
        }
        if slot.sent_us == UNSENT_US {
            return ReplyMatch::Unsent;
        }
        if slot.socket != socket {
            return ReplyMatch::WrongSocket;
        }
        let (sent_us, desc) = self.release_to_back(id);
        ReplyMatch::Matched { sent_us, desc }
    }

    /// Move every outstanding slot to the free list, dropping descriptions.
    /// Used at shutdown to reclassify in-flight queries as interrupted.
    pub fn drain_outstanding(&mut self) -> usize {
        let mut drained = 0;
        while let Some((id, _)) = self.oldest() {
            self.release_to_back(id);
            drained += 1;
        }
        drained
    }

    fn ends_mut(&mut self, which: Membership) -> &mut ListEnds {
        match which {
            Membership::Free => &mut self.free,
            Membership::Outstanding => &mut self.outstanding,
        }
    }

    fn push_front(&mut self, which: Membership, id: u32) {
        let old_head = {
            let ends = self.ends_mut(which);
            let h = ends.head;
            ends.head = id;
            if ends.tail == NIL {
                ends.tail = id;
            }
            ends.len += 1;
            h
        };
        if old_head != NIL {
            self.slots[old_head as usize].prev = id;
        }
        let slot = &mut self.slots[id as usize];
        slot.list = which;
        slot.prev = NIL;
        slot.next = old_head;
    }

    fn push_back(&mut self, which: Membership, id: u32) {
        let old_tail = {
            let ends = self.ends_mut(which);
            let t = ends.tail;
            ends.tail = id;
            if ends.head == NIL {
                ends.head = id;
            }
            ends.len += 1;
            t
        };
        if old_tail != NIL {
            self.slots[old_tail as usize].next = id;
        }
        let slot = &mut self.slots[id as usize];
        slot.list = which;
        slot.prev = old_tail;
        slot.next = NIL;
    }

    fn unlink(&mut self, which: Membership, id: u32) {
        let (prev, next) = {
            let slot = &self.slots[id as usize];
            debug_assert_eq!(slot.list, which);
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slots[prev as usize].next = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        }
        let ends = self.ends_mut(which);
        if ends.head == id {
            ends.head = next;
        }
        if ends.tail == id {
            ends.tail = prev;
        }
        ends.len -= 1;
        let slot = &mut self.slots[id as usize];
        slot.prev = NIL;
        slot.next = NIL;
    }

    /// Walk outstanding head→tail, returning (id, sent_us) pairs. Test aid.
    #[cfg(test)]
    fn outstanding_ids(&self) -> Vec<(u16, u64)> {
        let mut out = Vec::new();
        let mut cur = self.outstanding.head;
        while cur != NIL {
            out.push((cur as u16, self.slots[cur as usize].sent_us));
            cur = self.slots[cur as usize].next;
        }
        out
    }
}

impl Default for QueryTable {
    fn default() -> Self {
        Self::new()
    }
}
