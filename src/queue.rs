use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Handle to an item sitting in a [`PriorQueue`].
///
/// Stable from enqueue until `remove`; surviving a dequeue, so the consumer
/// can finalize the slot once the item's work is done. Handles are
/// generation checked, a stale one is ignored by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    idx: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Dequeueable.
    Ready,
    /// Reserved in its bucket's population but invisible to `dequeue`
    /// until activated.
    Deferred,
    /// Handed to the consumer; counted until removed.
    InFlight,
    Free,
}

#[derive(Debug)]
struct SlotEntry<T> {
    generation: u32,
    state: SlotState,
    bucket: usize,
    key: (u64, u64),
    item: Option<T>,
}

#[derive(Debug)]
struct Inner<T> {
    slots: Vec<SlotEntry<T>>,
    free: Vec<u32>,
    /// Ready entries only, ordered by (key, enqueue seq).
    buckets: Vec<BTreeMap<(u64, u64), u32>>,
    /// Ready + deferred + in-flight.
    live: usize,
    seq: u64,
}

/// A set of priority FIFO buckets with stable slot handles.
///
/// Each bucket orders its items by a `u64` key, lowest first, ties broken
/// by enqueue order. Dequeued items stay part of the population until
/// `remove` is called on their slot, which is what lets callers treat the
/// queue's emptiness as "nothing queued and nothing in flight".
///
/// # Examples
///
/// ```
/// use nandmq::PriorQueue;
///
/// let q = PriorQueue::new(2);
/// q.enqueue(0, 20, "late");
/// q.enqueue(0, 5, "early");
///
/// let (item, slot) = q.dequeue(0).unwrap();
/// assert_eq!(item, "early");
/// assert!(!q.is_all_empty()); // still in flight
/// q.remove(slot);
/// ```
#[derive(Debug)]
pub struct PriorQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> PriorQueue<T> {
    /// A queue with `buckets` independent buckets and unbounded capacity.
    pub fn new(buckets: usize) -> PriorQueue<T> {
        PriorQueue {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                buckets: (0..buckets).map(|_| BTreeMap::new()).collect(),
                live: 0,
                seq: 0,
            }),
        }
    }

    /// Add `item` to `bucket` under `key`. Never fails.
    pub fn enqueue(&self, bucket: usize, key: u64, item: T) -> Slot {
        self.insert(bucket, key, item, SlotState::Ready)
    }

    /// Reserve a slot in `bucket` that `dequeue` will not return until
    /// [`activate`](PriorQueue::activate) flips it. The slot still counts
    /// toward [`nr_items`](PriorQueue::nr_items).
    pub fn enqueue_deferred(&self, bucket: usize, key: u64, item: T) -> Slot {
        self.insert(bucket, key, item, SlotState::Deferred)
    }

    fn insert(&self, bucket: usize, key: u64, item: T, state: SlotState) -> Slot {
        let mut q = self.inner.lock();
        debug_assert!(bucket < q.buckets.len());
        let seq = q.seq;
        q.seq += 1;
        let full_key = (key, seq);
        let idx = match q.free.pop() {
            Some(idx) => idx,
            None => {
                q.slots.push(SlotEntry {
                    generation: 0,
                    state: SlotState::Free,
                    bucket: 0,
                    key: (0, 0),
                    item: None,
                });
                (q.slots.len() - 1) as u32
            }
        };
        let entry = &mut q.slots[idx as usize];
        entry.state = state;
        entry.bucket = bucket;
        entry.key = full_key;
        entry.item = Some(item);
        let generation = entry.generation;
        if state == SlotState::Ready {
            q.buckets[bucket].insert(full_key, idx);
        }
        q.live += 1;
        Slot { idx, generation }
    }

    /// Make a deferred slot dequeueable under its original key. Returns
    /// false for a stale handle or a slot that is not deferred.
    pub fn activate(&self, slot: Slot) -> bool {
        let mut q = self.inner.lock();
        let Some((state, key, bucket)) = q.probe(slot) else {
            return false;
        };
        if state != SlotState::Deferred {
            return false;
        }
        q.slots[slot.idx as usize].state = SlotState::Ready;
        q.buckets[bucket].insert(key, slot.idx);
        true
    }

    /// Pop the lowest-key ready item from `bucket`. The returned slot
    /// stays live (in flight) until `remove`.
    pub fn dequeue(&self, bucket: usize) -> Option<(T, Slot)> {
        let mut q = self.inner.lock();
        let (_, idx) = q.buckets[bucket].pop_first()?;
        let entry = &mut q.slots[idx as usize];
        entry.state = SlotState::InFlight;
        let item = entry.item.take()?;
        let slot = Slot {
            idx,
            generation: entry.generation,
        };
        Some((item, slot))
    }

    /// Finalize a slot, whatever state it is in. Returns false for a stale
    /// handle.
    pub fn remove(&self, slot: Slot) -> bool {
        let mut q = self.inner.lock();
        let Some((state, key, bucket)) = q.probe(slot) else {
            return false;
        };
        if state == SlotState::Ready {
            q.buckets[bucket].remove(&key);
        }
        let entry = &mut q.slots[slot.idx as usize];
        entry.state = SlotState::Free;
        entry.item = None;
        entry.generation = entry.generation.wrapping_add(1);
        q.free.push(slot.idx);
        q.live -= 1;
        true
    }

    /// True when no bucket holds anything: ready, deferred or in flight.
    pub fn is_all_empty(&self) -> bool {
        self.inner.lock().live == 0
    }

    /// Total population across buckets, in-flight and deferred included.
    pub fn nr_items(&self) -> usize {
        self.inner.lock().live
    }
}

impl<T> Inner<T> {
    /// (state, key, bucket) of a live slot, or None for a stale handle.
    fn probe(&self, slot: Slot) -> Option<(SlotState, (u64, u64), usize)> {
        let entry = self.slots.get(slot.idx as usize)?;
        if entry.generation != slot.generation || entry.state == SlotState::Free {
            return None;
        }
        Some((entry.state, entry.key, entry.bucket))
    }
}
