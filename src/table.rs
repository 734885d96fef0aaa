//! C2: the concurrent flow table — one shard per zone, each shard keyed by
//! the symmetric key hash, holding two key-nodes per NAT'd connection and
//! one for everything else (`spec.md` §4.2).
//!
//! The original stores key-nodes in a lock-free `cmap` with RCU-deferred
//! destruction. This crate follows the reference project's own concurrency
//! idiom instead (`proxy/nat.rs`'s `Mutex<HashMap<..>>`, `app/tracker.rs`'s
//! `RwLock<HashMap<..>>`): a `std::sync::RwLock` per shard guarding a
//! `HashMap<u64, Vec<KeyNode>>` bucketed by symmetric hash, with literal key
//! comparison inside the bucket resolving collisions. Readers take a shared
//! lock rather than running lock-free, which is a deliberate simplification
//! of the epoch-reclamation scheme `spec.md` §9 describes as a source
//! pattern needing re-architecture — documented in `DESIGN.md`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::conn::{Connection, Direction, KeyNode};
use crate::key::{symmetric_hash, ConnKey};

#[derive(Default)]
struct Shard {
    buckets: HashMap<u64, Vec<KeyNode>>,
    live_count: u32,
}

/// Result of a successful lookup: the matched connection and whether the
/// match was via its reverse key-node (`spec.md` §4.2 `lookup`).
pub struct LookupHit {
    pub conn: Arc<Connection>,
    pub reply: bool,
}

pub struct FlowTable {
    shards: RwLock<HashMap<u16, RwLock<Shard>>>,
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            shards: RwLock::new(HashMap::new()),
        }
    }

    fn with_shard<R>(&self, zone: u16, f: impl FnOnce(&RwLock<Shard>) -> R) -> R {
        {
            let shards = self.shards.read().unwrap();
            if let Some(shard) = shards.get(&zone) {
                return f(shard);
            }
        }
        let mut shards = self.shards.write().unwrap();
        let shard = shards.entry(zone).or_insert_with(|| RwLock::new(Shard::default()));
        f(shard)
    }

    /// `spec.md` §4.2 `lookup(key, now) → (connection?, reply?)`. Candidates
    /// whose connection is already expired are skipped (lazily reaped, not
    /// removed here — that's the sweeper's job).
    ///
    /// A non-NAT'd connection only ever stores its forward key-node, so a
    /// reply packet's literal key never equals a stored node's key — it
    /// equals that node's *reverse*. Both stored orientations land in the
    /// same symmetric-hash bucket, so matching against `node.key` and
    /// `node.key.reverse()` here is what makes a single key-node serve both
    /// directions (`spec.md` §9 "non-NAT replies matched by literal
    /// comparison against both directions in the bucket").
    pub fn lookup(&self, key: &ConnKey, now_ms: i64) -> Option<LookupHit> {
        let hash = symmetric_hash(key);
        self.with_shard(key.zone, |shard| {
            let shard = shard.read().unwrap();
            let bucket = shard.buckets.get(&hash)?;
            for node in bucket {
                if node.conn.is_reclaimed() || node.conn.is_expired(now_ms) {
                    continue;
                }
                if node.key == *key {
                    return Some(LookupHit {
                        conn: node.conn.clone(),
                        reply: node.direction == Direction::Reverse,
                    });
                }
                if node.key.reverse() == *key {
                    return Some(LookupHit {
                        conn: node.conn.clone(),
                        reply: node.direction == Direction::Forward,
                    });
                }
            }
            None
        })
    }

    /// `spec.md` §4.2 `insert`: forward entry always; reverse entry only if
    /// NAT is active. Caller must hold the tracker-wide write lock per the
    /// lock order in `spec.md` §5.
    pub fn insert(&self, conn: Arc<Connection>) {
        let zone = conn.zone;
        let fwd_hash = symmetric_hash(&conn.fwd_key);
        let fwd_node = KeyNode {
            key: conn.fwd_key,
            direction: Direction::Forward,
            conn: conn.clone(),
        };
        let rev_node = conn.nat_active.then(|| KeyNode {
            key: conn.rev_key,
            direction: Direction::Reverse,
            conn: conn.clone(),
        });
        let rev_hash = conn.nat_active.then(|| symmetric_hash(&conn.rev_key));

        self.with_shard(zone, |shard| {
            let mut shard = shard.write().unwrap();
            shard.buckets.entry(fwd_hash).or_default().push(fwd_node);
            if let (Some(rev_node), Some(rev_hash)) = (rev_node, rev_hash) {
                shard.buckets.entry(rev_hash).or_default().push(rev_node);
            }
            shard.live_count += 1;
        });
    }

    /// `spec.md` §4.2 `remove`: removes both key-nodes if present and
    /// decrements the zone count. Idempotent against a connection already
    /// removed — callers gate on [`Connection::mark_reclaimed`] for
    /// exactly-once semantics (`spec.md` §3 invariant 4).
    pub fn remove(&self, conn: &Connection) {
        let zone = conn.zone;
        let fwd_hash = symmetric_hash(&conn.fwd_key);
        let rev_hash = conn.nat_active.then(|| symmetric_hash(&conn.rev_key));

        self.with_shard(zone, |shard| {
            let mut shard = shard.write().unwrap();
            let mut removed = false;
            if let Some(bucket) = shard.buckets.get_mut(&fwd_hash) {
                let before = bucket.len();
                bucket.retain(|node| !std::ptr::eq(node.conn.as_ref(), conn));
                removed |= bucket.len() != before;
            }
            if let Some(rev_hash) = rev_hash {
                if let Some(bucket) = shard.buckets.get_mut(&rev_hash) {
                    let before = bucket.len();
                    bucket.retain(|node| !std::ptr::eq(node.conn.as_ref(), conn));
                    removed |= bucket.len() != before;
                }
            }
            if removed {
                shard.live_count = shard.live_count.saturating_sub(1);
            }
        });
    }

    pub fn live_count(&self, zone: u16) -> u32 {
        self.with_shard(zone, |shard| shard.read().unwrap().live_count)
    }

    /// Used by the NAT allocator's probe loop (`spec.md` §4.4 step 6): true
    /// if some live, non-expired connection already claims `key` in `zone`.
    pub fn contains_key(&self, key: &ConnKey, now_ms: i64) -> bool {
        self.lookup(key, now_ms).is_some()
    }

    /// Marks every connection in `zone` reclaimed and drops its entries —
    /// the `flush-conntrack-tuple` control command (`spec.md` §3: a flush
    /// request is one of exactly four ways a connection is destroyed).
    /// Returns the number of connections actually reclaimed by this call.
    pub fn flush_zone(&self, zone: u16) -> u32 {
        self.with_shard(zone, |shard| {
            let mut shard = shard.write().unwrap();
            let mut seen = HashSet::new();
            let mut count = 0u32;
            for bucket in shard.buckets.values() {
                for node in bucket {
                    let ptr = Arc::as_ptr(&node.conn) as usize;
                    if seen.insert(ptr) && node.conn.mark_reclaimed() {
                        count += 1;
                    }
                }
            }
            shard.buckets.clear();
            shard.live_count = 0;
            count
        })
    }

    /// `flush-conntrack`: flushes every zone currently tracked, returning the
    /// total number of connections reclaimed.
    pub fn flush_all(&self) -> u32 {
        let zones: Vec<u16> = self.shards.read().unwrap().keys().copied().collect();
        zones.into_iter().map(|zone| self.flush_zone(zone)).sum()
    }
}
