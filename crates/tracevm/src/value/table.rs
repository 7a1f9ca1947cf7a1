// Hybrid array + hash table.
//
// The array part serves dense integer keys 1..=n; the hash part is open
// addressing with "main position" chaining (Brent's variation): a colliding
// key either takes a free node linked after the occupant, or displaces an
// occupant that is itself out of its main position. `rehash` recomputes the
// split so as many integer keys as possible land in the array part while
// each (2^(i-1), 2^i] slice stays at least half full.
//
// `nil` is never a key; storing `nil` deletes (the node's key may linger as
// a dead key until the next rehash, with its `next` link preserved so
// chains stay intact). Length is the count of present entries in both
// parts, a deliberate statistical semantics.
//
// Aggregation tables carry parallel `stat_data` arrays (count/sum/min/max
// per slot); the value slot mirrors the accumulator as a `Value::Stat`
// snapshot so reads never chase pointers.
//
// Every public operation goes through the per-table spinlock; callers pass
// the string pool in (lock order: string pool, then table). Nothing inside
// a locked section calls back into the interpreter.

use crate::gc::StringPool;
use crate::limits::{MAX_ARRAY_SIZE, MAX_HASH_BITS};
use crate::value::{StatData, Value};

/// Errors surfaced by table operations; the interpreter layer turns them
/// into runtime errors on the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// `nil` used as a key.
    NilKey,
    /// An event value used as key or value (events never escape a handler).
    EventEscape,
    /// Hash part would exceed 2^30 nodes.
    Overflow,
    /// `next` called with a key not present in the table.
    InvalidNext,
}

#[derive(Debug, Clone, Copy)]
struct Node {
    key: Value,
    val: Value,
    /// Chain link to the next node index, -1 for none.
    next: i32,
}

impl Node {
    const EMPTY: Node = Node {
        key: Value::Nil,
        val: Value::Nil,
        next: -1,
    };
}

/// Location of a slot in either part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pos {
    Array(usize),
    Hash(usize),
}

pub struct Table {
    data: spin::Mutex<TableData>,
}

impl Table {
    pub fn new() -> Self {
        Table {
            data: spin::Mutex::new(TableData::new()),
        }
    }

    /// Acquire the per-table spinlock.
    #[inline]
    pub fn lock(&self) -> spin::MutexGuard<'_, TableData> {
        self.data.lock()
    }
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

pub struct TableData {
    array: Vec<Value>,
    node: Vec<Node>,
    /// Scan position for free nodes; counts down from the node count.
    lastfree: usize,
    pub with_stats: bool,
    sd_arr: Vec<StatData>,
    sd_rec: Vec<StatData>,
    /// Sorted view: `(key, value)` nodes chained by `next` in sort order.
    sorted: Vec<Node>,
    sort_head: i32,
}

#[inline]
fn lmod(h: u32, size: usize) -> usize {
    h as usize & (size - 1)
}

#[inline]
fn ceillog2(mut x: usize) -> u32 {
    debug_assert!(x > 0);
    x -= 1;
    usize::BITS - x.leading_zeros()
}

/// Array-part candidate index for a key, or None.
#[inline]
fn arrayindex(key: &Value) -> Option<usize> {
    match key {
        Value::Number(n) if *n > 0 && (*n as usize) <= MAX_ARRAY_SIZE => Some(*n as usize),
        _ => None,
    }
}

impl TableData {
    fn new() -> Self {
        TableData {
            array: Vec::new(),
            node: Vec::new(),
            lastfree: 0,
            with_stats: false,
            sd_arr: Vec::new(),
            sd_rec: Vec::new(),
            sorted: Vec::new(),
            sort_head: -1,
        }
    }

    // ---- hashing ----------------------------------------------------

    fn sizenode(&self) -> usize {
        self.node.len()
    }

    fn hashmod(&self, n: u64) -> usize {
        (n % ((self.sizenode() - 1) | 1) as u64) as usize
    }

    /// Main position of a key in the hash part. The hash part must be
    /// non-empty.
    fn mainposition(&self, sp: &StringPool, key: &Value) -> usize {
        match key {
            Value::Number(n) => self.hashmod(*n as u64),
            Value::Str(id) => lmod(sp.get_ref(*id).hash, self.sizenode()),
            Value::Boolean(b) => lmod(*b as u32, self.sizenode()),
            Value::LightPtr(p) => self.hashmod(*p),
            Value::NativeFunc(f) => self.hashmod(*f as usize as u64),
            Value::Btrace { digest, .. } => self.hashmod(*digest as u64),
            Value::Table(id) => self.hashmod(id.0 as u64),
            Value::Closure(id) => self.hashmod(id.0 as u64),
            Value::PTable(id) => self.hashmod(id.0 as u64),
            Value::Proto(id) => self.hashmod(id.0 as u64),
            Value::Upval(id) => self.hashmod(id.0 as u64),
            // NilKey / EventEscape are rejected before hashing.
            _ => 0,
        }
    }

    fn check_key(key: &Value) -> Result<(), TableError> {
        match key {
            Value::Nil => Err(TableError::NilKey),
            Value::Event => Err(TableError::EventEscape),
            _ => Ok(()),
        }
    }

    // ---- lookup -----------------------------------------------------

    /// Find the slot of a key, dead keys included (their value is nil).
    fn find_pos(&self, sp: &StringPool, key: &Value) -> Option<Pos> {
        if let Some(k) = arrayindex(key) {
            if k <= self.array.len() {
                return Some(Pos::Array(k - 1));
            }
        }
        if self.node.is_empty() {
            return None;
        }
        let mut n = self.mainposition(sp, key) as i32;
        while n >= 0 {
            let node = &self.node[n as usize];
            if node.key.raw_equal(key, sp) {
                return Some(Pos::Hash(n as usize));
            }
            n = node.next;
        }
        None
    }

    #[inline]
    fn slot_val(&self, pos: Pos) -> Value {
        match pos {
            Pos::Array(i) => self.array[i],
            Pos::Hash(i) => self.node[i].val,
        }
    }

    #[inline]
    fn set_slot_val(&mut self, pos: Pos, val: Value) {
        match pos {
            Pos::Array(i) => self.array[i] = val,
            Pos::Hash(i) => self.node[i].val = val,
        }
    }

    /// Specialized integer lookup: array part first, then the hash chain.
    pub fn get_int(&self, key: i64) -> Value {
        if key > 0 && (key as usize) <= self.array.len() {
            return self.array[key as usize - 1];
        }
        if self.node.is_empty() {
            return Value::Nil;
        }
        let mut n = self.hashmod(key as u64) as i32;
        while n >= 0 {
            let node = &self.node[n as usize];
            if let Value::Number(k) = node.key {
                if k == key {
                    return node.val;
                }
            }
            n = node.next;
        }
        Value::Nil
    }

    /// Main lookup. Returns nil for missing keys.
    pub fn get(&self, sp: &StringPool, key: &Value) -> Value {
        match key {
            Value::Nil => Value::Nil,
            Value::Number(n) => self.get_int(*n),
            _ => match self.find_pos(sp, key) {
                Some(pos) => self.slot_val(pos),
                None => Value::Nil,
            },
        }
    }

    // ---- insertion --------------------------------------------------

    /// Store `val` under `key`. Storing nil to a missing key is a no-op;
    /// storing nil to a present key deletes it.
    pub fn set(&mut self, sp: &StringPool, key: &Value, val: Value) -> Result<(), TableError> {
        Self::check_key(key)?;
        if matches!(val, Value::Event) {
            return Err(TableError::EventEscape);
        }
        if let Some(pos) = self.find_pos(sp, key) {
            self.set_slot_val(pos, val);
            return Ok(());
        }
        if val.is_nil() {
            return Ok(());
        }
        let pos = self.new_key(sp, key)?;
        self.set_slot_val(pos, val);
        Ok(())
    }

    pub fn set_int(&mut self, sp: &StringPool, key: i64, val: Value) -> Result<(), TableError> {
        self.set(sp, &Value::Number(key), val)
    }

    /// `count()` support: add `n` to the numeric slot, seeding a missing
    /// slot with `n`.
    pub fn atomic_inc(&mut self, sp: &StringPool, key: &Value, n: i64) -> Result<(), TableError> {
        Self::check_key(key)?;
        let pos = match self.find_pos(sp, key) {
            Some(pos) => pos,
            None => self.new_key(sp, key)?,
        };
        let next = match self.slot_val(pos) {
            Value::Number(v) => v + n,
            _ => n,
        };
        self.set_slot_val(pos, Value::Number(next));
        Ok(())
    }

    /// Insert a fresh key (must be absent) and return its slot.
    fn new_key(&mut self, sp: &StringPool, key: &Value) -> Result<Pos, TableError> {
        if let Some(k) = arrayindex(key) {
            if k <= self.array.len() {
                return Ok(Pos::Array(k - 1));
            }
        }
        if self.node.is_empty() {
            // no hash part yet: grow around the extra key
            self.rehash(sp, key)?;
            return match self.find_pos(sp, key) {
                Some(pos) => Ok(pos),
                None => self.new_key(sp, key),
            };
        }

        let mp = self.mainposition(sp, key);
        if !self.node[mp].val.is_nil() {
            // main position taken: find a free node
            let Some(free) = self.getfreepos() else {
                self.rehash(sp, key)?;
                return match self.find_pos(sp, key) {
                    Some(pos) => Ok(pos),
                    None => self.new_key(sp, key),
                };
            };
            let occupant_key = self.node[mp].key;
            let othern = self.mainposition(sp, &occupant_key);
            if othern != mp {
                // occupant is out of its main position: displace it into
                // the free node and take its place
                let mut prev = othern;
                while self.node[prev].next != mp as i32 {
                    prev = self.node[prev].next as usize;
                }
                self.node[prev].next = free as i32;
                self.node[free] = self.node[mp];
                if self.with_stats {
                    self.sd_rec[free] = self.sd_rec[mp];
                }
                self.node[mp].next = -1;
                self.node[mp].val = Value::Nil;
                self.node[mp].key = *key;
                if self.with_stats {
                    self.sd_rec[mp] = StatData::default();
                }
                Ok(Pos::Hash(mp))
            } else {
                // occupant owns its main position: chain the new key in
                // at the free node
                self.node[free].next = self.node[mp].next;
                self.node[mp].next = free as i32;
                self.node[free].key = *key;
                self.node[free].val = Value::Nil;
                if self.with_stats {
                    self.sd_rec[free] = StatData::default();
                }
                Ok(Pos::Hash(free))
            }
        } else {
            // main position free (possibly a dead key): take it over,
            // preserving the chain link through it
            self.node[mp].key = *key;
            if self.with_stats {
                self.sd_rec[mp] = StatData::default();
            }
            Ok(Pos::Hash(mp))
        }
    }

    fn getfreepos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.node[self.lastfree].key.is_nil() {
                return Some(self.lastfree);
            }
        }
        None
    }

    // ---- sizing -----------------------------------------------------

    /// Rebuild both parts at the given sizes, reinserting every live entry.
    pub fn resize(
        &mut self,
        sp: &StringPool,
        nasize: usize,
        nhsize: usize,
    ) -> Result<(), TableError> {
        let oldasize = self.array.len();

        if nasize > oldasize {
            self.array.resize(nasize, Value::Nil);
            if self.with_stats {
                self.sd_arr.resize(nasize, StatData::default());
            }
        }

        let old_node = std::mem::take(&mut self.node);
        let old_sd = std::mem::take(&mut self.sd_rec);
        self.setnodevector(nhsize)?;

        if nasize < oldasize {
            // re-insert elements from the vanishing slice
            let tail: Vec<(usize, Value, StatData)> = (nasize..oldasize)
                .filter(|&i| !self.array[i].is_nil())
                .map(|i| {
                    (
                        i,
                        self.array[i],
                        self.sd_arr.get(i).copied().unwrap_or_default(),
                    )
                })
                .collect();
            self.array.truncate(nasize);
            if self.with_stats {
                self.sd_arr.truncate(nasize);
            }
            for (i, v, sd) in tail {
                let pos = self.new_key(sp, &Value::Number(i as i64 + 1))?;
                self.set_slot_val(pos, v);
                if self.with_stats {
                    self.write_sd(pos, sd);
                }
            }
        }

        // re-insert elements from the old hash part
        for (i, old) in old_node.iter().enumerate() {
            if !old.val.is_nil() {
                let pos = self.new_key(sp, &old.key)?;
                self.set_slot_val(pos, old.val);
                if self.with_stats {
                    self.write_sd(pos, old_sd[i]);
                }
            }
        }
        Ok(())
    }

    fn setnodevector(&mut self, size: usize) -> Result<(), TableError> {
        if size == 0 {
            self.node = Vec::new();
            self.sd_rec = Vec::new();
            self.lastfree = 0;
            return Ok(());
        }
        let lsize = ceillog2(size);
        if lsize > MAX_HASH_BITS {
            return Err(TableError::Overflow);
        }
        let size = 1usize << lsize;
        self.node = vec![Node::EMPTY; size];
        if self.with_stats {
            self.sd_rec = vec![StatData::default(); size];
        }
        self.lastfree = size;
        Ok(())
    }

    /// Compute a new (array, hash) split around an extra key and resize.
    fn rehash(&mut self, sp: &StringPool, extra: &Value) -> Result<(), TableError> {
        // nums[i] = number of integer keys with 2^(i-1) < k <= 2^i
        let mut nums = [0usize; MAX_HASH_BITS as usize + 2];
        let mut nasize = self.numusearray(&mut nums);
        let mut totaluse = nasize;
        totaluse += self.numusehash(&mut nums, &mut nasize);
        if let Some(k) = arrayindex(extra) {
            nums[ceillog2(k) as usize] += 1;
            nasize += 1;
        }
        totaluse += 1;
        let na = Self::computesizes(&nums, &mut nasize);
        log::debug!(
            "table rehash, array size: {}, hash size: {}",
            nasize,
            totaluse - na
        );
        self.resize(sp, nasize, totaluse - na)
    }

    fn numusearray(&self, nums: &mut [usize]) -> usize {
        let mut ause = 0;
        let mut i = 1usize;
        let mut ttlg = 1usize;
        for lg in 0..=MAX_HASH_BITS as usize {
            let mut lc = 0;
            let mut lim = ttlg;
            if lim > self.array.len() {
                lim = self.array.len();
                if i > lim {
                    break;
                }
            }
            // count elements in range (2^(lg-1), 2^lg]
            while i <= lim {
                if !self.array[i - 1].is_nil() {
                    lc += 1;
                }
                i += 1;
            }
            nums[lg] += lc;
            ause += lc;
            ttlg *= 2;
        }
        ause
    }

    fn numusehash(&self, nums: &mut [usize], pnasize: &mut usize) -> usize {
        let mut totaluse = 0;
        let mut ause = 0;
        for n in &self.node {
            if !n.val.is_nil() {
                if let Some(k) = arrayindex(&n.key) {
                    nums[ceillog2(k) as usize] += 1;
                    ause += 1;
                }
                totaluse += 1;
            }
        }
        *pnasize += ause;
        totaluse
    }

    /// The largest power of two such that more than half the candidate
    /// slots below it are populated.
    fn computesizes(nums: &[usize], narray: &mut usize) -> usize {
        let mut a = 0; // elements smaller than 2^i
        let mut na = 0; // elements that go to the array part
        let mut n = 0; // optimal array size
        let mut twotoi = 1usize;
        let mut i = 0;
        while twotoi / 2 < *narray {
            if nums[i] > 0 {
                a += nums[i];
                if a > twotoi / 2 {
                    n = twotoi;
                    na = a;
                }
            }
            if a == *narray {
                break;
            }
            i += 1;
            twotoi *= 2;
        }
        *narray = n;
        na
    }

    // ---- traversal --------------------------------------------------

    /// Index of a key for traversal: array entries first, then hash nodes.
    /// `None` signals the start of a traversal.
    fn findindex(&self, sp: &StringPool, key: &Value) -> Result<Option<usize>, TableError> {
        if key.is_nil() {
            return Ok(None);
        }
        if let Some(k) = arrayindex(key) {
            if k <= self.array.len() {
                return Ok(Some(k - 1));
            }
        }
        if self.node.is_empty() {
            return Err(TableError::InvalidNext);
        }
        let mut n = self.mainposition(sp, key) as i32;
        while n >= 0 {
            if self.node[n as usize].key.raw_equal(key, sp) {
                return Ok(Some(self.array.len() + n as usize));
            }
            n = self.node[n as usize].next;
        }
        Err(TableError::InvalidNext)
    }

    /// Next `(key, value)` pair in traversal order, or `None` at the end.
    /// Every key present at traversal start is visited exactly once,
    /// provided the table is not mutated in between.
    pub fn next(
        &self,
        sp: &StringPool,
        key: &Value,
    ) -> Result<Option<(Value, Value)>, TableError> {
        let start = match self.findindex(sp, key)? {
            None => 0,
            Some(i) => i + 1,
        };
        for i in start..self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((Value::Number(i as i64 + 1), self.array[i])));
            }
        }
        let hstart = start.saturating_sub(self.array.len());
        for i in hstart..self.node.len() {
            if !self.node[i].val.is_nil() {
                return Ok(Some((self.node[i].key, self.node[i].val)));
            }
        }
        Ok(None)
    }

    /// Count of present entries in both parts.
    pub fn length(&self) -> i64 {
        let mut len = 0;
        for v in &self.array {
            if !v.is_nil() {
                len += 1;
            }
        }
        for n in &self.node {
            if !n.val.is_nil() {
                len += 1;
            }
        }
        len
    }

    /// Snapshot of all present entries, traversal order.
    pub fn entries(&self) -> Vec<(Value, Value)> {
        let mut out = Vec::new();
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((Value::Number(i as i64 + 1), *v));
            }
        }
        for n in &self.node {
            if !n.val.is_nil() {
                out.push((n.key, n.val));
            }
        }
        out
    }

    /// Nil out both parts but keep the allocations; the table is expected
    /// to be refilled shortly (aggregate synthesis reuses its buffers).
    pub fn clear(&mut self) {
        self.array.fill(Value::Nil);
        self.node.fill(Node::EMPTY);
        self.lastfree = self.node.len();
        self.sd_arr.fill(StatData::default());
        self.sd_rec.fill(StatData::default());
        self.sorted.clear();
        self.sort_head = -1;
    }

    // ---- stat slots -------------------------------------------------

    fn read_sd(&self, pos: Pos) -> StatData {
        match pos {
            Pos::Array(i) => self.sd_arr[i],
            Pos::Hash(i) => self.sd_rec[i],
        }
    }

    fn write_sd(&mut self, pos: Pos, sd: StatData) {
        match pos {
            Pos::Array(i) => self.sd_arr[i] = sd,
            Pos::Hash(i) => self.sd_rec[i] = sd,
        }
        self.set_slot_val(pos, Value::Stat(sd));
    }

    /// Fold one observation into the stats slot for `key` (the per-CPU
    /// aggregation write path).
    pub fn stat_add(&mut self, sp: &StringPool, key: &Value, v: i64) -> Result<(), TableError> {
        Self::check_key(key)?;
        let pos = match self.find_pos(sp, key) {
            Some(pos) => pos,
            None => self.new_key(sp, key)?,
        };
        let sd = if self.slot_val(pos).is_nil() {
            StatData::seeded(v)
        } else {
            let mut sd = self.read_sd(pos);
            sd.add(v);
            sd
        };
        self.write_sd(pos, sd);
        Ok(())
    }

    /// Merge a whole accumulator into the slot for `key` (the aggregate
    /// side of the per-CPU fold).
    pub fn stat_merge(
        &mut self,
        sp: &StringPool,
        key: &Value,
        other: &StatData,
    ) -> Result<StatData, TableError> {
        Self::check_key(key)?;
        let pos = match self.find_pos(sp, key) {
            Some(pos) => pos,
            None => self.new_key(sp, key)?,
        };
        let sd = if self.slot_val(pos).is_nil() {
            *other
        } else {
            let mut sd = self.read_sd(pos);
            sd.merge(other);
            sd
        };
        self.write_sd(pos, sd);
        Ok(sd)
    }

    /// Read the stats slot for `key`.
    pub fn stat_get(&self, sp: &StringPool, key: &Value) -> Option<StatData> {
        let pos = self.find_pos(sp, key)?;
        if self.slot_val(pos).is_nil() {
            None
        } else {
            Some(self.read_sd(pos))
        }
    }

    /// Snapshot of `(key, stat)` pairs of a stats table.
    pub fn stat_entries(&self) -> Vec<(Value, StatData)> {
        let mut out = Vec::new();
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                out.push((Value::Number(i as i64 + 1), self.sd_arr[i]));
            }
        }
        for (i, n) in self.node.iter().enumerate() {
            if !n.val.is_nil() {
                out.push((n.key, self.sd_rec[i]));
            }
        }
        out
    }

    // ---- sorted view ------------------------------------------------

    /// Install entries (already ordered by the caller's comparator) as the
    /// sorted chain.
    pub fn install_sorted(&mut self, ordered: &[(Value, Value)]) {
        self.sorted = ordered
            .iter()
            .enumerate()
            .map(|(i, (k, v))| Node {
                key: *k,
                val: *v,
                next: if i + 1 < ordered.len() {
                    i as i32 + 1
                } else {
                    -1
                },
            })
            .collect();
        self.sort_head = if self.sorted.is_empty() { -1 } else { 0 };
    }

    /// Walk the sorted chain: nil starts, then each key yields its
    /// successor.
    pub fn sort_next(&self, sp: &StringPool, key: &Value) -> Option<(Value, Value)> {
        if self.sort_head < 0 {
            return None;
        }
        if key.is_nil() {
            let n = &self.sorted[self.sort_head as usize];
            return Some((n.key, n.val));
        }
        let mut i = self.sort_head;
        while i >= 0 {
            let n = &self.sorted[i as usize];
            if n.key.raw_equal(key, sp) {
                let next = n.next;
                if next < 0 {
                    return None;
                }
                let n = &self.sorted[next as usize];
                return Some((n.key, n.val));
            }
            i = n.next;
        }
        None
    }

    pub fn has_sorted_view(&self) -> bool {
        self.sort_head >= 0
    }

    #[cfg(test)]
    pub(crate) fn hash_size(&self) -> usize {
        self.node.len()
    }

    #[cfg(test)]
    pub(crate) fn array_size(&self) -> usize {
        self.array.len()
    }

    #[cfg(test)]
    pub(crate) fn lastfree(&self) -> usize {
        self.lastfree
    }
}

impl TableData {
    /// Overwrite the stats slot for `key` (the aggregate copy taken by a
    /// cross-CPU read).
    pub fn stat_put(
        &mut self,
        sp: &StringPool,
        key: &Value,
        sd: StatData,
    ) -> Result<(), TableError> {
        Self::check_key(key)?;
        let pos = match self.find_pos(sp, key) {
            Some(pos) => pos,
            None => self.new_key(sp, key)?,
        };
        self.write_sd(pos, sd);
        Ok(())
    }
}
