/// Open-addressed username -> address table
///
/// Slots live in a flat arena indexed by position. Collisions are resolved
/// with quadratic probing over triangular offsets (0, 1, 3, 6, 10, ...),
/// which visits every slot exactly once per `capacity` probes when the
/// capacity is a power of two. Deletion is lazy: a deleted slot keeps a
/// tombstone until a later insert reuses it or the table grows.

use peerchat_common::config::table::{
    GROWTH_FACTOR, INITIAL_CAPACITY, LOAD_FACTOR, MAX_CAPACITY,
};
use peerchat_common::Username;
use std::net::IpAddr;

/// Base of the polynomial string hash
const HASH_PRIME: u64 = 7;

/// One slot's contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub username: Username,
    pub address: IpAddr,
    pub tombstone: bool,
}

impl DirectoryEntry {
    pub fn new(username: Username, address: IpAddr) -> Self {
        Self {
            username,
            address,
            tombstone: false,
        }
    }

    fn is_live(&self) -> bool {
        !self.tombstone
    }
}

/// Outcome of a successful insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new username was stored
    Inserted,
    /// An existing username's address was overwritten in place
    Updated,
}

#[derive(Debug)]
pub struct AddressTable {
    slots: Vec<Option<DirectoryEntry>>,
    count: usize,
    max_capacity: usize,
}

impl Default for AddressTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressTable {
    /// Create an empty table with the default limits
    pub fn new() -> Self {
        Self::with_limits(INITIAL_CAPACITY, MAX_CAPACITY)
    }

    /// Create an empty table with explicit capacity limits.
    ///
    /// Both values are rounded up to a power of two, and the initial
    /// capacity never exceeds the maximum.
    pub fn with_limits(initial_capacity: usize, max_capacity: usize) -> Self {
        let max_capacity = max_capacity.max(2).next_power_of_two();
        let capacity = initial_capacity
            .max(2)
            .next_power_of_two()
            .min(max_capacity);

        Self {
            slots: vec![None; capacity],
            count: 0,
            max_capacity,
        }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Locate the slot holding a live entry for `username`
    pub fn find(&self, username: &Username) -> Result<usize, TableError> {
        for index in self.probe_sequence(username) {
            match &self.slots[index] {
                None => break,
                Some(entry) if entry.is_live() && entry.username == *username => {
                    return Ok(index);
                }
                Some(_) => {}
            }
        }
        Err(TableError::NotFound)
    }

    /// Address currently registered for `username`
    pub fn get(&self, username: &Username) -> Option<IpAddr> {
        let index = self.find(username).ok()?;
        self.slots[index].as_ref().map(|entry| entry.address)
    }

    pub fn contains(&self, username: &Username) -> bool {
        self.find(username).is_ok()
    }

    /// Insert or overwrite the address for `username`
    pub fn insert(&mut self, username: Username, address: IpAddr) -> Result<InsertOutcome, TableError> {
        if let Ok(index) = self.find(&username) {
            self.slots[index] = Some(DirectoryEntry::new(username, address));
            return Ok(InsertOutcome::Updated);
        }

        if (self.count + 1) as f64 / self.capacity() as f64 >= LOAD_FACTOR {
            self.grow();
        }

        self.place(DirectoryEntry::new(username, address))?;
        Ok(InsertOutcome::Inserted)
    }

    /// Lazily delete `username`, leaving a tombstone in its slot
    pub fn delete(&mut self, username: &Username) -> Result<(), TableError> {
        let index = self.find(username)?;
        if let Some(entry) = self.slots[index].as_mut() {
            entry.tombstone = true;
        }
        self.count -= 1;
        Ok(())
    }

    /// Grow by `GROWTH_FACTOR`, capped at the maximum capacity.
    ///
    /// Live entries are re-inserted into the new arena; tombstones are
    /// dropped. At the maximum capacity this is a no-op.
    pub fn grow(&mut self) {
        if self.capacity() >= self.max_capacity {
            return;
        }

        let new_capacity = (self.capacity() * GROWTH_FACTOR).min(self.max_capacity);
        let old_slots = std::mem::replace(&mut self.slots, vec![None; new_capacity]);
        self.count = 0;

        for entry in old_slots.into_iter().flatten().filter(DirectoryEntry::is_live) {
            // the new arena is larger than the old count, so every live entry fits
            let placed = self.place(entry);
            debug_assert!(placed.is_ok(), "rehash lost an entry: {:?}", placed);
        }

        tracing::debug!(capacity = new_capacity, entries = self.count, "address table grown");
    }

    /// Iterate over live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.slots
            .iter()
            .flatten()
            .filter(|entry| entry.is_live())
    }

    /// Smallest power-of-two capacity that holds `entries` below the load
    /// factor, starting from `initial` and never above `max`
    pub fn capacity_for(entries: usize, initial: usize, max: usize) -> usize {
        let mut capacity = initial.max(2).next_power_of_two();
        while capacity < max && (entries + 1) as f64 / capacity as f64 >= LOAD_FACTOR {
            capacity *= GROWTH_FACTOR;
        }
        capacity.min(max.max(2).next_power_of_two())
    }

    /// Write `entry` into the first empty or tombstoned slot on its probe
    /// sequence. The caller guarantees no live entry for the username exists.
    fn place(&mut self, entry: DirectoryEntry) -> Result<usize, TableError> {
        let target = self
            .probe_sequence(&entry.username)
            .find(|&index| self.slots[index].as_ref().map_or(true, |slot| slot.tombstone));

        match target {
            Some(index) => {
                self.slots[index] = Some(entry);
                self.count += 1;
                Ok(index)
            }
            None => Err(TableError::Full {
                capacity: self.capacity(),
            }),
        }
    }

    fn probe_sequence(&self, username: &Username) -> ProbeSequence {
        let capacity = self.capacity();
        ProbeSequence {
            base: hash_username(username, capacity),
            step: 0,
            capacity,
        }
    }
}

/// Polynomial string hash: sum of `byte_i * 7^i`, reduced modulo `capacity`.
///
/// Arithmetic wraps at 2^64. Capacities are powers of two, so the reduction
/// of the wrapped sum equals the reduction of the exact sum.
pub fn hash_username(username: &Username, capacity: usize) -> usize {
    let mut weight: u64 = 1;
    let mut sum: u64 = 0;
    for &byte in username.as_bytes() {
        sum = sum.wrapping_add(u64::from(byte).wrapping_mul(weight));
        weight = weight.wrapping_mul(HASH_PRIME);
    }
    (sum % capacity as u64) as usize
}

/// Slot indices `base + i(i+1)/2 mod capacity` for `i` in `0..capacity`
struct ProbeSequence {
    base: usize,
    step: usize,
    capacity: usize,
}

impl Iterator for ProbeSequence {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.step >= self.capacity {
            return None;
        }
        let i = self.step;
        self.step += 1;
        let offset = (i * (i + 1) / 2) % self.capacity;
        Some((self.base + offset) % self.capacity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("username not found")]
    NotFound,

    #[error("address table full at capacity {capacity}")]
    Full { capacity: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    use std::collections::{HashMap, HashSet};
    use std::net::Ipv4Addr;

    fn name(s: &str) -> Username {
        Username::new(s).unwrap()
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    /// Usernames whose base slot is `target` in a table of `capacity`
    fn colliding_names(capacity: usize, target: usize, n: usize) -> Vec<Username> {
        (0..)
            .map(|i| name(&format!("user{}", i)))
            .filter(|u| hash_username(u, capacity) == target)
            .take(n)
            .collect()
    }

    #[test]
    fn test_insert_then_find() {
        let mut table = AddressTable::new();
        table.insert(name("alice"), v4(203, 0, 113, 5)).unwrap();

        assert!(table.find(&name("alice")).is_ok());
        assert_eq!(table.get(&name("alice")), Some(v4(203, 0, 113, 5)));
        assert_eq!(table.find(&name("bob")), Err(TableError::NotFound));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_probe_sequence_covers_table() {
        for capacity in [2usize, 8, 32, 1024] {
            let seq = ProbeSequence { base: 3 % capacity, step: 0, capacity };
            let visited: HashSet<usize> = seq.collect();
            assert_eq!(visited.len(), capacity);
        }
    }

    #[test]
    fn test_reinsert_updates_in_place() {
        let mut table = AddressTable::new();
        let first = table.insert(name("alice"), v4(10, 0, 0, 1)).unwrap();
        let index = table.find(&name("alice")).unwrap();

        let second = table.insert(name("alice"), "2001:db8::1".parse().unwrap()).unwrap();

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::Updated);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&name("alice")).unwrap(), index);
        assert_eq!(table.get(&name("alice")), Some("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_delete_marks_tombstone() {
        let mut table = AddressTable::new();
        table.insert(name("alice"), v4(10, 0, 0, 1)).unwrap();
        table.delete(&name("alice")).unwrap();

        assert_eq!(table.len(), 0);
        assert!(!table.contains(&name("alice")));
        assert_eq!(table.delete(&name("alice")), Err(TableError::NotFound));
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn test_tombstone_does_not_end_probe() {
        let capacity = 32;
        let names = colliding_names(capacity, 5, 3);
        let mut table = AddressTable::with_limits(capacity, capacity);
        for (i, n) in names.iter().enumerate() {
            table.insert(n.clone(), v4(10, 0, 0, i as u8)).unwrap();
        }

        // Removing the head of the chain must leave the rest reachable.
        table.delete(&names[0]).unwrap();
        assert_eq!(table.get(&names[1]), Some(v4(10, 0, 0, 1)));
        assert_eq!(table.get(&names[2]), Some(v4(10, 0, 0, 2)));
    }

    #[test]
    fn test_tombstoned_slot_is_reused() {
        let capacity = 32;
        let names = colliding_names(capacity, 9, 2);
        let mut table = AddressTable::with_limits(capacity, capacity);

        table.insert(names[0].clone(), v4(10, 0, 0, 1)).unwrap();
        let freed = table.find(&names[0]).unwrap();
        assert_eq!(freed, 9);
        table.delete(&names[0]).unwrap();

        table.insert(names[1].clone(), v4(10, 0, 0, 2)).unwrap();
        assert_eq!(table.find(&names[1]).unwrap(), freed);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_grows_before_load_factor() {
        let mut table = AddressTable::with_limits(8, 1024);
        for i in 0..5u8 {
            table.insert(name(&format!("peer{}", i)), v4(10, 0, 0, i)).unwrap();
        }
        assert_eq!(table.capacity(), 8);

        // A sixth entry in 8 slots would reach 0.67.
        table.insert(name("peer5"), v4(10, 0, 0, 5)).unwrap();
        assert_eq!(table.capacity(), 16);
        assert!((table.len() as f64) / (table.capacity() as f64) < LOAD_FACTOR);
    }

    #[test]
    fn test_grow_preserves_entries_and_drops_tombstones() {
        let mut table = AddressTable::with_limits(32, 1024);
        for i in 0..10u8 {
            table.insert(name(&format!("peer{}", i)), v4(10, 0, 1, i)).unwrap();
        }
        table.delete(&name("peer3")).unwrap();

        table.grow();

        assert_eq!(table.capacity(), 64);
        assert_eq!(table.len(), 9);
        assert_eq!(table.slots.iter().flatten().count(), 9);
        for i in (0..10u8).filter(|i| *i != 3) {
            assert_eq!(table.get(&name(&format!("peer{}", i))), Some(v4(10, 0, 1, i)));
        }
        assert!(!table.contains(&name("peer3")));
    }

    #[test]
    fn test_grow_rehashes_a_completely_full_arena() {
        let mut table = AddressTable::with_limits(4, 8);
        // fill every slot, bypassing the load factor check in insert
        for i in 0..4u8 {
            table.place(DirectoryEntry::new(name(&format!("peer{}", i)), v4(10, 0, 2, i))).unwrap();
        }
        assert_eq!(table.len(), table.capacity());

        table.grow();

        assert_eq!(table.capacity(), 8);
        assert_eq!(table.len(), 4);
        for i in 0..4u8 {
            assert_eq!(table.get(&name(&format!("peer{}", i))), Some(v4(10, 0, 2, i)));
        }
    }

    #[test]
    fn test_grow_is_noop_at_max() {
        let mut table = AddressTable::with_limits(16, 16);
        table.insert(name("alice"), v4(10, 0, 0, 1)).unwrap();
        table.grow();
        assert_eq!(table.capacity(), 16);
        assert!(table.contains(&name("alice")));
    }

    #[test]
    fn test_full_table_reports_error() {
        let mut table = AddressTable::with_limits(4, 4);
        for i in 0..4u8 {
            table.insert(name(&format!("peer{}", i)), v4(10, 0, 0, i)).unwrap();
        }
        assert_eq!(table.len(), 4);

        let err = table.insert(name("late"), v4(10, 0, 0, 9)).unwrap_err();
        assert_eq!(err, TableError::Full { capacity: 4 });

        // Existing names can still be updated.
        assert_eq!(
            table.insert(name("peer0"), v4(10, 0, 0, 7)).unwrap(),
            InsertOutcome::Updated
        );
    }

    #[test]
    fn test_random_workload_matches_model() {
        let mut rng = rand::thread_rng();
        let mut table = AddressTable::with_limits(8, 1 << 12);
        let mut model: HashMap<Username, IpAddr> = HashMap::new();

        for _ in 0..2000 {
            let len = rng.gen_range(1..=6);
            let raw: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            let user = name(&raw);

            if rng.gen_bool(0.2) {
                let expected = model.remove(&user).map(|_| ()).ok_or(TableError::NotFound);
                assert_eq!(table.delete(&user), expected);
            } else {
                let addr = v4(rng.gen(), rng.gen(), rng.gen(), rng.gen());
                table.insert(user.clone(), addr).unwrap();
                model.insert(user, addr);
            }

            assert!(table.len() <= table.capacity());
        }

        assert_eq!(table.len(), model.len());
        for (user, addr) in &model {
            assert_eq!(table.get(user), Some(*addr));
        }
        assert_eq!(table.iter().count(), model.len());
    }
}
