//! String interning with lock counts and a two-phase mark/sweep collector.
//!
//! Every runtime string lives in the [`StringTable`] and is referred to by its
//! [`Word`] index. A string's index is stable for as long as it lives. Owners
//! that keep indices around (arrays, registers, thread stacks, modules)
//! implement [`RefStrings`] so a collection pass can find them.

use std::collections::{BTreeSet, HashMap};
use std::io::{self, Read, Write};

use crate::error::ReadError;
use crate::serial::{read_bool, read_string, read_vln, write_bool, write_string, write_vln};
use crate::Word;

/// Hash used for interning. `h = h * 5 + byte`, wrapping.
pub fn str_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, &b| h.wrapping_mul(5).wrapping_add(b as u32))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcsString {
    bytes: Vec<u8>,
    hash: u32,
    idx: Word,
    lock: u32,
    marked: bool,
}

impl AcsString {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn index(&self) -> Word {
        self.idx
    }

    pub fn lock_count(&self) -> u32 {
        self.lock
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy UTF-8 view, for script names and log output.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Something that holds string indices and must keep them alive across a
/// collection pass.
pub trait RefStrings {
    fn ref_strings(&self, strings: &mut StringTable);
}

#[derive(Debug, Default)]
pub struct StringTable {
    slots: Vec<Option<AcsString>>,
    lookup: HashMap<u32, Vec<Word>>,
    free: BTreeSet<Word>,
    collecting: bool,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the index of the string with this content, creating it if
    /// absent. `hash` must be `str_hash(bytes)`.
    pub fn get_or_intern(&mut self, bytes: &[u8], hash: u32) -> Word {
        if let Some(bucket) = self.lookup.get(&hash) {
            for &idx in bucket {
                if let Some(Some(s)) = self.slots.get(idx as usize) {
                    if s.bytes == bytes {
                        return idx;
                    }
                }
            }
        }

        let idx = match self.free.pop_first() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as Word
            }
        };

        self.slots[idx as usize] = Some(AcsString {
            bytes: bytes.to_vec(),
            hash,
            idx,
            lock: 0,
            // Strings born during a collection pass survive it.
            marked: self.collecting,
        });
        self.lookup.entry(hash).or_default().push(idx);
        idx
    }

    pub fn intern(&mut self, bytes: &[u8]) -> Word {
        self.get_or_intern(bytes, str_hash(bytes))
    }

    /// `None` for out-of-range or collected indices.
    pub fn get(&self, idx: Word) -> Option<&AcsString> {
        self.slots.get(idx as usize)?.as_ref()
    }

    pub fn bytes(&self, idx: Word) -> Option<&[u8]> {
        self.get(idx).map(AcsString::bytes)
    }

    pub fn contains(&self, idx: Word) -> bool {
        self.get(idx).is_some()
    }

    pub fn lock(&mut self, idx: Word) {
        if let Some(Some(s)) = self.slots.get_mut(idx as usize) {
            s.lock = s.lock.saturating_add(1);
        }
    }

    /// Reaching zero only makes the string collectable.
    pub fn unlock(&mut self, idx: Word) {
        if let Some(Some(s)) = self.slots.get_mut(idx as usize) {
            s.lock = s.lock.saturating_sub(1);
        }
    }

    /// Marks a live index as referenced for the current pass. Unknown
    /// indices are ignored, which lets owners mark conservatively.
    pub fn mark(&mut self, idx: Word) {
        if let Some(Some(s)) = self.slots.get_mut(idx as usize) {
            s.marked = true;
        }
    }

    pub fn collect_begin(&mut self) {
        self.collecting = true;
        for s in self.slots.iter_mut().flatten() {
            s.marked = false;
        }
    }

    /// Frees every unlocked, unmarked string. Returns how many were freed.
    pub fn collect_end(&mut self) -> usize {
        self.collecting = false;
        let mut freed = 0;

        for slot in self.slots.iter_mut() {
            let dead = matches!(slot, Some(s) if s.lock == 0 && !s.marked);
            if !dead {
                continue;
            }
            if let Some(s) = slot.take() {
                if let Some(bucket) = self.lookup.get_mut(&s.hash) {
                    bucket.retain(|&i| i != s.idx);
                    if bucket.is_empty() {
                        self.lookup.remove(&s.hash);
                    }
                }
                self.free.insert(s.idx);
                freed += 1;
            }
        }

        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
            self.free.remove(&(self.slots.len() as Word));
        }

        log::trace!("string collection freed {freed}, {} slots remain", self.slots.len());
        freed
    }

    /// Number of slots, free ones included.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live strings.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &AcsString> {
        self.slots.iter().flatten()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.lookup.clear();
        self.free.clear();
        self.collecting = false;
    }

    pub(crate) fn lock_counts(&self) -> Vec<(Word, u32)> {
        self.iter().map(|s| (s.idx, s.lock)).collect()
    }

    pub(crate) fn restore_lock_counts(&mut self, counts: &[(Word, u32)]) {
        for &(idx, lock) in counts {
            if let Some(Some(s)) = self.slots.get_mut(idx as usize) {
                s.lock = lock;
            }
        }
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        write_vln(w, self.slots.len())?;
        for slot in &self.slots {
            write_bool(w, slot.is_some())?;
            if let Some(s) = slot {
                write_string(w, &s.bytes)?;
                write_vln(w, s.lock)?;
            }
        }
        Ok(())
    }

    /// Replaces the whole table. Indices come back exactly as saved.
    pub fn read<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<(), ReadError> {
        self.clear();

        let count = read_vln::<usize, _>(r)?;
        for idx in 0..count {
            let idx = Word::try_from(idx).map_err(|_| ReadError::Overflow("Word"))?;
            if !read_bool(r)? {
                self.slots.push(None);
                self.free.insert(idx);
                continue;
            }

            let bytes = read_string(r)?;
            let lock = read_vln::<u32, _>(r)?;
            let hash = str_hash(&bytes);
            self.lookup.entry(hash).or_default().push(idx);
            self.slots.push(Some(AcsString {
                bytes,
                hash,
                idx,
                lock,
                marked: false,
            }));
        }

        if matches!(self.slots.last(), Some(None)) {
            return Err(ReadError::malformed("string table ends with a free slot"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn hash_matches_fold() {
        assert_eq!(str_hash(b""), 0);
        assert_eq!(str_hash(b"a"), 97);
        assert_eq!(str_hash(b"ab"), 97 * 5 + 98);
    }

    #[test]
    fn interning_is_idempotent() {
        let mut t = StringTable::new();
        let a = t.intern(b"door");
        let b = t.intern(b"lift");
        assert_ne!(a, b);
        assert_eq!(t.intern(b"door"), a);
        assert_eq!(t.get(a).unwrap().bytes(), b"door");
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn lock_unlock_balance() {
        let mut t = StringTable::new();
        let a = t.intern(b"x");
        t.lock(a);
        for _ in 0..3 {
            t.lock(a);
        }
        for _ in 0..3 {
            t.unlock(a);
        }
        assert_eq!(t.get(a).unwrap().lock_count(), 1);
    }

    #[test]
    fn collection_keeps_locked_and_marked() {
        let mut t = StringTable::new();
        let dead = t.intern(b"dead");
        let locked = t.intern(b"locked");
        let marked = t.intern(b"marked");
        let tail = t.intern(b"tail");
        t.lock(locked);

        t.collect_begin();
        t.mark(marked);
        assert_eq!(t.collect_end(), 2);

        assert_eq!(t.get(locked).unwrap().bytes(), b"locked");
        assert_eq!(t.get(marked).unwrap().bytes(), b"marked");
        assert!(t.get(dead).is_none());
        assert!(t.get(tail).is_none());
        // trailing free slot is truncated, interior one is recycled
        assert_eq!(t.capacity(), 3);
        assert_eq!(t.intern(b"new"), dead);
        assert_eq!(t.intern(b"marked"), marked);
    }

    #[test]
    fn strings_interned_mid_collection_survive() {
        let mut t = StringTable::new();
        t.collect_begin();
        let s = t.intern(b"fresh");
        t.collect_end();
        assert!(t.get(s).is_some());
    }

    #[test]
    fn save_load_keeps_indices_and_locks() {
        let mut t = StringTable::new();
        let a = t.intern(b"a");
        let b = t.intern(b"b");
        let c = t.intern(b"c");
        t.lock(a);
        t.lock(c);
        t.lock(c);
        t.collect_begin();
        t.collect_end();
        assert!(t.get(b).is_none());

        let mut out = Vec::new();
        t.write(&mut out).unwrap();

        let mut u = StringTable::new();
        u.intern(b"garbage");
        u.read(&mut Cursor::new(out)).unwrap();
        assert_eq!(u.get(a).unwrap().bytes(), b"a");
        assert_eq!(u.get(c).unwrap().lock_count(), 2);
        assert!(u.get(b).is_none());
        assert_eq!(u.intern(b"c"), c);
        assert_eq!(u.intern(b"z"), b);
    }
}
