use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use crate::error::ReadError;
use crate::serial::{read_vln, write_vln};
use crate::string::{RefStrings, StringTable};
use crate::Word;

/// Sparse word-indexed array. Absent keys read as zero.
///
/// Plain stores drop zero values. String-typed stores (`set_str`) keep the
/// entry so the lock they hold on string 0 stays accounted for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Array {
    data: BTreeMap<Word, Word>,
}

impl Array {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, idx: Word) -> Word {
        self.data.get(&idx).copied().unwrap_or(0)
    }

    pub fn set(&mut self, idx: Word, value: Word) {
        if value == 0 {
            self.data.remove(&idx);
        } else {
            self.data.insert(idx, value);
        }
    }

    /// Stores a string index, locking it and unlocking the previous one.
    pub fn set_str(&mut self, idx: Word, value: Word, strings: &mut StringTable) {
        strings.lock(value);
        if let Some(old) = self.data.insert(idx, value) {
            strings.unlock(old);
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Clears a string-typed array, releasing every lock it held.
    pub fn clear_str(&mut self, strings: &mut StringTable) {
        for (_, v) in std::mem::take(&mut self.data) {
            strings.unlock(v);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Word, Word)> + '_ {
        self.data.iter().map(|(&k, &v)| (k, v))
    }

    pub fn write<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        write_vln(w, self.data.len())?;
        for (&k, &v) in &self.data {
            write_vln(w, k)?;
            write_vln(w, v)?;
        }
        Ok(())
    }

    pub fn read<R: Read + ?Sized>(r: &mut R) -> Result<Self, ReadError> {
        let mut data = BTreeMap::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            let k = read_vln::<Word, _>(r)?;
            let v = read_vln::<Word, _>(r)?;
            data.insert(k, v);
        }
        Ok(Self { data })
    }
}

impl RefStrings for Array {
    fn ref_strings(&self, strings: &mut StringTable) {
        for &v in self.data.values() {
            strings.mark(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    #[test]
    fn sparse_reads_default_to_zero() {
        let mut a = Array::new();
        a.set(1_000_000, 7);
        assert_eq!(a.get(1_000_000), 7);
        assert_eq!(a.get(3), 0);
        a.set(1_000_000, 0);
        assert!(a.is_empty());
    }

    #[test]
    fn string_stores_move_locks() {
        let mut strings = StringTable::new();
        let x = strings.intern(b"x");
        let y = strings.intern(b"y");

        let mut a = Array::new();
        a.set_str(0, x, &mut strings);
        a.set_str(1, x, &mut strings);
        assert_eq!(strings.get(x).unwrap().lock_count(), 2);

        a.set_str(0, y, &mut strings);
        assert_eq!(strings.get(x).unwrap().lock_count(), 1);
        assert_eq!(strings.get(y).unwrap().lock_count(), 1);

        a.clear_str(&mut strings);
        assert_eq!(strings.get(x).unwrap().lock_count(), 0);
        assert_eq!(strings.get(y).unwrap().lock_count(), 0);
    }

    #[test]
    fn serialized_array_reads_back() {
        let mut a = Array::new();
        a.set(2, 20);
        a.set(9, 90);
        let mut out = Vec::new();
        a.write(&mut out).unwrap();
        assert_eq!(Array::read(&mut Cursor::new(out)).unwrap(), a);
    }
}
