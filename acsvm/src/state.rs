//! Whole-environment save and load.
//!
//! Layout: `ACSS` signature, little-endian u32 version, then VLN encoded
//! settings, the string table, the names of every loaded module and the
//! scope tree with its threads. Module code is not stored; modules are
//! fetched again by name on load. Host data written by
//! [`crate::EnvHooks::save_extra`] follows at the end.

use std::collections::HashMap;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::environment::Environment;
use crate::error::{Error, ReadError, Result};
use crate::module::ModuleName;
use crate::scope::GlobalScope;
use crate::serial::{read_sign, read_vln, write_sign, write_vln};

pub const STATE_SIGN: [u8; 4] = *b"ACSS";
pub const STATE_VERSION: u32 = 1;

impl Environment {
    /// Serializes the environment. Fails with [`Error::Busy`] while scripts
    /// are executing.
    pub fn save_state<W: Write>(&mut self, w: &mut W) -> Result<()> {
        if self.in_exec {
            return Err(Error::Busy);
        }

        write_sign(w, &STATE_SIGN)?;
        w.write_u32::<LittleEndian>(STATE_VERSION)?;
        write_vln(w, self.config.branch_limit)?;
        write_vln(w, self.rng)?;

        self.strings.write(w)?;

        let index: HashMap<&ModuleName, usize> = self.modules.keys().enumerate().map(|(i, n)| (n, i)).collect();
        write_vln(w, self.modules.len())?;
        for name in self.modules.keys() {
            name.write(w)?;
        }
        let module_index = |name: &ModuleName| index.get(name).copied().unwrap_or(0);

        write_vln(w, self.scopes.globals.len())?;
        for g in self.scopes.globals.values() {
            g.write(w, &module_index)?;
        }

        if let Some(save) = self.hooks.save_extra.as_mut() {
            save(w)?;
        }
        log::debug!(
            "saved state: {} strings, {} modules, {} global scopes",
            self.strings.len(),
            self.modules.len(),
            self.scopes.globals.len()
        );
        Ok(())
    }

    /// Replaces the environment's contents with a saved state.
    ///
    /// Modules are re-fetched through the loader hook, or from bytes given
    /// to [`Environment::load_module_bytes`] earlier. On error the
    /// environment is left empty or partly restored.
    pub fn load_state<R: Read>(&mut self, r: &mut R) -> Result<()> {
        if self.in_exec {
            return Err(Error::Busy);
        }

        read_sign(r, &STATE_SIGN)?;
        let version = r.read_u32::<LittleEndian>().map_err(ReadError::from)?;
        if version != STATE_VERSION {
            return Err(ReadError::Version(version).into());
        }
        let branch_limit = read_vln(r)?;
        let rng = read_vln(r)?;

        self.scopes.clear();
        self.modules.clear();
        self.strings.read(r)?;
        // reloading modules locks their strings again
        let locks = self.strings.lock_counts();

        let mut modules = Vec::new();
        for _ in 0..read_vln::<usize, _>(r)? {
            let name = ModuleName::read(r)?;
            modules.push(self.get_module(&name)?);
        }

        for _ in 0..read_vln::<usize, _>(r)? {
            let global = GlobalScope::read(r, &modules)?;
            self.scopes.globals.insert(global.id(), global);
        }
        self.strings.restore_lock_counts(&locks);

        self.config.branch_limit = branch_limit;
        self.rng = rng;

        if let Some(load) = self.hooks.load_extra.as_mut() {
            load(r)?;
        }
        log::debug!("loaded state: {} modules, {} strings", modules.len(), self.strings.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn rejects_foreign_data() {
        let mut env = Environment::default();
        let err = env.load_state(&mut Cursor::new(b"ACSV\x01\x00\x00\x00".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Read(ReadError::BadSignature { .. })));
    }

    #[test]
    fn rejects_future_version() {
        let mut env = Environment::default();
        let err = env.load_state(&mut Cursor::new(b"ACSS\x02\x00\x00\x00".to_vec())).unwrap_err();
        assert!(matches!(err, Error::Read(ReadError::Version(2))));
    }

    #[test]
    fn empty_environment_round_trips() {
        let mut env = Environment::default();
        env.set_branch_limit(99);
        let mut out = Vec::new();
        env.save_state(&mut out).unwrap();

        let mut restored = Environment::default();
        restored.load_state(&mut Cursor::new(out)).unwrap();
        assert_eq!(restored.branch_limit(), 99);
        assert!(!restored.has_active_thread());
    }
}
