use serde::{Deserialize, Serialize};

use crate::Word;

/// What the loader does with a raw opcode missing from the code table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownCodePolicy {
    /// Translate to a kill with reason `UnknownCode`; the opcode is assumed
    /// to carry no operands.
    #[default]
    Trap,
    /// Fail the module load.
    Error,
}

/// Settings of one [`crate::Environment`].
/// Please use [`VmConfigBuilder`] if you want to build it from code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Instructions a thread may run per tick before it is killed. 0 disables the limit.
    pub branch_limit: Word,
    /// Register count of every global and hub scope.
    pub scope_reg_count: Word,
    /// Array count of every global and hub scope.
    pub scope_arr_count: Word,
    /// First CallFunc index handed to host functions. Lower indices go
    /// through the built-in table.
    pub func_base: Word,
    pub unknown_code: UnknownCodePolicy,
    /// Start OPEN scripts of modules newly added to a map scope.
    pub start_open_on_add: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            branch_limit: 65536,
            scope_reg_count: 256,
            scope_arr_count: 256,
            func_base: 256,
            unknown_code: UnknownCodePolicy::Trap,
            start_open_on_add: false,
        }
    }
}

/// `VmConfigBuilder` is a convenience builder to create a `VmConfig` from code.
#[derive(Debug, Default)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branch_limit(mut self, limit: Word) -> Self {
        self.config.branch_limit = limit;
        self
    }

    pub fn with_scope_vars(mut self, reg_count: Word, arr_count: Word) -> Self {
        self.config.scope_reg_count = reg_count;
        self.config.scope_arr_count = arr_count;
        self
    }

    pub fn with_func_base(mut self, base: Word) -> Self {
        self.config.func_base = base;
        self
    }

    pub fn with_unknown_code(mut self, policy: UnknownCodePolicy) -> Self {
        self.config.unknown_code = policy;
        self
    }

    pub fn with_start_open_on_add(mut self, start: bool) -> Self {
        self.config.start_open_on_add = start;
        self
    }

    /// Retrieves the configuration built
    pub fn get(self) -> VmConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = VmConfigBuilder::new()
            .with_branch_limit(10)
            .with_unknown_code(UnknownCodePolicy::Error)
            .get();
        assert_eq!(config.branch_limit, 10);
        assert_eq!(config.unknown_code, UnknownCodePolicy::Error);
        assert_eq!(config.func_base, 256);
    }
}
