//! In-process configuration for the execution core.
//!
//! Parsing CLI flags or config files is explicitly out of scope for this
//! crate; embedders build a [`CoreConfig`] themselves. `doscore-harness`
//! (this crate's demo binary) uses `clap` to fill one in for manual testing.

/// Which execution backend drives guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Linux VM86 mode via `vm86()`/`vm86old()`.
    V86,
    /// KVM with VME-assisted V86 monitor mode.
    Kvm,
    /// Pure software instruction interpreter.
    Interpreter,
    /// Just-in-time translating backend.
    Jit,
}

/// Top-level configuration for a [`crate::dispatcher::CoreState`].
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub backend: BackendKind,
    /// Guest low-memory size in bytes (conventional memory, <= 640KB in
    /// real DOS but kept configurable for test harnesses).
    pub lowmem_size: usize,
    /// Total addressable guest memory, including HMA and XMS pool.
    pub total_mem_size: usize,
    /// Linear address of the HLT instruction block dosemu2 places handlers
    /// behind (see spec §6 guest memory layout table).
    pub hlt_block_base: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Interpreter,
            lowmem_size: 640 * 1024,
            total_mem_size: 16 * 1024 * 1024,
            hlt_block_base: 0xf_0000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_interpreter_backed() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.backend, BackendKind::Interpreter);
        assert!(cfg.lowmem_size <= cfg.total_mem_size);
    }
}
