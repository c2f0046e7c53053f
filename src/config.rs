use std::time::Duration;

/// Tunables of the memory manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemConfig {
    /// Delay before a process-wide restore runs.
    pub restore_delay: Duration,

    /// Delay before a restore triggered by a host-memory change runs. Roughly one scheduling
    /// tick, so a burst of per-page invalidations collapses into one restore pass.
    pub userptr_restore_delay: Duration,

    /// How many times a host-page fetch may be retried when the pages change again while
    /// the locks were dropped.
    pub host_fault_retries: u32,

    /// Wait for reserved objects to go idle before releasing a reservation after a page-table
    /// update.
    pub wait_idle_after_map: bool,

    /// Upper bound on system memory (GTT and userptr) charged by allocations.
    pub system_mem_limit: u64,

    /// Upper bound on VRAM charged by allocations.
    pub vram_limit: u64,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            restore_delay: Duration::from_millis(1),
            userptr_restore_delay: Duration::from_millis(1),
            host_fault_retries: 5,
            wait_idle_after_map: true,
            system_mem_limit: u64::MAX,
            vram_limit: u64::MAX,
        }
    }
}

impl MemConfig {
    /// Overrides configuration fields based on environment variables.
    #[must_use]
    pub fn override_from_env(self) -> Self {
        self.override_from(|key| std::env::var(key).ok())
    }

    fn override_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| -> Option<u64> {
            let val = lookup(key)?;
            match val.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!("Ignoring {key}={val}: not an unsigned integer");
                    None
                }
            }
        };

        if let Some(ms) = parse("KFD_MEM_RESTORE_DELAY_MS") {
            self.restore_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse("KFD_MEM_USERPTR_RESTORE_DELAY_MS") {
            self.userptr_restore_delay = Duration::from_millis(ms);
        }
        if let Some(retries) = parse("KFD_MEM_HOST_FAULT_RETRIES") {
            self.host_fault_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        }
        if let Some(limit) = parse("KFD_MEM_SYSTEM_LIMIT") {
            self.system_mem_limit = limit;
        }
        if let Some(limit) = parse("KFD_MEM_VRAM_LIMIT") {
            self.vram_limit = limit;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("KFD_MEM_USERPTR_RESTORE_DELAY_MS", "10"),
            ("KFD_MEM_HOST_FAULT_RETRIES", "2"),
            ("KFD_MEM_VRAM_LIMIT", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let config =
            MemConfig::default().override_from(|key| env.get(key).map(|v| (*v).to_string()));

        assert_eq!(config.userptr_restore_delay, Duration::from_millis(10));
        assert_eq!(config.host_fault_retries, 2);
        assert_eq!(config.vram_limit, u64::MAX);
        assert_eq!(config.restore_delay, MemConfig::default().restore_delay);
    }
}
