//! Kernel Configuration
//!
//! Sizing of simulated RAM, the per-process address space and the process
//! table, plus scheduler defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{KernelError, KernelResult};

/// Upper bound on configured priority and time slice
pub const MAX_TIME_SLICE: u32 = u32::MAX / 2;

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Simulated physical memory in bytes
    pub memory_size: usize,

    /// Low memory reserved for the kernel image in bytes
    pub kernel_memory: usize,

    /// Virtual address space size per process in bytes
    pub task_size: u64,

    /// Scheduler slot count (hard ceiling on live processes)
    pub max_tasks: usize,

    /// Static priority given to new tasks
    pub default_priority: u32,

    /// Initial time slice given to new tasks
    pub default_counter: u32,

    /// Timer frequency in Hz
    pub hz: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            memory_size: crate::MEMORY_SIZE,
            kernel_memory: crate::KERNEL_MEMORY,
            task_size: crate::TASK_SIZE,
            max_tasks: crate::NR_TASKS,
            default_priority: crate::DEF_PRIORITY,
            default_counter: crate::DEF_COUNTER,
            hz: crate::HZ,
        }
    }
}

impl KernelConfig {
    /// Small machine for tests: 64 frames, nothing reserved, 8 slots
    pub fn small() -> Self {
        Self {
            memory_size: 64 * crate::PAGE_SIZE,
            kernel_memory: 0,
            max_tasks: 8,
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> KernelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> KernelResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> KernelResult<()> {
        let page = crate::PAGE_SIZE;

        if self.memory_size == 0 || self.memory_size % page != 0 {
            return Err(KernelError::InvalidConfiguration(format!(
                "memory_size must be a non-zero multiple of {} bytes",
                page
            )));
        }

        if self.kernel_memory % page != 0 {
            return Err(KernelError::InvalidConfiguration(format!(
                "kernel_memory must be a multiple of {} bytes",
                page
            )));
        }

        if self.kernel_memory >= self.memory_size {
            return Err(KernelError::InvalidConfiguration(
                "kernel_memory leaves no frames for processes".into(),
            ));
        }

        if self.task_size == 0 || self.task_size % page as u64 != 0 {
            return Err(KernelError::InvalidConfiguration(format!(
                "task_size must be a non-zero multiple of {} bytes",
                page
            )));
        }

        if self.max_tasks == 0 {
            return Err(KernelError::InvalidConfiguration("max_tasks must be at least 1".into()));
        }

        if self.default_priority > MAX_TIME_SLICE || self.default_counter > MAX_TIME_SLICE {
            return Err(KernelError::InvalidConfiguration(format!(
                "default_priority and default_counter must not exceed {}",
                MAX_TIME_SLICE
            )));
        }

        if self.hz == 0 {
            return Err(KernelError::InvalidConfiguration("hz must be at least 1".into()));
        }

        Ok(())
    }

    /// Total physical frames
    pub fn total_frames(&self) -> usize {
        self.memory_size / crate::PAGE_SIZE
    }

    /// Frames permanently reserved for the kernel
    pub fn reserved_frames(&self) -> usize {
        self.kernel_memory / crate::PAGE_SIZE
    }

    /// Milliseconds per timer tick
    pub fn tick_ms(&self) -> u32 {
        1000 / self.hz
    }
}
