use {
    crate::{error::ConfigError, trace_log::TraceLog},
    anyhow::{bail, Context, Result},
    serde::Deserialize,
    std::path::Path,
};

/// Receive path configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RxConfig {
    /// Payload bytes per pool buffer. Default: 2048.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Buffers owned by each worker's pool. Default: 16384.
    #[serde(default = "default_pool_buffers")]
    pub pool_buffers: usize,

    /// Chain heads per dispatched frame, and the refill batch. Default: 256.
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// Largest frame a descriptor device reads in one go. Default: 1500.
    #[serde(default = "default_mtu_bytes")]
    pub mtu_bytes: usize,

    /// Devices one scheduler can hold. Default: 64.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,

    /// Chains to record in the trace log at startup. Default: 0.
    #[serde(default)]
    pub trace_budget: u32,

    /// Event trace log.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Descriptor device provisioning.
    #[serde(default)]
    pub descriptor: DescriptorConfig,

    /// Shared-memory ring devices.
    #[serde(default)]
    pub ring: RingConfig,
}

/// Event trace log configuration. No records means the log stays unconfigured.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceConfig {
    #[serde(default)]
    pub records: usize,

    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DescriptorConfig {
    /// Refuse to create descriptor devices.
    #[serde(default)]
    pub disabled: bool,

    /// Kernel receive queue size in bytes; 0 keeps the kernel default.
    #[serde(default)]
    pub recv_buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RingConfig {
    /// Sub-rings per device. Default: 1.
    #[serde(default = "default_rings")]
    pub rings: usize,

    /// Slots per sub-ring. Default: 1024.
    #[serde(default = "default_slots")]
    pub slots: u32,

    /// Bytes per slot buffer. Default: 2048.
    #[serde(default = "default_slot_size")]
    pub slot_size: u16,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            rings: default_rings(),
            slots: default_slots(),
            slot_size: default_slot_size(),
        }
    }
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            pool_buffers: default_pool_buffers(),
            frame_size: default_frame_size(),
            mtu_bytes: default_mtu_bytes(),
            max_devices: default_max_devices(),
            trace_budget: 0,
            trace: TraceConfig::default(),
            descriptor: DescriptorConfig::default(),
            ring: RingConfig::default(),
        }
    }
}

fn default_buffer_size() -> usize {
    crate::buffer::DEFAULT_BUFFER_SIZE
}

fn default_pool_buffers() -> usize {
    16 * 1024
}

fn default_frame_size() -> usize {
    crate::FRAME_SIZE
}

fn default_mtu_bytes() -> usize {
    crate::fd_rx::DEFAULT_MTU_BYTES
}

fn default_max_devices() -> usize {
    64
}

fn default_rings() -> usize {
    1
}

fn default_slots() -> u32 {
    1024
}

fn default_slot_size() -> u16 {
    2048
}

impl RxConfig {
    /// Load and validate a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: RxConfig = serde_yaml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            bail!("buffer_size must be positive");
        }
        if self.frame_size == 0 {
            bail!("frame_size must be positive");
        }
        if self.pool_buffers < self.mtu_buffers() {
            bail!(
                "pool_buffers ({}) cannot hold one {}-byte frame",
                self.pool_buffers,
                self.mtu_bytes
            );
        }
        if self.frame_size < self.mtu_buffers() {
            bail!(
                "frame_size ({}) is below the {} buffers one {}-byte frame needs",
                self.frame_size,
                self.mtu_buffers(),
                self.mtu_bytes
            );
        }
        if self.pool_buffers > u32::MAX as usize {
            bail!("pool_buffers must fit a 32-bit buffer handle");
        }
        if self.max_devices == 0 {
            bail!("max_devices must be positive");
        }
        if self.ring.rings == 0 {
            bail!("ring.rings must be positive");
        }
        if self.ring.slots < 2 {
            bail!("ring.slots must be at least 2");
        }
        if self.ring.slot_size == 0 {
            bail!("ring.slot_size must be positive");
        }
        if self.trace.enabled && self.trace.records == 0 {
            bail!("trace.enabled needs trace.records");
        }
        Ok(())
    }

    /// buffers one MTU-sized read needs
    pub fn mtu_buffers(&self) -> usize {
        self.mtu_bytes.div_ceil(self.buffer_size.max(1)).max(1)
    }

    /// size and arm `log` per the `trace` section; no-op without records
    pub fn apply_trace(&self, log: &TraceLog) -> Result<Option<usize>, ConfigError> {
        if self.trace.records == 0 {
            return Ok(None);
        }
        log.configure(self.trace.records, self.trace.enabled).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RxConfig::from_yaml("{}").unwrap();
        assert_eq!(cfg.buffer_size, 2048);
        assert_eq!(cfg.frame_size, 256);
        assert_eq!(cfg.mtu_bytes, 1500);
        assert_eq!(cfg.mtu_buffers(), 1);
        assert!(!cfg.descriptor.disabled);
        assert_eq!(cfg.ring.slots, 1024);
    }

    #[test]
    fn test_full_document() {
        let cfg = RxConfig::from_yaml(
            r#"
buffer_size: 512
pool_buffers: 4096
mtu_bytes: 9000
trace_budget: 10
trace:
  records: 100
  enabled: true
descriptor:
  disabled: true
ring:
  rings: 4
  slots: 256
"#,
        )
        .unwrap();
        assert_eq!(cfg.mtu_buffers(), 18);
        assert_eq!(cfg.trace_budget, 10);
        assert!(cfg.descriptor.disabled);
        assert_eq!(cfg.ring.rings, 4);
        assert_eq!(cfg.ring.slot_size, 2048);

        let log = TraceLog::new();
        assert_eq!(cfg.apply_trace(&log), Ok(Some(128)));
        assert!(log.is_enabled());
    }

    #[test]
    fn test_rejects_inconsistent_values() {
        assert!(RxConfig::from_yaml("buffer_size: 0").is_err());
        assert!(RxConfig::from_yaml("pool_buffers: 2\nbuffer_size: 512").is_err());
        assert!(RxConfig::from_yaml("trace:\n  enabled: true").is_err());
        assert!(RxConfig::from_yaml("ring:\n  slots: 1").is_err());
        // twelve 128-byte buffers per frame, refilled four at a time
        assert!(RxConfig::from_yaml("buffer_size: 128\nframe_size: 4\npool_buffers: 64").is_err());
        assert!(RxConfig::from_yaml("buffer_size: 128\nframe_size: 12\npool_buffers: 64").is_ok());
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = RxConfig::load(Path::new("/nonexistent/rx.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/rx.yaml"));
    }

    #[test]
    fn test_unconfigured_trace_left_alone() {
        let log = TraceLog::new();
        assert_eq!(RxConfig::default().apply_trace(&log), Ok(None));
        assert_eq!(log.capacity(), 0);
    }
}
