use std::path::Path;

use serde::Deserialize;

use crate::error::Error;

const DEFAULT_CONFIG_PATH: &str = "/etc/pcpurand.toml";
const PROC_FIPS_ENABLED: &str = "/proc/sys/crypto/fips_enabled";

pub const MIN_PAGE_SIZE: usize = 64;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const MAX_CPUS: usize = 4096;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Boot-time security mode. `None` defers to the kernel's setting.
    pub fips: Option<bool>,
    pub algorithm: String,
    /// Possible CPU count, 0 = detect.
    pub cpus: usize,
    /// Scratch page size, 0 = system page size.
    pub page_size: usize,
    pub resched_quantum_us: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            fips: None,
            algorithm: "stdrng".into(),
            cpus: 0,
            page_size: 0,
            resched_quantum_us: 2000,
        }
    }
}

impl ServiceConfig {
    /// Clamp fields to valid ranges.
    pub fn validate(&mut self) {
        if self.algorithm.trim().is_empty() {
            self.algorithm = "stdrng".into();
        }
        self.cpus = self.cpus.min(MAX_CPUS);
        if self.page_size != 0 {
            self.page_size = self
                .page_size
                .clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
                .next_power_of_two();
        }
        self.resched_quantum_us = self.resched_quantum_us.clamp(50, 1_000_000);
    }

    pub fn fips_enabled(&self) -> bool {
        self.fips.unwrap_or_else(read_proc_fips)
    }

    pub fn possible_cpus(&self) -> usize {
        if self.cpus != 0 {
            return self.cpus;
        }
        // SAFETY: sysconf has no memory-safety preconditions.
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
        (n.max(1) as usize).min(MAX_CPUS)
    }

    pub fn page_size(&self) -> usize {
        if self.page_size != 0 {
            return self.page_size;
        }
        // SAFETY: sysconf has no memory-safety preconditions.
        let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if n <= 0 {
            4096
        } else {
            (n as usize).clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrbgConfig {
    /// Generate calls served before the generator reseeds itself.
    pub max_requests: u64,
    pub max_request_bytes: usize,
}

impl Default for DrbgConfig {
    fn default() -> Self {
        Self {
            max_requests: 1 << 20,
            max_request_bytes: 1 << 16,
        }
    }
}

impl DrbgConfig {
    pub fn validate(&mut self) {
        self.max_requests = self.max_requests.clamp(1, 1 << 20);
        self.max_request_bytes = self.max_request_bytes.clamp(1, 1 << 16);
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub drbg: DrbgConfig,
}

impl Config {
    pub fn validate(&mut self) {
        self.service.validate();
        self.drbg.validate();
    }
}

/// `fips=1` in the kernel shows up here; anything unreadable means disabled.
fn read_proc_fips() -> bool {
    std::fs::read_to_string(PROC_FIPS_ENABLED)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map(|v| v != 0)
        .unwrap_or(false)
}

/// Load configuration from a TOML file.
///
/// - If `explicit_path` is `Some` and the file is missing, returns an error.
/// - If `explicit_path` is `None`, tries `/etc/pcpurand.toml`; if missing, returns defaults.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config, Error> {
    let path = match explicit_path {
        Some(p) => {
            if !p.exists() {
                return Err(Error::InvalidArgs(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_PATH);
            if !default.exists() {
                return Ok(Config::default());
            }
            default
        }
    };

    let contents = std::fs::read_to_string(path).map_err(|e| {
        Error::InvalidArgs(format!("failed to read config {}: {}", path.display(), e))
    })?;

    toml::from_str(&contents).map_err(|e| {
        Error::InvalidArgs(format!("failed to parse config {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_values() {
        let cfg = Config::default();
        assert_eq!(cfg.service.fips, None);
        assert_eq!(cfg.service.algorithm, "stdrng");
        assert_eq!(cfg.service.cpus, 0);
        assert_eq!(cfg.service.page_size, 0);
        assert_eq!(cfg.service.resched_quantum_us, 2000);
        assert_eq!(cfg.drbg.max_requests, 1 << 20);
        assert_eq!(cfg.drbg.max_request_bytes, 1 << 16);
    }

    #[test]
    fn test_validate_clamps() {
        let mut cfg = Config {
            service: ServiceConfig {
                algorithm: "  ".into(),
                cpus: 100_000,
                page_size: 3000,
                resched_quantum_us: 1,
                ..Default::default()
            },
            drbg: DrbgConfig {
                max_requests: 0,
                max_request_bytes: 1 << 20,
            },
        };
        cfg.validate();
        assert_eq!(cfg.service.algorithm, "stdrng");
        assert_eq!(cfg.service.cpus, MAX_CPUS);
        assert_eq!(cfg.service.page_size, 4096);
        assert_eq!(cfg.service.resched_quantum_us, 50);
        assert_eq!(cfg.drbg.max_requests, 1);
        assert_eq!(cfg.drbg.max_request_bytes, 1 << 16);
    }

    #[test]
    fn test_small_page_size_clamped_up() {
        let mut cfg = ServiceConfig {
            page_size: 1,
            ..Default::default()
        };
        cfg.validate();
        assert_eq!(cfg.page_size, MIN_PAGE_SIZE);
        assert_eq!(cfg.page_size(), MIN_PAGE_SIZE);
    }

    #[test]
    fn test_detected_values_are_sane() {
        let cfg = ServiceConfig::default();
        assert!(cfg.possible_cpus() >= 1);
        let page = cfg.page_size();
        assert!(page >= MIN_PAGE_SIZE && page <= MAX_PAGE_SIZE);
    }

    #[test]
    fn test_explicit_fips_wins() {
        let on = ServiceConfig {
            fips: Some(true),
            ..Default::default()
        };
        let off = ServiceConfig {
            fips: Some(false),
            ..Default::default()
        };
        assert!(on.fips_enabled());
        assert!(!off.fips_enabled());
    }

    #[test]
    fn test_toml_parsing() {
        let path = std::env::temp_dir().join("pcpurand_test_config.toml");
        {
            let mut f = std::fs::File::create(&path).unwrap();
            write!(
                f,
                r#"
[service]
fips = true
cpus = 8
page_size = 256

[drbg]
max_requests = 1000
"#
            )
            .unwrap();
        }
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.service.fips, Some(true));
        assert_eq!(config.service.cpus, 8);
        assert_eq!(config.service.page_size, 256);
        assert_eq!(config.drbg.max_requests, 1000);
        // Unset fields should get defaults
        assert_eq!(config.service.algorithm, "stdrng");
        assert_eq!(config.drbg.max_request_bytes, 1 << 16);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_missing_explicit_config_errors() {
        let path = Path::new("/tmp/pcpurand_nonexistent_config.toml");
        assert!(load_config(Some(path)).is_err());
    }
}
