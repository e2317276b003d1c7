//! Parsing of the three resource-limit inputs (CPU, memory, block I/O).
//!
//! Parsing is total and touches no files; [`ResourceLimits::load`] is the
//! thin wrapper that reads the conventional limit files from a directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Default CPU accounting period, in microseconds.
pub const DEFAULT_CPU_PERIOD_US: u64 = 100_000;

const MIN_MEMORY_BYTES: u64 = 1024 * 1024;
const MIN_IO_BPS: u64 = 1024;

#[derive(Debug, Error)]
pub enum LimitsError {
    #[error("malformed {field} limit: {raw:?}")]
    MalformedValue { field: &'static str, raw: String },

    #[error("{field} limit out of range: {raw:?}")]
    OutOfRange { field: &'static str, raw: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Block device identifier in `major:minor` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

impl FromStr for DeviceId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let (major, minor) = s.split_once(':').ok_or(())?;
        Ok(Self {
            major: major.parse().map_err(|_| ())?,
            minor: minor.parse().map_err(|_| ())?,
        })
    }
}

/// One write-bandwidth limit. Entries without a device are resolved against
/// the controller's configured default device at cgroup-creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoWriteLimit {
    pub device: Option<DeviceId>,
    pub bytes_per_sec: u64,
}

/// The raw text form of the three limit inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LimitSpecs {
    pub cpu: String,
    pub memory: String,
    pub io: String,
}

/// Validated per-job resource limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU quota in microseconds per `cpu_period_us`.
    pub cpu_quota_us: u64,
    pub cpu_period_us: u64,
    pub memory_bytes: u64,
    /// Write-bandwidth limits; empty means no I/O limit.
    pub io_write_bps: Vec<IoWriteLimit>,
}

impl ResourceLimits {
    /// Parse limits from text. `cores` bounds the CPU allowance: a job may
    /// request at most `cores * 100%`.
    pub fn parse(specs: &LimitSpecs, cores: u32) -> Result<Self, LimitsError> {
        let cpu_quota_us = parse_cpu(&specs.cpu, cores)?;
        let memory_bytes = parse_memory(&specs.memory)?;
        let io_write_bps = parse_io(&specs.io)?;
        Ok(Self {
            cpu_quota_us,
            cpu_period_us: DEFAULT_CPU_PERIOD_US,
            memory_bytes,
            io_write_bps,
        })
    }

    /// Read `cpu_limit`, `memory_limit`, and `disk_io_limit` from `dir` and
    /// parse them. A missing `disk_io_limit` file disables the I/O limit.
    pub fn load(dir: &Path, cores: u32) -> Result<Self, LimitsError> {
        let read = |name: &str| -> Result<String, LimitsError> {
            let path = dir.join(name);
            std::fs::read_to_string(&path).map_err(|source| LimitsError::Io { path, source })
        };
        let specs = LimitSpecs {
            cpu: read("cpu_limit")?,
            memory: read("memory_limit")?,
            io: match std::fs::read_to_string(dir.join("disk_io_limit")) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(source) => {
                    return Err(LimitsError::Io {
                        path: dir.join("disk_io_limit"),
                        source,
                    })
                }
            },
        };
        Self::parse(&specs, cores)
    }

    /// Render back to the text form accepted by [`parse`](Self::parse).
    pub fn serialize(&self) -> LimitSpecs {
        let pct = self.cpu_quota_us as f64 * 100.0 / self.cpu_period_us as f64;
        let cpu = if pct.fract() == 0.0 {
            format!("{}%", pct as u64)
        } else {
            format!("{pct}%")
        };
        let io = self
            .io_write_bps
            .iter()
            .map(|l| match l.device {
                Some(dev) => format!("{} {}/s", dev, format_size(l.bytes_per_sec)),
                None => format!("{}/s", format_size(l.bytes_per_sec)),
            })
            .collect::<Vec<_>>()
            .join("\n");
        LimitSpecs {
            cpu,
            memory: format_size(self.memory_bytes),
            io,
        }
    }
}

fn parse_cpu(raw: &str, cores: u32) -> Result<u64, LimitsError> {
    let field = "cpu";
    let trimmed = raw.trim();
    let malformed = || LimitsError::MalformedValue {
        field,
        raw: raw.to_string(),
    };
    let digits = trimmed.strip_suffix('%').ok_or_else(malformed)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(malformed());
    }
    let pct: f64 = digits.parse().map_err(|_| malformed())?;
    if pct <= 0.0 || pct > 100.0 * cores.max(1) as f64 {
        return Err(LimitsError::OutOfRange {
            field,
            raw: raw.to_string(),
        });
    }
    // percent of one core -> microseconds per 100ms period
    Ok((pct * DEFAULT_CPU_PERIOD_US as f64 / 100.0).round() as u64)
}

fn parse_memory(raw: &str) -> Result<u64, LimitsError> {
    let field = "memory";
    let bytes = parse_size(raw.trim()).ok_or_else(|| LimitsError::MalformedValue {
        field,
        raw: raw.to_string(),
    })?;
    if bytes < MIN_MEMORY_BYTES {
        return Err(LimitsError::OutOfRange {
            field,
            raw: raw.to_string(),
        });
    }
    Ok(bytes)
}

fn parse_io(raw: &str) -> Result<Vec<IoWriteLimit>, LimitsError> {
    let field = "io";
    let mut limits = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let malformed = || LimitsError::MalformedValue {
            field,
            raw: line.to_string(),
        };
        // "major:minor <rate>/s" or "<rate>/s"
        let (device, rate) = match line.split_once(' ') {
            Some((dev, rest)) => {
                let device: DeviceId = dev.parse().map_err(|_| malformed())?;
                (Some(device), rest.trim())
            }
            None => (None, line),
        };
        let rate = rate.strip_suffix("/s").ok_or_else(malformed)?;
        let bytes_per_sec = parse_size(rate).ok_or_else(malformed)?;
        if bytes_per_sec < MIN_IO_BPS {
            return Err(LimitsError::OutOfRange {
                field,
                raw: line.to_string(),
            });
        }
        limits.push(IoWriteLimit {
            device,
            bytes_per_sec,
        });
    }
    Ok(limits)
}

/// Parse an integer with an optional K/M/G suffix (powers of 1024).
fn parse_size(s: &str) -> Option<u64> {
    if s.is_empty() {
        return None;
    }
    let (digits, multiplier) = match s.chars().last()? {
        'k' | 'K' => (&s[..s.len() - 1], 1024),
        'm' | 'M' => (&s[..s.len() - 1], 1024 * 1024),
        'g' | 'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (s, 1),
        _ => return None,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    n.checked_mul(multiplier)
}

fn format_size(bytes: u64) -> String {
    const G: u64 = 1024 * 1024 * 1024;
    const M: u64 = 1024 * 1024;
    const K: u64 = 1024;
    if bytes >= G && bytes % G == 0 {
        format!("{}G", bytes / G)
    } else if bytes >= M && bytes % M == 0 {
        format!("{}M", bytes / M)
    } else if bytes >= K && bytes % K == 0 {
        format!("{}K", bytes / K)
    } else {
        bytes.to_string()
    }
}
