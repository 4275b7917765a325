//! FoilPics - Engine Configuration

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::VaultResult;

/// Default edge of the square thumbnails kept alongside every picture.
pub const DEFAULT_THUMBNAIL_SIZE: u32 = 256;

/// Default decrypted-bytes cache budget: 5 KB of cache per MB of RAM.
/// Unusually small on purpose; override via `max_decrypted_bytes` if a
/// deployment wants a bigger cache.
pub const DEFAULT_CACHE_BYTES_PER_RAM_KIB: u64 = 5;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding `foil.key`
    pub key_dir: PathBuf,
    /// Vault directory holding the encrypted pictures and `.info`
    pub pics_dir: PathBuf,
    /// Square thumbnail edge in pixels
    pub thumbnail_size: u32,
    /// Decrypted-bytes budget multiplier (bytes per KiB of physical RAM)
    pub cache_bytes_per_ram_kib: u64,
    /// Absolute decrypted-bytes budget; takes precedence over the multiplier
    pub max_decrypted_bytes: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            key_dir: home.join(".local/share/foil"),
            pics_dir: home.join("Documents/FoilPics"),
            thumbnail_size: DEFAULT_THUMBNAIL_SIZE,
            cache_bytes_per_ram_kib: DEFAULT_CACHE_BYTES_PER_RAM_KIB,
            max_decrypted_bytes: None,
        }
    }
}

impl EngineConfig {
    /// Resolves the decrypted-bytes budget for this machine.
    pub fn cache_budget(&self) -> u64 {
        if let Some(max) = self.max_decrypted_bytes {
            return max;
        }
        let kib = physical_ram_kib();
        log::debug!("We seem to have {kib} kB of RAM");
        self.cache_bytes_per_ram_kib.saturating_mul(kib)
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Physical RAM in KiB, from /proc/meminfo where available.
fn physical_ram_kib() -> u64 {
    if let Ok(text) = fs::read_to_string("/proc/meminfo") {
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                if let Some(kib) = rest
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                {
                    return kib;
                }
            }
        }
    }
    // 1 GiB fallback
    1_048_576
}

/// Creates `dir` if needed and restricts it to the owner.
pub fn create_private_dir(dir: &Path) -> VaultResult<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absolute_override_wins() {
        let cfg = EngineConfig {
            max_decrypted_bytes: Some(1234),
            ..Default::default()
        };
        assert_eq!(cfg.cache_budget(), 1234);
    }

    #[test]
    fn multiplier_scales_with_ram() {
        let cfg = EngineConfig {
            cache_bytes_per_ram_kib: 0,
            ..Default::default()
        };
        assert_eq!(cfg.cache_budget(), 0);
    }

    #[test]
    #[cfg(unix)]
    fn private_dir_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let target = dir.path().join("vault");
        create_private_dir(&target).unwrap();
        let mode = fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
