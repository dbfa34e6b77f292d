//! LSN checkpoint persistence.
//!
//! The checkpoint file holds a single line: the canonical `XX/XX` hex
//! rendering of the last committed LSN. Written only on `Commit`,
//! truncate-and-write, flushed before the consumer acknowledges the
//! commit.

use crate::errors::{CdcError, CdcResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Resolves `<user-config-dir>/cdc-pipe/log.txt`, matching the original
/// Go service's `os.UserConfigDir()`-based path.
pub fn default_checkpoint_path() -> CdcResult<PathBuf> {
    let base = dirs::config_dir()
        .ok_or_else(|| CdcError::checkpoint("could not resolve user config directory"))?;
    Ok(base.join("cdc-pipe").join("log.txt"))
}

/// Renders a raw LSN as PostgreSQL's canonical `XX/XX` hex form.
pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

/// Parses the canonical `XX/XX` hex form back into a raw LSN.
pub fn parse_lsn(s: &str) -> CdcResult<u64> {
    let (hi, lo) = s
        .split_once('/')
        .ok_or_else(|| CdcError::checkpoint(format!("malformed LSN: {}", s)))?;
    let hi = u64::from_str_radix(hi, 16).map_err(|e| CdcError::checkpoint(e.to_string()))?;
    let lo = u64::from_str_radix(lo, 16).map_err(|e| CdcError::checkpoint(e.to_string()))?;
    Ok((hi << 32) | lo)
}

/// Reads the last committed LSN from `path`. Missing file means "from
/// slot's confirmed flush", i.e. `0`.
pub fn read_checkpoint(path: &Path) -> CdcResult<u64> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                Ok(0)
            } else {
                parse_lsn(trimmed)
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(CdcError::checkpoint(e.to_string())),
    }
}

/// Truncates and writes the checkpoint file, flushing before returning so
/// the write is durable before the commit is acknowledged upstream.
pub fn write_checkpoint(path: &Path, lsn: u64) -> CdcResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CdcError::checkpoint(e.to_string()))?;
    }
    let mut file = fs::File::create(path).map_err(|e| CdcError::checkpoint(e.to_string()))?;
    file.write_all(format_lsn(lsn).as_bytes())
        .map_err(|e| CdcError::checkpoint(e.to_string()))?;
    file.flush().map_err(|e| CdcError::checkpoint(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_canonical_lsn() {
        // 0x16B7A30 fits entirely in the low 32 bits.
        assert_eq!(format_lsn(0x16B7A30), "0/16B7A30");
    }

    #[test]
    fn round_trips_through_parse() {
        let lsn = 0x1_0000_2222u64;
        assert_eq!(parse_lsn(&format_lsn(lsn)).unwrap(), lsn);
    }

    #[test]
    fn missing_checkpoint_file_reads_as_zero() {
        let path = std::env::temp_dir().join("cdc-pipe-missing-checkpoint.txt");
        let _ = fs::remove_file(&path);
        assert_eq!(read_checkpoint(&path).unwrap(), 0);
    }

    #[test]
    fn end_to_end_scenario_checkpoint_matches_spec() {
        let dir = std::env::temp_dir().join(format!("cdc-pipe-ckpt-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("log.txt");

        write_checkpoint(&path, parse_lsn("0/16B7A30").unwrap()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "0/16B7A30");
    }
}
