use std::env;

const DEFAULT_SKIP_SAMPLE_LIMIT: usize = 25;
const HARD_MAX_SKIP_SAMPLE_LIMIT: usize = 1_000;
const DEFAULT_FRAME_STATEMENTS: usize = 256;
const HARD_MAX_FRAME_STATEMENTS: usize = 65_536;
const DEFAULT_FRAME_BYTES: usize = 4 * 1024 * 1024;
const MIN_FRAME_BYTES: usize = 64 * 1024;
const HARD_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;
const MAX_COMPRESSION_LEVEL: i32 = 19;
const DEFAULT_FILE_KDF_ITERATIONS: u32 = 2;
/// Argon2 passes accepted for snapshot and backup files, on write and on read.
pub const MAX_FILE_KDF_ITERATIONS: u32 = 64;

/// Free space required in the destination directory, relative to the source size.
pub const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
/// Test hook overriding the free-space check.
pub const FAKE_FREE_BYTES_ENV: &str = "REPAIRKIT_FAKE_FREE_BYTES";

/// Tunables read from the environment. Out-of-range values are clamped and
/// unparsable ones fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of skipped-row samples kept in a repair report.
    pub skip_sample_limit: usize,
    /// Statements buffered per backup frame before it is flushed.
    pub frame_statements: usize,
    /// Approximate record bytes buffered per backup frame before it is flushed.
    pub frame_bytes: usize,
    /// zstd level used for compressed backup frames.
    pub compression_level: i32,
    /// Argon2 passes used to derive keys for snapshot and backup files.
    pub file_kdf_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            skip_sample_limit: DEFAULT_SKIP_SAMPLE_LIMIT,
            frame_statements: DEFAULT_FRAME_STATEMENTS,
            frame_bytes: DEFAULT_FRAME_BYTES,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            file_kdf_iterations: DEFAULT_FILE_KDF_ITERATIONS,
        }
    }
}

impl EngineConfig {
    pub fn load() -> Self {
        let skip_sample_limit = env::var("REPAIRKIT_SKIP_SAMPLE_LIMIT")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .map(|value| value.min(HARD_MAX_SKIP_SAMPLE_LIMIT))
            .unwrap_or(DEFAULT_SKIP_SAMPLE_LIMIT);

        let frame_statements = env::var("REPAIRKIT_FRAME_STATEMENTS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_FRAME_STATEMENTS))
            .unwrap_or(DEFAULT_FRAME_STATEMENTS);

        let frame_bytes = env::var("REPAIRKIT_FRAME_BYTES")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .map(|value| value.clamp(MIN_FRAME_BYTES, HARD_MAX_FRAME_BYTES))
            .unwrap_or(DEFAULT_FRAME_BYTES);

        let compression_level = env::var("REPAIRKIT_COMPRESSION_LEVEL")
            .ok()
            .and_then(|value| value.parse::<i32>().ok())
            .map(|value| value.clamp(1, MAX_COMPRESSION_LEVEL))
            .unwrap_or(DEFAULT_COMPRESSION_LEVEL);

        let file_kdf_iterations = env::var("REPAIRKIT_KDF_ITERATIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(MAX_FILE_KDF_ITERATIONS))
            .unwrap_or(DEFAULT_FILE_KDF_ITERATIONS);

        Self {
            skip_sample_limit,
            frame_statements,
            frame_bytes,
            compression_level,
            file_kdf_iterations,
        }
    }
}

/// Bytes that must be free before writing an output derived from `source_bytes`.
pub fn required_free_bytes(source_bytes: u64) -> u64 {
    ((source_bytes as f64) * REQUIRED_FREE_MULTIPLIER).ceil() as u64
}

pub fn fake_free_bytes() -> Option<u64> {
    env::var(FAKE_FREE_BYTES_ENV)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.skip_sample_limit, 25);
        assert_eq!(config.frame_statements, 256);
        assert_eq!(config.frame_bytes, 4 * 1024 * 1024);
        assert_eq!(config.compression_level, 3);
        assert_eq!(config.file_kdf_iterations, 2);
    }

    #[test]
    fn required_free_bytes_applies_multiplier() {
        assert_eq!(required_free_bytes(0), 0);
        assert_eq!(required_free_bytes(1000), 1200);
        assert_eq!(required_free_bytes(1), 2);
    }
}
