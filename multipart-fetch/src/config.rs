//! Configuration for the fetch engine.

/// Length of one content-hash segment on the CDN (128 KiB).
///
/// Hash offsets and hash-fetch windows are multiples of this value.
pub const HASH_SEGMENT_LENGTH: u64 = 128 * 1024;

/// Request lengths sent to the transport are multiples of this quantum.
pub const TRANSPORT_QUANTUM: u64 = 4096;

/// Largest request length accepted by the transport (1 MiB).
///
/// Every transport length must divide this value evenly.
pub const MAX_TRANSPORT_LIMIT: u64 = 1024 * 1024;

/// Configuration for a multipart fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Largest chunk requested in one go, before alignment.
    pub part_size: u64,

    /// Chunk offsets and request lengths are aligned to this value.
    pub part_alignment: u64,

    /// Chunks never straddle a multiple of this value.
    pub request_boundary: u64,

    /// Concurrent chunks when the total size is known up front.
    pub parallel_parts_known_size: usize,

    /// Concurrent chunks while the total size is still unknown.
    ///
    /// Kept at 1 by default so the short final chunk is found without
    /// speculative requests past the end of the resource.
    pub parallel_parts_unknown_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            part_size: 128 * 1024,
            part_alignment: 128 * 1024,
            request_boundary: 1024 * 1024,
            parallel_parts_known_size: 4,
            parallel_parts_unknown_size: 1,
        }
    }
}

impl FetchConfig {
    /// Create a configuration with the default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size (minimum 1).
    pub fn with_part_size(mut self, size: u64) -> Self {
        self.part_size = size.max(1);
        self
    }

    /// Set the chunk alignment (minimum 1).
    pub fn with_part_alignment(mut self, alignment: u64) -> Self {
        self.part_alignment = alignment.max(1);
        self
    }

    /// Set the boundary chunks may not cross (minimum 1).
    pub fn with_request_boundary(mut self, boundary: u64) -> Self {
        self.request_boundary = boundary.max(1);
        self
    }

    /// Set the parallelism used when the size is known (minimum 1).
    pub fn with_parallel_parts_known_size(mut self, parts: usize) -> Self {
        self.parallel_parts_known_size = parts.max(1);
        self
    }

    /// Set the parallelism used when the size is unknown (minimum 1).
    pub fn with_parallel_parts_unknown_size(mut self, parts: usize) -> Self {
        self.parallel_parts_unknown_size = parts.max(1);
        self
    }

    /// Concurrency ceiling for a fetch, given what is known about its size.
    pub fn parallel_parts(&self, size: Option<u64>) -> usize {
        match size {
            Some(_) => self.parallel_parts_known_size,
            None => self.parallel_parts_unknown_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = FetchConfig::default();
        assert_eq!(config.part_size, 131_072);
        assert_eq!(config.part_alignment, 131_072);
        assert_eq!(config.request_boundary, 1_048_576);
        assert_eq!(config.parallel_parts(Some(300_000)), 4);
        assert_eq!(config.parallel_parts(None), 1);
    }

    #[test]
    fn test_builder_pattern() {
        let config = FetchConfig::new()
            .with_part_size(64 * 1024)
            .with_part_alignment(64 * 1024)
            .with_parallel_parts_known_size(8)
            .with_parallel_parts_unknown_size(2);

        assert_eq!(config.part_size, 65_536);
        assert_eq!(config.part_alignment, 65_536);
        assert_eq!(config.parallel_parts(Some(1)), 8);
        assert_eq!(config.parallel_parts(None), 2);
    }

    #[test]
    fn test_builder_clamps_zero() {
        let config = FetchConfig::new()
            .with_part_size(0)
            .with_part_alignment(0)
            .with_request_boundary(0)
            .with_parallel_parts_known_size(0)
            .with_parallel_parts_unknown_size(0);

        assert_eq!(config.part_size, 1);
        assert_eq!(config.part_alignment, 1);
        assert_eq!(config.request_boundary, 1);
        assert_eq!(config.parallel_parts(Some(10)), 1);
        assert_eq!(config.parallel_parts(None), 1);
    }
}
