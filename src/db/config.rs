use time::Duration;

/// Engine tuning knobs. Construction is programmatic; there is no file
/// format.
#[derive(Debug, Clone)]
pub struct Config {
    /// Reject CommitObject when distinct part numbers exceed this.
    pub max_number_of_parts: usize,
    /// Reject CommitObject when any non-final part holds fewer plain bytes.
    pub min_part_size: i64,
    /// Require `plain_size > 0` on segment commits.
    pub validate_plain_size: bool,
    /// Default lifetime of a pending row absent an explicit deadline.
    pub zombie_deletion_period: Duration,
    /// Default listing delimiter.
    pub delimiter: Vec<u8>,
    /// Rows fetched per listing batch when the request does not say.
    pub list_batch_size: usize,
    /// Rows visited per reaper pass before the batch commits.
    pub reaper_batch_size: usize,
    /// Bounded forward map of the node alias cache.
    pub alias_cache_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_number_of_parts: 10_000,
            min_part_size: 5 * 1024 * 1024,
            validate_plain_size: false,
            zombie_deletion_period: Duration::hours(24),
            delimiter: b"/".to_vec(),
            list_batch_size: 1_000,
            reaper_batch_size: 100,
            alias_cache_size: 10_000,
        }
    }
}

impl Config {
    /// Shrunk sizes so tests exercise batching and validation boundaries
    /// without megabytes of fixtures.
    pub fn testing() -> Self {
        Self {
            max_number_of_parts: 10,
            min_part_size: 1024,
            validate_plain_size: false,
            zombie_deletion_period: Duration::hours(24),
            delimiter: b"/".to_vec(),
            list_batch_size: 3,
            reaper_batch_size: 4,
            alias_cache_size: 64,
        }
    }
}
