/// Counters from a single resolution attempt.  The engine builds this
/// structure up as it goes; the caller decides what to do with it
/// (the server logs it).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Metrics {
    /// Whether the top-level question was answered straight from the
    /// cache.
    pub cache_hit: bool,

    /// How many queries were sent to remote nameservers, including
    /// ones that went unanswered.
    pub queries_made: u64,

    /// The deepest point the walk reached, counting referral hops and
    /// sub-resolutions.
    pub max_depth_reached: usize,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            cache_hit: false,
            queries_made: 0,
            max_depth_reached: 0,
        }
    }

    pub fn record_cache_hit(&mut self) {
        self.cache_hit = true;
    }

    pub fn record_query(&mut self) {
        self.queries_made += 1;
    }

    pub fn record_depth(&mut self, depth: usize) {
        if depth > self.max_depth_reached {
            self.max_depth_reached = depth;
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
