use std::collections::HashSet;
use std::net::IpAddr;

use dns_wire::types::{DomainName, Question, QueryType};

use crate::cache::SharedCache;
use crate::config::Config;
use crate::metrics::Metrics;

/// State for a single top-level resolution: the shared handles, the
/// metrics being built up, and the set of attempts already made.  It
/// is discarded when the resolution returns.
pub struct Context<'a> {
    pub config: &'a Config,
    pub cache: &'a SharedCache,
    metrics: Metrics,
    attempted: HashSet<(DomainName, QueryType, IpAddr)>,
}

impl<'a> Context<'a> {
    pub fn new(config: &'a Config, cache: &'a SharedCache) -> Self {
        Self {
            config,
            cache,
            metrics: Metrics::new(),
            attempted: HashSet::new(),
        }
    }

    pub fn metrics(&mut self) -> &mut Metrics {
        &mut self.metrics
    }

    pub fn done(self) -> Metrics {
        self.metrics
    }

    /// Record that a nameserver is about to be asked a question.
    /// Returns false if this resolution has already asked it, which
    /// breaks referral loops that the depth counter alone would take
    /// a long time to catch.
    pub fn first_attempt(&mut self, question: &Question, address: IpAddr) -> bool {
        self.attempted
            .insert((question.name.clone(), question.qtype, address))
    }
}
