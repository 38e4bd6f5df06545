#![warn(clippy::pedantic)]
// Sometimes a redundant else is clearer
#![allow(clippy::redundant_else)]
// Don't care enough to fix
#![allow(clippy::match_same_arms)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::similar_names)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::wildcard_imports)]

pub mod cache;
pub mod config;
pub mod context;
pub mod metrics;
pub mod nameserver;
pub mod recursive;

use std::sync::Arc;
use tokio::time::timeout;
use tracing::Instrument;

use dns_wire::types::*;

use self::cache::SharedCache;
use self::config::Config;
use self::context::Context;
use self::metrics::Metrics;
use self::recursive::resolve_iterative;

/// The recursive resolver: an immutable configuration plus the shared
/// answer cache.  Cloning is cheap, and every clone shares the same
/// cache.
#[derive(Debug, Clone)]
pub struct Resolver {
    config: Arc<Config>,
    cache: SharedCache,
}

impl Resolver {
    pub fn new(config: Config) -> Self {
        let cache = SharedCache::with_config(config.cache);
        Self {
            config: Arc::new(config),
            cache,
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    /// The listener contract: raw request octets in, raw response
    /// octets out.  `None` means the datagram should be dropped -
    /// never reply to input we cannot even read an id from.
    pub async fn handle(&self, request_bytes: &[u8]) -> Option<Vec<u8>> {
        let decoded = Message::from_octets(request_bytes);
        tracing::debug!(message = ?decoded, "got message");

        match decoded {
            Ok(request) => {
                if request.header.is_response {
                    // a response aimed at us is nonsense
                    serialise_response(Message::make_format_error_response(request.header.id))
                } else if request.header.opcode != Opcode::Standard {
                    let mut response = request.make_response();
                    response.header.rcode = Rcode::NotImplemented;
                    serialise_response(response)
                } else if request.questions.is_empty() {
                    serialise_response(Message::make_format_error_response(request.header.id))
                } else {
                    let (metrics, response) = self.resolve(&request).await;
                    tracing::info!(
                        question = %request.questions[0],
                        rcode = %response.header.rcode,
                        cache_hit = %metrics.cache_hit,
                        queries_made = %metrics.queries_made,
                        max_depth_reached = %metrics.max_depth_reached,
                        "resolved"
                    );
                    serialise_response(response)
                }
            }
            Err(error) => {
                tracing::debug!(%error, "undecodable request");
                error
                    .id()
                    .and_then(|id| serialise_response(Message::make_format_error_response(id)))
            }
        }
    }

    /// Resolve the first question of a request and build the
    /// response.  Additional questions, if present, are ignored, but
    /// the whole question section is echoed back.
    ///
    /// The response always echoes the request id and recursion-desired
    /// flag and advertises recursion; fatal resolution errors surface
    /// as SERVFAIL, never as anything the caller has to unwind.
    pub async fn resolve(&self, request: &Message) -> (Metrics, Message) {
        let mut response = request.make_response();

        let Some(question) = request.questions.first() else {
            response.header.rcode = Rcode::FormatError;
            return (Metrics::new(), response);
        };

        let mut ctx = Context::new(&self.config, &self.cache);
        let result = timeout(
            self.config.overall_deadline(),
            resolve_iterative(&mut ctx, question, 0),
        )
        .instrument(tracing::error_span!("resolve", %question))
        .await;

        match result {
            Ok(Ok(resolution)) => {
                response.answers = resolution.rrs;
                response.header.rcode = resolution.rcode;
            }
            Ok(Err(error)) => {
                tracing::debug!(%question, %error, "resolution failed");
                response.header.rcode = Rcode::ServerFailure;
            }
            Err(_elapsed) => {
                tracing::debug!(%question, "resolution deadline expired");
                response.header.rcode = Rcode::ServerFailure;
            }
        }

        (ctx.done(), response)
    }

    /// Flush the cache, logging its final statistics.  The listener
    /// calls this on shutdown.
    pub fn shutdown(&self) {
        let stats = self.cache.stats();
        tracing::info!(
            hits = %stats.hits,
            misses = %stats.misses,
            evictions = %stats.evictions,
            entries = %stats.entries,
            approximate_weight = %stats.approximate_weight,
            "flushing cache"
        );
        self.cache.clear();
    }
}

fn serialise_response(message: Message) -> Option<Vec<u8>> {
    match message.clone().into_udp_octets() {
        Ok(octets) => Some(octets),
        Err(error) => {
            tracing::warn!(?message, ?error, "could not serialise response");
            None
        }
    }
}
