use async_recursion::async_recursion;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};

use dns_wire::types::*;

use crate::context::Context;
use crate::nameserver::{is_usable_response, query_nameserver};

/// The final result of an iterative walk: the answer records (empty
/// for a negative result) and the rcode to propagate to the client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Resolution {
    pub rrs: Vec<ResourceRecord>,
    pub rcode: Rcode,
}

/// An error which aborts a whole resolution.  Per-hop problems
/// (timeouts, unparseable or error responses) never surface here:
/// they are recovered by moving on to the next nameserver.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ResolutionError {
    /// The overall deadline for the resolution expired.
    Timeout,

    /// The referral / alias chain went deeper than the configured
    /// limit.
    DepthExceeded,

    /// Every nameserver at some level failed to give a usable
    /// response.
    NoNameservers { question: Question },
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolutionError::Timeout => write!(f, "deadline expired"),
            ResolutionError::DepthExceeded => write!(f, "referral or alias chain too deep"),
            ResolutionError::NoNameservers { question } => {
                write!(f, "no nameserver could answer '{question}'")
            }
        }
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// Iteratively resolve a question, starting from the root hints.
///
/// This is the standard resolver algorithm (RFC 1034 section 5.3.3)
/// over remote state only: check the cache, then walk down the
/// hierarchy following referrals.  Aliases and addressless
/// nameservers re-enter the engine from the top, at `depth + 1`.
///
/// A positive answer is cached under the question that produced it -
/// the original name, not the end of any alias chain.
///
/// # Errors
///
/// See `ResolutionError`.
#[async_recursion]
pub async fn resolve_iterative(
    ctx: &mut Context<'_>,
    question: &Question,
    depth: usize,
) -> Result<Resolution, ResolutionError> {
    if let Some(rrs) = ctx.cache.get(&question.name, &question.qtype) {
        tracing::trace!(%question, "cache hit");
        if depth == 0 {
            ctx.metrics().record_cache_hit();
        }
        return Ok(Resolution {
            rrs,
            rcode: Rcode::NoError,
        });
    }

    let resolution = walk(ctx, question, depth).await?;

    if resolution.rcode == Rcode::NoError && !resolution.rrs.is_empty() {
        ctx.cache
            .put(&question.name, &question.qtype, &resolution.rrs);
    }

    Ok(resolution)
}

/// The referral walk itself: a loop over the current nameserver list
/// and depth.  Only alias and nameserver-address resolution recurse.
#[async_recursion]
async fn walk(
    ctx: &mut Context<'_>,
    question: &Question,
    mut depth: usize,
) -> Result<Resolution, ResolutionError> {
    let mut ns_ips = ctx.config.root_servers.clone();

    loop {
        if depth > ctx.config.max_depth {
            tracing::debug!(%question, %depth, "hit depth limit");
            return Err(ResolutionError::DepthExceeded);
        }
        ctx.metrics().record_depth(depth);

        let Some(response) = query_nameservers(ctx, &ns_ips, question).await else {
            return Err(ResolutionError::NoNameservers {
                question: question.clone(),
            });
        };

        match classify_response(question, &response) {
            Classification::Answered { rrs } => {
                tracing::trace!(%question, answers = %rrs.len(), "answered");
                return Ok(Resolution {
                    rrs,
                    rcode: Rcode::NoError,
                });
            }
            Classification::Cname { rrs, target } => {
                tracing::trace!(%question, %target, "following alias");
                let target_question = Question {
                    name: target,
                    qtype: question.qtype,
                    qclass: question.qclass,
                };
                let resolved = resolve_iterative(ctx, &target_question, depth + 1).await?;
                let mut combined = rrs;
                combined.extend(resolved.rrs);
                return Ok(Resolution {
                    rrs: combined,
                    rcode: resolved.rcode,
                });
            }
            Classification::Referred { ns_names, glue } => {
                tracing::trace!(%question, nameservers = %ns_names.len(), glue = %glue.len(), "referred");
                depth += 1;
                ns_ips = if glue.is_empty() {
                    resolve_nameserver_addresses(ctx, &ns_names, depth).await
                } else {
                    glue
                };
                if ns_ips.is_empty() {
                    return Err(ResolutionError::NoNameservers {
                        question: question.clone(),
                    });
                }
            }
            Classification::NegativeFinal { rcode } => {
                tracing::trace!(%question, %rcode, "negative answer");
                return Ok(Resolution {
                    rrs: Vec::new(),
                    rcode,
                });
            }
            Classification::Failed => {
                tracing::debug!(%question, "response shape cannot advance the resolution");
                return Err(ResolutionError::NoNameservers {
                    question: question.clone(),
                });
            }
        }
    }
}

/// Try each nameserver in order until one produces a usable response.
/// Timeouts, unparseable datagrams, and error rcodes are all
/// recovered here by moving on.  A nameserver this resolution has
/// already asked this question is skipped.
async fn query_nameservers(
    ctx: &mut Context<'_>,
    ns_ips: &[IpAddr],
    question: &Question,
) -> Option<Message> {
    for &ip in ns_ips {
        if !ctx.first_attempt(question, ip) {
            tracing::trace!(%question, address = %ip, "skipping: already attempted");
            continue;
        }

        let address = SocketAddr::new(ip, ctx.config.upstream_port);
        ctx.metrics().record_query();
        match query_nameserver(address, question, ctx.config.timeout).await {
            Some(response) if is_usable_response(&response) => return Some(response),
            Some(response) => {
                tracing::debug!(%question, %address, rcode = %response.header.rcode, "unusable response");
            }
            None => {
                tracing::debug!(%question, %address, "no response");
            }
        }
    }

    None
}

/// A referral arrived with no glue: resolve the nameserver names
/// themselves, from the top, until one of them yields addresses.
async fn resolve_nameserver_addresses(
    ctx: &mut Context<'_>,
    ns_names: &[DomainName],
    depth: usize,
) -> Vec<IpAddr> {
    for name in ns_names {
        let question = Question {
            name: name.clone(),
            qtype: QueryType::Record(RecordType::A),
            qclass: QueryClass::Record(RecordClass::IN),
        };

        match resolve_iterative(ctx, &question, depth).await {
            Ok(resolution) => {
                let addresses = address_records(&resolution.rrs, name);
                if !addresses.is_empty() {
                    return addresses;
                }
            }
            Err(error) => {
                tracing::debug!(nameserver = %name, %error, "could not resolve nameserver address");
            }
        }
    }

    Vec::new()
}

/// How a nameserver response advances the resolution.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Classification {
    /// The answer section resolves the question, alias chain
    /// included.
    Answered { rrs: Vec<ResourceRecord> },

    /// The answer section only gets as far as an alias: resolution
    /// restarts from the target name.
    Cname {
        rrs: Vec<ResourceRecord>,
        target: DomainName,
    },

    /// A delegation to nameservers closer to the answer, with
    /// whatever addresses the additional section supplied for them.
    Referred {
        ns_names: Vec<DomainName>,
        glue: Vec<IpAddr>,
    },

    /// An authoritative "no such name" or "no such data".
    NegativeFinal { rcode: Rcode },

    /// Nothing in the response can advance the resolution.
    Failed,
}

/// Classify a usable response, in order: answers (a direct match, or
/// an alias chain to follow), a propagated name error, a referral, an
/// authoritative empty answer.
pub fn classify_response(question: &Question, response: &Message) -> Classification {
    if let Some(first) = response.answers.first() {
        if first.data.matches(&question.qtype) {
            return Classification::Answered {
                rrs: response.answers.clone(),
            };
        }

        if first.data.rtype() == RecordType::CNAME {
            if let Some((final_name, cnames)) =
                follow_cnames(&response.answers, &question.name, &question.qtype)
            {
                let mut rrs = Vec::with_capacity(response.answers.len());
                let mut seen_final_record = false;
                for an in &response.answers {
                    if an.data.matches(&question.qtype) && an.name == final_name {
                        rrs.push(an.clone());
                        seen_final_record = true;
                    } else if an.data.rtype() == RecordType::CNAME && cnames.contains_key(&an.name)
                    {
                        rrs.push(an.clone());
                    }
                }

                if seen_final_record {
                    return Classification::Answered { rrs };
                } else {
                    return Classification::Cname {
                        rrs,
                        target: final_name,
                    };
                }
            }
        }

        return Classification::Failed;
    }

    if response.header.rcode == Rcode::NameError {
        return Classification::NegativeFinal {
            rcode: Rcode::NameError,
        };
    }

    let ns_names: Vec<DomainName> = response
        .authority
        .iter()
        .filter_map(|rr| match &rr.data {
            RecordData::NS { nsdname } if question.name.is_subdomain_of(&rr.name) => {
                Some(nsdname.clone())
            }
            _ => None,
        })
        .collect();

    if !ns_names.is_empty() {
        let glue = glue_addresses(&ns_names, &response.additional);
        return Classification::Referred { ns_names, glue };
    }

    if response.header.is_authoritative {
        return Classification::NegativeFinal {
            rcode: Rcode::NoError,
        };
    }

    Classification::Failed
}

/// Given a set of RRs and the name we are looking for, follow any
/// `CNAME`s and return the final name (the one the non-`CNAME`
/// records would be attached to) plus the alias map.
///
/// Returns `None` if the aliases form a loop, or nothing in the set
/// pertains to the target at all.
pub fn follow_cnames(
    rrs: &[ResourceRecord],
    target: &DomainName,
    qtype: &QueryType,
) -> Option<(DomainName, HashMap<DomainName, DomainName>)> {
    let mut got_match = false;
    let mut cname_map = HashMap::<DomainName, DomainName>::new();
    for rr in rrs {
        if &rr.name == target && rr.data.matches(qtype) {
            got_match = true;
        }
        if let RecordData::CNAME { cname } = &rr.data {
            cname_map.insert(rr.name.clone(), cname.clone());
        }
    }

    let mut seen = HashSet::new();
    let mut final_name = target.clone();
    while let Some(next) = cname_map.get(&final_name) {
        if seen.contains(next) {
            return None;
        }
        seen.insert(next.clone());
        final_name = next.clone();
    }

    if got_match || !seen.is_empty() {
        Some((final_name, cname_map))
    } else {
        None
    }
}

/// Addresses from a referral's additional section for the named
/// nameservers - the "glue".  Both A and AAAA records count.
fn glue_addresses(ns_names: &[DomainName], additional: &[ResourceRecord]) -> Vec<IpAddr> {
    let mut out = Vec::new();
    for rr in additional {
        if !ns_names.contains(&rr.name) {
            continue;
        }
        match rr.data {
            RecordData::A { address } => out.push(IpAddr::V4(address)),
            RecordData::AAAA { address } => out.push(IpAddr::V6(address)),
            _ => (),
        }
    }
    out
}

/// The addresses for a name in a record set, following any alias
/// chain it is behind.
fn address_records(rrs: &[ResourceRecord], target: &DomainName) -> Vec<IpAddr> {
    let Some((final_name, _)) = follow_cnames(rrs, target, &QueryType::Record(RecordType::A))
    else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for rr in rrs {
        if rr.name != final_name {
            continue;
        }
        match rr.data {
            RecordData::A { address } => out.push(IpAddr::V4(address)),
            RecordData::AAAA { address } => out.push(IpAddr::V6(address)),
            _ => (),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_wire::types::test_util::*;

    use super::*;
    use crate::nameserver::test_util::*;

    #[test]
    fn classify_direct_answer() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[a_record("www.example.com", Ipv4Addr::new(127, 0, 0, 1))],
            &[],
            &[],
        );

        assert_eq!(
            Classification::Answered {
                rrs: vec![a_record("www.example.com", Ipv4Addr::new(127, 0, 0, 1))],
            },
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_answer_with_full_alias_chain() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[
                cname_record("www.example.com", "host.example.net"),
                a_record("host.example.net", Ipv4Addr::new(127, 0, 0, 1)),
            ],
            &[],
            &[],
        );

        assert_eq!(
            Classification::Answered {
                rrs: vec![
                    cname_record("www.example.com", "host.example.net"),
                    a_record("host.example.net", Ipv4Addr::new(127, 0, 0, 1)),
                ],
            },
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_bare_alias() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[cname_record("www.example.com", "host.example.net")],
            &[],
            &[],
        );

        assert_eq!(
            Classification::Cname {
                rrs: vec![cname_record("www.example.com", "host.example.net")],
                target: domain("host.example.net"),
            },
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_cname_question_takes_the_alias_as_the_answer() {
        let response = {
            let (_, r) = nameserver_response(
                "www.example.com",
                &[cname_record("www.example.com", "host.example.net")],
                &[],
                &[],
            );
            r
        };
        let q = Question {
            name: domain("www.example.com"),
            qtype: QueryType::Record(RecordType::CNAME),
            qclass: QueryClass::Record(RecordClass::IN),
        };

        assert_eq!(
            Classification::Answered {
                rrs: vec![cname_record("www.example.com", "host.example.net")],
            },
            classify_response(&q, &response)
        );
    }

    #[test]
    fn classify_alias_loop_fails() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[
                cname_record("www.example.com", "bad.example.com"),
                cname_record("bad.example.com", "www.example.com"),
            ],
            &[],
            &[],
        );

        assert_eq!(
            Classification::Failed,
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_unrelated_answer_fails() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[ns_record("example.com", "ns1.example.net")],
            &[],
            &[],
        );

        assert_eq!(
            Classification::Failed,
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_referral_with_glue() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[],
            &[ns_record("example.com", "ns1.example.net")],
            &[
                a_record("ns1.example.net", Ipv4Addr::new(10, 0, 0, 1)),
                a_record("unrelated.example.net", Ipv4Addr::new(10, 0, 0, 99)),
            ],
        );

        assert_eq!(
            Classification::Referred {
                ns_names: vec![domain("ns1.example.net")],
                glue: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))],
            },
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_referral_without_glue() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[],
            &[ns_record("example.com", "ns1.example.net")],
            &[],
        );

        assert_eq!(
            Classification::Referred {
                ns_names: vec![domain("ns1.example.net")],
                glue: Vec::new(),
            },
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_referral_ignores_nameservers_for_unrelated_zones() {
        let (request, response) = nameserver_response(
            "www.example.com",
            &[],
            &[ns_record("example.org", "ns1.example.net")],
            &[],
        );

        assert_eq!(
            Classification::Failed,
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_name_error() {
        let (request, mut response) = nameserver_response("www.example.com", &[], &[], &[]);
        response.header.rcode = Rcode::NameError;

        assert_eq!(
            Classification::NegativeFinal {
                rcode: Rcode::NameError,
            },
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_authoritative_empty_answer() {
        let (request, mut response) = nameserver_response("www.example.com", &[], &[], &[]);
        response.header.is_authoritative = true;

        assert_eq!(
            Classification::NegativeFinal {
                rcode: Rcode::NoError,
            },
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn classify_empty_non_authoritative_fails() {
        let (request, response) = nameserver_response("www.example.com", &[], &[], &[]);

        assert_eq!(
            Classification::Failed,
            classify_response(&request.questions[0], &response)
        );
    }

    #[test]
    fn follow_cnames_no_records() {
        assert_eq!(
            None,
            follow_cnames(&[], &domain("www.example.com"), &QueryType::Wildcard)
        );
    }

    #[test]
    fn follow_cnames_no_name_match() {
        assert_eq!(
            None,
            follow_cnames(
                &[a_record("www.example.net", Ipv4Addr::new(1, 1, 1, 1))],
                &domain("www.example.com"),
                &QueryType::Wildcard
            )
        );
    }

    #[test]
    fn follow_cnames_no_cname() {
        let rr_a = a_record("www.example.com", Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(
            Some((domain("www.example.com"), HashMap::new())),
            follow_cnames(&[rr_a], &domain("www.example.com"), &QueryType::Wildcard)
        );
    }

    #[test]
    fn follow_cnames_chain() {
        let rr_cname1 = cname_record("www.example.com", "www2.example.com");
        let rr_cname2 = cname_record("www2.example.com", "www3.example.com");
        let rr_a = a_record("www3.example.com", Ipv4Addr::new(127, 0, 0, 1));

        let mut expected_map = HashMap::new();
        expected_map.insert(domain("www.example.com"), domain("www2.example.com"));
        expected_map.insert(domain("www2.example.com"), domain("www3.example.com"));

        // order of records does not matter, so pick the "worst"
        // order: the records in the opposite order to what we'd
        // expect
        assert_eq!(
            Some((domain("www3.example.com"), expected_map)),
            follow_cnames(
                &[rr_a, rr_cname2, rr_cname1],
                &domain("www.example.com"),
                &QueryType::Wildcard
            )
        );
    }

    #[test]
    fn follow_cnames_loop() {
        let rr_cname1 = cname_record("www.example.com", "bad.example.com");
        let rr_cname2 = cname_record("bad.example.com", "www.example.com");

        assert_eq!(
            None,
            follow_cnames(
                &[rr_cname1, rr_cname2],
                &domain("www.example.com"),
                &QueryType::Wildcard
            )
        );
    }

    #[test]
    fn address_records_direct_match() {
        let a_rr = a_record("www.example.com", Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(
            vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))],
            address_records(&[a_rr], &domain("www.example.com"))
        );
    }

    #[test]
    fn address_records_behind_alias() {
        let cname_rr = cname_record("www.example.com", "www.example.net");
        let a_rr = a_record("www.example.net", Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(
            vec![IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))],
            address_records(&[cname_rr, a_rr], &domain("www.example.com"))
        );
    }

    #[test]
    fn address_records_no_match() {
        let a_rr = a_record("www.example.net", Ipv4Addr::new(127, 0, 0, 1));
        assert!(address_records(&[a_rr], &domain("www.example.com")).is_empty());
    }
}
