use rand::Rng;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use dns_wire::types::*;

/// Referral responses with a well-populated additional section can be
/// a lot bigger than the 512-octet answers we send to clients.
const RECV_BUFFER_SIZE: usize = 4096;

/// Send a single non-recursive query to a remote nameserver and wait
/// for the response, for up to `budget`.
///
/// Datagrams are accepted from any source, but must match the
/// request's id and question section: anything else is discarded and
/// the receive retried within the same budget.  The response is
/// otherwise NOT validated - consumers decide whether it is usable.
///
/// `None` covers timeouts, socket errors, and serialisation failures
/// alike; the caller's only recourse is the next nameserver either
/// way.
pub async fn query_nameserver(
    address: SocketAddr,
    question: &Question,
    budget: Duration,
) -> Option<Message> {
    let request = Message::from_question(rand::thread_rng().gen(), question.clone());

    let serialised_request = match request.clone().into_octets() {
        Ok(octets) => octets,
        Err(error) => {
            tracing::warn!(message = ?request, ?error, "could not serialise query");
            return None;
        }
    };

    tracing::trace!(%question, %address, "querying nameserver");

    match timeout(budget, exchange(address, &request, &serialised_request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::debug!(%question, %address, "nameserver timed out");
            None
        }
    }
}

/// Timeout-less send-then-receive.
async fn exchange(
    address: SocketAddr,
    request: &Message,
    serialised_request: &[u8],
) -> Option<Message> {
    // a fresh ephemeral socket per query keeps correlation trivial
    let bind_address = if address.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let sock = UdpSocket::bind(bind_address).await.ok()?;
    sock.send_to(serialised_request, address).await.ok()?;

    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        let (size, _) = sock.recv_from(&mut buf).await.ok()?;
        match Message::from_octets(&buf[..size]) {
            Ok(response) if response_matches_request(request, &response) => {
                return Some(response);
            }
            Ok(response) => {
                tracing::trace!(id = %response.header.id, "discarding mismatched datagram");
            }
            Err(error) => {
                tracing::trace!(%error, "discarding unparseable datagram");
            }
        }
    }
}

/// Whether a response corresponds to a request:
///
/// - the IDs match;
///
/// - it actually is a response;
///
/// - the opcode matches;
///
/// - the question section matches.
pub fn response_matches_request(request: &Message, response: &Message) -> bool {
    if request.header.id != response.header.id {
        return false;
    }
    if !response.header.is_response {
        return false;
    }
    if request.header.opcode != response.header.opcode {
        return false;
    }
    if request.questions != response.questions {
        return false;
    }

    true
}

/// Whether a matched response can advance the resolution.
///
/// FORMERR, SERVFAIL, NOTIMP, and REFUSED all mean this nameserver is
/// a dead end; only NOERROR and NXDOMAIN responses carry information.
/// A truncated response is still usable if enough of it survived to
/// make progress - there is no other transport to retry it over.
pub fn is_usable_response(response: &Message) -> bool {
    if !matches!(response.header.rcode, Rcode::NoError | Rcode::NameError) {
        return false;
    }

    if response.header.is_truncated {
        return !response.answers.is_empty() || !response.authority.is_empty();
    }

    true
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use dns_wire::types::test_util::*;

    use super::test_util::*;
    use super::*;

    #[test]
    fn response_matches_request_accepts() {
        let (request, response) = matching_nameserver_response();

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_id() {
        let (request, mut response) = matching_nameserver_response();
        response.header.id += 1;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_qr() {
        let (request, mut response) = matching_nameserver_response();
        response.header.is_response = false;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_opcode() {
        let (request, mut response) = matching_nameserver_response();
        response.header.opcode = Opcode::Status;

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_checks_question() {
        let (request, mut response) = matching_nameserver_response();
        response.questions = vec![question(
            "other.example.com",
            QueryType::Record(RecordType::A),
        )];

        assert!(!response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_aa() {
        let (request, mut response) = matching_nameserver_response();
        response.header.is_authoritative = !response.header.is_authoritative;

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn response_matches_request_does_not_check_ra() {
        let (request, mut response) = matching_nameserver_response();
        response.header.recursion_available = !response.header.recursion_available;

        assert!(response_matches_request(&request, &response));
    }

    #[test]
    fn usable_rcodes() {
        let (_, mut response) = matching_nameserver_response();

        for (rcode, usable) in [
            (Rcode::NoError, true),
            (Rcode::FormatError, false),
            (Rcode::ServerFailure, false),
            (Rcode::NameError, true),
            (Rcode::NotImplemented, false),
            (Rcode::Refused, false),
        ] {
            response.header.rcode = rcode;
            assert_eq!(usable, is_usable_response(&response), "{rcode}");
        }
    }

    #[test]
    fn truncated_response_usable_only_with_content() {
        let (_, mut response) = matching_nameserver_response();
        response.header.is_truncated = true;

        assert!(is_usable_response(&response));

        response.answers = Vec::new();
        assert!(!is_usable_response(&response));

        response.authority = vec![ns_record("example.com", "ns1.example.net")];
        assert!(is_usable_response(&response));
    }

    #[tokio::test]
    async fn query_nameserver_discards_mismatched_datagrams() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (size, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let query = Message::from_octets(&buf[..size]).unwrap();

            // garbage, then a wrong-id response, then the real one
            upstream.send_to(&[0xff, 0xff, 0xff], peer).await.unwrap();

            let mut wrong_id = query.make_response();
            wrong_id.header.id = query.header.id.wrapping_add(1);
            upstream
                .send_to(&wrong_id.into_octets().unwrap(), peer)
                .await
                .unwrap();

            let mut real = query.make_response();
            real.answers = vec![a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1))];
            upstream
                .send_to(&real.into_octets().unwrap(), peer)
                .await
                .unwrap();
        });

        let response = query_nameserver(
            upstream_address,
            &question("www.example.com", QueryType::Record(RecordType::A)),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(
            vec![a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1))],
            response.answers
        );
    }

    #[tokio::test]
    async fn query_nameserver_times_out() {
        // bound but never answered
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_address = upstream.local_addr().unwrap();

        let response = query_nameserver(
            upstream_address,
            &question("www.example.com", QueryType::Record(RecordType::A)),
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(None, response);
        drop(upstream);
    }
}

#[cfg(test)]
pub mod test_util {
    use dns_wire::types::test_util::*;
    use std::net::Ipv4Addr;

    use super::*;

    pub fn matching_nameserver_response() -> (Message, Message) {
        nameserver_response(
            "www.example.com",
            &[a_record("www.example.com", Ipv4Addr::new(1, 1, 1, 1))],
            &[],
            &[],
        )
    }

    pub fn nameserver_response(
        name: &str,
        answers: &[ResourceRecord],
        authority: &[ResourceRecord],
        additional: &[ResourceRecord],
    ) -> (Message, Message) {
        let request = Message::from_question(
            1234,
            question(name, QueryType::Record(RecordType::A)),
        );

        let mut response = request.make_response();
        response.answers = answers.into();
        response.authority = authority.into();
        response.additional = additional.into();

        (request, response)
    }
}
