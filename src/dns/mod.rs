//! DNS subsystem: transports, client façade, hosts, fake-ip and reverse
//! mapping.

pub mod client;
pub mod fakeip;
pub mod hosts;
pub mod reverse;
pub mod transport;

pub use client::{DnsClient, DnsClientConfig, QueryOptions};
pub use fakeip::{DomainPredicate, FakeIpStore};
pub use hosts::Hosts;
pub use reverse::DnsReverseMapping;
pub use transport::{build_transports, Transport, TransportSet};

use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;

use crate::error::{Error, Result};

/// Normalized lowercase domain of a DNS name, without the trailing dot.
pub fn name_to_domain(name: &Name) -> String {
    let mut domain = name.to_utf8().to_lowercase();
    if domain.ends_with('.') && domain.len() > 1 {
        domain.pop();
    }
    domain
}

/// Domain of the first question, if any.
pub fn question_domain(message: &Message) -> Option<String> {
    message.queries().first().map(|q| name_to_domain(q.name()))
}

/// Record type of the first question.
pub fn question_type(message: &Message) -> Option<RecordType> {
    message.queries().first().map(|q| q.query_type())
}

/// Response skeleton mirroring the query id and questions.
pub fn response_for(message: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(message.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(message.op_code());
    response.set_recursion_desired(message.recursion_desired());
    response.set_recursion_available(true);
    for query in message.queries() {
        response.add_query(query.clone());
    }
    response
}

/// Response with the given code and no answers.
pub fn rcode_response(message: &Message, code: ResponseCode) -> Message {
    let mut response = response_for(message);
    response.set_response_code(code);
    response
}

/// Answer the query with the given addresses, filtered to the question type.
pub fn address_response(message: &Message, addresses: &[IpAddr], ttl: u32) -> Message {
    let mut response = response_for(message);
    response.set_response_code(ResponseCode::NoError);
    if let Some(query) = message.queries().first() {
        let name = query.name().clone();
        for address in addresses {
            let rdata = match (address, query.query_type()) {
                (IpAddr::V4(v4), RecordType::A) => RData::A(A(*v4)),
                (IpAddr::V6(v6), RecordType::AAAA) => RData::AAAA(AAAA(*v6)),
                _ => continue,
            };
            response.add_answer(Record::from_rdata(name.clone(), ttl, rdata));
        }
    }
    response
}

/// Addresses carried in the answer section.
pub fn message_addresses(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}

/// Serialize a response, dropping answers and setting TC until it fits the
/// packet MTU.
pub fn truncate_message(response: &Message, mtu: usize) -> Result<Vec<u8>> {
    let encoded = response.to_bytes()?;
    if encoded.len() <= mtu {
        return Ok(encoded);
    }
    let mut truncated = response.clone();
    truncated.set_truncated(true);
    while !truncated.answers().is_empty() {
        let mut answers = truncated.take_answers();
        answers.pop();
        truncated.insert_answers(answers);
        let encoded = truncated.to_bytes()?;
        if encoded.len() <= mtu {
            return Ok(encoded);
        }
    }
    Ok(truncated.to_bytes()?)
}

/// Is the response one worth caching or did the server reject the name.
pub fn is_rejected(message: &Message) -> bool {
    matches!(
        message.response_code(),
        ResponseCode::NXDomain | ResponseCode::Refused | ResponseCode::ServFail
    )
}

/// Build an address query for the domain.
pub fn address_query(domain: &str, record_type: RecordType) -> Result<Message> {
    let name = Name::from_utf8(domain).map_err(|err| Error::Resolve {
        domain: domain.to_string(),
        message: err.to_string(),
    })?;
    let mut message = Message::new();
    message.set_id(rand_id());
    message.set_recursion_desired(true);
    message.add_query(hickory_proto::op::Query::query(name, record_type));
    Ok(message)
}

/// Query ids only need to differ between in-flight queries on one socket.
fn rand_id() -> u16 {
    use std::sync::atomic::{AtomicU16, Ordering};
    static NEXT: AtomicU16 = AtomicU16::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}
