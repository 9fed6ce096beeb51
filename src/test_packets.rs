// 测试用报文构造 / wire-format packets for unit tests

use std::net::Ipv4Addr;

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, NS};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};

pub fn name(s: &str) -> Name {
    Name::from_ascii(s).expect("valid name")
}

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder).expect("encode message");
    }
    out
}

fn base_query(id: u16, qname: &str, qtype: RecordType) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(name(qname), qtype));
    msg
}

pub fn query(id: u16, qname: &str, qtype: RecordType) -> Vec<u8> {
    encode(&base_query(id, qname, qtype))
}

pub fn query_with_edns(id: u16, qname: &str, qtype: RecordType, payload: u16) -> Vec<u8> {
    let mut msg = base_query(id, qname, qtype);
    let mut edns = Edns::new();
    edns.set_max_payload(payload);
    msg.set_edns(edns);
    encode(&msg)
}

fn base_response(id: u16, qname: &str, qtype: RecordType, rcode: ResponseCode, ttls: &[u32]) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    msg.add_query(Query::query(name(qname), qtype));
    for (idx, ttl) in ttls.iter().enumerate() {
        let rdata = RData::A(A(Ipv4Addr::new(192, 0, 2, idx as u8 + 1)));
        msg.add_answer(Record::from_rdata(name(qname), *ttl, rdata));
    }
    msg
}

/// Response with one A record per entry of `ttls`.
pub fn response(id: u16, qname: &str, qtype: RecordType, rcode: ResponseCode, ttls: &[u32]) -> Vec<u8> {
    encode(&base_response(id, qname, qtype, rcode, ttls))
}

pub fn response_with_authority(
    id: u16,
    qname: &str,
    rcode: ResponseCode,
    ttls: &[u32],
    ns_ttl: u32,
) -> Vec<u8> {
    let mut msg = base_response(id, qname, RecordType::A, rcode, ttls);
    let ns = RData::NS(NS(name("ns1.example.")));
    msg.add_name_server(Record::from_rdata(name("example."), ns_ttl, ns));
    encode(&msg)
}

/// TTL of every answer record, decoded with hickory-proto.
pub fn answer_ttls(packet: &[u8]) -> Vec<u32> {
    let msg = Message::from_vec(packet).expect("decode message");
    msg.answers().iter().map(|r| r.ttl()).collect()
}
