//! DNS Summary
//!
//! Pulls the query name and the first few answer values out of a DNS message.
//! Only what the metadata record carries is decoded; everything else in the
//! message is skipped.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Longest name or answer value kept, in bytes
pub const DNS_NAME_MAX: usize = 96;

/// Most answer values kept per message
pub const DNS_RESULT_MAX: usize = 8;

const DNS_HDR_LEN: usize = 12;
const POINTER_HOPS_MAX: usize = 16;

const TYPE_A: u16 = 1;
const TYPE_NS: u16 = 2;
const TYPE_CNAME: u16 = 5;
const TYPE_PTR: u16 = 12;
const TYPE_AAAA: u16 = 28;

/// Query name and answer values from one DNS message
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DnsSummary {
    /// Transaction ID
    pub id: u16,
    /// Response bit
    pub is_response: bool,
    /// First question name
    pub qname: String,
    /// Rendered A/AAAA/CNAME/PTR/NS answers
    pub answers: Vec<String>,
}

impl DnsSummary {
    /// Parse a DNS message; `None` when the header or question is malformed
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < DNS_HDR_LEN {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let is_response = data[2] & 0x80 != 0;
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        let ancount = u16::from_be_bytes([data[6], data[7]]);

        if qdcount == 0 {
            return None;
        }

        let mut offset = DNS_HDR_LEN;
        let mut qname = String::new();
        for i in 0..qdcount {
            let (name, next) = read_name(data, offset)?;
            if i == 0 {
                qname = name;
            }
            // qtype + qclass
            offset = next + 4;
            if offset > data.len() {
                return None;
            }
        }

        let mut answers = Vec::new();
        for _ in 0..ancount {
            if answers.len() >= DNS_RESULT_MAX {
                break;
            }
            let Some((_, next)) = read_name(data, offset) else {
                break;
            };
            if next + 10 > data.len() {
                break;
            }
            let rtype = u16::from_be_bytes([data[next], data[next + 1]]);
            let rdlen = u16::from_be_bytes([data[next + 8], data[next + 9]]) as usize;
            let rdata_start = next + 10;
            let rdata_end = rdata_start + rdlen;
            if rdata_end > data.len() {
                break;
            }

            let value = match rtype {
                TYPE_A if rdlen == 4 => {
                    let r = &data[rdata_start..rdata_end];
                    Some(Ipv4Addr::new(r[0], r[1], r[2], r[3]).to_string())
                }
                TYPE_AAAA if rdlen == 16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&data[rdata_start..rdata_end]);
                    Some(Ipv6Addr::from(octets).to_string())
                }
                TYPE_CNAME | TYPE_PTR | TYPE_NS => read_name(data, rdata_start).map(|(n, _)| n),
                _ => None,
            };
            if let Some(value) = value {
                answers.push(value);
            }
            offset = rdata_end;
        }

        Some(Self {
            id,
            is_response,
            qname,
            answers,
        })
    }
}

/// Read a possibly compressed name starting at `offset`.
///
/// Returns the dotted name (truncated to `DNS_NAME_MAX`) and the offset just
/// past the name in the original position.
fn read_name(data: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut resume = None;
    let mut hops = 0;

    loop {
        let len = *data.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }

        if len & 0xc0 == 0xc0 {
            let low = *data.get(offset + 1)? as usize;
            if resume.is_none() {
                resume = Some(offset + 2);
            }
            hops += 1;
            if hops > POINTER_HOPS_MAX {
                return None;
            }
            offset = ((len & 0x3f) << 8) | low;
            continue;
        }

        let label = data.get(offset + 1..offset + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            name.push(if b.is_ascii_graphic() { b as char } else { '?' });
        }
        offset += 1 + len;
    }

    if name.len() > DNS_NAME_MAX {
        name.truncate(DNS_NAME_MAX);
    }

    Some((name, resume.unwrap_or(offset)))
}
