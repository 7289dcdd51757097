//! DNS resolver
//!
//! Resolves hostnames to IPv4 addresses with A queries over a UDP slot that
//! is borrowed for the duration of one lookup. There is no cache; every call
//! queries the configured server.
//!
//! Each lookup:
//! - Claims a free slot and opens it in UDP mode
//! - Sends the query to the server on port 53
//! - Polls for the reply, retrying once after a timeout
//! - Closes and releases the slot whatever the outcome

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use isonet_config::parse_dotted_quad;
use smoltcp::wire::Ipv4Address;

use crate::bus::Bus;
use crate::clock::{elapsed, Clock};
use crate::drivers::{SocketFlags, SocketMode};
use crate::error::NetError;
use crate::slots::{SlotOwner, SocketSlot};

/// DNS server port
pub const DNS_PORT: u16 = 53;
/// Wait for a reply per attempt
pub const DNS_TIMEOUT_MS: u32 = 3000;
/// Attempts per lookup
pub const DNS_TRIES: u32 = 2;
/// Largest reply accepted over UDP
pub const MAX_DNS_BUF_SIZE: usize = 512;

/// A record type
const TYPE_A: u16 = 1;
/// Internet class
const CLASS_IN: u16 = 1;

/// DNS response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    /// No error
    NoError = 0,
    /// Format error
    FormatError = 1,
    /// Server failure
    ServerFailure = 2,
    /// Name error (domain doesn't exist)
    NameError = 3,
    /// Not implemented
    NotImplemented = 4,
    /// Refused
    Refused = 5,
}

impl ResponseCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(ResponseCode::NoError),
            1 => Some(ResponseCode::FormatError),
            2 => Some(ResponseCode::ServerFailure),
            3 => Some(ResponseCode::NameError),
            4 => Some(ResponseCode::NotImplemented),
            5 => Some(ResponseCode::Refused),
            _ => None,
        }
    }
}

/// DNS header (12 bytes, RFC 1035 section 4.1.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    /// QR, Opcode, AA, TC, RD, RA, Z, RCODE
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl DnsHeader {
    pub const LEN: usize = 12;

    /// Standard query with recursion desired
    pub fn new_query(id: u16) -> Self {
        Self {
            id,
            flags: 0x0100,
            qdcount: 1,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        let fields = [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ];
        for (chunk, field) in bytes.chunks_exact_mut(2).zip(fields) {
            chunk.copy_from_slice(&field.to_be_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, &'static str> {
        if bytes.len() < Self::LEN {
            return Err("DNS header too short");
        }
        let field = |at: usize| u16::from_be_bytes([bytes[at], bytes[at + 1]]);

        Ok(Self {
            id: field(0),
            flags: field(2),
            qdcount: field(4),
            ancount: field(6),
            nscount: field(8),
            arcount: field(10),
        })
    }

    /// QR bit
    pub fn is_response(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000F) as u8
    }
}

/// Encode a domain name in DNS label format
///
/// "example.com" becomes `[7]example[3]com[0]`. Labels are cut at 63 bytes.
pub fn encode_domain_name(domain: &str) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(domain.len() + 2);

    for label in domain.split('.').filter(|label| !label.is_empty()) {
        let len = label.len().min(63);
        encoded.push(len as u8);
        encoded.extend_from_slice(&label.as_bytes()[..len]);
    }
    encoded.push(0);

    encoded
}

/// Decode a domain name starting at `offset`
///
/// Follows compression pointers (RFC 1035 section 4.1.4), at most 5 deep.
///
/// # Returns
/// * `Ok((name, next))` - The name and the offset just past it in `data`
pub fn decode_domain_name(data: &[u8], offset: usize) -> Result<(String, usize), &'static str> {
    const MAX_JUMPS: usize = 5;

    let mut name = String::new();
    let mut pos = offset;
    let mut resume = None;
    let mut jumps = 0;

    loop {
        let len = *data
            .get(pos)
            .ok_or("Unexpected end of data while decoding domain name")?;

        if (len & 0xC0) == 0xC0 {
            let low = *data.get(pos + 1).ok_or("Incomplete compression pointer")?;
            let pointer = (usize::from(len & 0x3F) << 8) | usize::from(low);
            if pointer >= data.len() {
                return Err("Invalid compression pointer");
            }
            jumps += 1;
            if jumps > MAX_JUMPS {
                return Err("Too many compression jumps");
            }
            resume.get_or_insert(pos + 2);
            pos = pointer;
            continue;
        }

        if len == 0 {
            pos += 1;
            break;
        }
        if len > 63 {
            return Err("Label length too long");
        }

        let start = pos + 1;
        let end = start + usize::from(len);
        let label = data.get(start..end).ok_or("Label extends beyond data")?;
        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|&b| b as char));
        pos = end;
    }

    Ok((name, resume.unwrap_or(pos)))
}

/// Build an A query for `hostname`
pub fn build_query(hostname: &str, transaction_id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(DnsHeader::LEN + hostname.len() + 6);
    packet.extend_from_slice(&DnsHeader::new_query(transaction_id).to_bytes());
    packet.extend_from_slice(&encode_domain_name(hostname));
    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());
    packet
}

/// Resource record from the answer section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsAnswer {
    pub fn from_bytes(data: &[u8], offset: usize) -> Result<(Self, usize), &'static str> {
        let (name, pos) = decode_domain_name(data, offset)?;

        let fixed = data.get(pos..pos + 10).ok_or("Incomplete DNS answer")?;
        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));

        let start = pos + 10;
        let rdata = data
            .get(start..start + rdlength)
            .ok_or("Incomplete DNS answer data")?
            .to_vec();

        Ok((
            Self {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            start + rdlength,
        ))
    }

    /// Address carried by an A record
    pub fn as_ipv4(&self) -> Option<Ipv4Address> {
        if self.rtype == TYPE_A && self.rclass == CLASS_IN && self.rdata.len() == 4 {
            Some(Ipv4Address::from_bytes(&self.rdata))
        } else {
            None
        }
    }
}

/// Parsed DNS reply
#[derive(Debug)]
pub struct DnsResponse {
    pub header: DnsHeader,
    pub answers: Vec<DnsAnswer>,
}

impl DnsResponse {
    pub fn from_bytes(data: &[u8]) -> Result<Self, &'static str> {
        let header = DnsHeader::from_bytes(data)?;
        if !header.is_response() {
            return Err("Not a DNS response");
        }

        // Skip the echoed questions
        let mut pos = DnsHeader::LEN;
        for _ in 0..header.qdcount {
            let (_, next) = decode_domain_name(data, pos)?;
            if next + 4 > data.len() {
                return Err("Incomplete question section");
            }
            pos = next + 4;
        }

        let mut answers = Vec::with_capacity(usize::from(header.ancount));
        for _ in 0..header.ancount {
            let (answer, next) = DnsAnswer::from_bytes(data, pos)?;
            answers.push(answer);
            pos = next;
        }

        Ok(Self { header, answers })
    }

    pub fn first_ipv4(&self) -> Option<Ipv4Address> {
        self.answers.iter().find_map(DnsAnswer::as_ipv4)
    }

    /// Map the reply to a lookup result
    pub fn into_result(self) -> Result<Ipv4Address, NetError> {
        match ResponseCode::from_u8(self.header.rcode()) {
            Some(ResponseCode::NoError) => self
                .first_ipv4()
                .ok_or_else(|| NetError::DnsFailure("no A record in reply".to_string())),
            Some(ResponseCode::NameError) => Err(NetError::DnsNameNotFound),
            Some(ResponseCode::ServerFailure) => Err(NetError::DnsServerFailure),
            Some(code) => Err(NetError::DnsFailure(format!("server answered {:?}", code))),
            None => Err(NetError::DnsFailure(format!(
                "unknown response code {}",
                self.header.rcode()
            ))),
        }
    }
}

/// Resolve a dotted-quad literal without a query
pub fn parse_literal(host: &str) -> Option<Ipv4Address> {
    parse_dotted_quad(host).map(Ipv4Address)
}

/// Look up `host` through `server`
///
/// # Arguments
/// * `bus` - Bus the query slot is claimed on
/// * `clock` - Time source for the reply timeout
/// * `server` - DNS server
/// * `local_port` - Source port for the query
/// * `id` - Transaction ID
/// * `host` - Name to resolve
///
/// # Returns
/// * `Ok(ip)` - First A record of the reply
/// * `Err(NetError)` - No slot, no reply, or a negative reply; the slot is
///   released in every case
pub fn resolve(
    bus: &Bus,
    clock: &dyn Clock,
    server: Ipv4Address,
    local_port: u16,
    id: u16,
    host: &str,
) -> Result<Ipv4Address, NetError> {
    if let Some(ip) = parse_literal(host) {
        return Ok(ip);
    }
    if server.is_unspecified() {
        log::trace!("dns error {}: no server configured", host);
        return Err(NetError::DnsFailure("no DNS server configured".to_string()));
    }

    let slot = bus.transaction(|tx| -> Result<SocketSlot, NetError> {
        let slot = tx.acquire(SlotOwner::Dns)?;
        if let Err(e) = tx
            .chip()
            .open(slot, SocketMode::Udp, local_port, SocketFlags::empty())
        {
            tx.release(slot);
            return Err(NetError::SocketOpen(e));
        }
        Ok(slot)
    })?;

    let result = exchange(bus, clock, slot, server, id, host);
    bus.transaction(|tx| tx.close_and_release(slot));

    match &result {
        Ok(ip) => log::trace!("dns resolved {} to {}", host, ip),
        Err(e) => log::trace!("dns error {}: {}", host, e),
    }
    result
}

fn exchange(
    bus: &Bus,
    clock: &dyn Clock,
    slot: SocketSlot,
    server: Ipv4Address,
    id: u16,
    host: &str,
) -> Result<Ipv4Address, NetError> {
    let query = build_query(host, id);
    let mut buffer = [0u8; MAX_DNS_BUF_SIZE];

    for attempt in 0..DNS_TRIES {
        bus.transaction(|tx| tx.chip().send_to(slot, &query, server, DNS_PORT))
            .map_err(NetError::Send)?;
        log::trace!("dns query {} to {} (try {})", host, server, attempt + 1);

        let start = clock.now_ms();
        loop {
            let received = bus.transaction(|tx| {
                if tx.chip().rx_size(slot) == 0 {
                    return None;
                }
                Some(tx.chip().recv_from(slot, &mut buffer))
            });

            match received {
                Some(Ok((len, from, port))) => {
                    if from != server || port != DNS_PORT {
                        continue;
                    }
                    let response = DnsResponse::from_bytes(&buffer[..len])
                        .map_err(|e| NetError::DnsMalformedResponse(e.to_string()))?;
                    if response.header.id != id {
                        continue;
                    }
                    return response.into_result();
                }
                Some(Err(e)) => return Err(NetError::Receive(e)),
                None => {}
            }

            if elapsed(clock, start, DNS_TIMEOUT_MS) {
                break;
            }
            clock.sleep_ms(1);
        }
    }

    Err(NetError::DnsTimeout)
}
