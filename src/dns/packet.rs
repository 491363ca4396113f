use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::dns::types::{DnsClass, RecordType, ResponseCode};

/// Raw DNS packet codec - full binary level parsing per RFC 1035.
/// No external DNS library used - everything is hand-parsed from &[u8].
///
/// A parsed packet keeps the original wire bytes in `raw`. Rewrites that
/// must survive label compression (transaction ID, answer TTLs) are done
/// in place on `raw` with the parsed view kept in sync; packets that are
/// synthesized locally are encoded without compression.

#[derive(Debug, Clone)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool, // Query/Response flag
    pub opcode: u8,
    pub aa: bool, // Authoritative Answer
    pub tc: bool, // Truncated
    pub rd: bool, // Recursion Desired
    pub ra: bool, // Recursion Available
    pub rcode: ResponseCode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: DnsClass,
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub rclass: DnsClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    /// The record's address body, if it is an A or AAAA record.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.rtype {
            RecordType::A if self.rdata.len() == 4 => {
                let b: [u8; 4] = self.rdata[..].try_into().ok()?;
                Some(IpAddr::V4(Ipv4Addr::from(b)))
            }
            RecordType::AAAA if self.rdata.len() == 16 => {
                let b: [u8; 16] = self.rdata[..].try_into().ok()?;
                Some(IpAddr::V6(Ipv6Addr::from(b)))
            }
            _ => None,
        }
    }

    /// 4-byte IPv4 body of an A (or wildcard-typed) record.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if !matches!(self.rtype, RecordType::A | RecordType::ANY) {
            return None;
        }
        let b: [u8; 4] = self.rdata[..].try_into().ok()?;
        Some(Ipv4Addr::from(b))
    }
}

/// An answer assembled locally (hosts / dyn tables), to be encoded into
/// a synthesized reply.
#[derive(Debug, Clone)]
pub struct AnswerRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: DnsClass,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
    raw: Vec<u8>,
}

impl fmt::Display for DnsPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[id:{}][rcode:{:?}][flags:", self.header.id, self.header.rcode)?;
        if self.header.qr {
            write!(f, "+R")?;
        }
        if self.header.tc {
            write!(f, "+T")?;
        }
        if self.header.rd {
            write!(f, "+RD")?;
        }
        if self.header.ra {
            write!(f, "+RA")?;
        }
        write!(f, "]")?;
        for q in &self.questions {
            write!(f, " [{}:{}]", q.qtype.name(), q.name)?;
        }
        for a in &self.answers {
            match a.ip() {
                Some(ip) => write!(f, " [{}:{} ttl:{} ip:{}]", a.rtype.name(), a.name, a.ttl, ip)?,
                None => write!(f, " [{}:{} ttl:{}]", a.rtype.name(), a.name, a.ttl)?,
            }
        }
        Ok(())
    }
}

/// Parse a DNS name with label compression support (RFC 1035 §4.1.4).
/// `offset` is advanced past the name as it appears at the call site.
fn parse_name(data: &[u8], offset: &mut usize) -> anyhow::Result<String> {
    let mut labels = Vec::new();
    let mut jumped = false;
    let mut pos = *offset;
    let mut jumps = 0;
    const MAX_JUMPS: usize = 10; // prevent pointer loops

    loop {
        if pos >= data.len() {
            return Err(anyhow::anyhow!("name parse: unexpected end of data at offset {}", pos));
        }

        let len_byte = data[pos];

        // Pointer: top two bits set
        if (len_byte & 0xC0) == 0xC0 {
            if pos + 1 >= data.len() {
                return Err(anyhow::anyhow!("name parse: truncated pointer at offset {}", pos));
            }
            if !jumped {
                *offset = pos + 2;
                jumped = true;
            }
            pos = (((len_byte as u16 & 0x3F) << 8) | data[pos + 1] as u16) as usize;
            jumps += 1;
            if jumps > MAX_JUMPS {
                return Err(anyhow::anyhow!("name parse: too many jumps (possible loop)"));
            }
            continue;
        }

        if len_byte == 0 {
            if !jumped {
                *offset = pos + 1;
            }
            break;
        }

        let label_len = len_byte as usize;
        pos += 1;
        if pos + label_len > data.len() {
            return Err(anyhow::anyhow!("name parse: label extends beyond packet"));
        }
        labels.push(String::from_utf8_lossy(&data[pos..pos + label_len]).to_string());
        pos += label_len;
    }

    Ok(labels.join("."))
}

/// Encode a DNS name into wire format (uncompressed).
pub fn encode_name(name: &str) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(name.len() + 2);
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(anyhow::anyhow!("bad label {:?} in name {:?}", label, name));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    if out.len() > 255 {
        return Err(anyhow::anyhow!("name too long: {:?}", name));
    }
    Ok(out)
}

fn parse_records(data: &[u8], offset: &mut usize, count: u16) -> anyhow::Result<Vec<DnsRecord>> {
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = parse_name(data, offset)?;
        if *offset + 10 > data.len() {
            return Err(anyhow::anyhow!("record truncated at offset {}", offset));
        }
        let rtype = RecordType::from(u16::from_be_bytes([data[*offset], data[*offset + 1]]));
        let rclass = DnsClass::from(u16::from_be_bytes([data[*offset + 2], data[*offset + 3]]));
        let ttl = u32::from_be_bytes([
            data[*offset + 4],
            data[*offset + 5],
            data[*offset + 6],
            data[*offset + 7],
        ]);
        let rdlength = u16::from_be_bytes([data[*offset + 8], data[*offset + 9]]) as usize;
        *offset += 10;

        if *offset + rdlength > data.len() {
            return Err(anyhow::anyhow!("rdata extends beyond packet"));
        }
        let rdata = data[*offset..*offset + rdlength].to_vec();
        *offset += rdlength;

        records.push(DnsRecord { name, rtype, rclass, ttl, rdata });
    }
    Ok(records)
}

impl DnsPacket {
    /// Parse a complete DNS packet from wire bytes.
    pub fn parse(data: &[u8]) -> anyhow::Result<DnsPacket> {
        if data.len() < 12 {
            return Err(anyhow::anyhow!("packet too short: {} bytes (minimum 12)", data.len()));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        let ancount = u16::from_be_bytes([data[6], data[7]]);
        let nscount = u16::from_be_bytes([data[8], data[9]]);
        let arcount = u16::from_be_bytes([data[10], data[11]]);

        let header = DnsHeader {
            id,
            qr: (flags >> 15) & 1 == 1,
            opcode: ((flags >> 11) & 0xF) as u8,
            aa: (flags >> 10) & 1 == 1,
            tc: (flags >> 9) & 1 == 1,
            rd: (flags >> 8) & 1 == 1,
            ra: (flags >> 7) & 1 == 1,
            rcode: ResponseCode::from((flags & 0xF) as u8),
            qdcount,
            ancount,
            nscount,
            arcount,
        };

        let mut offset = 12;

        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let name = parse_name(data, &mut offset)?;
            if offset + 4 > data.len() {
                return Err(anyhow::anyhow!("question section truncated"));
            }
            let qtype = RecordType::from(u16::from_be_bytes([data[offset], data[offset + 1]]));
            let qclass = DnsClass::from(u16::from_be_bytes([data[offset + 2], data[offset + 3]]));
            offset += 4;
            questions.push(DnsQuestion { name, qtype, qclass });
        }

        let answers = parse_records(data, &mut offset, ancount)?;
        let authorities = parse_records(data, &mut offset, nscount)?;
        let additionals = parse_records(data, &mut offset, arcount)?;

        Ok(DnsPacket {
            header,
            questions,
            answers,
            authorities,
            additionals,
            raw: data.to_vec(),
        })
    }

    /// Build a query packet.
    pub fn build_query(id: u16, name: &str, qtype: RecordType, rd: bool) -> anyhow::Result<DnsPacket> {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(&id.to_be_bytes());
        let flags: u16 = if rd { 0x0100 } else { 0x0000 };
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&encode_name(name)?);
        buf.extend_from_slice(&qtype.to_u16().to_be_bytes());
        buf.extend_from_slice(&DnsClass::IN.to_u16().to_be_bytes());
        Self::parse(&buf)
    }

    /// Synthesize a reply from locally assembled answers: response flag
    /// and recursion-available set, transaction ID taken from the request.
    pub fn build_reply(req: &DnsPacket, answers: &[AnswerRecord]) -> anyhow::Result<DnsPacket> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&req.header.id.to_be_bytes());
        let flags: u16 = 0x8080; // QR | RA
        buf.extend_from_slice(&flags.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes()); // no question section
        buf.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        for a in answers {
            buf.extend_from_slice(&encode_name(&a.name)?);
            buf.extend_from_slice(&a.rtype.to_u16().to_be_bytes());
            buf.extend_from_slice(&a.class.to_u16().to_be_bytes());
            buf.extend_from_slice(&a.ttl.to_be_bytes());
            buf.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            buf.extend_from_slice(&a.rdata);
        }
        Self::parse(&buf)
    }

    /// Build an error reply from a request: response flag set, the given
    /// rcode, record counts zeroed, ID and question bytes preserved.
    pub fn build_error_reply(req: &DnsPacket, rcode: ResponseCode) -> anyhow::Result<DnsPacket> {
        let mut buf = req.raw.clone();
        buf[2] = (buf[2] | 0x80) & 0xFD; // QR=1, TC=0
        buf[3] = (buf[3] & 0xF0) | rcode.to_u8();
        buf[6] = 0;
        buf[7] = 0;
        buf[8] = 0;
        buf[9] = 0;
        buf[10] = 0;
        buf[11] = 0;
        Self::parse(&buf)
    }

    pub fn id(&self) -> u16 {
        self.header.id
    }

    pub fn first_question(&self) -> Option<&DnsQuestion> {
        self.questions.first()
    }

    /// The wire bytes of this packet.
    pub fn wire(&self) -> &[u8] {
        &self.raw
    }

    /// Rewrite the transaction ID, in the wire bytes and the parsed view.
    pub fn set_id(&mut self, id: u16) {
        let b = id.to_be_bytes();
        self.raw[0] = b[0];
        self.raw[1] = b[1];
        self.header.id = id;
    }

    /// Overwrite every answer's TTL with `f(old_ttl)`. OPT pseudo-records
    /// keep their TTL field (it is not a TTL). Operates on the wire bytes
    /// so compressed names stay valid.
    pub fn rewrite_answer_ttls(&mut self, f: impl Fn(u32) -> u32) -> anyhow::Result<()> {
        let mut offset = 12usize;
        for _ in 0..self.header.qdcount {
            parse_name(&self.raw, &mut offset)?;
            offset += 4;
        }
        for i in 0..self.header.ancount as usize {
            parse_name(&self.raw, &mut offset)?;
            if offset + 10 > self.raw.len() {
                return Err(anyhow::anyhow!("answer truncated at offset {}", offset));
            }
            let rtype = u16::from_be_bytes([self.raw[offset], self.raw[offset + 1]]);
            if rtype != RecordType::OPT.to_u16() {
                let old = u32::from_be_bytes([
                    self.raw[offset + 4],
                    self.raw[offset + 5],
                    self.raw[offset + 6],
                    self.raw[offset + 7],
                ]);
                let new = f(old);
                self.raw[offset + 4..offset + 8].copy_from_slice(&new.to_be_bytes());
                if let Some(ans) = self.answers.get_mut(i) {
                    ans.ttl = new;
                }
            }
            let rdlength =
                u16::from_be_bytes([self.raw[offset + 8], self.raw[offset + 9]]) as usize;
            offset += 10 + rdlength;
        }
        Ok(())
    }

    /// Set every answer's TTL to a fixed value.
    pub fn set_answer_ttls(&mut self, ttl: u32) -> anyhow::Result<()> {
        self.rewrite_answer_ttls(|_| ttl)
    }

    /// Cap every answer's TTL at `max_ttl`. A zero `max_ttl` disables the
    /// clamp.
    pub fn clamp_answer_ttls(&mut self, max_ttl: u32) -> anyhow::Result<()> {
        if max_ttl == 0 {
            return Ok(());
        }
        self.rewrite_answer_ttls(|ttl| ttl.min(max_ttl))
    }
}
