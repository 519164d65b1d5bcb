// UDP DNS responder that points domain-joined tooling at the gateway

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

pub const TYPE_A: u16 = 1;
pub const TYPE_SRV: u16 = 33;
const CLASS_IN: u16 = 1;
const TTL: u32 = 300;

const HEADER_LEN: usize = 12;
const MAX_DATAGRAM: usize = 512;
const MAX_POINTER_JUMPS: usize = 16;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const OPCODE_MASK: u16 = 0x7800;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_NOTIMP: u8 = 4;

const PDC_SRV_PREFIX: &str = "_ldap._tcp.pdc._msdcs.";
const GC_SRV_PREFIX: &str = "_ldap._tcp.gc._msdcs.";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Question {
    name: String,
    qtype: u16,
    qclass: u16,
}

/// Answers A and SRV questions with this host's name and address.
#[derive(Debug, Clone)]
pub struct DnsResponder {
    hostname: String,
    address: Ipv4Addr,
    ldap_port: u16,
    gc_port: u16,
}

impl DnsResponder {
    pub fn new(hostname: impl Into<String>, address: Ipv4Addr, ldap_port: u16, gc_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            address,
            ldap_port,
            gc_port,
        }
    }

    /// Uses the machine's host name and its first non-loopback IPv4 address.
    pub async fn for_local_host(ldap_port: u16, gc_port: u16) -> Result<Self> {
        let hostname = local_hostname();
        let address = local_ipv4(&hostname).await?;
        debug!("DNS hostname: {}", hostname);
        debug!("Local IP address: {}", address);
        Ok(Self::new(hostname, address, ldap_port, gc_port))
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Port advertised in an SRV answer for the given owner name.
    pub fn srv_port(&self, name: &str) -> u16 {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with(PDC_SRV_PREFIX) {
            self.ldap_port
        } else if lower.starts_with(GC_SRV_PREFIX) {
            self.gc_port
        } else {
            1
        }
    }

    /// Build the reply for one query datagram. Err means the datagram is not a query we can parse.
    pub fn respond(&self, packet: &[u8]) -> Result<Vec<u8>> {
        if packet.len() < HEADER_LEN {
            bail!("DNS packet too short ({} bytes)", packet.len());
        }
        let id = read_u16(packet, 0)?;
        let flags = read_u16(packet, 2)?;
        if flags & FLAG_QR != 0 {
            bail!("DNS packet {:#06x} is a response, not a query", id);
        }
        let qdcount = read_u16(packet, 4)?;

        let mut pos = HEADER_LEN;
        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let name = read_name(packet, &mut pos)?;
            let qtype = read_u16(packet, pos)?;
            let qclass = read_u16(packet, pos + 2)?;
            pos += 4;
            debug!("DNS request = {} (type {})", name, qtype);
            questions.push(Question { name, qtype, qclass });
        }

        let opcode_query = flags & OPCODE_MASK == 0;
        let supported = opcode_query && questions.iter().all(|q| matches!(q.qtype, TYPE_A | TYPE_SRV));
        let rcode = if supported { RCODE_NOERROR } else { RCODE_NOTIMP };
        if !supported {
            warn!(
                "DNS request {:#06x} not implemented: {:?}",
                id,
                questions.iter().map(|q| q.qtype).collect::<Vec<_>>()
            );
        }

        let mut body = BytesMut::with_capacity(MAX_DATAGRAM);
        for q in &questions {
            write_name(&mut body, &q.name)?;
            body.put_u16(q.qtype);
            body.put_u16(q.qclass);
        }
        let mut answers = BytesMut::new();
        if supported {
            for q in &questions {
                self.write_answer(&mut answers, q)?;
            }
        }
        // UDP replies stop at 512 bytes; past that only the questions go out, flagged TC.
        let truncated = HEADER_LEN + body.len() + answers.len() > MAX_DATAGRAM;
        if truncated {
            warn!("DNS reply {:#06x} exceeds {} bytes, sending truncated", id, MAX_DATAGRAM);
        }

        let mut flags_out = FLAG_QR | FLAG_AA | (flags & (OPCODE_MASK | FLAG_RD)) | rcode as u16;
        if truncated {
            flags_out |= FLAG_TC;
        }
        let ancount = if supported && !truncated { questions.len() as u16 } else { 0 };

        let mut out = BytesMut::with_capacity(MAX_DATAGRAM);
        out.put_u16(id);
        out.put_u16(flags_out);
        out.put_u16(questions.len() as u16);
        out.put_u16(ancount);
        out.put_u16(0);
        out.put_u16(0);
        out.put_slice(&body);
        if ancount > 0 {
            out.put_slice(&answers);
        }
        Ok(out.to_vec())
    }

    fn write_answer(&self, out: &mut BytesMut, q: &Question) -> Result<()> {
        write_name(out, &q.name)?;
        out.put_u16(q.qtype);
        out.put_u16(CLASS_IN);
        out.put_u32(TTL);
        match q.qtype {
            TYPE_A => {
                out.put_u16(4);
                out.put_slice(&self.address.octets());
            }
            TYPE_SRV => {
                let mut rdata = BytesMut::new();
                rdata.put_u16(0);
                rdata.put_u16(100);
                rdata.put_u16(self.srv_port(&q.name));
                write_name(&mut rdata, &self.hostname)?;
                out.put_u16(rdata.len() as u16);
                out.put_slice(&rdata);
            }
            other => bail!("No answer for record type {}", other),
        }
        Ok(())
    }

    /// Answer datagrams until the socket fails.
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) -> Result<()> {
        let local = socket.local_addr()?;
        info!("DNS responder listening on {}", local);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, peer) = socket.recv_from(&mut buf).await.context("DNS receive failed")?;
            info!("Resolving new DNS request from {}", peer);
            match self.respond(&buf[..n]) {
                Ok(reply) => {
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        error!("Failed to send DNS reply to {}: {}", peer, e);
                    }
                }
                Err(e) => warn!("Dropping malformed DNS datagram from {}: {:#}", peer, e),
            }
        }
    }
}

/// Bind the DNS socket on all interfaces.
pub async fn bind(port: u16) -> Result<UdpSocket> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    UdpSocket::bind(addr)
        .await
        .with_context(|| format!("Port UDP/{} is already in use, unable to start DNS resolver", port))
}

fn read_u16(packet: &[u8], pos: usize) -> Result<u16> {
    match packet.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => bail!("DNS packet truncated at offset {}", pos),
    }
}

/// Read a possibly compressed name; `pos` ends just past the name where it first appears.
fn read_name(packet: &[u8], pos: &mut usize) -> Result<String> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = *pos;
    let mut jumps = 0;
    let mut end: Option<usize> = None;
    loop {
        let len = match packet.get(cursor) {
            Some(&b) => b,
            None => bail!("DNS name truncated at offset {}", cursor),
        };
        if len & 0xC0 == 0xC0 {
            let target = (read_u16(packet, cursor)? & 0x3FFF) as usize;
            if end.is_none() {
                end = Some(cursor + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                bail!("DNS name compression loop");
            }
            cursor = target;
            continue;
        }
        if len & 0xC0 != 0 {
            bail!("Unsupported DNS label type {:#04x}", len);
        }
        if len == 0 {
            cursor += 1;
            break;
        }
        let start = cursor + 1;
        let label = match packet.get(start..start + len as usize) {
            Some(l) => l,
            None => bail!("DNS label truncated at offset {}", start),
        };
        labels.push(String::from_utf8_lossy(label).into_owned());
        cursor = start + len as usize;
    }
    *pos = end.unwrap_or(cursor);
    Ok(labels.join("."))
}

fn write_name(out: &mut BytesMut, name: &str) -> Result<()> {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        if label.len() > 63 {
            bail!("DNS label too long: {}", label);
        }
        out.put_u8(label.len() as u8);
        out.put_slice(label.as_bytes());
    }
    out.put_u8(0);
    Ok(())
}

fn local_hostname() -> String {
    let proc_name = || std::fs::read_to_string("/proc/sys/kernel/hostname").ok();
    let command_name = || {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .map(|o| String::from_utf8_lossy(&o.stdout).into_owned())
    };
    let etc_name = || std::fs::read_to_string("/etc/hostname").ok();
    let env_name = || std::env::var("HOSTNAME").or_else(|_| std::env::var("COMPUTERNAME")).ok();
    first_hostname(
        std::iter::once_with(proc_name)
            .chain(std::iter::once_with(command_name))
            .chain(std::iter::once_with(etc_name))
            .chain(std::iter::once_with(env_name)),
    )
}

/// First non-empty candidate, trimmed. Falls back to "localhost".
fn first_hostname<I: IntoIterator<Item = Option<String>>>(candidates: I) -> String {
    candidates
        .into_iter()
        .flatten()
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

async fn local_ipv4(hostname: &str) -> Result<Ipv4Addr> {
    if let Ok(addrs) = tokio::net::lookup_host((hostname, 0)).await {
        for addr in addrs {
            if let IpAddr::V4(ip) = addr.ip() {
                if !ip.is_loopback() {
                    return Ok(ip);
                }
            }
        }
    }
    // No packet is sent; connect only selects the outbound interface.
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    if probe.connect((Ipv4Addr::new(192, 0, 2, 1), 53)).await.is_ok() {
        if let IpAddr::V4(ip) = probe.local_addr()?.ip() {
            if !ip.is_loopback() && !ip.is_unspecified() {
                return Ok(ip);
            }
        }
    }
    bail!("No network adapters with an IPv4 address in the system!")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder() -> DnsResponder {
        DnsResponder::new("gw01.corp.local", Ipv4Addr::new(10, 1, 2, 3), 389, 3268)
    }

    fn query(id: u16, questions: &[(&str, u16)]) -> Vec<u8> {
        let mut out = BytesMut::new();
        out.put_u16(id);
        out.put_u16(FLAG_RD);
        out.put_u16(questions.len() as u16);
        out.put_u16(0);
        out.put_u16(0);
        out.put_u16(0);
        for (name, qtype) in questions {
            write_name(&mut out, name).unwrap();
            out.put_u16(*qtype);
            out.put_u16(CLASS_IN);
        }
        out.to_vec()
    }

    /// Skip the header and echoed questions, returning the offset of the first answer.
    fn answers_offset(reply: &[u8]) -> usize {
        let qdcount = read_u16(reply, 4).unwrap();
        let mut pos = HEADER_LEN;
        for _ in 0..qdcount {
            read_name(reply, &mut pos).unwrap();
            pos += 4;
        }
        pos
    }

    #[test]
    fn test_srv_port_selection() {
        let r = responder();
        assert_eq!(r.srv_port("_ldap._tcp.pdc._msdcs.corp.local"), 389);
        assert_eq!(r.srv_port("_LDAP._TCP.GC._MSDCS.corp.local"), 3268);
        assert_eq!(r.srv_port("_kerberos._tcp.corp.local"), 1);
    }

    #[test]
    fn test_a_record() {
        let reply = responder().respond(&query(0x1234, &[("gw01.corp.local", TYPE_A)])).unwrap();
        assert_eq!(read_u16(&reply, 0).unwrap(), 0x1234);
        let flags = read_u16(&reply, 2).unwrap();
        assert_ne!(flags & FLAG_QR, 0);
        assert_ne!(flags & FLAG_RD, 0);
        assert_eq!(flags & 0x000F, RCODE_NOERROR as u16);
        assert_eq!(read_u16(&reply, 6).unwrap(), 1);

        let mut pos = answers_offset(&reply);
        assert_eq!(read_name(&reply, &mut pos).unwrap(), "gw01.corp.local");
        assert_eq!(read_u16(&reply, pos).unwrap(), TYPE_A);
        assert_eq!(read_u16(&reply, pos + 2).unwrap(), CLASS_IN);
        assert_eq!(&reply[pos + 4..pos + 8], &300u32.to_be_bytes());
        assert_eq!(read_u16(&reply, pos + 8).unwrap(), 4);
        assert_eq!(&reply[pos + 10..pos + 14], &[10, 1, 2, 3]);
        assert_eq!(reply.len(), pos + 14);
    }

    #[test]
    fn test_srv_record() {
        let name = "_ldap._tcp.gc._msdcs.corp.local";
        let reply = responder().respond(&query(7, &[(name, TYPE_SRV)])).unwrap();
        let mut pos = answers_offset(&reply);
        assert_eq!(read_name(&reply, &mut pos).unwrap(), name);
        assert_eq!(read_u16(&reply, pos).unwrap(), TYPE_SRV);
        let rdlength = read_u16(&reply, pos + 8).unwrap() as usize;
        let rdata = pos + 10;
        assert_eq!(read_u16(&reply, rdata).unwrap(), 0);
        assert_eq!(read_u16(&reply, rdata + 2).unwrap(), 100);
        assert_eq!(read_u16(&reply, rdata + 4).unwrap(), 3268);
        let mut target = rdata + 6;
        assert_eq!(read_name(&reply, &mut target).unwrap(), "gw01.corp.local");
        assert_eq!(target, rdata + rdlength);
    }

    #[test]
    fn test_unsupported_type_is_notimp() {
        let reply = responder()
            .respond(&query(9, &[("gw01.corp.local", 28)]))
            .unwrap();
        assert_eq!(read_u16(&reply, 2).unwrap() & 0x000F, RCODE_NOTIMP as u16);
        assert_eq!(read_u16(&reply, 4).unwrap(), 1);
        assert_eq!(read_u16(&reply, 6).unwrap(), 0);
    }

    #[test]
    fn test_oversized_reply_is_truncated() {
        let label = "h".repeat(63);
        let hostname = format!("{0}.{0}.{0}", label);
        let r = DnsResponder::new(hostname, Ipv4Addr::new(10, 1, 2, 3), 389, 3268);
        let name = "_ldap._tcp.pdc._msdcs.corp.local";
        let request = query(11, &[(name, TYPE_SRV), (name, TYPE_SRV), (name, TYPE_SRV)]);
        let reply = r.respond(&request).unwrap();
        assert!(reply.len() <= MAX_DATAGRAM);
        let flags = read_u16(&reply, 2).unwrap();
        assert_ne!(flags & FLAG_TC, 0);
        assert_eq!(flags & 0x000F, RCODE_NOERROR as u16);
        assert_eq!(read_u16(&reply, 4).unwrap(), 3);
        assert_eq!(read_u16(&reply, 6).unwrap(), 0);
        assert_eq!(answers_offset(&reply), reply.len());

        // one question still fits
        let reply = r.respond(&query(12, &[(name, TYPE_SRV)])).unwrap();
        assert_eq!(read_u16(&reply, 2).unwrap() & FLAG_TC, 0);
        assert_eq!(read_u16(&reply, 6).unwrap(), 1);
    }

    #[test]
    fn test_first_hostname_skips_missing_and_blank() {
        assert_eq!(
            first_hostname([None, Some("  \n".to_string()), Some("gw01\n".to_string()), Some("other".to_string())]),
            "gw01"
        );
        assert_eq!(first_hostname([None::<String>, None]), "localhost");
    }

    #[test]
    fn test_malformed_packets_rejected() {
        let r = responder();
        assert!(r.respond(&[0x00, 0x01]).is_err());

        let mut truncated = query(1, &[("gw01.corp.local", TYPE_A)]);
        truncated.truncate(truncated.len() - 3);
        assert!(r.respond(&truncated).is_err());

        let mut response = query(1, &[("gw01.corp.local", TYPE_A)]);
        response[2] |= 0x80;
        assert!(r.respond(&response).is_err());
    }

    #[test]
    fn test_compressed_name_and_loop() {
        // "corp" at 12, then a name "x" + pointer to 12
        let packet = [
            0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 4, b'c', b'o', b'r', b'p', 0, 1, b'x', 0xC0, 12,
        ];
        let mut pos = 18;
        assert_eq!(read_name(&packet, &mut pos).unwrap(), "x.corp");
        assert_eq!(pos, 22);

        let looped = [0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xC0, 12];
        let mut pos = 12;
        assert!(read_name(&looped, &mut pos).is_err());
    }

    #[tokio::test]
    async fn test_serve_over_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(Arc::new(responder()).serve(server));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // garbage first: dropped without a reply
        client.send_to(&[0xFF], server_addr).await.unwrap();
        client
            .send_to(&query(42, &[("_ldap._tcp.pdc._msdcs.corp.local", TYPE_SRV)]), server_addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = &buf[..n];
        assert_eq!(read_u16(reply, 0).unwrap(), 42);
        let pos = answers_offset(reply);
        let mut skip = pos;
        read_name(reply, &mut skip).unwrap();
        assert_eq!(read_u16(reply, skip + 10 + 4).unwrap(), 389);
    }
}
