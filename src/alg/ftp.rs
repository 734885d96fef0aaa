//! C5 FTP (TCP port 21): active/passive, v4/v6 control-message parsing,
//! expectation creation, and NAT payload rewriting (`spec.md` §4.5).
//!
//! Constants and message prefixes are ported from `lib/conntrack.c`:
//! `FTP_PORT_CMD="PORT"`, `FTP_PASV_REPLY_CODE="227"`, `FTP_EPRT_CMD="EPRT"`,
//! `FTP_EPSV_REPLY="EXTENDED PASSIVE"`, `LARGEST_FTP_MSG_OF_INTEREST=128`,
//! `MAX_FTP_PORT_DGTS=3`, `MAX_EXT_FTP_PORT_DGTS=5`, `ALG_WC_SRC_PORT=0`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::conn::{Connection, Direction};
use crate::expectation::Expectation;
use crate::key::{ConnKey, Endpoint};

use super::{validate_advertised_addr, AlgError, AlgHelper, AlgOutcome, AlgPacket};

pub const LARGEST_FTP_MSG_OF_INTEREST: usize = 128;
const FTP_PORT_CMD: &str = "PORT";
const FTP_PASV_REPLY_CODE: &str = "227";
const FTP_EPRT_CMD: &str = "EPRT";
const FTP_EPSV_REPLY: &str = "EXTENDED PASSIVE";

#[derive(Debug, Clone, Copy)]
enum Advertised {
    V4 { addr: Ipv4Addr, port: u16 },
    V6 { addr: Ipv6Addr, port: u16 },
}

impl Advertised {
    fn addr(&self) -> IpAddr {
        match self {
            Advertised::V4 { addr, .. } => IpAddr::V4(*addr),
            Advertised::V6 { addr, .. } => IpAddr::V6(*addr),
        }
    }

    fn port(&self) -> u16 {
        match self {
            Advertised::V4 { port, .. } => *port,
            Advertised::V6 { port, .. } => *port,
        }
    }
}

/// `PORT a,b,c,d,p1,p2` / `227 ... (a,b,c,d,p1,p2)`.
fn parse_v4_numbers(text: &str) -> Option<(Ipv4Addr, u16)> {
    let digits: Vec<i64> = text
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect();

    // Scan for the first run of 6 values all fitting in a byte/port field;
    // mirrors the source tolerating leading reply-code prose before the
    // parenthesized tuple.
    for window in digits.windows(6) {
        if window.iter().take(4).all(|v| (0..=255).contains(v))
            && window[4..6].iter().all(|v| (0..=255).contains(v))
        {
            let addr = Ipv4Addr::new(
                window[0] as u8,
                window[1] as u8,
                window[2] as u8,
                window[3] as u8,
            );
            let port = (window[4] as u16) * 256 + window[5] as u16;
            return Some((addr, port));
        }
    }
    None
}

fn parse_port_cmd(msg: &str) -> Option<Advertised> {
    let rest = msg.get(FTP_PORT_CMD.len()..)?;
    let (addr, port) = parse_v4_numbers(rest)?;
    Some(Advertised::V4 { addr, port })
}

fn parse_pasv_reply(msg: &str) -> Option<Advertised> {
    let idx = msg.find(FTP_PASV_REPLY_CODE)?;
    let rest = &msg[idx + FTP_PASV_REPLY_CODE.len()..];
    let (addr, port) = parse_v4_numbers(rest)?;
    Some(Advertised::V4 { addr, port })
}

/// `EPRT |2|addr|port|`.
fn parse_eprt(msg: &str) -> Option<Advertised> {
    let rest = msg.get(FTP_EPRT_CMD.len()..)?.trim_start();
    let mut parts = rest.split('|').filter(|s| !s.is_empty());
    let af = parts.next()?;
    if af != "2" {
        return None;
    }
    let addr: Ipv6Addr = parts.next()?.parse().ok()?;
    let port: u16 = parts.next()?.parse().ok()?;
    Some(Advertised::V6 { addr, port })
}

/// `EXTENDED PASSIVE MODE (|||port|)`.
fn parse_epsv_reply(msg: &str) -> Option<Advertised> {
    let idx = msg.find(FTP_EPSV_REPLY)?;
    let rest = &msg[idx + FTP_EPSV_REPLY.len()..];
    let port: u16 = rest
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())?
        .parse()
        .ok()?;
    // EPSV carries no address; the data connection always targets the
    // control connection's own peer address.
    Some(Advertised::V6 {
        addr: Ipv6Addr::UNSPECIFIED,
        port,
    })
}

fn is_interest(msg: &str) -> bool {
    msg.to_ascii_uppercase().starts_with(FTP_PORT_CMD)
        || msg.starts_with(FTP_PASV_REPLY_CODE)
        || msg.to_ascii_uppercase().starts_with(FTP_EPRT_CMD)
        || msg.contains(FTP_EPSV_REPLY)
}

fn render_v4(addr: Ipv4Addr, port: u16) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{a},{b},{c},{d},{},{}", port / 256, port % 256)
}

pub struct FtpHelper;

impl AlgHelper for FtpHelper {
    fn inspect(
        &self,
        conn: &Connection,
        parent_key: &ConnKey,
        nat_active: bool,
        pkt: &mut AlgPacket,
    ) -> Result<AlgOutcome, AlgError> {
        let msg_len = pkt.payload.len().min(LARGEST_FTP_MSG_OF_INTEREST);
        let text = std::str::from_utf8(&pkt.payload[..msg_len]).map_err(|_| AlgError::Malformed)?;

        if !is_interest(text) {
            return Ok(AlgOutcome::default());
        }

        let advertised = parse_port_cmd(text)
            .or_else(|| parse_pasv_reply(text))
            .or_else(|| parse_eprt(text))
            .or_else(|| parse_epsv_reply(text))
            .ok_or(AlgError::Malformed)?;

        let literal_addr = advertised.addr();
        if !matches!(literal_addr, IpAddr::V6(v6) if v6.is_unspecified())
            && !validate_advertised_addr(conn, pkt.reply, literal_addr)
        {
            return Err(AlgError::BounceAttempt);
        }

        // The data connection's client side is whichever endpoint did not
        // send the control message advertising the literal.
        let client_addr = if pkt.reply {
            parent_key.dst.addr
        } else {
            parent_key.src.addr
        };

        let expectation = Expectation::new_ftp(
            parent_key,
            Endpoint::port(client_addr, 0),
            advertised.port(),
            nat_active,
        );

        let mut skew = None;
        if nat_active {
            if let Advertised::V4 { addr, port } = advertised {
                let rewritten_addr = conn.nat_visible_addr(pkt.reply);
                if let IpAddr::V4(rewritten_v4) = rewritten_addr {
                    let original = render_v4(addr, port);
                    let rewritten = render_v4(rewritten_v4, port);
                    let delta = rewritten.len() as i32 - original.len() as i32;
                    if delta != 0 {
                        if let Some(pos) = find_subslice(pkt.payload, original.as_bytes()) {
                            pkt.payload.splice(
                                pos..pos + original.len(),
                                rewritten.bytes(),
                            );
                        }
                        let direction = if pkt.reply {
                            Direction::Reverse
                        } else {
                            Direction::Forward
                        };
                        skew = Some((delta, direction));
                    }
                }
            }
        }

        Ok(AlgOutcome {
            expectation: Some(expectation),
            seq_skew: skew,
        })
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_active_port_command() {
        let advertised = parse_port_cmd("PORT 10,0,0,1,20,0").unwrap();
        match advertised {
            Advertised::V4 { addr, port } => {
                assert_eq!(addr, Ipv4Addr::new(10, 0, 0, 1));
                assert_eq!(port, 20 * 256);
            }
            _ => panic!("expected v4"),
        }
    }

    #[test]
    fn parses_passive_reply() {
        let advertised =
            parse_pasv_reply("227 Entering Passive Mode (203,0,113,5,20,1).").unwrap();
        match advertised {
            Advertised::V4 { addr, port } => {
                assert_eq!(addr, Ipv4Addr::new(203, 0, 113, 5));
                assert_eq!(port, 20 * 256 + 1);
            }
            _ => panic!("expected v4"),
        }
    }

    #[test]
    fn render_matches_original_format() {
        assert_eq!(render_v4(Ipv4Addr::new(10, 0, 0, 1), 5120), "10,0,0,1,20,0");
    }

    #[test]
    fn skew_is_byte_length_delta() {
        let original = render_v4(Ipv4Addr::new(10, 0, 0, 1), 5120);
        let rewritten = render_v4(Ipv4Addr::new(203, 0, 113, 5), 5120);
        assert_eq!(rewritten.len() as i32 - original.len() as i32, 3);
    }
}
