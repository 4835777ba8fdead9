//! Control-channel wire protocol.
//!
//! Length-implicit messages: one byte of message code followed by a fixed
//! little-endian body. Addresses are four IPv4 octets plus a u16 port;
//! connection ids are `node_id u32 + idx u32`.

use std::net::Ipv4Addr;

use burrow_core::{ConnId, Error, NodeId, Result};
use bytes::{Buf, BufMut, BytesMut};
use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u32, u8 as nom_u8};
use nom::IResult;

pub const MSG_PROBE: u8 = 0x00;
pub const MSG_HELLO: u8 = 0x01;
pub const MSG_HELLO_CONN: u8 = 0x02;
pub const MSG_HELLO_ACC: u8 = 0x03;
pub const MSG_HELLO_SYMM_NEXT: u8 = 0x04;
pub const MSG_SYMM_DONE_OUT: u8 = 0x05;
pub const MSG_PROBE_RESULT: u8 = 0x06;
pub const MSG_CONN: u8 = 0x07;
pub const MSG_CONN_ERR: u8 = 0x08;
pub const MSG_CONN_OK: u8 = 0x09;
pub const MSG_SYMM_NEXT: u8 = 0x10;
pub const MSG_SYMM_DONE_IN: u8 = 0x11;
pub const MSG_READY: u8 = 0x12;
pub const MSG_FAST: u8 = 0x13;
pub const MSG_NEXT: u8 = 0x14;

/// Rendezvous failure codes carried in CONN_ERR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    Unknown = 1,
    /// Destination node is not registered.
    NotFound = 2,
    /// Both peers behind a symmetric NAT, no way to connect.
    Symm = 3,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0 => ErrorCode::None,
            2 => ErrorCode::NotFound,
            3 => ErrorCode::Symm,
            _ => ErrorCode::Unknown,
        }
    }
}

/// Rendezvous roles assigned by the server in CONN / CONN_OK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    /// Normal connector, single punched port.
    Conn = 0,
    /// Connector behind a symmetric NAT: socket-pool spread connect.
    ConnSymm = 1,
    /// Normal acceptor: send pings, wait for connect.
    Acc = 2,
    /// Acceptor behind a symmetric NAT: windowed port sweep.
    AccSymm = 3,
}

impl Role {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Role::Conn,
            1 => Role::ConnSymm,
            2 => Role::Acc,
            3 => Role::AccSymm,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UDP observation probe; the server answers with ProbeResult.
    Probe,
    /// Persistent registration: node id plus the probe-discovered external
    /// UDP endpoint.
    Hello {
        node_id: NodeId,
        probe_ip: Ipv4Addr,
        probe_port: u16,
    },
    /// Transient connector-side hello through the socket being punched.
    HelloConn {
        src_node: NodeId,
        dst_node: NodeId,
        conn_id: ConnId,
        remote_ip: Ipv4Addr,
        remote_port: u16,
    },
    /// Transient acceptor-side hello through the socket being punched.
    HelloAcc {
        src_node: NodeId,
        dst_node: NodeId,
        conn_id: ConnId,
    },
    /// Symmetric acceptor's per-window re-hello; `failed` marks an exhausted
    /// previous window.
    HelloSymmNext {
        src_node: NodeId,
        dst_node: NodeId,
        conn_id: ConnId,
        failed: bool,
    },
    /// Node -> server: symmetric punch finished; relay SymmDoneIn.
    SymmDoneOut { dst_node: NodeId, conn_id: ConnId },
    /// Server echo of the observed source of a Probe or transient hello.
    ProbeResult { src_ip: Ipv4Addr, src_port: u16 },
    /// Server -> acceptor: a peer wants to connect.
    Conn {
        src_node: NodeId,
        src_ip: Ipv4Addr,
        src_port: u16,
        conn_id: ConnId,
        ip: Ipv4Addr,
        port: u16,
        role: Role,
    },
    /// Server -> connector: the request failed.
    ConnErr { conn_id: ConnId, err: ErrorCode },
    /// Server -> connector: peer located, punch with this role.
    ConnOk {
        conn_id: ConnId,
        dst_ip: Ipv4Addr,
        dst_port: u16,
        role: Role,
    },
    /// Advance the symmetric sweep; a non-zero port echoes a discovery.
    SymmNext { conn_id: ConnId, port: u16 },
    /// Server relay of SymmDoneOut to the other side.
    SymmDoneIn { src_node: NodeId, conn_id: ConnId },
    /// Fast session: owner reserved ports, peer should prepare.
    Ready { conn_id: ConnId },
    /// Fast session: the peer's observed external endpoint.
    Fast {
        conn_id: ConnId,
        node_ip: Ipv4Addr,
        node_port: u16,
    },
    /// Fast session: probe pacing acknowledgment.
    Next { conn_id: ConnId },
}

impl Message {
    pub fn code(&self) -> u8 {
        match self {
            Message::Probe => MSG_PROBE,
            Message::Hello { .. } => MSG_HELLO,
            Message::HelloConn { .. } => MSG_HELLO_CONN,
            Message::HelloAcc { .. } => MSG_HELLO_ACC,
            Message::HelloSymmNext { .. } => MSG_HELLO_SYMM_NEXT,
            Message::SymmDoneOut { .. } => MSG_SYMM_DONE_OUT,
            Message::ProbeResult { .. } => MSG_PROBE_RESULT,
            Message::Conn { .. } => MSG_CONN,
            Message::ConnErr { .. } => MSG_CONN_ERR,
            Message::ConnOk { .. } => MSG_CONN_OK,
            Message::SymmNext { .. } => MSG_SYMM_NEXT,
            Message::SymmDoneIn { .. } => MSG_SYMM_DONE_IN,
            Message::Ready { .. } => MSG_READY,
            Message::Fast { .. } => MSG_FAST,
            Message::Next { .. } => MSG_NEXT,
        }
    }

    /// Fixed body length for a message code; `None` for unknown codes.
    pub fn body_len(code: u8) -> Option<usize> {
        Some(match code {
            MSG_PROBE => 1,
            MSG_HELLO => 10,
            MSG_HELLO_CONN => 22,
            MSG_HELLO_ACC => 16,
            MSG_HELLO_SYMM_NEXT => 17,
            MSG_SYMM_DONE_OUT => 12,
            MSG_PROBE_RESULT => 6,
            MSG_CONN => 25,
            MSG_CONN_ERR => 12,
            MSG_CONN_OK => 15,
            MSG_SYMM_NEXT => 10,
            MSG_SYMM_DONE_IN => 12,
            MSG_READY => 8,
            MSG_FAST => 14,
            MSG_NEXT => 8,
            _ => return None,
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.code());
        match self {
            Message::Probe => dst.put_u8(0),
            Message::Hello {
                node_id,
                probe_ip,
                probe_port,
            } => {
                dst.put_u32_le(node_id.get());
                put_addr(dst, *probe_ip, *probe_port);
            }
            Message::HelloConn {
                src_node,
                dst_node,
                conn_id,
                remote_ip,
                remote_port,
            } => {
                dst.put_u32_le(src_node.get());
                dst.put_u32_le(dst_node.get());
                put_conn_id(dst, *conn_id);
                put_addr(dst, *remote_ip, *remote_port);
            }
            Message::HelloAcc {
                src_node,
                dst_node,
                conn_id,
            } => {
                dst.put_u32_le(src_node.get());
                dst.put_u32_le(dst_node.get());
                put_conn_id(dst, *conn_id);
            }
            Message::HelloSymmNext {
                src_node,
                dst_node,
                conn_id,
                failed,
            } => {
                dst.put_u32_le(src_node.get());
                dst.put_u32_le(dst_node.get());
                put_conn_id(dst, *conn_id);
                dst.put_u8(u8::from(*failed));
            }
            Message::SymmDoneOut { dst_node, conn_id } => {
                dst.put_u32_le(dst_node.get());
                put_conn_id(dst, *conn_id);
            }
            Message::ProbeResult { src_ip, src_port } => {
                put_addr(dst, *src_ip, *src_port);
            }
            Message::Conn {
                src_node,
                src_ip,
                src_port,
                conn_id,
                ip,
                port,
                role,
            } => {
                dst.put_u32_le(src_node.get());
                put_addr(dst, *src_ip, *src_port);
                put_conn_id(dst, *conn_id);
                put_addr(dst, *ip, *port);
                dst.put_u8(*role as u8);
            }
            Message::ConnErr { conn_id, err } => {
                put_conn_id(dst, *conn_id);
                dst.put_u32_le(*err as u32);
            }
            Message::ConnOk {
                conn_id,
                dst_ip,
                dst_port,
                role,
            } => {
                put_conn_id(dst, *conn_id);
                put_addr(dst, *dst_ip, *dst_port);
                dst.put_u8(*role as u8);
            }
            Message::SymmNext { conn_id, port } => {
                put_conn_id(dst, *conn_id);
                dst.put_u16_le(*port);
            }
            Message::SymmDoneIn { src_node, conn_id } => {
                dst.put_u32_le(src_node.get());
                put_conn_id(dst, *conn_id);
            }
            Message::Ready { conn_id } | Message::Next { conn_id } => {
                put_conn_id(dst, *conn_id);
            }
            Message::Fast {
                conn_id,
                node_ip,
                node_port,
            } => {
                put_conn_id(dst, *conn_id);
                put_addr(dst, *node_ip, *node_port);
            }
        }
    }

    pub fn to_bytes(&self) -> bytes::Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one message from the front of `src`. `Ok(None)` means more
    /// bytes are needed; unknown codes and malformed bodies are protocol
    /// errors.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Message>> {
        if src.is_empty() {
            return Ok(None);
        }
        let code = src[0];
        let Some(body_len) = Self::body_len(code) else {
            return Err(Error::protocol(format!("bad msg code: {code:#04x}")));
        };
        if src.len() < 1 + body_len {
            return Ok(None);
        }
        src.advance(1);
        let body = src.split_to(body_len);
        match parse_body(code, &body) {
            Ok((rest, msg)) if rest.is_empty() => Ok(Some(msg)),
            _ => Err(Error::protocol(format!(
                "malformed body for msg code {code:#04x}"
            ))),
        }
    }
}

fn put_conn_id(dst: &mut BytesMut, conn_id: ConnId) {
    dst.put_u32_le(conn_id.node_id.get());
    dst.put_u32_le(conn_id.idx);
}

fn put_addr(dst: &mut BytesMut, ip: Ipv4Addr, port: u16) {
    dst.put_slice(&ip.octets());
    dst.put_u16_le(port);
}

fn parse_conn_id(input: &[u8]) -> IResult<&[u8], ConnId> {
    let (input, node_id) = le_u32(input)?;
    let (input, idx) = le_u32(input)?;
    Ok((input, ConnId::new(NodeId(node_id), idx)))
}

fn parse_addr(input: &[u8]) -> IResult<&[u8], (Ipv4Addr, u16)> {
    let (input, octets) = take(4usize)(input)?;
    let (input, port) = le_u16(input)?;
    let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
    Ok((input, (ip, port)))
}

fn parse_body(code: u8, input: &[u8]) -> IResult<&[u8], Message> {
    match code {
        MSG_PROBE => {
            let (input, _dummy) = nom_u8(input)?;
            Ok((input, Message::Probe))
        }
        MSG_HELLO => {
            let (input, node_id) = le_u32(input)?;
            let (input, (probe_ip, probe_port)) = parse_addr(input)?;
            Ok((
                input,
                Message::Hello {
                    node_id: NodeId(node_id),
                    probe_ip,
                    probe_port,
                },
            ))
        }
        MSG_HELLO_CONN => {
            let (input, src_node) = le_u32(input)?;
            let (input, dst_node) = le_u32(input)?;
            let (input, conn_id) = parse_conn_id(input)?;
            let (input, (remote_ip, remote_port)) = parse_addr(input)?;
            Ok((
                input,
                Message::HelloConn {
                    src_node: NodeId(src_node),
                    dst_node: NodeId(dst_node),
                    conn_id,
                    remote_ip,
                    remote_port,
                },
            ))
        }
        MSG_HELLO_ACC => {
            let (input, src_node) = le_u32(input)?;
            let (input, dst_node) = le_u32(input)?;
            let (input, conn_id) = parse_conn_id(input)?;
            Ok((
                input,
                Message::HelloAcc {
                    src_node: NodeId(src_node),
                    dst_node: NodeId(dst_node),
                    conn_id,
                },
            ))
        }
        MSG_HELLO_SYMM_NEXT => {
            let (input, src_node) = le_u32(input)?;
            let (input, dst_node) = le_u32(input)?;
            let (input, conn_id) = parse_conn_id(input)?;
            let (input, failed) = nom_u8(input)?;
            Ok((
                input,
                Message::HelloSymmNext {
                    src_node: NodeId(src_node),
                    dst_node: NodeId(dst_node),
                    conn_id,
                    failed: failed != 0,
                },
            ))
        }
        MSG_SYMM_DONE_OUT => {
            let (input, dst_node) = le_u32(input)?;
            let (input, conn_id) = parse_conn_id(input)?;
            Ok((
                input,
                Message::SymmDoneOut {
                    dst_node: NodeId(dst_node),
                    conn_id,
                },
            ))
        }
        MSG_PROBE_RESULT => {
            let (input, (src_ip, src_port)) = parse_addr(input)?;
            Ok((input, Message::ProbeResult { src_ip, src_port }))
        }
        MSG_CONN => {
            let (input, src_node) = le_u32(input)?;
            let (input, (src_ip, src_port)) = parse_addr(input)?;
            let (input, conn_id) = parse_conn_id(input)?;
            let (input, (ip, port)) = parse_addr(input)?;
            let (input, role) = nom_u8(input)?;
            let role = Role::from_u8(role).ok_or(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))?;
            Ok((
                input,
                Message::Conn {
                    src_node: NodeId(src_node),
                    src_ip,
                    src_port,
                    conn_id,
                    ip,
                    port,
                    role,
                },
            ))
        }
        MSG_CONN_ERR => {
            let (input, conn_id) = parse_conn_id(input)?;
            let (input, err) = le_u32(input)?;
            Ok((
                input,
                Message::ConnErr {
                    conn_id,
                    err: ErrorCode::from_u32(err),
                },
            ))
        }
        MSG_CONN_OK => {
            let (input, conn_id) = parse_conn_id(input)?;
            let (input, (dst_ip, dst_port)) = parse_addr(input)?;
            let (input, role) = nom_u8(input)?;
            let role = Role::from_u8(role).ok_or(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))?;
            Ok((
                input,
                Message::ConnOk {
                    conn_id,
                    dst_ip,
                    dst_port,
                    role,
                },
            ))
        }
        MSG_SYMM_NEXT => {
            let (input, conn_id) = parse_conn_id(input)?;
            let (input, port) = le_u16(input)?;
            Ok((input, Message::SymmNext { conn_id, port }))
        }
        MSG_SYMM_DONE_IN => {
            let (input, src_node) = le_u32(input)?;
            let (input, conn_id) = parse_conn_id(input)?;
            Ok((
                input,
                Message::SymmDoneIn {
                    src_node: NodeId(src_node),
                    conn_id,
                },
            ))
        }
        MSG_READY => {
            let (input, conn_id) = parse_conn_id(input)?;
            Ok((input, Message::Ready { conn_id }))
        }
        MSG_FAST => {
            let (input, conn_id) = parse_conn_id(input)?;
            let (input, (node_ip, node_port)) = parse_addr(input)?;
            Ok((
                input,
                Message::Fast {
                    conn_id,
                    node_ip,
                    node_port,
                },
            ))
        }
        MSG_NEXT => {
            let (input, conn_id) = parse_conn_id(input)?;
            Ok((input, Message::Next { conn_id }))
        }
        _ => Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Tag,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_messages() -> Vec<Message> {
        let conn_id = ConnId::new(NodeId(0xdead_beef), 7);
        let ip = Ipv4Addr::new(192, 168, 1, 42);
        vec![
            Message::Probe,
            Message::Hello {
                node_id: NodeId(1),
                probe_ip: ip,
                probe_port: 1999,
            },
            Message::HelloConn {
                src_node: NodeId(1),
                dst_node: NodeId(2),
                conn_id,
                remote_ip: ip,
                remote_port: 443,
            },
            Message::HelloAcc {
                src_node: NodeId(2),
                dst_node: NodeId(1),
                conn_id,
            },
            Message::HelloSymmNext {
                src_node: NodeId(2),
                dst_node: NodeId(1),
                conn_id,
                failed: true,
            },
            Message::SymmDoneOut {
                dst_node: NodeId(1),
                conn_id,
            },
            Message::ProbeResult {
                src_ip: ip,
                src_port: 40_001,
            },
            Message::Conn {
                src_node: NodeId(1),
                src_ip: ip,
                src_port: 4242,
                conn_id,
                ip,
                port: 8080,
                role: Role::AccSymm,
            },
            Message::ConnErr {
                conn_id,
                err: ErrorCode::Symm,
            },
            Message::ConnOk {
                conn_id,
                dst_ip: ip,
                dst_port: 9999,
                role: Role::ConnSymm,
            },
            Message::SymmNext { conn_id, port: 0 },
            Message::SymmDoneIn {
                src_node: NodeId(2),
                conn_id,
            },
            Message::Ready { conn_id },
            Message::Fast {
                conn_id,
                node_ip: ip,
                node_port: 65_535,
            },
            Message::Next { conn_id },
        ]
    }

    #[test]
    fn roundtrip_every_message() {
        for msg in sample_messages() {
            let mut buf = BytesMut::new();
            msg.encode(&mut buf);
            assert_eq!(
                buf.len(),
                1 + Message::body_len(msg.code()).unwrap(),
                "length mismatch for {msg:?}"
            );
            let encoded = buf.clone();
            let decoded = Message::decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty());
            // decode∘encode is the identity on bytes too.
            let mut re = BytesMut::new();
            decoded.encode(&mut re);
            assert_eq!(re, encoded);
        }
    }

    #[test]
    fn partial_input_needs_more() {
        let msg = Message::Ready {
            conn_id: ConnId::new(NodeId(5), 6),
        };
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        let mut partial = buf.split_to(4);
        assert!(Message::decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(Message::decode(&mut partial).unwrap().unwrap(), msg);
    }

    #[test]
    fn back_to_back_messages_decode_in_order() {
        let mut buf = BytesMut::new();
        Message::Probe.encode(&mut buf);
        Message::Fast {
            conn_id: ConnId::new(NodeId(1), 2),
            node_ip: Ipv4Addr::LOCALHOST,
            node_port: 2345,
        }
        .encode(&mut buf);
        assert_eq!(Message::decode(&mut buf).unwrap().unwrap(), Message::Probe);
        assert!(matches!(
            Message::decode(&mut buf).unwrap().unwrap(),
            Message::Fast { .. }
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn unknown_code_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x7f);
        buf.put_slice(&[0u8; 32]);
        assert!(Message::decode(&mut buf).is_err());
    }

    #[test]
    fn bad_role_is_rejected() {
        let mut buf = BytesMut::new();
        Message::ConnOk {
            conn_id: ConnId::new(NodeId(9), 1),
            dst_ip: Ipv4Addr::LOCALHOST,
            dst_port: 1,
            role: Role::Conn,
        }
        .encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] = 9; // no such role
        assert!(Message::decode(&mut buf).is_err());
    }

    use proptest::prelude::*;
    proptest! {
        #[test]
        fn prop_conn_roundtrip(src in any::<u32>(), idx in any::<u32>(), a in any::<u8>(), b in any::<u8>(), port in any::<u16>()) {
            let msg = Message::Conn {
                src_node: NodeId(src),
                src_ip: Ipv4Addr::new(a, b, a, b),
                src_port: port,
                conn_id: ConnId::new(NodeId(src), idx),
                ip: Ipv4Addr::new(b, a, b, a),
                port,
                role: Role::Acc,
            };
            let mut buf = BytesMut::new();
            msg.encode(&mut buf);
            let got = Message::decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(got, msg);
        }
    }
}
