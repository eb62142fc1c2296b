//! Blocking TCP transport: TPKT (RFC 1006) and X.224 class 0 framing, plus
//! fast-path output detection.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use rdpwire_proto::transport::{ConnectTarget, Frame, PROTOCOL_RDP};
use rdpwire_proto::{ByteCursor, Transport};

const TPKT_VERSION: u8 = 3;
const TPKT_HEADER_LEN: usize = 4;

// X.224 TPDU codes
const X224_CONNECTION_REQUEST: u8 = 0xe0;
const X224_CONNECTION_CONFIRM: u8 = 0xd0;
const X224_DATA:               u8 = 0xf0;
const X224_EOT:                u8 = 0x80;

// negotiation
const TYPE_RDP_NEG_REQ:     u8 = 0x01;
const TYPE_RDP_NEG_RSP:     u8 = 0x02;
const TYPE_RDP_NEG_FAILURE: u8 = 0x03;
const NEG_LEN:              usize = 8;

/// Upper bound on one received frame.
const MAX_FRAME: usize = 0x8000 * 2;

// ─── TcpTransport ─────────────────────────────────────────────────────────────

/// TPKT over a [`TcpStream`].
pub struct TcpTransport {
    stream:          Option<TcpStream>,
    connect_timeout: Duration,
    recv_timeout:    Duration,
}

impl TcpTransport {
    /// `recv_timeout` bounds how long [`Transport::recv`] waits for the
    /// first byte of a frame before returning `None`.
    pub fn new(connect_timeout: Duration, recv_timeout: Duration) -> Self {
        Self { stream: None, connect_timeout, recv_timeout }
    }

    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        self.stream.as_mut().ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))
    }

    fn open(&self, target: &ConnectTarget) -> io::Result<TcpStream> {
        let mut last = io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", target.host));
        for addr in (target.host.as_str(), target.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    tracing::debug!("TCP connected to {addr}");
                    return Ok(stream);
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

impl Transport for TcpTransport {
    type Error = io::Error;

    fn connect(&mut self, target: &ConnectTarget) -> io::Result<u32> {
        let mut stream = self.open(target)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.connect_timeout))?;
        stream.write_all(&connection_request(target))?;

        let confirm = match read_tpkt(&mut stream)? {
            Some(body) => body,
            None => return Err(io::Error::new(io::ErrorKind::TimedOut, "no X.224 connection confirm")),
        };
        let selected = parse_connection_confirm(&confirm)?;
        if selected != PROTOCOL_RDP {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("server selected security protocol {selected:#x}"),
            ));
        }
        stream.set_read_timeout(Some(self.recv_timeout))?;
        self.stream = Some(stream);
        Ok(selected)
    }

    fn send(&mut self, data: &[u8]) -> io::Result<()> {
        let len = TPKT_HEADER_LEN + 3 + data.len();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&[TPKT_VERSION, 0]);
        out.extend_from_slice(&(len as u16).to_be_bytes());
        out.extend_from_slice(&[2, X224_DATA, X224_EOT]);
        out.extend_from_slice(data);
        self.stream()?.write_all(&out)
    }

    fn recv(&mut self) -> io::Result<Option<Frame>> {
        read_frame(self.stream()?)
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn local_addr(&self) -> Option<std::net::IpAddr> {
        self.stream.as_ref()?.local_addr().ok().map(|a| a.ip())
    }
}

// ─── Framing ──────────────────────────────────────────────────────────────────

/// X.224 connection request with routing cookie and negotiation request.
pub fn connection_request(target: &ConnectTarget) -> Vec<u8> {
    let cookie = match &target.lb_cookie {
        Some(lb) => lb.clone(),
        None if !target.username.is_empty() => format!("Cookie: mstshash={}\r\n", target.username).into_bytes(),
        None => Vec::new(),
    };
    let li = 6 + cookie.len() + NEG_LEN;
    let len = TPKT_HEADER_LEN + 1 + li;

    let mut s = ByteCursor::with_capacity(len);
    s.write_u8(TPKT_VERSION);
    s.write_u8(0);
    s.write_u16_be(len as u16);
    s.write_u8(li as u8);
    s.write_u8(X224_CONNECTION_REQUEST);
    s.write_u16_be(0); // dst ref
    s.write_u16_be(0); // src ref
    s.write_u8(0);     // class
    s.write_bytes(&cookie);
    s.write_u8(TYPE_RDP_NEG_REQ);
    s.write_u8(0);
    s.write_u16_le(NEG_LEN as u16);
    s.write_u32_le(target.requested_protocols);
    s.into_vec()
}

/// The protocol the server selected in its connection confirm.
pub fn parse_connection_confirm(body: &[u8]) -> io::Result<u32> {
    let mut s = ByteCursor::from_vec(body.to_vec());
    let _li = s.read_u8().map_err(invalid)?;
    let code = s.read_u8().map_err(invalid)?;
    if code != X224_CONNECTION_CONFIRM {
        return Err(invalid_data(format!("expected X.224 connection confirm, got {code:#04x}")));
    }
    s.skip(5).map_err(invalid)?; // dst ref, src ref, class
    if s.remaining() < NEG_LEN {
        return Ok(PROTOCOL_RDP);
    }
    let kind = s.read_u8().map_err(invalid)?;
    s.skip(3).map_err(invalid)?; // flags, length
    let value = s.read_u32_le().map_err(invalid)?;
    match kind {
        TYPE_RDP_NEG_RSP => Ok(value),
        TYPE_RDP_NEG_FAILURE => Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("security negotiation failed (code {value})"),
        )),
        other => Err(invalid_data(format!("unknown negotiation message {other}"))),
    }
}

/// Read one TPKT or fast-path frame. `None` if nothing arrived before the
/// read timeout.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Option<Frame>> {
    let Some(first) = read_first(r)? else {
        return Ok(None);
    };
    if first == TPKT_VERSION {
        let body = read_tpkt_rest(r)?;
        let mut s = ByteCursor::from_vec(body);
        let _li = s.read_u8().map_err(invalid)?;
        let code = s.read_u8().map_err(invalid)?;
        if code != X224_DATA {
            return Err(invalid_data(format!("expected X.224 data TPDU, got {code:#04x}")));
        }
        s.skip(1).map_err(invalid)?; // EOT
        let rest = s.read_vec(s.remaining()).map_err(invalid)?;
        return Ok(Some(Frame::SlowPath(ByteCursor::from_vec(rest))));
    }

    let mut b = [0u8; 1];
    read_full(r, &mut b)?;
    let (len, used) = if b[0] & 0x80 != 0 {
        let mut lo = [0u8; 1];
        read_full(r, &mut lo)?;
        ((usize::from(b[0] & 0x7f) << 8) | usize::from(lo[0]), 3)
    } else {
        (usize::from(b[0]), 2)
    };
    if len < used {
        return Err(invalid_data(format!("fast-path length {len}")));
    }
    let mut data = vec![0u8; len - used];
    read_full(r, &mut data)?;
    Ok(Some(Frame::FastPath { header: first, data: ByteCursor::from_vec(data) }))
}

fn read_tpkt<R: Read>(r: &mut R) -> io::Result<Option<Vec<u8>>> {
    match read_first(r)? {
        None => Ok(None),
        Some(TPKT_VERSION) => read_tpkt_rest(r).map(Some),
        Some(other) => Err(invalid_data(format!("TPKT version {other}"))),
    }
}

fn read_tpkt_rest<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let mut hdr = [0u8; 3];
    read_full(r, &mut hdr)?;
    let len = usize::from(u16::from_be_bytes([hdr[1], hdr[2]]));
    if !(TPKT_HEADER_LEN..=MAX_FRAME).contains(&len) {
        return Err(invalid_data(format!("TPKT length {len}")));
    }
    let mut body = vec![0u8; len - TPKT_HEADER_LEN];
    read_full(r, &mut body)?;
    Ok(body)
}

/// The first byte of a frame, or `None` on timeout.
fn read_first<R: Read>(r: &mut R) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e),
        }
    }
}

/// Fill `buf`, waiting out read timeouts once a frame has started.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match r.read(&mut buf[done..]) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-frame")),
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted || is_timeout(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn invalid(e: rdpwire_proto::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}
