use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rdpwire_client::collaborators::{Display, PersistentCache};
use rdpwire_client::{Client, ClientError, Config, LoopExit, Phase, RdpVersion};
use rdpwire_proto::mcs::decode_send_data;
use rdpwire_proto::transport::PROTOCOL_RDP;
use rdpwire_proto::{ByteCursor, ConnectTarget, Frame, GLOBAL_CHANNEL, Transport};

// ── MemTransport ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Wire {
    inbox:   VecDeque<Frame>,
    outbox:  Vec<Vec<u8>>,
    targets: Vec<ConnectTarget>,
    /// Raised instead of failing once the script runs out.
    exit:    Option<Arc<AtomicBool>>,
    /// Report no data forever once the script runs out.
    idle:    bool,
    local:   Option<IpAddr>,
}

/// Replays scripted frames; fails with EOF once the script runs out.
#[derive(Clone, Default)]
struct MemTransport(Rc<RefCell<Wire>>);

impl Transport for MemTransport {
    type Error = std::io::Error;
    fn connect(&mut self, target: &ConnectTarget) -> Result<u32, Self::Error> {
        self.0.borrow_mut().targets.push(target.clone());
        Ok(PROTOCOL_RDP)
    }
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.0.borrow_mut().outbox.push(data.to_vec());
        Ok(())
    }
    fn recv(&mut self) -> Result<Option<Frame>, Self::Error> {
        let mut wire = self.0.borrow_mut();
        match (wire.inbox.pop_front(), &wire.exit) {
            (Some(frame), _) => Ok(Some(frame)),
            (None, Some(exit)) => {
                exit.store(true, Ordering::Relaxed);
                Ok(None)
            }
            (None, None) if wire.idle => Ok(None),
            (None, None) => Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)),
        }
    }
    fn disconnect(&mut self) {}
    fn local_addr(&self) -> Option<IpAddr> {
        self.0.borrow().local
    }
}

impl MemTransport {
    fn push(&self, frame: Frame) {
        self.0.borrow_mut().inbox.push_back(frame);
    }

    fn push_global(&self, pdu: Vec<u8>) {
        self.push(slow(send_data_indication(GLOBAL_CHANNEL, &pdu)));
    }

    /// Payloads sent on any channel after the MCS handshake.
    fn sent(&self) -> Vec<Vec<u8>> {
        self.0
            .borrow()
            .outbox
            .iter()
            .filter(|p| p[0] >> 2 == 25)
            .map(|p| decode_send_data(&mut ByteCursor::from_vec(p.clone())).unwrap().2)
            .collect()
    }

    fn clear_sent(&self) {
        self.0.borrow_mut().outbox.clear();
    }
}

fn slow(bytes: Vec<u8>) -> Frame {
    Frame::SlowPath(ByteCursor::from_vec(bytes))
}

// ── MCS / GCC builders ────────────────────────────────────────────────────────

const USER_ID: u16 = 7;
const SHARE_ID: u32 = 0x0001_03ea;

fn ber(tag: &[u8], body: &[u8]) -> Vec<u8> {
    let mut v = tag.to_vec();
    if body.len() < 0x80 {
        v.push(body.len() as u8);
    } else {
        v.push(0x82);
        v.extend((body.len() as u16).to_be_bytes());
    }
    v.extend_from_slice(body);
    v
}

fn block(tag: u16, body: &[u8]) -> Vec<u8> {
    let mut v = tag.to_le_bytes().to_vec();
    v.extend((body.len() as u16 + 4).to_le_bytes());
    v.extend_from_slice(body);
    v
}

fn connect_response(rdp_version: u32) -> Vec<u8> {
    let mut user_data = vec![0u8; 21];
    user_data.push(0);
    user_data.extend(block(0x0c01, &rdp_version.to_le_bytes()));
    user_data.extend(block(0x0c02, &[0; 8]));

    let mut body = ber(&[0x0a], &[0]);
    body.extend(ber(&[0x02], &[0]));
    body.extend(ber(&[0x30], &[]));
    body.extend(ber(&[0x04], &user_data));
    ber(&[0x7f, 0x66], &body)
}

fn join_confirm(channel: u16) -> Vec<u8> {
    let mut v = vec![(15 << 2) | 2, 0];
    v.extend(USER_ID.to_be_bytes());
    v.extend(channel.to_be_bytes());
    v.extend(channel.to_be_bytes());
    v
}

fn send_data_indication(channel: u16, data: &[u8]) -> Vec<u8> {
    let mut v = vec![26 << 2];
    v.extend(1002u16.to_be_bytes());
    v.extend(channel.to_be_bytes());
    v.push(0x70);
    v.extend((0x8000 | data.len() as u16).to_be_bytes());
    v.extend_from_slice(data);
    v
}

/// MCS connect, user attach, joins and a "valid client" licence.
fn script_session(t: &MemTransport, rdp_version: u32) {
    t.push(slow(connect_response(rdp_version)));
    let mut attach = vec![(11 << 2) | 2, 0];
    attach.extend(USER_ID.to_be_bytes());
    t.push(slow(attach));
    t.push(slow(join_confirm(1001 + USER_ID)));
    t.push(slow(join_confirm(GLOBAL_CHANNEL)));
    t.push_global(vec![
        0x80, 0, 0, 0, // SEC_LICENSE_PKT
        0xff, 0x03, 0x10, 0x00, 7, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0,
    ]);
}

// ── share PDU builders ────────────────────────────────────────────────────────

fn share_control(pdu_type: u16, body: &[u8]) -> Vec<u8> {
    let mut v = ((body.len() + 6) as u16).to_le_bytes().to_vec();
    v.extend((pdu_type | 0x10).to_le_bytes());
    v.extend(0x03eau16.to_le_bytes());
    v.extend_from_slice(body);
    v
}

fn data_pdu(data_type: u8, body: &[u8]) -> Vec<u8> {
    let mut v = SHARE_ID.to_le_bytes().to_vec();
    v.extend([0, 1]);
    v.extend(((body.len() + 4) as u16).to_le_bytes());
    v.extend([data_type, 0, 0, 0]);
    v.extend_from_slice(body);
    share_control(7, &v)
}

fn cap(kind: u16, body: &[u8]) -> Vec<u8> {
    block(kind, body)
}

fn demand_active(extra_flags: u16, width: u16, height: u16, bpp: u16) -> Vec<u8> {
    let mut general = vec![0u8; 10];
    general.extend(extra_flags.to_le_bytes());
    general.extend([0; 8]);
    let mut bitmap = bpp.to_le_bytes().to_vec();
    bitmap.extend([0; 6]);
    bitmap.extend(width.to_le_bytes());
    bitmap.extend(height.to_le_bytes());
    bitmap.extend([0; 12]);

    let mut caps = 3u16.to_le_bytes().to_vec();
    caps.extend([0, 0]);
    caps.extend(cap(1, &general));
    caps.extend(cap(2, &bitmap));
    caps.extend(cap(0x99, &[1, 2, 3, 4])); // unknown set, skipped

    let mut body = SHARE_ID.to_le_bytes().to_vec();
    body.extend(4u16.to_le_bytes());
    body.extend((caps.len() as u16).to_le_bytes());
    body.extend(b"RDP\0");
    body.extend(caps);
    body.extend(0u32.to_le_bytes());
    share_control(1, &body)
}

/// Synchronise, cooperate and granted control in a single payload.
fn activation_replies() -> Vec<u8> {
    let mut v = data_pdu(31, &[1, 0, 0xea, 0x03]);
    v.extend(data_pdu(20, &[4, 0, 0, 0, 0, 0, 0, 0]));
    v.extend(data_pdu(20, &[2, 0, 0, 0, 0, 0, 0, 0]));
    v
}

fn script_activation(t: &MemTransport, extra_flags: u16, width: u16, height: u16) {
    t.push_global(demand_active(extra_flags, width, height, 16));
    t.push_global(activation_replies());
}

/// `(share-control type, data type)` of a sent payload.
fn kind(p: &[u8]) -> (u16, u8) {
    let pdu_type = u16::from_le_bytes([p[2], p[3]]) & 0xf;
    (pdu_type, if pdu_type == 7 { p[14] } else { 0 })
}

fn confirm_active_sets(p: &[u8]) -> Vec<u16> {
    let mut s = ByteCursor::from_vec(p[26..p.len() - 4].to_vec());
    let mut out = Vec::new();
    while !s.at_end() {
        out.push(s.read_u16_le().unwrap());
        let len = usize::from(s.read_u16_le().unwrap());
        s.skip(len - 4).unwrap();
    }
    out
}

// ── collaborators ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Seen {
    resized: Vec<(u16, u16, u16)>,
    moves:   Vec<(u16, u16)>,
    bells:   usize,
}

struct Recorder(Rc<RefCell<Seen>>);

impl Display for Recorder {
    fn resize(&mut self, width: u16, height: u16, bpp: u16) {
        self.0.borrow_mut().resized.push((width, height, bpp));
    }
    fn move_pointer(&mut self, x: u16, y: u16) {
        self.0.borrow_mut().moves.push((x, y));
    }
    fn bell(&mut self) {
        self.0.borrow_mut().bells += 1;
    }
}

struct Keys(usize);

impl PersistentCache for Keys {
    fn enumerate(&mut self, level: u8) -> Vec<[u8; 8]> {
        assert_eq!(level, 2);
        (0..self.0).map(|i| (i as u64).to_le_bytes()).collect()
    }
}

fn config() -> Config {
    Config {
        server: "rdp.test".into(),
        username: "alice".into(),
        password: "hunter2".into(),
        width: 800,
        height: 600,
        encryption: false,
        ..Default::default()
    }
}

fn active_client(t: &MemTransport) -> Client<MemTransport> {
    script_session(t, 0x0008_0004);
    script_activation(t, 0x041d, 800, 600);
    let mut client = Client::new(t.clone(), config()).unwrap();
    client.connect().unwrap();
    t.clear_sent();
    client
}

fn drain(client: &mut Client<MemTransport>) {
    let err = client.main_loop().unwrap_err();
    assert!(err.is_disconnect(), "unexpected error: {err}");
}

// ── activation ────────────────────────────────────────────────────────────────

#[test]
fn activation_sends_handshake_in_order() {
    let t = MemTransport::default();
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 800, 600);
    let mut client = Client::new(t.clone(), config()).unwrap();
    client.connect().unwrap();
    assert_eq!(client.state().phase, Phase::Active);
    assert_eq!(client.state().share_id, SHARE_ID);
    assert_eq!(client.state().version, RdpVersion::V5);

    let sent = t.sent();
    assert_eq!(&sent[0][..4], &[0x40, 0, 0, 0], "client info first");
    let kinds: Vec<_> = sent[1..].iter().map(|p| kind(p)).collect();
    assert_eq!(kinds, vec![(3, 0), (7, 31), (7, 20), (7, 20), (7, 28), (7, 39)]);

    let confirm = &sent[1];
    assert_eq!(usize::from(u16::from_le_bytes([confirm[0], confirm[1]])), confirm.len());
    assert_eq!(u16::from_le_bytes([confirm[4], confirm[5]]), 1001 + USER_ID);
    let sets = confirm_active_sets(confirm);
    assert_eq!(sets.len(), 15);
    assert!(sets.contains(&19) && !sets.contains(&4));

    let controls: Vec<u8> = sent[3..5].iter().map(|p| p[18]).collect();
    assert_eq!(controls, vec![4, 1], "cooperate then request control");
    assert_eq!(sent[6][22], 3, "single RDP 5 font list");
}

#[test]
fn zero_extra_flags_downgrade_to_rdp4() {
    let t = MemTransport::default();
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0, 800, 600);
    let mut client = Client::new(t.clone(), config()).unwrap();
    client.connect().unwrap();
    assert_eq!(client.state().version, RdpVersion::V4);

    let sent = t.sent();
    let sets = confirm_active_sets(&sent[1]);
    assert!(sets.contains(&4) && !sets.contains(&19));
    let fonts: Vec<u8> = sent.iter().filter(|p| kind(p) == (7, 39)).map(|p| p[22]).collect();
    assert_eq!(fonts, vec![1, 2]);
}

#[test]
fn rdp4_server_gets_basic_client_info() {
    let t = MemTransport::default();
    script_session(&t, 0x0008_0001);
    script_activation(&t, 0, 800, 600);
    let mut client = Client::new(t.clone(), config()).unwrap();
    client.connect().unwrap();
    let info = &t.sent()[0];
    let flags = u32::from_le_bytes([info[8], info[9], info[10], info[11]]);
    assert_eq!(flags & 0x0001_0000, 0, "no logon-errors flag in the RDP 4 form");
    assert_ne!(flags & 0x8, 0, "autologon with a password");
}

#[test]
fn server_desktop_size_resizes_display() {
    let t = MemTransport::default();
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 1280, 1024);
    let seen = Rc::new(RefCell::new(Seen::default()));
    let mut client = Client::new(t.clone(), config()).unwrap().with_display(Box::new(Recorder(seen.clone())));
    client.connect().unwrap();
    assert_eq!(seen.borrow().resized, vec![(1280, 1024, 16)]);
    assert_eq!((client.state().width, client.state().height), (1280, 1024));
}

#[test]
fn persistent_keys_are_paged() {
    let t = MemTransport::default();
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 800, 600);
    let cfg = Config { bitmap_cache_persist: true, ..config() };
    let mut client = Client::new(t.clone(), cfg).unwrap().with_persistent_cache(Box::new(Keys(170)));
    client.connect().unwrap();

    let pages: Vec<Vec<u8>> = t.sent().into_iter().filter(|p| kind(p) == (7, 43)).collect();
    assert_eq!(pages.len(), 2);
    let count = |p: &[u8]| u16::from_le_bytes([p[22], p[23]]);
    let total = |p: &[u8]| u16::from_le_bytes([p[32], p[33]]);
    let flags = |p: &[u8]| u32::from_le_bytes([p[38], p[39], p[40], p[41]]);
    assert_eq!((count(&pages[0]), total(&pages[0]), flags(&pages[0])), (169, 170, 1));
    assert_eq!((count(&pages[1]), total(&pages[1]), flags(&pages[1])), (1, 170, 2));
    assert_eq!(pages[1].len(), 18 + 24 + 8);
}

// ── data PDUs ─────────────────────────────────────────────────────────────────

#[test]
fn zero_width_bitmap_is_protocol_violation() {
    let t = MemTransport::default();
    let mut client = active_client(&t);
    let mut body = vec![1, 0, 1, 0]; // bitmap update, one rectangle
    for v in [0u16, 0, 3, 3, 0, 4, 16, 0, 0] {
        body.extend(v.to_le_bytes());
    }
    t.push_global(data_pdu(2, &body));
    let err = client.main_loop().unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(err.dump().is_some());
    assert_eq!(client.state().phase, Phase::Terminated);
}

#[test]
fn logon_info_reports_local_address() {
    let utf16 = |s: &str| s.encode_utf16().flat_map(u16::to_le_bytes).collect::<Vec<u8>>();
    let contains = |hay: &[u8], needle: &[u8]| hay.windows(needle.len()).any(|w| w == needle);

    let t = MemTransport::default();
    t.0.borrow_mut().local = Some("192.0.2.7".parse().unwrap());
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 800, 600);
    let mut client = Client::new(t.clone(), config()).unwrap();
    client.connect().unwrap();

    let info = &t.sent()[0];
    assert!(contains(info, &utf16("192.0.2.7")));
    assert!(!contains(info, &utf16("0.0.0.0")));
}

#[test]
fn logon_info_falls_back_to_configured_address() {
    let utf16 = |s: &str| s.encode_utf16().flat_map(u16::to_le_bytes).collect::<Vec<u8>>();

    let t = MemTransport::default();
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 800, 600);
    let cfg = Config { client_address: "10.1.2.3".into(), ..config() };
    let mut client = Client::new(t.clone(), cfg).unwrap();
    client.connect().unwrap();

    let needle = utf16("10.1.2.3");
    assert!(t.sent()[0].windows(needle.len()).any(|w| w == needle));
}

#[test]
fn silent_server_after_demand_active_times_out() {
    let t = MemTransport::default();
    script_session(&t, 0x0008_0004);
    t.push_global(demand_active(0x041d, 800, 600, 16));
    t.0.borrow_mut().idle = true;
    let cfg = Config { connect_timeout: Duration::from_millis(50), ..config() };
    let mut client = Client::new(t.clone(), cfg).unwrap();

    let err = client.connect().unwrap_err();
    assert!(
        matches!(err, ClientError::Proto(rdpwire_proto::Error::Handshake(_))),
        "unexpected error: {err}"
    );
    assert_ne!(client.state().phase, Phase::Active);
}

#[test]
fn password_is_scrubbed_on_first_data_pdu() {
    let t = MemTransport::default();
    let mut client = active_client(&t);
    assert!(client.state().holds_password(), "activation replies are discarded unread");
    t.push_global(data_pdu(34, &[]));
    t.0.borrow_mut().exit = Some(client.exit_flag());
    assert_eq!(client.main_loop().unwrap(), LoopExit::Requested);
    assert_eq!(client.state().phase, Phase::Active);
    assert!(!client.state().holds_password());
}

#[test]
fn extended_logon_info_keeps_reconnect_cookie() {
    let t = MemTransport::default();
    let mut client = active_client(&t);
    let mut body = 3u32.to_le_bytes().to_vec();
    body.extend(38u16.to_le_bytes());
    body.extend(1u32.to_le_bytes());
    body.extend(28u32.to_le_bytes());
    body.extend(28u32.to_le_bytes());
    body.extend(1u32.to_le_bytes());
    body.extend(0x42u32.to_le_bytes());
    body.extend([9; 16]);
    t.push_global(data_pdu(38, &body));
    drain(&mut client);

    let cookie = client.state().reconnect_cookie.clone().expect("cookie kept");
    assert_eq!((cookie.logon_id, cookie.random), (0x42, [9; 16]));
}

#[test]
fn error_info_bell_and_keepalive_in_one_payload() {
    let t = MemTransport::default();
    let seen = Rc::new(RefCell::new(Seen::default()));
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 800, 600);
    let mut client = Client::new(t.clone(), config()).unwrap().with_display(Box::new(Recorder(seen.clone())));
    client.connect().unwrap();

    let mut payload = data_pdu(47, &0x0000_000cu32.to_le_bytes());
    payload.extend([0x00, 0x80, 0, 0, 0, 0, 0, 0]);
    payload.extend(data_pdu(34, &[]));
    t.push_global(payload);
    drain(&mut client);
    assert_eq!(client.state().error_info, 0x0c);
    assert_eq!(seen.borrow().bells, 1);
}

#[test]
fn fast_path_pointer_position_reaches_display() {
    let t = MemTransport::default();
    let seen = Rc::new(RefCell::new(Seen::default()));
    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 800, 600);
    let mut client = Client::new(t.clone(), config()).unwrap().with_display(Box::new(Recorder(seen.clone())));
    client.connect().unwrap();

    let data = ByteCursor::from_vec(vec![0x08, 4, 0, 10, 0, 20, 0]);
    t.push(Frame::FastPath { header: 0, data });
    drain(&mut client);
    assert_eq!(seen.borrow().moves, vec![(10, 20)]);
}

// ── main loop control ─────────────────────────────────────────────────────────

#[test]
fn exit_flag_stops_main_loop() {
    let t = MemTransport::default();
    let mut client = active_client(&t);
    client.exit_flag().store(true, Ordering::Relaxed);
    assert_eq!(client.main_loop().unwrap(), LoopExit::Requested);
}

#[test]
fn redirect_with_address_and_lb_info_only() {
    let t = MemTransport::default();
    let mut client = active_client(&t);

    let mut body = vec![0, 0, 0x00, 0x04, 0, 0];
    body.extend(5u32.to_le_bytes());
    body.extend(0x3u32.to_le_bytes()); // target address + load-balance info
    let addr: Vec<u8> = "10.9.8.7\0".encode_utf16().flat_map(u16::to_le_bytes).collect();
    body.extend((addr.len() as u32).to_le_bytes());
    body.extend(&addr);
    let lb = b"Cookie: msts=3640205228.15629.0000\r\n";
    body.extend((lb.len() as u32).to_le_bytes());
    body.extend(lb);
    t.push_global(share_control(10, &body));

    assert_eq!(client.main_loop().unwrap(), LoopExit::Redirect);
    let r = client.pending_redirect().expect("redirect retained").clone();
    assert_eq!(r.session_id, 5);
    assert_eq!(r.server.as_deref(), Some("10.9.8.7"));
    assert_eq!(r.lb_info.as_deref(), Some(&lb[..]));
    assert!(r.username.is_none() && r.domain.is_none() && r.cookie.is_none());

    assert_eq!(client.reset_for_redirect(), Some(r));
    assert!(client.pending_redirect().is_none());
    assert_eq!(client.config().server, "10.9.8.7");
    assert_eq!(client.config().username, "alice");
    assert_eq!(client.state().phase, Phase::AwaitingDemandActive);

    script_session(&t, 0x0008_0004);
    script_activation(&t, 0x041d, 800, 600);
    client.connect().unwrap();
    let wire = t.0.borrow();
    let targets = &wire.targets;
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[1].host, "10.9.8.7");
    assert_eq!(targets[1].lb_cookie.as_deref(), Some(&lb[..]));
}

#[test]
fn invalid_config_is_rejected_before_connecting() {
    let cfg = Config { width: 0, ..config() };
    assert!(Client::new(MemTransport::default(), cfg).is_err());
}
