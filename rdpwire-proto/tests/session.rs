use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use rdpwire_crypto::{KeyState, SessionKeys, Strength};
use rdpwire_proto::{
    ByteCursor, ChannelDispatch, ClientData, ConnectTarget, Error, Frame, GLOBAL_CHANNEL, Mcs,
    McsState, SecPdu, Security, Transport,
    mcs::decode_send_data,
    sec::flags,
    transport::PROTOCOL_RDP,
};

// ── MemTransport ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemTransport {
    inbox:  VecDeque<Frame>,
    outbox: Vec<Vec<u8>>,
    closed: bool,
}

impl Transport for MemTransport {
    type Error = std::io::Error;
    fn connect(&mut self, _target: &ConnectTarget) -> Result<u32, Self::Error> {
        Ok(PROTOCOL_RDP)
    }
    fn send(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.outbox.push(data.to_vec());
        Ok(())
    }
    fn recv(&mut self) -> Result<Option<Frame>, Self::Error> {
        Ok(self.inbox.pop_front())
    }
    fn disconnect(&mut self) {
        self.closed = true;
    }
}

fn slow(bytes: Vec<u8>) -> Frame {
    Frame::SlowPath(ByteCursor::from_vec(bytes))
}

// ── server PDU builders ───────────────────────────────────────────────────────

const USER_ID: u16 = 7;

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

fn connect_response(user_data: &[u8]) -> Vec<u8> {
    let mut body = ber(&[0x0a], &[0]);
    body.extend(ber(&[0x02], &[0]));
    body.extend(ber(&[0x30], &[]));
    body.extend(ber(&[0x04], user_data));
    ber(&[0x7f, 0x66], &body)
}

fn attach_confirm() -> Vec<u8> {
    let mut v = vec![(11 << 2) | 2, 0];
    v.extend(USER_ID.to_be_bytes());
    v
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

fn block(tag: u16, body: &[u8]) -> Vec<u8> {
    let mut v = tag.to_le_bytes().to_vec();
    v.extend((body.len() as u16 + 4).to_le_bytes());
    v.extend_from_slice(body);
    v
}

fn proprietary_certificate() -> Vec<u8> {
    let mut modulus = [0xc5u8; 64];
    modulus[0] = 0x01;
    let mut key = 0x3141_5352u32.to_le_bytes().to_vec(); // RSA1
    key.extend(72u32.to_le_bytes());
    key.extend(512u32.to_le_bytes());
    key.extend(63u32.to_le_bytes());
    key.extend([1, 0, 1, 0]);
    key.extend(modulus);
    key.extend([0; 8]);

    let mut cert = 1u32.to_le_bytes().to_vec();
    cert.extend([0; 8]);
    cert.extend(0x0006u16.to_le_bytes());
    cert.extend((key.len() as u16).to_le_bytes());
    cert.extend(key);
    cert
}

const SERVER_RANDOM: [u8; 32] = [0x5a; 32];

fn server_user_data(encrypted: bool) -> Vec<u8> {
    let mut v = vec![0u8; 21];
    v.push(0x00);
    v.extend(block(0x0c01, &0x0008_0004u32.to_le_bytes()));
    let mut sec = Vec::new();
    if encrypted {
        let cert = proprietary_certificate();
        sec.extend(2u32.to_le_bytes()); // 128-bit
        sec.extend(1u32.to_le_bytes()); // low level
        sec.extend(32u32.to_le_bytes());
        sec.extend((cert.len() as u32).to_le_bytes());
        sec.extend(SERVER_RANDOM);
        sec.extend(cert);
    } else {
        sec.extend([0; 8]);
    }
    v.extend(block(0x0c02, &sec));
    v
}

/// Script a full connect sequence for `statics` registered channels.
fn script_connect(t: &mut MemTransport, statics: u16, encrypted: bool) {
    t.inbox.push_back(slow(connect_response(&server_user_data(encrypted))));
    t.inbox.push_back(slow(attach_confirm()));
    t.inbox.push_back(slow(join_confirm(1001 + USER_ID)));
    t.inbox.push_back(slow(join_confirm(GLOBAL_CHANNEL)));
    for i in 0..statics {
        t.inbox.push_back(slow(join_confirm(GLOBAL_CHANNEL + 1 + i)));
    }
}

fn plain_client() -> ClientData {
    ClientData { encryption: false, ..Default::default() }
}

fn server_keys(sec: &Security<MemTransport>) -> KeyState {
    let k = SessionKeys::derive(sec.client_random(), &SERVER_RANDOM, Strength::Bits128);
    KeyState::new(SessionKeys { sign: k.sign, encrypt: k.decrypt, decrypt: k.encrypt, strength: k.strength })
}

fn push(sec: &mut Security<MemTransport>, frame: Frame) {
    sec.mcs_mut().transport_mut().inbox.push_back(frame);
}

fn outbox(sec: &mut Security<MemTransport>) -> &mut Vec<Vec<u8>> {
    &mut sec.mcs_mut().transport_mut().outbox
}

// ── session layer ─────────────────────────────────────────────────────────────

#[test]
fn connect_joins_user_global_then_statics_in_order() {
    let mut t = MemTransport::default();
    script_connect(&mut t, 2, false);
    let mut sec = Security::new(t);
    assert_eq!(sec.mcs_mut().register_channel("rdpdr", 0x8000_0000).unwrap(), 1004);
    assert_eq!(sec.mcs_mut().register_channel("cliprdr", 0xc0a0_0000).unwrap(), 1005);

    let server = sec.connect(&ConnectTarget::default(), &plain_client()).unwrap();
    assert_eq!(server.rdp_version, Some(0x0008_0004));
    assert!(server.crypto.is_none());
    assert_eq!(sec.mcs().state(), McsState::Ready);
    assert_eq!(sec.mcs().user_id(), USER_ID);

    let out = outbox(&mut sec);
    assert_eq!(&out[0][..2], &[0x7f, 0x65]);
    let target: [u8; 34] = [
        0x30, 0x20, 0x02, 0x02, 0x00, 0x22, 0x02, 0x02, 0x00, 0x02, 0x02, 0x02, 0x00, 0x00,
        0x02, 0x02, 0x00, 0x01, 0x02, 0x02, 0x00, 0x00, 0x02, 0x02, 0x00, 0x01, 0x02, 0x02,
        0xff, 0xff, 0x02, 0x02, 0x00, 0x02,
    ];
    let pos = out[0].windows(34).position(|w| w == target).expect("target domain params");
    let minimum = &out[0][pos + 34..pos + 68];
    assert_eq!(&minimum[2..6], &[0x02, 0x02, 0x00, 0x01]);
    assert_eq!(&minimum[26..30], &[0x02, 0x02, 0x04, 0x20]);
    let maximum = &out[0][pos + 68..pos + 102];
    assert_eq!(&maximum[6..10], &[0x02, 0x02, 0xfc, 0x17]);

    assert_eq!(out[1], vec![1 << 2, 0, 0, 0, 0]);
    assert_eq!(out[2], vec![10 << 2]);
    let joins: Vec<u16> = out[3..].iter().map(|p| u16::from_be_bytes([p[3], p[4]])).collect();
    assert_eq!(joins, vec![1008, 1003, 1004, 1005]);
}

#[test]
fn failed_join_disconnects() {
    let mut t = MemTransport::default();
    t.inbox.push_back(slow(connect_response(&server_user_data(false))));
    t.inbox.push_back(slow(attach_confirm()));
    t.inbox.push_back(slow(vec![(15 << 2) | 2, 1, 0, 7, 0x03, 0xef, 0x03, 0xef]));
    let mut sec = Security::new(t);
    let err = sec.connect(&ConnectTarget::default(), &plain_client()).unwrap_err();
    assert!(matches!(err, Error::Handshake(_)));
    assert_eq!(sec.mcs().state(), McsState::Disconnected);
    assert!(sec.mcs_mut().transport_mut().closed);
}

#[test]
fn channels_cannot_be_registered_after_connect() {
    let mut t = MemTransport::default();
    script_connect(&mut t, 0, false);
    let mut sec = Security::new(t);
    sec.connect(&ConnectTarget::default(), &plain_client()).unwrap();
    assert!(sec.mcs_mut().register_channel("late", 0).is_err());
}

#[test]
fn send_data_header_round_trip() {
    let mut mcs = Mcs::new(MemTransport::default());
    let mut s = mcs.init(5);
    s.write_bytes(b"hello");
    mcs.send(s, 1004).unwrap();

    let wire = mcs.transport_mut().outbox.pop().unwrap();
    assert_eq!(&wire[6..8], &[0x80, 0x05]);
    let (user, channel, payload) = decode_send_data(&mut ByteCursor::from_vec(wire)).unwrap();
    assert_eq!((user, channel), (0, 1004));
    assert_eq!(payload, b"hello");
}

#[test]
fn ultimatum_is_reported_as_disconnect() {
    let mut mcs = Mcs::new(MemTransport::default());
    mcs.transport_mut().inbox.push_back(slow(vec![(8 << 2) | 1, 0x80]));
    match mcs.recv() {
        Err(Error::Disconnected { reason }) => assert_eq!(reason, 3),
        other => panic!("expected disconnect, got {other:?}"),
    }
}

#[test]
fn unexpected_opcode_is_no_data() {
    let mut mcs = Mcs::new(MemTransport::default());
    mcs.transport_mut().inbox.push_back(slow(vec![11 << 2, 0]));
    assert!(mcs.recv().unwrap().is_none());
}

// ── security layer ────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Vec<(u16, Vec<u8>)>>>);

impl ChannelDispatch for Recorder {
    fn deliver(&mut self, channel: u16, data: ByteCursor) {
        self.0.borrow_mut().push((channel, data.rest().to_vec()));
    }
}

#[test]
fn licensing_and_virtual_channels_never_reach_caller() {
    let mut t = MemTransport::default();
    script_connect(&mut t, 1, false);
    let recorder = Recorder::default();
    let mut sec = Security::new(t).with_channels(Box::new(recorder.clone()));
    sec.mcs_mut().register_channel("rdpdr", 0).unwrap();
    sec.connect(&ConnectTarget::default(), &plain_client()).unwrap();

    // plain data before licensing: header read, then rewound
    push(&mut sec, slow(send_data_indication(GLOBAL_CHANNEL, &[0x00, 0x00, 0x00, 0x00, 0xab])));
    // valid-client alert
    let mut licence = (flags::LICENSE_PKT as u16).to_le_bytes().to_vec();
    licence.extend([0, 0, 0xff, 0x03, 0x10, 0x00, 7, 0, 0, 0, 2, 0, 0, 0]);
    push(&mut sec, slow(send_data_indication(GLOBAL_CHANNEL, &licence)));
    push(&mut sec, slow(send_data_indication(1004, b"dr")));
    push(&mut sec, slow(send_data_indication(GLOBAL_CHANNEL, b"share")));

    match sec.recv().unwrap() {
        Some(SecPdu::Slow(s)) => assert_eq!(s.rest(), &[0x00, 0x00, 0x00, 0x00, 0xab]),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!sec.licence_issued());
    match sec.recv().unwrap() {
        Some(SecPdu::Slow(s)) => assert_eq!(s.rest(), b"share"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(sec.licence_issued());
    assert_eq!(*recorder.0.borrow(), vec![(1004, b"dr".to_vec())]);
    assert!(sec.recv().unwrap().is_none());
}

#[test]
fn exchange_packet_and_encrypted_round_trip() {
    let mut t = MemTransport::default();
    script_connect(&mut t, 0, true);
    let mut sec = Security::new(t);
    let server = sec.connect(&ConnectTarget::default(), &ClientData::default()).unwrap();
    assert_eq!(server.crypto.as_ref().map(|c| c.strength), Some(Strength::Bits128));
    assert!(sec.encrypting());

    // exchange packet: flags, length, 64-byte ciphertext, 8 zero bytes
    let exchange = outbox(&mut sec).last().unwrap().clone();
    let (_, channel, payload) = decode_send_data(&mut ByteCursor::from_vec(exchange)).unwrap();
    assert_eq!(channel, GLOBAL_CHANNEL);
    assert_eq!(&payload[..4], &flags::EXCHANGE_PKT.to_le_bytes());
    assert_eq!(&payload[4..8], &72u32.to_le_bytes());
    assert_eq!(payload.len(), 8 + 72);
    assert_eq!(&payload[72..], &[0; 8]);

    let mut server_keys = server_keys(&sec);

    // client → server
    let mut s = sec.init(sec.data_flags(), 5);
    s.write_bytes(b"hello");
    sec.send(s, sec.data_flags()).unwrap();
    let wire = outbox(&mut sec).pop().unwrap();
    let (_, _, mut payload) = decode_send_data(&mut ByteCursor::from_vec(wire)).unwrap();
    assert_eq!(&payload[..4], &flags::ENCRYPT.to_le_bytes());
    server_keys.decrypt(&mut payload[12..]);
    assert_eq!(&payload[12..], b"hello");
    assert_eq!(payload[4..12], server_keys.sign(b"hello"));

    // server → client, slow path
    let mut body = b"share-control".to_vec();
    let sig = server_keys.sign(&body);
    server_keys.encrypt(&mut body);
    let mut pdu = (flags::ENCRYPT as u16).to_le_bytes().to_vec();
    pdu.extend([0, 0]);
    pdu.extend(sig);
    pdu.extend(body);
    push(&mut sec, slow(send_data_indication(GLOBAL_CHANNEL, &pdu)));
    match sec.recv().unwrap() {
        Some(SecPdu::Slow(s)) => assert_eq!(s.rest(), b"share-control"),
        other => panic!("unexpected {other:?}"),
    }

    // server → client, encrypted fast path
    let mut body = vec![0x00, 0x01, 0x02];
    let sig = server_keys.sign(&body);
    server_keys.encrypt(&mut body);
    let mut data = sig.to_vec();
    data.extend(body);
    push(&mut sec, Frame::FastPath { header: 0x80, data: ByteCursor::from_vec(data) });
    match sec.recv().unwrap() {
        Some(SecPdu::FastPath { header, data }) => {
            assert_eq!(header, 0x80);
            assert_eq!(data.rest(), &[0x00, 0x01, 0x02]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

// Known server quirk: standard-security redirects carry their type and
// length swapped; the layer swaps them back before handing up.
#[test]
fn redirect_packet_is_decrypted_and_swapped() {
    let mut t = MemTransport::default();
    script_connect(&mut t, 0, true);
    let mut sec = Security::new(t);
    sec.connect(&ConnectTarget::default(), &ClientData::default()).unwrap();
    let mut server_keys = server_keys(&sec);

    let mut body = vec![0x00, 0x04, 0x10, 0x00, 0xee];
    server_keys.encrypt(&mut body);
    let mut pdu = (flags::REDIRECTION_PKT as u16).to_le_bytes().to_vec();
    pdu.extend([0, 0]);
    pdu.extend([0; 8]);
    pdu.extend(body);
    push(&mut sec, slow(send_data_indication(GLOBAL_CHANNEL, &pdu)));
    match sec.recv().unwrap() {
        Some(SecPdu::Slow(s)) => assert_eq!(s.rest(), &[0x10, 0x00, 0x04, 0x00, 0xee]),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn encrypted_frame_without_signature_is_violation() {
    let mut t = MemTransport::default();
    script_connect(&mut t, 0, true);
    let mut sec = Security::new(t);
    sec.connect(&ConnectTarget::default(), &ClientData::default()).unwrap();

    let mut pdu = (flags::ENCRYPT as u16).to_le_bytes().to_vec();
    pdu.extend([0, 0, 1, 2, 3]);
    push(&mut sec, slow(send_data_indication(GLOBAL_CHANNEL, &pdu)));
    assert!(sec.recv().unwrap_err().is_protocol_violation());
}
