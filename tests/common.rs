//! Shared helpers for integration tests.
//!
//! This file has no `#[test]` functions. Import it from other test files via
//! `mod common;`.

#![allow(unused)]

use std::net::SocketAddr;
use std::sync::Arc;

use tlsengine::certificate::{CertificateAuthority, CertifiedKey};
use tlsengine::{
    AlertDescription, CipherSuite, Config, ConnectionId, Engine, Output, Role, SoftwareCryptoService,
    State, Transport, TransportError, TransportKind,
};

pub const PSK_IDENTITY: &[u8] = b"device-17";
pub const PSK: &[u8] = b"0123456789abcdef";

/// Record content types.
pub const CHANGE_CIPHER_SPEC: u8 = 20;
pub const ALERT: u8 = 21;
pub const HANDSHAKE: u8 = 22;
pub const APPLICATION_DATA: u8 = 23;

/// Handshake message types.
pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const HELLO_VERIFY_REQUEST: u8 = 3;
pub const SERVER_KEY_EXCHANGE: u8 = 12;
pub const CERTIFICATE_VERIFY: u8 = 15;

/// What the upper layer saw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected(ConnectionId),
    Data(ConnectionId, Vec<u8>),
    TxConfirmed(ConnectionId, usize),
    Closed(ConnectionId),
    Failed(ConnectionId, Option<AlertDescription>),
}

/// Collects everything the engine sends.
#[derive(Default)]
pub struct Wire {
    pub sent: Vec<(ConnectionId, Vec<u8>)>,
    pub refuse: bool,
}

impl Transport for Wire {
    fn send(&mut self, id: ConnectionId, _to: Option<SocketAddr>, data: &[u8]) -> Result<(), TransportError> {
        if self.refuse {
            return Err(TransportError::Refused);
        }
        self.sent.push((id, data.to_vec()));
        Ok(())
    }
}

/// Decides how many copies of a sent record or datagram reach the peer.
/// The bytes may be modified in place.
pub type Filter = Box<dyn FnMut(ConnectionId, &mut Vec<u8>) -> usize>;

/// A client and a server in one engine, wired back to back.
pub struct Pair {
    pub engine: Engine,
    pub client: ConnectionId,
    pub server: ConnectionId,
    pub kind: TransportKind,
    pub wire: Wire,
    /// Every record or datagram sent, in order.
    pub log: Vec<(ConnectionId, Vec<u8>)>,
    pub seen: Vec<Seen>,
    pub filter: Option<Filter>,
    pub ticks: usize,
}

pub fn client_addr() -> SocketAddr {
    "192.0.2.10:40000".parse().unwrap()
}

impl Pair {
    pub fn new(client: Arc<Config>, server: Arc<Config>, crypto: SoftwareCryptoService) -> Pair {
        let _ = env_logger::try_init();
        let kind = client.transport();
        let mut engine = Engine::new(2, Box::new(crypto));
        let client = engine.open(client).expect("open client");
        let server = engine.open(server).expect("open server");
        Pair {
            engine,
            client,
            server,
            kind,
            wire: Wire::default(),
            log: Vec::new(),
            seen: Vec::new(),
            filter: None,
            ticks: 0,
        }
    }

    pub fn peer(&self, id: ConnectionId) -> ConnectionId {
        if id == self.client {
            self.server
        } else {
            self.client
        }
    }

    /// One engine tick, then deliver what was sent and collect output.
    pub fn step(&mut self) {
        self.ticks += 1;
        self.engine.tick(&mut self.wire);

        for (from, mut data) in std::mem::take(&mut self.wire.sent) {
            self.log.push((from, data.clone()));

            if self.kind == TransportKind::Stream {
                self.engine
                    .tx_confirmation(from, data.len())
                    .expect("tx confirmation");
            }

            let copies = match self.filter.as_mut() {
                Some(f) => f(from, &mut data),
                None => 1,
            };

            let to = self.peer(from);
            let addr = (self.kind == TransportKind::Datagram && from == self.client).then(client_addr);
            for _ in 0..copies {
                // Released peers no longer take data.
                let _ = self.engine.rx_indication(to, addr, &data);
            }
        }

        let mut buf = [0u8; 4096];
        loop {
            let seen = match self.engine.poll_output(&mut buf) {
                Output::Idle => break,
                Output::Connected(id) => Seen::Connected(id),
                Output::ApplicationData { id, data } => Seen::Data(id, data.to_vec()),
                Output::TxConfirmed { id, len } => Seen::TxConfirmed(id, len),
                Output::Closed(id) => Seen::Closed(id),
                Output::Failed { id, alert } => Seen::Failed(id, alert),
            };
            self.seen.push(seen);
        }
    }

    /// Step until `done` holds. False if it never did within `max` ticks.
    pub fn run_until(&mut self, max: usize, mut done: impl FnMut(&Pair) -> bool) -> bool {
        for _ in 0..max {
            if done(self) {
                return true;
            }
            self.step();
        }
        done(self)
    }

    pub fn connect(&mut self) {
        self.engine.connect(self.client).expect("connect");
    }

    /// Connect and run until both ends report `Connected`.
    pub fn handshake(&mut self) {
        self.connect();
        let (client, server) = (self.client, self.server);
        let ok = self.run_until(2000, |p| {
            p.seen.contains(&Seen::Connected(client)) && p.seen.contains(&Seen::Connected(server))
        });
        assert!(ok, "handshake did not complete: {:?}", self.seen);
        assert_eq!(self.engine.state(client).unwrap(), State::Ok);
        assert_eq!(self.engine.state(server).unwrap(), State::Ok);
    }

    /// Application data received by `id` so far.
    pub fn received(&self, id: ConnectionId) -> Vec<u8> {
        self.seen
            .iter()
            .filter_map(|s| match s {
                Seen::Data(to, data) if *to == id => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn failed(&self, id: ConnectionId) -> Option<Option<AlertDescription>> {
        self.seen.iter().find_map(|s| match s {
            Seen::Failed(f, alert) if *f == id => Some(*alert),
            _ => None,
        })
    }

    /// Records or datagrams sent by `id`.
    pub fn sent_by(&self, id: ConnectionId) -> Vec<&[u8]> {
        self.log
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, d)| d.as_slice())
            .collect()
    }
}

pub fn psk_config(role: Role, kind: TransportKind, suite: CipherSuite) -> Arc<Config> {
    let mut builder = Config::builder(role, kind, suite).psk(PSK_IDENTITY, PSK);
    if role == Role::Server {
        builder = builder.retransmit_initial_ticks(4);
    } else {
        builder = builder.retransmit_initial_ticks(3);
    }
    Arc::new(builder.build().expect("psk config"))
}

pub fn psk_pair(kind: TransportKind, suite: CipherSuite) -> Pair {
    Pair::new(
        psk_config(Role::Client, kind, suite),
        psk_config(Role::Server, kind, suite),
        SoftwareCryptoService::new(),
    )
}

/// Certificates for an ECDHE-ECDSA pair.
pub struct Pki {
    pub ca: CertificateAuthority,
    pub server: CertifiedKey,
    pub client: CertifiedKey,
}

pub fn pki() -> Pki {
    let ca = CertificateAuthority::new("test ca").expect("ca");
    let server = ca.issue("server").expect("server cert");
    let client = ca.issue("client").expect("client cert");
    Pki { ca, server, client }
}

/// ECDHE-ECDSA pair. With `client_auth` the server asks for a certificate
/// and the client presents one. `client_anchor` overrides the client's
/// trust anchor.
pub fn ecdhe_pair(
    kind: TransportKind,
    suite: CipherSuite,
    client_auth: bool,
    client_anchor: Option<&[u8]>,
    crypto: SoftwareCryptoService,
) -> Pair {
    let pki = pki();
    let mut crypto = crypto;
    let server_key = crypto
        .import_signing_key(&pki.server.private_key)
        .expect("import server key");
    let client_key = crypto
        .import_signing_key(&pki.client.private_key)
        .expect("import client key");

    let mut server = Config::builder(Role::Server, kind, suite)
        .certificate(vec![pki.server.certificate.clone()], server_key)
        .retransmit_initial_ticks(4);
    if client_auth {
        server = server.trust_anchor(pki.ca.certificate());
    }

    let anchor = client_anchor.unwrap_or(pki.ca.certificate());
    let mut client = Config::builder(Role::Client, kind, suite)
        .trust_anchor(anchor)
        .retransmit_initial_ticks(3);
    if client_auth {
        client = client.certificate(vec![pki.client.certificate.clone()], client_key);
    }

    Pair::new(
        Arc::new(client.build().expect("client config")),
        Arc::new(server.build().expect("server config")),
        crypto,
    )
}

/// Content type of the first record in a record or datagram.
pub fn content_type(data: &[u8]) -> u8 {
    data[0]
}

/// Handshake message type of a plaintext datagram record.
pub fn datagram_handshake_type(data: &[u8]) -> Option<u8> {
    (data.len() > 13 && data[0] == HANDSHAKE).then(|| data[13])
}

/// Record lengths of every record in a datagram.
pub fn datagram_record_lengths(datagram: &[u8]) -> Vec<usize> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 13 <= datagram.len() {
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        out.push(13 + len);
        i += 13 + len;
    }
    out
}

/// (epoch, sequence number, record bytes) of every record in a datagram.
pub fn datagram_records(datagram: &[u8]) -> Vec<(u16, u64, &[u8])> {
    let mut out = Vec::new();
    let mut i = 0;
    while i + 13 <= datagram.len() {
        let epoch = u16::from_be_bytes([datagram[i + 3], datagram[i + 4]]);
        let mut seq = [0u8; 8];
        seq[2..].copy_from_slice(&datagram[i + 5..i + 11]);
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        let end = (i + 13 + len).min(datagram.len());
        out.push((epoch, u64::from_be_bytes(seq), &datagram[i..end]));
        i += 13 + len;
    }
    out
}
