//! Datagram loss, duplication and record size negotiation.

mod common;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use common::*;
use tlsengine::{AlertDescription, CipherSuite, Config, Role, SoftwareCryptoService, TransportKind};

fn is_epoch1_handshake(data: &[u8]) -> bool {
    data[0] == HANDSHAKE && data[3..5] == [0, 1]
}

#[test]
fn lost_server_hello_is_retransmitted() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256);
    let server = pair.server;
    let mut dropped = false;
    pair.filter = Some(Box::new(move |from, data| {
        if from == server && !dropped && datagram_handshake_type(data) == Some(SERVER_HELLO) {
            dropped = true;
            return 0;
        }
        1
    }));

    pair.handshake();

    let hellos = pair
        .sent_by(pair.server)
        .into_iter()
        .filter(|d| datagram_handshake_type(d) == Some(SERVER_HELLO))
        .count();
    assert!(hellos >= 2, "ServerHello sent {} times", hellos);
}

#[test]
fn lost_server_finished_is_recovered() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256);
    let server = pair.server;
    let mut dropped = false;
    pair.filter = Some(Box::new(move |from, data| {
        if from == server && !dropped && is_epoch1_handshake(data) {
            dropped = true;
            return 0;
        }
        1
    }));

    // The client repeats its last flight, the server answers with its own.
    pair.handshake();

    let finished = pair
        .sent_by(pair.server)
        .into_iter()
        .filter(|d| is_epoch1_handshake(d))
        .count();
    assert!(finished >= 2, "Finished sent {} times", finished);
}

#[test]
fn retransmission_limit() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256);
    let server = pair.server;
    pair.filter = Some(Box::new(move |from, _| if from == server { 0 } else { 1 }));
    pair.connect();

    let client = pair.client;
    assert!(pair.run_until(5000, |p| p.failed(client).is_some()));
    assert_eq!(pair.failed(client), Some(Some(AlertDescription::InternalError)));

    // Initial hello plus six retransmissions, then the alert.
    let hellos = pair
        .sent_by(client)
        .into_iter()
        .filter(|d| datagram_handshake_type(d) == Some(CLIENT_HELLO))
        .count();
    assert_eq!(hellos, 7);
}

#[test]
fn duplicated_datagrams_are_dropped() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_NULL_SHA256);
    pair.filter = Some(Box::new(|_, _| 2));
    pair.handshake();

    let (client, server) = (pair.client, pair.server);
    pair.engine.send(client, b"once").unwrap();
    assert!(pair.run_until(100, |p| p.received(server) == b"once"));
    for _ in 0..20 {
        pair.step();
    }
    assert_eq!(pair.received(server), b"once");
    assert_eq!(pair.failed(server), None);
    assert_eq!(pair.failed(client), None);
}

#[test]
fn record_size_limit_bounds_records() {
    let client = Arc::new(
        Config::builder(Role::Client, TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256)
            .psk(PSK_IDENTITY, PSK)
            .max_record_size(512)
            .record_size_limit(true)
            .build()
            .unwrap(),
    );
    let server = Arc::new(
        Config::builder(Role::Server, TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256)
            .psk(PSK_IDENTITY, PSK)
            .record_size_limit(true)
            .build()
            .unwrap(),
    );
    let mut pair = Pair::new(client, server, SoftwareCryptoService::new());
    pair.handshake();

    let payload = vec![0x5a; 3000];
    let (client, server) = (pair.client, pair.server);
    assert_eq!(pair.engine.send(server, &payload).unwrap(), payload.len());
    assert!(pair.run_until(200, |p| p.received(client).len() == payload.len()));

    for datagram in pair.sent_by(server) {
        for len in datagram_record_lengths(datagram) {
            assert!(len <= 512, "record of {} bytes", len);
        }
    }
}

#[test]
fn record_size_limit_ignored_when_disabled() {
    let client = Arc::new(
        Config::builder(Role::Client, TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256)
            .psk(PSK_IDENTITY, PSK)
            .max_record_size(512)
            .record_size_limit(true)
            .build()
            .unwrap(),
    );
    let server = psk_config(
        Role::Server,
        TransportKind::Datagram,
        CipherSuite::PSK_AES_128_GCM_SHA256,
    );
    let mut pair = Pair::new(client, server, SoftwareCryptoService::new());
    pair.handshake();

    // The server does not echo the extension, so it sends full records.
    let (client, server) = (pair.client, pair.server);
    pair.engine.send(server, &[1; 400]).unwrap();
    assert!(pair.run_until(200, |p| p.received(client).len() == 400));
}

#[test]
fn record_from_unknown_epoch_is_dropped() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256);
    let client = pair.client;
    let mut first = true;
    pair.filter = Some(Box::new(move |from, data| {
        if from == client && first {
            first = false;
            data[3] = 0xff;
            data[4] = 0xff;
        }
        1
    }));

    // The mangled hello is ignored and the retransmitted one goes through.
    pair.handshake();
    assert_eq!(pair.failed(pair.server), None);
}

#[test]
fn truncated_datagram_does_not_spill_into_the_next() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_NULL_SHA256);
    pair.handshake();

    let (client, server) = (pair.client, pair.server);
    let held = Rc::new(RefCell::new(Vec::new()));
    let sink = held.clone();
    pair.filter = Some(Box::new(move |from, data| {
        if from == client && content_type(data) == APPLICATION_DATA {
            sink.borrow_mut().push(data.clone());
            return 0;
        }
        1
    }));

    pair.engine.send(client, b"after the runt").unwrap();
    assert!(pair.run_until(50, |_| !held.borrow().is_empty()));
    pair.filter = None;

    // The first datagram's header promises more bytes than it carries.
    let datagram = held.borrow()[0].clone();
    pair.engine
        .rx_indication(server, Some(client_addr()), &datagram[..20])
        .unwrap();
    pair.engine
        .rx_indication(server, Some(client_addr()), &datagram)
        .unwrap();

    assert!(pair.run_until(50, |p| p.received(server) == b"after the runt"));
    assert_eq!(pair.failed(server), None);
    assert_eq!(pair.failed(client), None);
}

#[test]
fn sequence_numbers_step_by_one_per_epoch() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256);
    pair.handshake();
    let (client, server) = (pair.client, pair.server);
    pair.engine.send(client, b"one").unwrap();
    assert!(pair.run_until(100, |p| p.received(server) == b"one"));
    pair.engine.send(client, b"two").unwrap();
    assert!(pair.run_until(100, |p| p.received(server) == b"onetwo"));

    // Retransmissions repeat a record verbatim; anything else is a new number.
    let mut seen: BTreeMap<(u16, u64), Vec<u8>> = BTreeMap::new();
    let mut order = Vec::new();
    for datagram in pair.sent_by(client) {
        for (epoch, seq, record) in datagram_records(datagram) {
            match seen.get(&(epoch, seq)) {
                Some(previous) => assert_eq!(previous.as_slice(), record, "epoch {} seq {} reused", epoch, seq),
                None => {
                    seen.insert((epoch, seq), record.to_vec());
                    order.push((epoch, seq));
                }
            }
        }
    }

    for epoch in [0u16, 1] {
        let seqs: Vec<u64> = order.iter().filter(|(e, _)| *e == epoch).map(|(_, s)| *s).collect();
        assert!(!seqs.is_empty(), "nothing sent in epoch {}", epoch);
        let expected: Vec<u64> = (0..seqs.len() as u64).collect();
        assert_eq!(seqs, expected, "epoch {}", epoch);
    }
}
