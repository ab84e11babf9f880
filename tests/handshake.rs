//! Full handshakes over both transports and every suite.

mod common;

use common::*;
use tlsengine::{AlertDescription, CipherSuite, ConnectionState, SoftwareCryptoService, State, TransportKind};

fn exchange(pair: &mut Pair) {
    let (client, server) = (pair.client, pair.server);

    assert_eq!(pair.engine.send(client, b"ping").unwrap(), 4);
    assert!(pair.run_until(200, |p| p.received(server) == b"ping"));

    assert_eq!(pair.engine.send(server, b"pong").unwrap(), 4);
    assert!(pair.run_until(200, |p| p.received(client) == b"pong"));
}

#[test]
fn tls_psk_aes_gcm() {
    let mut pair = psk_pair(TransportKind::Stream, CipherSuite::PSK_AES_128_GCM_SHA256);
    pair.handshake();
    exchange(&mut pair);

    assert_eq!(
        pair.engine.connection_state(pair.client).unwrap(),
        ConnectionState::Connected
    );
    // Stream transports confirm application payload, not record bytes.
    assert!(pair.seen.contains(&Seen::TxConfirmed(pair.client, 4)));
    assert!(pair.seen.contains(&Seen::TxConfirmed(pair.server, 4)));
}

#[test]
fn tls_psk_null_sha256() {
    let mut pair = psk_pair(TransportKind::Stream, CipherSuite::PSK_NULL_SHA256);
    pair.handshake();
    exchange(&mut pair);
}

#[test]
fn dtls_psk_null_with_cookie_exchange() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_NULL_SHA256);
    pair.handshake();

    let client_sent = pair.sent_by(pair.client);
    assert_eq!(datagram_handshake_type(client_sent[0]), Some(CLIENT_HELLO));
    assert_eq!(datagram_handshake_type(client_sent[1]), Some(CLIENT_HELLO));

    let server_sent = pair.sent_by(pair.server);
    assert_eq!(datagram_handshake_type(server_sent[0]), Some(HELLO_VERIFY_REQUEST));
    assert_eq!(datagram_handshake_type(server_sent[1]), Some(SERVER_HELLO));

    // The HelloVerifyRequest echoes the record sequence of the first hello.
    assert_eq!(&server_sent[0][3..11], &client_sent[0][3..11]);

    exchange(&mut pair);

    // Application data travels in epoch 1.
    let data = pair
        .sent_by(pair.client)
        .into_iter()
        .rev()
        .find(|d| content_type(d) == APPLICATION_DATA)
        .expect("application record");
    assert_eq!(&data[3..5], &[0, 1]);
}

#[test]
fn dtls_psk_aes_gcm() {
    let mut pair = psk_pair(TransportKind::Datagram, CipherSuite::PSK_AES_128_GCM_SHA256);
    pair.handshake();
    exchange(&mut pair);
}

#[test]
fn tls_ecdhe_ecdsa_with_client_auth() {
    let mut pair = ecdhe_pair(
        TransportKind::Stream,
        CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        true,
        None,
        SoftwareCryptoService::new(),
    );
    pair.handshake();
    exchange(&mut pair);
}

#[test]
fn dtls_ecdhe_ecdsa_with_client_auth() {
    let mut pair = ecdhe_pair(
        TransportKind::Datagram,
        CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        true,
        None,
        SoftwareCryptoService::new(),
    );
    pair.handshake();
    exchange(&mut pair);
}

#[test]
fn dtls_ecdhe_ecdsa_null_sha_server_auth_only() {
    let mut pair = ecdhe_pair(
        TransportKind::Datagram,
        CipherSuite::ECDHE_ECDSA_NULL_SHA,
        false,
        None,
        SoftwareCryptoService::new(),
    );
    pair.handshake();
    exchange(&mut pair);
}

#[test]
fn slow_crypto_service() {
    let mut pair = ecdhe_pair(
        TransportKind::Stream,
        CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        true,
        None,
        SoftwareCryptoService::new().with_latency(3),
    );
    pair.handshake();
    exchange(&mut pair);
}

#[test]
fn untrusted_server_certificate() {
    let other = tlsengine::certificate::CertificateAuthority::new("other ca").unwrap();
    let mut pair = ecdhe_pair(
        TransportKind::Stream,
        CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        false,
        Some(other.certificate()),
        SoftwareCryptoService::new(),
    );
    pair.connect();

    let (client, server) = (pair.client, pair.server);
    assert!(pair.run_until(500, |p| p.failed(client).is_some() && p.failed(server).is_some()));
    assert_eq!(pair.failed(client), Some(Some(AlertDescription::BadCertificate)));
    assert_eq!(pair.failed(server), Some(Some(AlertDescription::BadCertificate)));
    assert_eq!(pair.engine.state(client).unwrap(), State::Error);
}

#[test]
fn mismatched_psk() {
    let client = psk_config(
        tlsengine::Role::Client,
        TransportKind::Stream,
        CipherSuite::PSK_AES_128_GCM_SHA256,
    );
    let server = std::sync::Arc::new(
        tlsengine::Config::builder(
            tlsengine::Role::Server,
            TransportKind::Stream,
            CipherSuite::PSK_AES_128_GCM_SHA256,
        )
        .psk(PSK_IDENTITY, b"another key")
        .build()
        .unwrap(),
    );
    let mut pair = Pair::new(client, server, SoftwareCryptoService::new());
    pair.connect();

    let (client, server) = (pair.client, pair.server);
    assert!(pair.run_until(500, |p| p.failed(client).is_some() && p.failed(server).is_some()));
    assert_eq!(pair.failed(server), Some(Some(AlertDescription::BadRecordMac)));
    assert_eq!(pair.failed(client), Some(Some(AlertDescription::BadRecordMac)));
}

#[test]
fn failing_crypto_job_ends_with_internal_error() {
    let mut crypto = SoftwareCryptoService::new();
    crypto.fail_next(tlsengine::JobKind::KeyExchangePublic);
    let mut pair = ecdhe_pair(
        TransportKind::Stream,
        CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        false,
        None,
        crypto,
    );
    pair.connect();

    let server = pair.server;
    assert!(pair.run_until(500, |p| p.failed(server).is_some()));
    assert_eq!(pair.failed(server), Some(Some(AlertDescription::InternalError)));
}

fn corrupt_last_byte_of(sender: tlsengine::ConnectionId, msg_type: u8) -> Filter {
    Box::new(move |from, data| {
        // Plaintext stream handshake record: the message type follows the header.
        if from == sender && data[0] == HANDSHAKE && data.len() > 5 && data[5] == msg_type {
            let last = data.len() - 1;
            data[last] ^= 0x01;
        }
        1
    })
}

#[test]
fn forged_server_key_exchange_signature() {
    let mut pair = ecdhe_pair(
        TransportKind::Stream,
        CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        false,
        None,
        SoftwareCryptoService::new(),
    );
    pair.filter = Some(corrupt_last_byte_of(pair.server, SERVER_KEY_EXCHANGE));
    pair.connect();

    let (client, server) = (pair.client, pair.server);
    assert!(pair.run_until(500, |p| p.failed(client).is_some() && p.failed(server).is_some()));
    assert_eq!(pair.failed(client), Some(Some(AlertDescription::DecryptError)));
    assert_eq!(pair.failed(server), Some(Some(AlertDescription::DecryptError)));
    assert!(!pair.seen.contains(&Seen::Connected(client)));
}

#[test]
fn forged_certificate_verify_signature() {
    let mut pair = ecdhe_pair(
        TransportKind::Stream,
        CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        true,
        None,
        SoftwareCryptoService::new(),
    );
    pair.filter = Some(corrupt_last_byte_of(pair.client, CERTIFICATE_VERIFY));
    pair.connect();

    let server = pair.server;
    assert!(pair.run_until(500, |p| p.failed(server).is_some()));
    assert_eq!(pair.failed(server), Some(Some(AlertDescription::DecryptError)));
    assert!(!pair.seen.contains(&Seen::Connected(server)));
}
