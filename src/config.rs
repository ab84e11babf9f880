use std::fmt;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::crypto::KeyRef;
use crate::types::{CipherSuite, Role, TransportKind};
use crate::Error;

/// Hook that remaps a configured key reference once per connection.
pub type KeyResolver = Arc<dyn Fn(KeyRef) -> KeyRef + Send + Sync>;

/// Connection configuration.
///
/// Static input shared between connections through an `Arc`. Build it with
/// [`Config::builder`].
#[derive(Clone)]
pub struct Config {
    role: Role,
    transport: TransportKind,
    cipher_suite: CipherSuite,
    max_record_size: usize,
    record_size_limit: bool,
    psk_identity: Vec<u8>,
    psk: Zeroizing<Vec<u8>>,
    psk_hint: Option<Vec<u8>>,
    certificate_chain: Vec<Vec<u8>>,
    signing_key: Option<KeyRef>,
    trust_anchor: Option<Vec<u8>>,
    ca_name: Option<Vec<u8>>,
    rx_buffer_size: usize,
    tx_buffer_size: usize,
    app_rx_buffer_size: usize,
    fragment_buffer_size: usize,
    transcript_size: usize,
    retransmit_buffer_size: usize,
    retransmit_initial_ticks: u32,
    retransmit_limit: u32,
    tx_confirmation_depth: usize,
    key_resolver: Option<KeyResolver>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder(role: Role, transport: TransportKind, cipher_suite: CipherSuite) -> ConfigBuilder {
        ConfigBuilder {
            role,
            transport,
            cipher_suite,
            max_record_size: 16384,
            record_size_limit: false,
            psk_identity: Vec::new(),
            psk: Zeroizing::new(Vec::new()),
            psk_hint: None,
            certificate_chain: Vec::new(),
            signing_key: None,
            trust_anchor: None,
            ca_name: None,
            rx_buffer_size: None,
            tx_buffer_size: None,
            app_rx_buffer_size: None,
            fragment_buffer_size: 2048,
            transcript_size: 4096,
            retransmit_buffer_size: 4096,
            retransmit_initial_ticks: 100,
            retransmit_limit: 6,
            tx_confirmation_depth: 10,
            key_resolver: None,
        }
    }

    /// Client or server.
    #[inline(always)]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Stream (TLS) or datagram (DTLS).
    #[inline(always)]
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// The single cipher suite offered or accepted.
    #[inline(always)]
    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    /// Largest record, header included, we accept and send.
    ///
    /// Larger inbound records fail with `record_overflow`.
    #[inline(always)]
    pub fn max_record_size(&self) -> usize {
        self.max_record_size
    }

    /// Whether the record_size_limit extension (RFC 8449) is negotiated.
    #[inline(always)]
    pub fn record_size_limit(&self) -> bool {
        self.record_size_limit
    }

    /// PSK identity sent in ClientKeyExchange.
    #[inline(always)]
    pub fn psk_identity(&self) -> &[u8] {
        &self.psk_identity
    }

    /// Pre-shared key.
    #[inline(always)]
    pub fn psk(&self) -> &[u8] {
        &self.psk
    }

    /// Identity hint a PSK server sends in ServerKeyExchange.
    #[inline(always)]
    pub fn psk_hint(&self) -> Option<&[u8]> {
        self.psk_hint.as_deref()
    }

    /// DER certificates we send, leaf first.
    #[inline(always)]
    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.certificate_chain
    }

    /// Crypto service key used to sign with our certificate.
    #[inline(always)]
    pub fn signing_key(&self) -> Option<KeyRef> {
        self.signing_key
    }

    /// DER certificate the peer's chain must lead to.
    ///
    /// For a server this also enables client authentication.
    #[inline(always)]
    pub fn trust_anchor(&self) -> Option<&[u8]> {
        self.trust_anchor.as_deref()
    }

    /// DER distinguished name listed in CertificateRequest.
    #[inline(always)]
    pub fn ca_name(&self) -> Option<&[u8]> {
        self.ca_name.as_deref()
    }

    /// Capacity of the raw receive buffer.
    #[inline(always)]
    pub fn rx_buffer_size(&self) -> usize {
        self.rx_buffer_size
    }

    /// Capacity of the plaintext transmit queue.
    #[inline(always)]
    pub fn tx_buffer_size(&self) -> usize {
        self.tx_buffer_size
    }

    /// Capacity of received application data awaiting pickup.
    #[inline(always)]
    pub fn app_rx_buffer_size(&self) -> usize {
        self.app_rx_buffer_size
    }

    /// Largest handshake message, header included, that can be reassembled.
    #[inline(always)]
    pub fn fragment_buffer_size(&self) -> usize {
        self.fragment_buffer_size
    }

    /// Capacity of the handshake transcript.
    #[inline(always)]
    pub fn transcript_size(&self) -> usize {
        self.transcript_size
    }

    /// Capacity of the datagram flight buffer.
    #[inline(always)]
    pub fn retransmit_buffer_size(&self) -> usize {
        self.retransmit_buffer_size
    }

    /// Ticks before the first retransmission of a flight.
    ///
    /// Doubled for every retransmission.
    #[inline(always)]
    pub fn retransmit_initial_ticks(&self) -> u32 {
        self.retransmit_initial_ticks
    }

    /// Retransmissions of one flight before the handshake fails.
    #[inline(always)]
    pub fn retransmit_limit(&self) -> u32 {
        self.retransmit_limit
    }

    /// Depth of the transmit confirmation queue.
    #[inline(always)]
    pub fn tx_confirmation_depth(&self) -> usize {
        self.tx_confirmation_depth
    }

    /// Apply the key resolver hook, if any.
    pub fn resolve_key(&self, key: KeyRef) -> KeyRef {
        match &self.key_resolver {
            Some(f) => f(key),
            None => key,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("role", &self.role)
            .field("transport", &self.transport)
            .field("cipher_suite", &self.cipher_suite)
            .field("max_record_size", &self.max_record_size)
            .field("record_size_limit", &self.record_size_limit)
            .field("certificates", &self.certificate_chain.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    role: Role,
    transport: TransportKind,
    cipher_suite: CipherSuite,
    max_record_size: usize,
    record_size_limit: bool,
    psk_identity: Vec<u8>,
    psk: Zeroizing<Vec<u8>>,
    psk_hint: Option<Vec<u8>>,
    certificate_chain: Vec<Vec<u8>>,
    signing_key: Option<KeyRef>,
    trust_anchor: Option<Vec<u8>>,
    ca_name: Option<Vec<u8>>,
    rx_buffer_size: Option<usize>,
    tx_buffer_size: Option<usize>,
    app_rx_buffer_size: Option<usize>,
    fragment_buffer_size: usize,
    transcript_size: usize,
    retransmit_buffer_size: usize,
    retransmit_initial_ticks: u32,
    retransmit_limit: u32,
    tx_confirmation_depth: usize,
    key_resolver: Option<KeyResolver>,
}

impl ConfigBuilder {
    /// Set the largest record size, header included.
    ///
    /// Defaults to 16384.
    pub fn max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    /// Negotiate the record_size_limit extension.
    ///
    /// Defaults to false.
    pub fn record_size_limit(mut self, enabled: bool) -> Self {
        self.record_size_limit = enabled;
        self
    }

    /// Set the PSK and the identity a client presents.
    pub fn psk(mut self, identity: &[u8], key: &[u8]) -> Self {
        self.psk_identity = identity.to_vec();
        self.psk = Zeroizing::new(key.to_vec());
        self
    }

    /// Identity hint sent by a PSK server.
    ///
    /// Defaults to none, in which case ServerKeyExchange is omitted.
    pub fn psk_hint(mut self, hint: &[u8]) -> Self {
        self.psk_hint = Some(hint.to_vec());
        self
    }

    /// Our certificate chain (leaf first, root omitted) and its signing key.
    pub fn certificate(mut self, chain: Vec<Vec<u8>>, signing_key: KeyRef) -> Self {
        self.certificate_chain = chain;
        self.signing_key = Some(signing_key);
        self
    }

    /// Trust anchor for the peer's chain.
    ///
    /// On a server this requests a client certificate.
    pub fn trust_anchor(mut self, der: &[u8]) -> Self {
        self.trust_anchor = Some(der.to_vec());
        self
    }

    /// DER distinguished name advertised in CertificateRequest.
    ///
    /// Defaults to an empty list.
    pub fn ca_name(mut self, der: &[u8]) -> Self {
        self.ca_name = Some(der.to_vec());
        self
    }

    /// Raw receive buffer capacity.
    ///
    /// Defaults to two max size records.
    pub fn rx_buffer_size(mut self, size: usize) -> Self {
        self.rx_buffer_size = Some(size);
        self
    }

    /// Plaintext transmit queue capacity.
    ///
    /// Defaults to two max size records.
    pub fn tx_buffer_size(mut self, size: usize) -> Self {
        self.tx_buffer_size = Some(size);
        self
    }

    /// Received application data capacity.
    ///
    /// Defaults to two max size records.
    pub fn app_rx_buffer_size(mut self, size: usize) -> Self {
        self.app_rx_buffer_size = Some(size);
        self
    }

    /// Handshake reassembly capacity.
    ///
    /// Defaults to 2048.
    pub fn fragment_buffer_size(mut self, size: usize) -> Self {
        self.fragment_buffer_size = size;
        self
    }

    /// Handshake transcript capacity. Overflow fails the handshake.
    ///
    /// Defaults to 4096.
    pub fn transcript_size(mut self, size: usize) -> Self {
        self.transcript_size = size;
        self
    }

    /// Datagram flight buffer capacity. Overflow fails the handshake.
    ///
    /// Defaults to 4096.
    pub fn retransmit_buffer_size(mut self, size: usize) -> Self {
        self.retransmit_buffer_size = size;
        self
    }

    /// Ticks before the first retransmission.
    ///
    /// Defaults to 100.
    pub fn retransmit_initial_ticks(mut self, ticks: u32) -> Self {
        self.retransmit_initial_ticks = ticks;
        self
    }

    /// Retransmissions before giving up.
    ///
    /// Defaults to 6.
    pub fn retransmit_limit(mut self, limit: u32) -> Self {
        self.retransmit_limit = limit;
        self
    }

    /// Transmit confirmation queue depth.
    ///
    /// Defaults to 10.
    pub fn tx_confirmation_depth(mut self, depth: usize) -> Self {
        self.tx_confirmation_depth = depth;
        self
    }

    /// Hook applied to the signing key reference when a connection opens.
    pub fn key_resolver(mut self, resolver: KeyResolver) -> Self {
        self.key_resolver = Some(resolver);
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<Config, Error> {
        let params = self
            .cipher_suite
            .params()
            .ok_or(Error::UnsupportedCipherSuite(self.cipher_suite))?;

        let header = self.transport.record_header_len();
        if self.max_record_size < 64 + header || self.max_record_size > 16384 + 2048 {
            return Err(Error::ConfigError(format!(
                "max_record_size {} out of range",
                self.max_record_size
            )));
        }
        if self.record_size_limit && self.max_record_size > 16384 {
            return Err(Error::ConfigError(
                "record_size_limit requires max_record_size <= 16384".into(),
            ));
        }

        if params.certificates {
            match self.role {
                Role::Server => {
                    if self.certificate_chain.is_empty() || self.signing_key.is_none() {
                        return Err(Error::ConfigError(
                            "certificate suite needs a server certificate and signing key".into(),
                        ));
                    }
                }
                Role::Client => {
                    if self.trust_anchor.is_none() {
                        return Err(Error::ConfigError(
                            "certificate suite needs a trust anchor".into(),
                        ));
                    }
                }
            }
        } else {
            if self.psk.is_empty() {
                return Err(Error::ConfigError("PSK suite needs a key".into()));
            }
            if self.role == Role::Client && self.psk_identity.is_empty() {
                return Err(Error::ConfigError("PSK suite needs an identity".into()));
            }
            if self.psk.len() > u16::MAX as usize {
                return Err(Error::ConfigError("PSK too long".into()));
            }
        }

        if self.retransmit_initial_ticks == 0 {
            return Err(Error::ConfigError("retransmit_initial_ticks must be > 0".into()));
        }
        if self.retransmit_limit > 16 {
            return Err(Error::ConfigError("retransmit_limit must be <= 16".into()));
        }
        if self.tx_confirmation_depth == 0 {
            return Err(Error::ConfigError("tx_confirmation_depth must be > 0".into()));
        }

        let two_records = 2 * self.max_record_size;
        let rx_buffer_size = self.rx_buffer_size.unwrap_or(two_records);
        let app_rx_buffer_size = self.app_rx_buffer_size.unwrap_or(two_records);
        if rx_buffer_size < self.max_record_size || app_rx_buffer_size < self.max_record_size {
            return Err(Error::ConfigError(
                "receive buffers must hold at least one record".into(),
            ));
        }
        let tx_buffer_size = self.tx_buffer_size.unwrap_or(two_records);
        if tx_buffer_size < self.max_record_size {
            return Err(Error::ConfigError(
                "tx_buffer_size must hold at least one record".into(),
            ));
        }

        Ok(Config {
            role: self.role,
            transport: self.transport,
            cipher_suite: self.cipher_suite,
            max_record_size: self.max_record_size,
            record_size_limit: self.record_size_limit,
            psk_identity: self.psk_identity,
            psk: self.psk,
            psk_hint: self.psk_hint,
            certificate_chain: self.certificate_chain,
            signing_key: self.signing_key,
            trust_anchor: self.trust_anchor,
            ca_name: self.ca_name,
            rx_buffer_size,
            tx_buffer_size,
            app_rx_buffer_size,
            fragment_buffer_size: self.fragment_buffer_size,
            transcript_size: self.transcript_size,
            retransmit_buffer_size: self.retransmit_buffer_size,
            retransmit_initial_ticks: self.retransmit_initial_ticks,
            retransmit_limit: self.retransmit_limit,
            tx_confirmation_depth: self.tx_confirmation_depth,
            key_resolver: self.key_resolver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psk_defaults() {
        let config = Config::builder(
            Role::Client,
            TransportKind::Stream,
            CipherSuite::PSK_AES_128_GCM_SHA256,
        )
        .psk(b"client", b"secret")
        .build()
        .unwrap();

        assert_eq!(config.max_record_size(), 16384);
        assert_eq!(config.rx_buffer_size(), 2 * 16384);
        assert_eq!(config.retransmit_limit(), 6);
        assert_eq!(config.tx_confirmation_depth(), 10);
        assert_eq!(config.resolve_key(KeyRef(3)), KeyRef(3));
    }

    #[test]
    fn rejects_suite_without_params() {
        let res = Config::builder(Role::Client, TransportKind::Stream, CipherSuite::PSK_AES_128_CCM)
            .psk(b"client", b"secret")
            .build();
        assert!(matches!(res, Err(Error::UnsupportedCipherSuite(_))));
    }

    #[test]
    fn certificate_server_needs_key() {
        let res = Config::builder(
            Role::Server,
            TransportKind::Datagram,
            CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        )
        .build();
        assert!(matches!(res, Err(Error::ConfigError(_))));
    }

    #[test]
    fn buffers_must_hold_a_record() {
        let builder = || {
            Config::builder(Role::Client, TransportKind::Datagram, CipherSuite::PSK_NULL_SHA256)
                .psk(b"client", b"secret")
                .max_record_size(1024)
        };
        assert!(matches!(
            builder().tx_buffer_size(1023).build(),
            Err(Error::ConfigError(_))
        ));
        assert!(matches!(
            builder().rx_buffer_size(512).build(),
            Err(Error::ConfigError(_))
        ));
        let config = builder().tx_buffer_size(1024).rx_buffer_size(1024).build().unwrap();
        assert_eq!(config.tx_buffer_size(), 1024);
    }

    #[test]
    fn key_resolver_applied() {
        let config = Config::builder(
            Role::Server,
            TransportKind::Stream,
            CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        )
        .certificate(vec![vec![0x30]], KeyRef(1))
        .key_resolver(Arc::new(|k: KeyRef| KeyRef(k.0 + 10)))
        .build()
        .unwrap();
        assert_eq!(config.resolve_key(KeyRef(1)), KeyRef(11));
    }
}
