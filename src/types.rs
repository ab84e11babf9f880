//! Wire level enums and the cipher suite parameter table.

use std::fmt;

/// TLS 1.2 record version.
pub(crate) const TLS1_2: u16 = 0x0303;

/// DTLS 1.2 record version.
pub(crate) const DTLS1_2: u16 = 0xFEFD;

/// Record content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    ChangeCipherSpec,
    Alert,
    Handshake,
    ApplicationData,
}

impl From<ContentType> for u8 {
    fn from(value: ContentType) -> Self {
        use ContentType::*;
        match value {
            ChangeCipherSpec => 20,
            Alert => 21,
            Handshake => 22,
            ApplicationData => 23,
        }
    }
}

impl TryFrom<u8> for ContentType {
    type Error = AlertDescription;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ContentType::*;
        let t = match value {
            20 => ChangeCipherSpec,
            21 => Alert,
            22 => Handshake,
            23 => ApplicationData,
            _ => return Err(AlertDescription::DecodeError),
        };
        Ok(t)
    }
}

/// Handshake message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeType {
    HelloRequest,
    ClientHello,
    ServerHello,
    HelloVerifyRequest,
    Certificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    CertificateVerify,
    ClientKeyExchange,
    Finished,
    Unknown(u8),
}

impl HandshakeType {
    pub fn as_u8(&self) -> u8 {
        use HandshakeType::*;
        match self {
            HelloRequest => 0,
            ClientHello => 1,
            ServerHello => 2,
            HelloVerifyRequest => 3,
            Certificate => 11,
            ServerKeyExchange => 12,
            CertificateRequest => 13,
            ServerHelloDone => 14,
            CertificateVerify => 15,
            ClientKeyExchange => 16,
            Finished => 20,
            Unknown(v) => *v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        use HandshakeType::*;
        match value {
            0 => HelloRequest,
            1 => ClientHello,
            2 => ServerHello,
            3 => HelloVerifyRequest,
            11 => Certificate,
            12 => ServerKeyExchange,
            13 => CertificateRequest,
            14 => ServerHelloDone,
            15 => CertificateVerify,
            16 => ClientKeyExchange,
            20 => Finished,
            _ => Unknown(value),
        }
    }
}

/// Alert level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Warning,
    Fatal,
}

impl AlertLevel {
    pub fn as_u8(&self) -> u8 {
        match self {
            AlertLevel::Warning => 1,
            AlertLevel::Fatal => 2,
        }
    }
}

/// Alert description (RFC 5246 section 7.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify,
    UnexpectedMessage,
    BadRecordMac,
    DecryptionFailed,
    RecordOverflow,
    HandshakeFailure,
    BadCertificate,
    UnsupportedCertificate,
    CertificateRevoked,
    CertificateExpired,
    CertificateUnknown,
    IllegalParameter,
    UnknownCa,
    AccessDenied,
    DecodeError,
    DecryptError,
    ProtocolVersion,
    InsufficientSecurity,
    InternalError,
    UserCanceled,
    NoRenegotiation,
    UnsupportedExtension,
    Unknown(u8),
}

impl AlertDescription {
    pub fn as_u8(&self) -> u8 {
        use AlertDescription::*;
        match self {
            CloseNotify => 0,
            UnexpectedMessage => 10,
            BadRecordMac => 20,
            DecryptionFailed => 21,
            RecordOverflow => 22,
            HandshakeFailure => 40,
            BadCertificate => 42,
            UnsupportedCertificate => 43,
            CertificateRevoked => 44,
            CertificateExpired => 45,
            CertificateUnknown => 46,
            IllegalParameter => 47,
            UnknownCa => 48,
            AccessDenied => 49,
            DecodeError => 50,
            DecryptError => 51,
            ProtocolVersion => 70,
            InsufficientSecurity => 71,
            InternalError => 80,
            UserCanceled => 90,
            NoRenegotiation => 100,
            UnsupportedExtension => 110,
            Unknown(v) => *v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        use AlertDescription::*;
        match value {
            0 => CloseNotify,
            10 => UnexpectedMessage,
            20 => BadRecordMac,
            21 => DecryptionFailed,
            22 => RecordOverflow,
            40 => HandshakeFailure,
            42 => BadCertificate,
            43 => UnsupportedCertificate,
            44 => CertificateRevoked,
            45 => CertificateExpired,
            46 => CertificateUnknown,
            47 => IllegalParameter,
            48 => UnknownCa,
            49 => AccessDenied,
            50 => DecodeError,
            51 => DecryptError,
            70 => ProtocolVersion,
            71 => InsufficientSecurity,
            80 => InternalError,
            90 => UserCanceled,
            100 => NoRenegotiation,
            110 => UnsupportedExtension,
            _ => Unknown(value),
        }
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Stream (TLS) or datagram (DTLS) transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stream,
    Datagram,
}

impl TransportKind {
    /// Record header size: 5 bytes for stream, 13 for datagram.
    #[inline]
    pub(crate) fn record_header_len(&self) -> usize {
        match self {
            TransportKind::Stream => 5,
            TransportKind::Datagram => 13,
        }
    }

    /// Handshake message header size: 4 bytes for stream, 12 for datagram.
    #[inline]
    pub(crate) fn handshake_header_len(&self) -> usize {
        match self {
            TransportKind::Stream => 4,
            TransportKind::Datagram => 12,
        }
    }

    #[inline]
    pub(crate) fn version(&self) -> u16 {
        match self {
            TransportKind::Stream => TLS1_2,
            TransportKind::Datagram => DTLS1_2,
        }
    }
}

/// Connection state.
///
/// Client and server share the enum and walk the role appropriate subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Default,
    Start,
    ClientHelloDone,
    ServerHelloDone,
    ServerCertificateDone,
    ServerKeyExchangeDone,
    CertificateRequestDone,
    ServerHelloDoneDone,
    ClientCertificateDone,
    ClientKeyExchangeDone,
    CertificateVerifyDone,
    ChangeCipherSpecSent,
    FinishedSent,
    ChangeCipherSpecReceived,
    FinishedReceived,
    Ok,
    Closing,
    Closed,
    Error,
}

impl State {
    /// Closing, Closed or Error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Closing | State::Closed | State::Error)
    }
}

/// Coarse view of a connection for the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    NotConnected,
}

/// Record integrity algorithm of a NULL cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    HmacSha1,
    HmacSha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CipherType {
    Null,
    Aead,
}

/// Cipher suites recognised on the wire.
///
/// Only the suites with a parameter entry can be used to open a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum CipherSuite {
    PSK_AES_128_CCM,
    PSK_AES_256_CCM,
    PSK_AES_128_GCM_SHA256,
    PSK_AES_256_GCM_SHA384,
    PSK_NULL_SHA256,
    ECDHE_RSA_NULL_SHA,
    ECDHE_RSA_AES_128_CBC_SHA,
    ECDHE_RSA_AES_256_CBC_SHA,
    ECDHE_RSA_AES_128_CBC_SHA256,
    ECDHE_RSA_AES_256_CBC_SHA384,
    ECDHE_ECDSA_NULL_SHA,
    ECDHE_ECDSA_AES_128_GCM_SHA256,
    Unknown(u16),
}

impl CipherSuite {
    pub fn as_u16(&self) -> u16 {
        use CipherSuite::*;
        match self {
            PSK_AES_128_CCM => 0xC0A4,
            PSK_AES_256_CCM => 0xC0A5,
            PSK_AES_128_GCM_SHA256 => 0x00A8,
            PSK_AES_256_GCM_SHA384 => 0x00A9,
            PSK_NULL_SHA256 => 0x00B0,
            ECDHE_RSA_NULL_SHA => 0xC010,
            ECDHE_RSA_AES_128_CBC_SHA => 0xC013,
            ECDHE_RSA_AES_256_CBC_SHA => 0xC014,
            ECDHE_RSA_AES_128_CBC_SHA256 => 0xC027,
            ECDHE_RSA_AES_256_CBC_SHA384 => 0xC028,
            ECDHE_ECDSA_NULL_SHA => 0xC006,
            ECDHE_ECDSA_AES_128_GCM_SHA256 => 0xC02B,
            Unknown(v) => *v,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        use CipherSuite::*;
        match value {
            0xC0A4 => PSK_AES_128_CCM,
            0xC0A5 => PSK_AES_256_CCM,
            0x00A8 => PSK_AES_128_GCM_SHA256,
            0x00A9 => PSK_AES_256_GCM_SHA384,
            0x00B0 => PSK_NULL_SHA256,
            0xC010 => ECDHE_RSA_NULL_SHA,
            0xC013 => ECDHE_RSA_AES_128_CBC_SHA,
            0xC014 => ECDHE_RSA_AES_256_CBC_SHA,
            0xC027 => ECDHE_RSA_AES_128_CBC_SHA256,
            0xC028 => ECDHE_RSA_AES_256_CBC_SHA384,
            0xC006 => ECDHE_ECDSA_NULL_SHA,
            0xC02B => ECDHE_ECDSA_AES_128_GCM_SHA256,
            _ => Unknown(value),
        }
    }

    /// Parameters of the suite, if it can be used.
    pub(crate) fn params(&self) -> Option<&'static CipherSuiteParams> {
        PARAMS.iter().find(|p| p.suite == *self)
    }

    /// Whether the suite authenticates with certificates rather than a PSK.
    pub fn uses_certificates(&self) -> bool {
        self.params().map(|p| p.certificates).unwrap_or(false)
    }
}

/// Immutable per-suite parameters.
#[derive(Debug)]
pub(crate) struct CipherSuiteParams {
    pub suite: CipherSuite,
    pub cipher: CipherType,
    pub mac: Option<MacAlgorithm>,
    pub mac_key_len: usize,
    /// MAC length, or tag length for AEAD.
    pub mac_len: usize,
    pub iv_len: usize,
    pub key_len: usize,
    pub certificates: bool,
}

impl CipherSuiteParams {
    /// Bytes of key block: two MAC keys, two bulk keys, two fixed IVs.
    pub fn key_block_len(&self) -> usize {
        2 * (self.mac_key_len + self.key_len + self.iv_len)
    }

    pub fn is_aead(&self) -> bool {
        self.cipher == CipherType::Aead
    }
}

static PARAMS: [CipherSuiteParams; 4] = [
    CipherSuiteParams {
        suite: CipherSuite::PSK_NULL_SHA256,
        cipher: CipherType::Null,
        mac: Some(MacAlgorithm::HmacSha256),
        mac_key_len: 32,
        mac_len: 32,
        iv_len: 0,
        key_len: 0,
        certificates: false,
    },
    CipherSuiteParams {
        suite: CipherSuite::PSK_AES_128_GCM_SHA256,
        cipher: CipherType::Aead,
        mac: None,
        mac_key_len: 0,
        mac_len: 16,
        iv_len: 4,
        key_len: 16,
        certificates: false,
    },
    CipherSuiteParams {
        suite: CipherSuite::ECDHE_ECDSA_NULL_SHA,
        cipher: CipherType::Null,
        mac: Some(MacAlgorithm::HmacSha1),
        mac_key_len: 20,
        mac_len: 20,
        iv_len: 0,
        key_len: 0,
        certificates: true,
    },
    CipherSuiteParams {
        suite: CipherSuite::ECDHE_ECDSA_AES_128_GCM_SHA256,
        cipher: CipherType::Aead,
        mac: None,
        mac_key_len: 0,
        mac_len: 16,
        iv_len: 4,
        key_len: 16,
        certificates: true,
    },
];
