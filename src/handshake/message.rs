//! Handshake message bodies.
//!
//! Parsers are nom complete parsers over a reassembled message body. Each
//! message type also has a `decode` that requires the whole body to be
//! consumed and maps parse failures to `decode_error`.

use nom::bytes::complete::take;
use nom::combinator::all_consuming;
use nom::multi::{length_data, many0};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::IResult;

use super::extension::{parse_extensions, serialize_extensions, Extension, RECORD_SIZE_LIMIT};
use crate::types::{AlertDescription, CipherSuite, HandshakeType, TransportKind};

pub(crate) const RANDOM_LEN: usize = 32;
pub(crate) const VERIFY_DATA_LEN: usize = 12;
pub(crate) const COOKIE_LEN: usize = 32;
pub(crate) const MAX_SESSION_ID_LEN: usize = 32;

pub(crate) const CURVE_TYPE_NAMED: u8 = 3;
pub(crate) const X25519: u16 = 29;
pub(crate) const X25519_POINT_LEN: usize = 32;
pub(crate) const ECDSA_SECP256R1_SHA256: u16 = 0x0403;
pub(crate) const ECDSA_SIGN: u8 = 64;

const MIN_CLIENT_HELLO_STREAM: usize = 38;
const MIN_CLIENT_HELLO_DATAGRAM: usize = 39;
const MIN_SERVER_HELLO: usize = 38;

/// Run `parser` over `input`, requiring it to consume everything.
fn decode<'a, O>(
    input: &'a [u8],
    parser: impl FnMut(&'a [u8]) -> IResult<&'a [u8], O>,
) -> Result<O, AlertDescription> {
    all_consuming(parser)(input)
        .map(|(_, out)| out)
        .map_err(|_| AlertDescription::DecodeError)
}

fn write_u24(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&(v as u32).to_be_bytes()[1..]);
}

/// Handshake message header. Fragment fields are datagram only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandshakeHeader {
    pub msg_type: HandshakeType,
    pub length: usize,
    pub message_seq: u16,
    pub fragment_offset: usize,
    pub fragment_length: usize,
}

impl HandshakeHeader {
    /// Header of an unfragmented message.
    pub fn whole(msg_type: HandshakeType, length: usize, message_seq: u16) -> Self {
        HandshakeHeader {
            msg_type,
            length,
            message_seq,
            fragment_offset: 0,
            fragment_length: length,
        }
    }

    pub fn parse(input: &[u8], kind: TransportKind) -> IResult<&[u8], HandshakeHeader> {
        let (input, msg_type) = be_u8(input)?;
        let (input, length) = be_u24(input)?;
        let msg_type = HandshakeType::from_u8(msg_type);
        let length = length as usize;

        match kind {
            TransportKind::Stream => Ok((input, HandshakeHeader::whole(msg_type, length, 0))),
            TransportKind::Datagram => {
                let (input, message_seq) = be_u16(input)?;
                let (input, fragment_offset) = be_u24(input)?;
                let (input, fragment_length) = be_u24(input)?;
                Ok((
                    input,
                    HandshakeHeader {
                        msg_type,
                        length,
                        message_seq,
                        fragment_offset: fragment_offset as usize,
                        fragment_length: fragment_length as usize,
                    },
                ))
            }
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>, kind: TransportKind) {
        out.push(self.msg_type.as_u8());
        write_u24(out, self.length);
        if kind == TransportKind::Datagram {
            out.extend_from_slice(&self.message_seq.to_be_bytes());
            write_u24(out, self.fragment_offset);
            write_u24(out, self.fragment_length);
        }
    }
}

/// Whether a peer's hello version is acceptable. Datagram versions count down.
fn version_supported(kind: TransportKind, version: u16) -> bool {
    match kind {
        TransportKind::Stream => version >= kind.version(),
        TransportKind::Datagram => version <= kind.version(),
    }
}

fn parse_session_id(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, id) = length_data(be_u8)(input)?;
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::LengthValue,
        )));
    }
    Ok((rest, id))
}

/// Optional trailing extensions block.
fn parse_extension_block(input: &[u8]) -> Result<Option<&[u8]>, AlertDescription> {
    if input.is_empty() {
        return Ok(None);
    }
    decode(input, length_data(be_u16)).map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ClientHello<'a> {
    pub client_version: u16,
    pub random: &'a [u8],
    pub cookie: &'a [u8],
    pub cipher_suites: &'a [u8],
    pub compression_methods: &'a [u8],
    pub extensions: Option<&'a [u8]>,
}

impl<'a> ClientHello<'a> {
    pub fn decode(body: &'a [u8], kind: TransportKind) -> Result<ClientHello<'a>, AlertDescription> {
        let min = match kind {
            TransportKind::Stream => MIN_CLIENT_HELLO_STREAM,
            TransportKind::Datagram => MIN_CLIENT_HELLO_DATAGRAM,
        };
        if body.len() < min {
            return Err(AlertDescription::DecodeError);
        }

        let (rest, hello) =
            Self::parse(body, kind).map_err(|_| AlertDescription::DecodeError)?;

        if !version_supported(kind, hello.client_version) {
            return Err(AlertDescription::ProtocolVersion);
        }
        if hello.cipher_suites.is_empty() || hello.cipher_suites.len() % 2 != 0 {
            return Err(AlertDescription::DecodeError);
        }
        match hello.compression_methods.first() {
            None => return Err(AlertDescription::DecodeError),
            Some(0) => {}
            Some(_) => return Err(AlertDescription::IllegalParameter),
        }

        Ok(ClientHello {
            extensions: parse_extension_block(rest)?,
            ..hello
        })
    }

    fn parse(input: &'a [u8], kind: TransportKind) -> IResult<&'a [u8], ClientHello<'a>> {
        let (input, client_version) = be_u16(input)?;
        let (input, random) = take(RANDOM_LEN)(input)?;
        let (input, _session_id) = parse_session_id(input)?;
        let (input, cookie) = match kind {
            TransportKind::Stream => (input, &input[..0]),
            TransportKind::Datagram => length_data(be_u8)(input)?,
        };
        let (input, cipher_suites) = length_data(be_u16)(input)?;
        let (input, compression_methods) = length_data(be_u8)(input)?;

        Ok((
            input,
            ClientHello {
                client_version,
                random,
                cookie,
                cipher_suites,
                compression_methods,
                extensions: None,
            },
        ))
    }

    pub fn offers(&self, suite: CipherSuite) -> bool {
        self.cipher_suites
            .chunks_exact(2)
            .any(|c| u16::from_be_bytes([c[0], c[1]]) == suite.as_u16())
    }

    pub fn extensions(&self) -> Result<Vec<Extension<'a>>, AlertDescription> {
        match self.extensions {
            Some(block) => parse_extensions(block),
            None => Ok(Vec::new()),
        }
    }

    /// Write a ClientHello offering a single suite.
    pub fn serialize(
        out: &mut Vec<u8>,
        kind: TransportKind,
        random: &[u8; RANDOM_LEN],
        cookie: &[u8],
        suite: CipherSuite,
        record_size_limit: Option<u16>,
    ) {
        out.extend_from_slice(&kind.version().to_be_bytes());
        out.extend_from_slice(random);
        out.push(0); // session id
        if kind == TransportKind::Datagram {
            out.push(cookie.len() as u8);
            out.extend_from_slice(cookie);
        }
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(&suite.as_u16().to_be_bytes());
        out.extend_from_slice(&[1, 0]); // null compression
        if let Some(limit) = record_size_limit {
            let value = limit.to_be_bytes();
            serialize_extensions(
                out,
                &[Extension {
                    extension_type: RECORD_SIZE_LIMIT,
                    data: &value,
                }],
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ServerHello<'a> {
    pub server_version: u16,
    pub random: &'a [u8],
    pub cipher_suite: CipherSuite,
    pub extensions: Option<&'a [u8]>,
}

impl<'a> ServerHello<'a> {
    pub fn decode(body: &'a [u8], kind: TransportKind) -> Result<ServerHello<'a>, AlertDescription> {
        if body.len() < MIN_SERVER_HELLO {
            return Err(AlertDescription::DecodeError);
        }

        let (rest, (hello, compression)) =
            Self::parse(body).map_err(|_| AlertDescription::DecodeError)?;

        if compression != 0 {
            return Err(AlertDescription::IllegalParameter);
        }
        if hello.server_version != kind.version() {
            return Err(AlertDescription::ProtocolVersion);
        }

        Ok(ServerHello {
            extensions: parse_extension_block(rest)?,
            ..hello
        })
    }

    fn parse(input: &'a [u8]) -> IResult<&'a [u8], (ServerHello<'a>, u8)> {
        let (input, server_version) = be_u16(input)?;
        let (input, random) = take(RANDOM_LEN)(input)?;
        let (input, _session_id) = parse_session_id(input)?;
        let (input, suite) = be_u16(input)?;
        let (input, compression) = be_u8(input)?;
        Ok((
            input,
            (
                ServerHello {
                    server_version,
                    random,
                    cipher_suite: CipherSuite::from_u16(suite),
                    extensions: None,
                },
                compression,
            ),
        ))
    }

    pub fn extensions(&self) -> Result<Vec<Extension<'a>>, AlertDescription> {
        match self.extensions {
            Some(block) => parse_extensions(block),
            None => Ok(Vec::new()),
        }
    }

    /// Write a ServerHello. The extensions length is always present.
    pub fn serialize(
        out: &mut Vec<u8>,
        kind: TransportKind,
        random: &[u8; RANDOM_LEN],
        suite: CipherSuite,
        record_size_limit: Option<u16>,
    ) {
        out.extend_from_slice(&kind.version().to_be_bytes());
        out.extend_from_slice(random);
        out.push(0); // session id
        out.extend_from_slice(&suite.as_u16().to_be_bytes());
        out.push(0); // null compression
        let value = record_size_limit.map(u16::to_be_bytes);
        let extensions: Vec<Extension<'_>> = value
            .as_ref()
            .map(|v| Extension {
                extension_type: RECORD_SIZE_LIMIT,
                data: v,
            })
            .into_iter()
            .collect();
        serialize_extensions(out, &extensions);
    }
}

pub(crate) struct HelloVerifyRequest;

impl HelloVerifyRequest {
    /// The cookie carried in a HelloVerifyRequest body.
    pub fn decode(body: &[u8]) -> Result<&[u8], AlertDescription> {
        let (_version, cookie) = decode(body, |i| {
            let (i, version) = be_u16(i)?;
            let (i, cookie) = length_data(be_u8)(i)?;
            Ok((i, (version, cookie)))
        })?;
        if cookie.len() > COOKIE_LEN {
            return Err(AlertDescription::DecodeError);
        }
        Ok(cookie)
    }

    pub fn serialize(out: &mut Vec<u8>, cookie: &[u8]) {
        out.extend_from_slice(&TransportKind::Datagram.version().to_be_bytes());
        out.push(cookie.len() as u8);
        out.extend_from_slice(cookie);
    }
}

pub(crate) struct CertificateMessage;

impl CertificateMessage {
    /// The certificate_list contents, validated to be a sequence of 24-bit
    /// length prefixed entries. May be empty.
    pub fn decode(body: &[u8]) -> Result<&[u8], AlertDescription> {
        let list = decode(body, length_data(be_u24))?;
        decode(list, many0(length_data(be_u24)))?;
        Ok(list)
    }

    pub fn serialize(out: &mut Vec<u8>, chain: &[Vec<u8>]) {
        let total: usize = chain.iter().map(|c| 3 + c.len()).sum();
        write_u24(out, total);
        for cert in chain {
            write_u24(out, cert.len());
            out.extend_from_slice(cert);
        }
    }
}

/// ECDHE server parameters with their signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EcdheServerKeyExchange<'a> {
    /// curve_type, named_curve and the point, as covered by the signature.
    pub params: &'a [u8],
    pub point: &'a [u8],
    pub signature: &'a [u8],
}

impl<'a> EcdheServerKeyExchange<'a> {
    pub fn decode(body: &'a [u8]) -> Result<EcdheServerKeyExchange<'a>, AlertDescription> {
        let (curve_type, curve, point, sig_alg, signature) = decode(body, |i| {
            let (i, curve_type) = be_u8(i)?;
            let (i, curve) = be_u16(i)?;
            let (i, point) = length_data(be_u8)(i)?;
            let (i, sig_alg) = be_u16(i)?;
            let (i, signature) = length_data(be_u16)(i)?;
            Ok((i, (curve_type, curve, point, sig_alg, signature)))
        })?;

        if curve_type != CURVE_TYPE_NAMED || curve != X25519 || point.len() != X25519_POINT_LEN {
            return Err(AlertDescription::IllegalParameter);
        }
        if sig_alg != ECDSA_SECP256R1_SHA256 {
            return Err(AlertDescription::IllegalParameter);
        }

        Ok(EcdheServerKeyExchange {
            params: &body[..4 + point.len()],
            point,
            signature,
        })
    }

    /// The signed part: curve_type, named_curve and the point.
    pub fn serialize_params(out: &mut Vec<u8>, point: &[u8]) {
        out.push(CURVE_TYPE_NAMED);
        out.extend_from_slice(&X25519.to_be_bytes());
        out.push(point.len() as u8);
        out.extend_from_slice(point);
    }
}

/// `algorithm(2) | length(2) | signature`, shared by ServerKeyExchange and
/// CertificateVerify.
pub(crate) fn serialize_signature(out: &mut Vec<u8>, signature: &[u8]) {
    out.extend_from_slice(&ECDSA_SECP256R1_SHA256.to_be_bytes());
    out.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    out.extend_from_slice(signature);
}

/// PSK identity or identity hint: a 16-bit length prefixed opaque.
pub(crate) struct PskIdentity;

impl PskIdentity {
    pub fn decode(body: &[u8]) -> Result<&[u8], AlertDescription> {
        decode(body, length_data(be_u16))
    }

    pub fn serialize(out: &mut Vec<u8>, identity: &[u8]) {
        out.extend_from_slice(&(identity.len() as u16).to_be_bytes());
        out.extend_from_slice(identity);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CertificateRequest {
    /// Both ecdsa_sign and ecdsa_secp256r1_sha256 were offered.
    pub ecdsa: bool,
}

impl CertificateRequest {
    pub fn decode(body: &[u8]) -> Result<CertificateRequest, AlertDescription> {
        let (types, sig_algs, _authorities) = decode(body, |i| {
            let (i, types) = length_data(be_u8)(i)?;
            let (i, sig_algs) = length_data(be_u16)(i)?;
            let (i, authorities) = length_data(be_u16)(i)?;
            Ok((i, (types, sig_algs, authorities)))
        })?;

        if types.is_empty() || sig_algs.len() % 2 != 0 {
            return Err(AlertDescription::DecodeError);
        }

        let ecdsa = types.contains(&ECDSA_SIGN)
            && sig_algs
                .chunks_exact(2)
                .any(|c| u16::from_be_bytes([c[0], c[1]]) == ECDSA_SECP256R1_SHA256);

        Ok(CertificateRequest { ecdsa })
    }

    pub fn serialize(out: &mut Vec<u8>, ca_name: Option<&[u8]>) {
        out.extend_from_slice(&[1, ECDSA_SIGN]);
        out.extend_from_slice(&2u16.to_be_bytes());
        out.extend_from_slice(&ECDSA_SECP256R1_SHA256.to_be_bytes());
        match ca_name {
            Some(name) => {
                out.extend_from_slice(&((2 + name.len()) as u16).to_be_bytes());
                out.extend_from_slice(&(name.len() as u16).to_be_bytes());
                out.extend_from_slice(name);
            }
            None => out.extend_from_slice(&[0, 0]),
        }
    }
}

/// ECDHE ClientKeyExchange: the client point.
pub(crate) struct EcdheClientKeyExchange;

impl EcdheClientKeyExchange {
    pub fn decode(body: &[u8]) -> Result<&[u8], AlertDescription> {
        let point = decode(body, length_data(be_u8))?;
        if point.len() != X25519_POINT_LEN {
            return Err(AlertDescription::IllegalParameter);
        }
        Ok(point)
    }

    pub fn serialize(out: &mut Vec<u8>, point: &[u8]) {
        out.push(point.len() as u8);
        out.extend_from_slice(point);
    }
}

pub(crate) struct CertificateVerify;

impl CertificateVerify {
    /// The DER signature.
    pub fn decode(body: &[u8]) -> Result<&[u8], AlertDescription> {
        let (alg, signature) = decode(body, |i| {
            let (i, alg) = be_u16(i)?;
            let (i, signature) = length_data(be_u16)(i)?;
            Ok((i, (alg, signature)))
        })?;
        if alg != ECDSA_SECP256R1_SHA256 {
            return Err(AlertDescription::IllegalParameter);
        }
        Ok(signature)
    }
}

pub(crate) struct Finished;

impl Finished {
    pub fn decode(body: &[u8]) -> Result<[u8; VERIFY_DATA_LEN], AlertDescription> {
        body.try_into().map_err(|_| AlertDescription::DecodeError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SUITE: CipherSuite = CipherSuite::PSK_AES_128_GCM_SHA256;

    fn client_hello_bytes(kind: TransportKind, cookie: &[u8], limit: Option<u16>) -> Vec<u8> {
        let mut out = Vec::new();
        ClientHello::serialize(&mut out, kind, &[7; 32], cookie, SUITE, limit);
        out
    }

    #[test]
    fn client_hello_datagram_with_cookie() {
        let body = client_hello_bytes(TransportKind::Datagram, &[9; 32], Some(512));
        let hello = ClientHello::decode(&body, TransportKind::Datagram).unwrap();
        assert_eq!(hello.client_version, 0xFEFD);
        assert_eq!(hello.random, &[7; 32]);
        assert_eq!(hello.cookie, &[9; 32]);
        assert!(hello.offers(SUITE));
        assert!(!hello.offers(CipherSuite::PSK_NULL_SHA256));
        let exts = hello.extensions().unwrap();
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0].data, &[0x02, 0x00]);
    }

    #[test]
    fn client_hello_checks() {
        let body = client_hello_bytes(TransportKind::Stream, &[], None);
        assert_eq!(body.len(), 38 + 2 + 1);
        assert!(ClientHello::decode(&body, TransportKind::Stream).unwrap().extensions.is_none());

        assert_eq!(
            ClientHello::decode(&body[..37], TransportKind::Stream),
            Err(AlertDescription::DecodeError)
        );

        let mut old = body.clone();
        old[1] = 0x01; // TLS 1.0
        assert_eq!(
            ClientHello::decode(&old, TransportKind::Stream),
            Err(AlertDescription::ProtocolVersion)
        );

        let mut deflate = body.clone();
        let last = deflate.len() - 1;
        deflate[last] = 1;
        assert_eq!(
            ClientHello::decode(&deflate, TransportKind::Stream),
            Err(AlertDescription::IllegalParameter)
        );

        let mut trailing = body;
        trailing.extend_from_slice(&[0, 5, 0]);
        assert_eq!(
            ClientHello::decode(&trailing, TransportKind::Stream),
            Err(AlertDescription::DecodeError)
        );
    }

    #[test]
    fn server_hello_decode() {
        let mut body = Vec::new();
        ServerHello::serialize(&mut body, TransportKind::Stream, &[3; 32], SUITE, None);
        let hello = ServerHello::decode(&body, TransportKind::Stream).unwrap();
        assert_eq!(hello.cipher_suite, SUITE);
        assert_eq!(hello.extensions, Some(&[][..]));

        assert_eq!(
            ServerHello::decode(&body, TransportKind::Datagram),
            Err(AlertDescription::ProtocolVersion)
        );

        body[2 + 32 + 1 + 2] = 1;
        assert_eq!(
            ServerHello::decode(&body, TransportKind::Stream),
            Err(AlertDescription::IllegalParameter)
        );
    }

    #[test]
    fn datagram_header_layout() {
        let header = HandshakeHeader {
            msg_type: HandshakeType::Certificate,
            length: 0x012345,
            message_seq: 2,
            fragment_offset: 0x10,
            fragment_length: 0x20,
        };
        let mut out = Vec::new();
        header.serialize(&mut out, TransportKind::Datagram);
        assert_eq!(out, [11, 0x01, 0x23, 0x45, 0, 2, 0, 0, 0x10, 0, 0, 0x20]);
        let (rest, parsed) = HandshakeHeader::parse(&out, TransportKind::Datagram).unwrap();
        assert!(rest.is_empty());
        assert_eq!(parsed, header);
    }

    #[test]
    fn certificate_list() {
        let mut body = Vec::new();
        CertificateMessage::serialize(&mut body, &[vec![1, 2, 3], vec![4]]);
        assert_eq!(body, [0, 0, 10, 0, 0, 3, 1, 2, 3, 0, 0, 1, 4]);
        assert_eq!(CertificateMessage::decode(&body).unwrap().len(), 10);

        body[2] = 9;
        assert_eq!(CertificateMessage::decode(&body), Err(AlertDescription::DecodeError));
        assert_eq!(CertificateMessage::decode(&[0, 0, 0]).unwrap(), &[] as &[u8]);
    }

    #[test]
    fn ecdhe_server_key_exchange() {
        let mut body = Vec::new();
        EcdheServerKeyExchange::serialize_params(&mut body, &[5; 32]);
        serialize_signature(&mut body, &[0x30, 0x01, 0x00]);
        let ske = EcdheServerKeyExchange::decode(&body).unwrap();
        assert_eq!(ske.params.len(), 36);
        assert_eq!(ske.point, &[5; 32]);
        assert_eq!(ske.signature, &[0x30, 0x01, 0x00]);

        body[2] = 23; // secp256r1
        assert_eq!(
            EcdheServerKeyExchange::decode(&body),
            Err(AlertDescription::IllegalParameter)
        );
    }

    #[test]
    fn certificate_request() {
        let mut body = Vec::new();
        CertificateRequest::serialize(&mut body, Some(&[0x30, 0x00]));
        assert_eq!(body, [1, 64, 0, 2, 4, 3, 0, 4, 0, 2, 0x30, 0x00]);
        assert!(CertificateRequest::decode(&body).unwrap().ecdsa);

        let rsa_only = [1, 1, 0, 2, 4, 1, 0, 0];
        assert!(!CertificateRequest::decode(&rsa_only).unwrap().ecdsa);
    }

    #[test]
    fn finished_length() {
        assert!(Finished::decode(&[0; 12]).is_ok());
        assert_eq!(Finished::decode(&[0; 11]), Err(AlertDescription::DecodeError));
    }

    #[test]
    fn hello_verify_request() {
        let mut body = Vec::new();
        HelloVerifyRequest::serialize(&mut body, &[1; 32]);
        assert_eq!(HelloVerifyRequest::decode(&body).unwrap(), &[1; 32]);
        body.push(0);
        assert_eq!(HelloVerifyRequest::decode(&body), Err(AlertDescription::DecodeError));
    }
}
