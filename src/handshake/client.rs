use super::extension::record_size_limit;
use super::message::{
    serialize_signature, CertificateMessage, CertificateRequest, ClientHello, EcdheClientKeyExchange,
    EcdheServerKeyExchange, Finished, HelloVerifyRequest, PskIdentity, ServerHello, RANDOM_LEN,
};
use super::psk_premaster;
use crate::connection::{Connection, Io};
use crate::crypto::KeyDerive;
use crate::types::{AlertDescription, AlertLevel, HandshakeType, State, TransportKind};

impl Connection {
    /// Client side of the tick: consume job results and send whatever the
    /// current state allows, until nothing more can happen this tick.
    pub(crate) fn client_tick(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        self.collect_results();

        loop {
            let before = self.state;

            match self.state {
                State::Start => self.client_start(io)?,

                State::ServerHelloDone if self.hs.peer_key.is_some() => {
                    self.set_state(State::ServerCertificateDone);
                }

                State::ServerHelloDoneDone if self.hs.cert_requested => {
                    self.client_send_certificate(io)?;
                }

                State::ServerHelloDoneDone | State::ClientCertificateDone => {
                    self.client_send_key_exchange(io)?;
                }

                State::ClientKeyExchangeDone if self.hs.send_cert_verify => {
                    if let Some(signature) = self.hs.signature.take() {
                        let mut body = Vec::with_capacity(4 + signature.len());
                        serialize_signature(&mut body, &signature);
                        self.send_handshake(io, HandshakeType::CertificateVerify, &body, true)?;
                        self.set_state(State::CertificateVerifyDone);
                    }
                }

                State::ClientKeyExchangeDone | State::CertificateVerifyDone => {
                    if self.hs.premaster.is_some() {
                        self.send_change_cipher_spec(io)?;
                        self.set_state(State::ChangeCipherSpecSent);
                        self.hs.jobs.key_derive = KeyDerive::Start;
                    }
                }

                State::ChangeCipherSpecSent => {
                    if self.hs.jobs.key_derive.is_ready() && self.hs.jobs.client_verify.is_idle() {
                        let upto = self.hs.transcript.len();
                        self.hs.jobs.client_verify.request(upto);
                    } else if let Some(verify) = self.hs.jobs.client_verify.take_ready() {
                        self.send_handshake(io, HandshakeType::Finished, &verify, true)?;
                        self.set_state(State::FinishedSent);
                    }
                }

                State::FinishedReceived => {
                    if let Some(expected) = self.hs.jobs.server_verify.take_ready() {
                        if self.hs.peer_verify != Some(expected) {
                            debug!("{} server Finished mismatch", self.id);
                            return Err(AlertDescription::DecryptError);
                        }
                        self.enter_ok();
                    }
                }

                _ => {}
            }

            if self.state == before {
                return Ok(());
            }
        }
    }

    /// Send ClientHello once the client random is known.
    fn client_start(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let random = match self.hs.client_random {
            Some(random) => random,
            None => {
                let Some(bytes) = self.hs.jobs.random.take_ready() else {
                    self.hs.jobs.random.request();
                    return Ok(());
                };
                let random: [u8; RANDOM_LEN] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| AlertDescription::InternalError)?;
                self.hs.client_random = Some(random);
                random
            }
        };

        let limit = self
            .config
            .record_size_limit()
            .then(|| self.config.max_record_size() as u16);

        let mut body = Vec::new();
        ClientHello::serialize(
            &mut body,
            self.kind,
            &random,
            &self.hs.cookie,
            self.params.suite,
            limit,
        );

        // The cookie-less hello of a datagram exchange is answered with
        // HelloVerifyRequest and does not count.
        let datagram = self.kind == TransportKind::Datagram;
        let transcript = !(datagram && self.hs.hello_count == 0);

        self.start_retransmit();
        self.send_handshake(io, HandshakeType::ClientHello, &body, transcript)?;
        if datagram {
            self.hs.hello_count = self.hs.hello_count.saturating_add(1);
        }
        self.set_state(State::ClientHelloDone);
        Ok(())
    }

    fn client_send_certificate(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let chain: &[Vec<u8>] = if self.signing_key.is_some() {
            self.config.certificate_chain()
        } else {
            &[]
        };
        let mut body = Vec::new();
        CertificateMessage::serialize(&mut body, chain);
        self.hs.send_cert_verify = !chain.is_empty();

        self.send_handshake(io, HandshakeType::Certificate, &body, true)?;
        self.set_state(State::ClientCertificateDone);
        Ok(())
    }

    fn client_send_key_exchange(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let mut body = Vec::new();

        if self.params.certificates {
            let Some(public) = self.hs.kx_public.as_deref() else {
                return Ok(());
            };
            if !self.hs.signature_verified {
                return Ok(());
            }
            EcdheClientKeyExchange::serialize(&mut body, public);
            self.start_key_exchange_secret(io)?;
        } else {
            PskIdentity::serialize(&mut body, self.config.psk_identity());
            self.hs.premaster = Some(psk_premaster(self.config.psk()));
        }

        self.send_handshake(io, HandshakeType::ClientKeyExchange, &body, true)?;
        if self.hs.send_cert_verify {
            self.start_transcript_signature(io)?;
        }
        self.set_state(State::ClientKeyExchangeDone);
        Ok(())
    }

    /// Handle a reassembled handshake message.
    pub(crate) fn client_message(
        &mut self,
        io: &mut Io<'_>,
        msg_type: HandshakeType,
        raw: &[u8],
        body: &[u8],
    ) -> Result<(), AlertDescription> {
        let certificates = self.params.certificates;
        let datagram = self.kind == TransportKind::Datagram;

        match (msg_type, self.state) {
            (HandshakeType::HelloVerifyRequest, State::Default | State::ClientHelloDone) if datagram => {
                let cookie = HelloVerifyRequest::decode(body)?;
                self.stop_retransmit();
                self.hs.cookie = cookie.to_vec();
                self.hs.transcript.clear();
                self.set_state(State::Start);
            }

            (HandshakeType::ServerHello, State::ClientHelloDone) => {
                let hello = ServerHello::decode(body, self.kind)?;
                if hello.cipher_suite != self.params.suite {
                    debug!("{} server chose {:?}", self.id, hello.cipher_suite);
                    return Err(AlertDescription::HandshakeFailure);
                }
                let random: [u8; RANDOM_LEN] = hello
                    .random
                    .try_into()
                    .map_err(|_| AlertDescription::DecodeError)?;
                self.hs.server_random = Some(random);

                if self.config.record_size_limit() {
                    if let Some(limit) = record_size_limit(&hello.extensions()?)? {
                        self.transmit_limit = (limit as usize).min(self.config.max_record_size());
                        debug!("{} transmit limit {}", self.id, self.transmit_limit);
                    }
                }
                self.set_state(State::ServerHelloDone);
            }

            (HandshakeType::Certificate, State::ServerHelloDone) if certificates => {
                let list = CertificateMessage::decode(body)?;
                if list.is_empty() {
                    return Err(AlertDescription::BadCertificate);
                }
                self.start_chain_verify(io, list)?;
            }

            (HandshakeType::ServerKeyExchange, State::ServerCertificateDone) if certificates => {
                let ske = EcdheServerKeyExchange::decode(body)?;
                let (client_random, server_random) = self.hs.randoms()?;
                let mut signed = Vec::with_capacity(2 * RANDOM_LEN + ske.params.len());
                signed.extend_from_slice(client_random);
                signed.extend_from_slice(server_random);
                signed.extend_from_slice(ske.params);

                self.hs.peer_point = Some(ske.point.to_vec());
                self.start_signature_verify(io, &signed, ske.signature)?;
                self.start_key_exchange_public(io)?;
                self.set_state(State::ServerKeyExchangeDone);
            }

            (HandshakeType::ServerKeyExchange, State::ServerHelloDone) if !certificates => {
                let hint = PskIdentity::decode(body)?;
                debug!("{} ignoring PSK identity hint of {} bytes", self.id, hint.len());
                self.set_state(State::ServerKeyExchangeDone);
            }

            (HandshakeType::CertificateRequest, State::ServerKeyExchangeDone) if certificates => {
                let request = CertificateRequest::decode(body)?;
                if !request.ecdsa {
                    debug!("{} certificate request without ECDSA, answering empty", self.id);
                    self.signing_key = None;
                }
                self.hs.cert_requested = true;
                self.set_state(State::CertificateRequestDone);
            }

            (HandshakeType::ServerHelloDone, state)
                if matches!(state, State::ServerKeyExchangeDone | State::CertificateRequestDone)
                    || (state == State::ServerHelloDone && !certificates) =>
            {
                if !body.is_empty() {
                    return Err(AlertDescription::DecodeError);
                }
                self.start_retransmit();
                self.set_state(State::ServerHelloDoneDone);
            }

            (HandshakeType::Finished, State::ChangeCipherSpecReceived) => {
                let verify = Finished::decode(body)?;
                self.stop_retransmit();
                self.hs.peer_verify = Some(verify);
                self.hs.append_transcript(raw)?;
                self.set_state(State::FinishedReceived);
            }

            (HandshakeType::HelloRequest, State::Ok) => {
                self.send_alert(io, AlertLevel::Warning, AlertDescription::NoRenegotiation);
            }

            (HandshakeType::HelloRequest, _) => {
                debug!("{} ignoring HelloRequest during handshake", self.id);
            }

            (msg_type, state) => {
                debug!("{} unexpected {:?} in {:?}", self.id, msg_type, state);
                return Err(AlertDescription::UnexpectedMessage);
            }
        }
        Ok(())
    }

    pub(crate) fn client_change_cipher_spec(&mut self) -> Result<(), AlertDescription> {
        if self.state != State::FinishedSent {
            debug!("{} unexpected ChangeCipherSpec in {:?}", self.id, self.state);
            return Err(AlertDescription::UnexpectedMessage);
        }
        self.on_receive_change_cipher_spec();
        self.set_state(State::ChangeCipherSpecReceived);
        let upto = self.hs.transcript.len();
        self.hs.jobs.server_verify.request(upto);
        Ok(())
    }
}
