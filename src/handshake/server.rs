use super::extension::record_size_limit;
use super::message::{
    serialize_signature, CertificateMessage, CertificateRequest, CertificateVerify, ClientHello,
    EcdheClientKeyExchange, EcdheServerKeyExchange, Finished, HelloVerifyRequest, PskIdentity,
    ServerHello, COOKIE_LEN, RANDOM_LEN,
};
use super::psk_premaster;
use crate::connection::{Connection, Io};
use crate::crypto::{poll_job, start_job, JobOutput, JobRequest, JobState, KeyDerive};
use crate::types::{AlertDescription, AlertLevel, HandshakeType, State, TransportKind};

impl Connection {
    /// Client certificates are requested when a trust anchor is configured.
    fn client_auth(&self) -> bool {
        self.params.certificates && self.config.trust_anchor().is_some()
    }

    /// Server side of the tick.
    pub(crate) fn server_tick(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        self.collect_results();

        loop {
            let before = self.state;

            match self.state {
                State::ClientHelloDone => {
                    if let Some(bytes) = self.hs.jobs.random.take_ready() {
                        let random: [u8; RANDOM_LEN] = bytes
                            .as_slice()
                            .try_into()
                            .map_err(|_| AlertDescription::InternalError)?;
                        self.hs.server_random = Some(random);
                        self.server_send_hello(io, &random)?;
                    }
                }

                State::ServerHelloDone => {
                    if self.params.certificates {
                        let mut body = Vec::new();
                        CertificateMessage::serialize(&mut body, self.config.certificate_chain());
                        self.send_handshake(io, HandshakeType::Certificate, &body, true)?;
                        self.set_state(State::ServerCertificateDone);
                        self.start_key_exchange_public(io)?;
                    } else {
                        if let Some(hint) = self.config.psk_hint() {
                            let mut body = Vec::new();
                            PskIdentity::serialize(&mut body, hint);
                            self.send_handshake(io, HandshakeType::ServerKeyExchange, &body, true)?;
                        }
                        self.set_state(State::ServerKeyExchangeDone);
                    }
                }

                State::ServerCertificateDone => {
                    if let Some(signature) = self.hs.signature.take() {
                        let mut body = self.hs.ske_params.clone();
                        serialize_signature(&mut body, &signature);
                        self.send_handshake(io, HandshakeType::ServerKeyExchange, &body, true)?;
                        self.set_state(State::ServerKeyExchangeDone);
                    } else if let Some(public) = self.hs.kx_public.take() {
                        self.hs.ske_params.clear();
                        EcdheServerKeyExchange::serialize_params(&mut self.hs.ske_params, &public);
                        self.start_key_exchange_signature(io)?;
                    }
                }

                State::ServerKeyExchangeDone => {
                    if self.client_auth() {
                        let mut body = Vec::new();
                        CertificateRequest::serialize(&mut body, self.config.ca_name());
                        self.send_handshake(io, HandshakeType::CertificateRequest, &body, true)?;
                        self.set_state(State::CertificateRequestDone);
                    } else {
                        self.server_send_hello_done(io)?;
                    }
                }

                State::CertificateRequestDone => self.server_send_hello_done(io)?,

                State::ServerHelloDoneDone if self.client_auth() && self.hs.peer_key.is_some() => {
                    self.set_state(State::ClientCertificateDone);
                }

                State::ServerHelloDoneDone | State::ClientCertificateDone
                    if self.hs.premaster.is_some() =>
                {
                    self.set_state(State::ClientKeyExchangeDone);
                }

                State::ClientKeyExchangeDone if self.client_auth() && self.hs.signature_verified => {
                    self.set_state(State::CertificateVerifyDone);
                }

                State::FinishedReceived => {
                    if self.hs.jobs.key_derive.is_ready() && self.hs.jobs.client_verify.is_idle() {
                        let upto = self.hs.peer_finished_offset;
                        self.hs.jobs.client_verify.request(upto);
                    } else if let Some(expected) = self.hs.jobs.client_verify.take_ready() {
                        if self.hs.peer_verify != Some(expected) {
                            debug!("{} client Finished mismatch", self.id);
                            return Err(AlertDescription::DecryptError);
                        }
                        self.send_change_cipher_spec(io)?;
                        self.set_state(State::ChangeCipherSpecSent);
                        let upto = self.hs.transcript.len();
                        self.hs.jobs.server_verify.request(upto);
                    }
                }

                State::ChangeCipherSpecSent => {
                    if let Some(verify) = self.hs.jobs.server_verify.take_ready() {
                        self.send_handshake(io, HandshakeType::Finished, &verify, false)?;
                        self.set_state(State::FinishedSent);
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

    fn server_send_hello(&mut self, io: &mut Io<'_>, random: &[u8; RANDOM_LEN]) -> Result<(), AlertDescription> {
        let limit = (self.config.record_size_limit() && self.hs.peer_offered_limit)
            .then(|| self.config.max_record_size() as u16);

        let mut body = Vec::new();
        ServerHello::serialize(&mut body, self.kind, random, self.params.suite, limit);
        self.send_handshake(io, HandshakeType::ServerHello, &body, true)?;
        self.set_state(State::ServerHelloDone);
        Ok(())
    }

    fn server_send_hello_done(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        self.send_handshake(io, HandshakeType::ServerHelloDone, &[], true)?;
        self.set_state(State::ServerHelloDoneDone);
        Ok(())
    }

    /// Submit or poll the cookie job and answer with HelloVerifyRequest once
    /// the cookie exists.
    pub(crate) fn drive_cookie(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let jobs = &mut self.hs.jobs;
        match jobs.cookie {
            JobState::Idle | JobState::Ready(_) | JobState::Failed(_) => {}
            JobState::Start => {
                let request = JobRequest::Random { len: COOKIE_LEN };
                return start_job(&mut jobs.cookie, io.crypto, self.id, request, ());
            }
            JobState::Busy { .. } => {
                let Some(((), outcome)) = poll_job(&jobs.cookie, io.crypto) else {
                    return Ok(());
                };
                match outcome {
                    Ok(JobOutput::Bytes(cookie)) => jobs.cookie = JobState::Ready(cookie),
                    Ok(other) => {
                        warn!("{} cookie job returned {:?}", self.id, other);
                        jobs.cookie.reset();
                        return Err(AlertDescription::InternalError);
                    }
                    Err(e) => {
                        warn!("{} cookie job failed: {}", self.id, e);
                        jobs.cookie = JobState::Failed(e);
                        return Err(AlertDescription::InternalError);
                    }
                }
            }
        }

        if let Some(cookie) = self.hs.jobs.cookie.take_ready() {
            self.hs.cookie = cookie;
            self.send_hello_verify_request(io)?;
        }
        Ok(())
    }

    fn send_hello_verify_request(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let mut body = Vec::with_capacity(3 + self.hs.cookie.len());
        HelloVerifyRequest::serialize(&mut body, &self.hs.cookie);
        self.send_handshake(io, HandshakeType::HelloVerifyRequest, &body, false)
    }

    fn server_client_hello(&mut self, io: &mut Io<'_>, raw: &[u8], body: &[u8]) -> Result<(), AlertDescription> {
        let hello = ClientHello::decode(body, self.kind)?;

        if self.kind == TransportKind::Datagram {
            let valid = hello.cookie.len() == COOKIE_LEN && hello.cookie == &self.hs.cookie[..];
            if !valid {
                debug!("{} ClientHello without valid cookie", self.id);
                // HelloVerifyRequest echoes the hello's record sequence.
                self.write.seq = self.hs.record_seq;
                self.read.seq = 0;
                self.window.reset();
                // Incremented to 1 once this message is done.
                self.hs.next_receive_seq = 0;

                if self.hs.cookie.is_empty() {
                    self.hs.jobs.cookie.request();
                } else {
                    self.send_hello_verify_request(io)?;
                }
                return Ok(());
            }
            self.hs.send_seq = 1;
        }

        if !hello.offers(self.params.suite) {
            debug!("{} client does not offer {:?}", self.id, self.params.suite);
            return Err(AlertDescription::HandshakeFailure);
        }

        let random: [u8; RANDOM_LEN] = hello
            .random
            .try_into()
            .map_err(|_| AlertDescription::DecodeError)?;
        self.hs.client_random = Some(random);
        self.hs.append_transcript(raw)?;

        if self.config.record_size_limit() {
            if let Some(limit) = record_size_limit(&hello.extensions()?)? {
                self.hs.peer_offered_limit = true;
                self.transmit_limit = (limit as usize).min(self.config.max_record_size());
                debug!("{} transmit limit {}", self.id, self.transmit_limit);
            }
        }

        self.hs.jobs.random.request();
        self.start_retransmit();
        self.set_state(State::ClientHelloDone);
        Ok(())
    }

    /// Handle a reassembled handshake message.
    pub(crate) fn server_message(
        &mut self,
        io: &mut Io<'_>,
        msg_type: HandshakeType,
        raw: &[u8],
        body: &[u8],
    ) -> Result<(), AlertDescription> {
        let certificates = self.params.certificates;
        let client_auth = self.client_auth();

        match (msg_type, self.state) {
            (HandshakeType::ClientHello, State::Default) => self.server_client_hello(io, raw, body)?,

            (HandshakeType::ClientHello, State::Ok) => {
                self.send_alert(io, AlertLevel::Warning, AlertDescription::NoRenegotiation);
            }

            (HandshakeType::Certificate, State::ServerHelloDoneDone) if client_auth => {
                let list = CertificateMessage::decode(body)?;
                if list.is_empty() {
                    debug!("{} client sent no certificate", self.id);
                    return Err(AlertDescription::BadCertificate);
                }
                self.start_chain_verify(io, list)?;
            }

            (HandshakeType::ClientKeyExchange, State::ServerHelloDoneDone) if !certificates => {
                let identity = PskIdentity::decode(body)?;
                debug!("{} PSK identity of {} bytes", self.id, identity.len());
                self.hs.premaster = Some(psk_premaster(self.config.psk()));
                self.set_state(State::ClientKeyExchangeDone);
            }

            (HandshakeType::ClientKeyExchange, state)
                if certificates
                    && ((state == State::ServerHelloDoneDone && !client_auth)
                        || (state == State::ClientCertificateDone && client_auth)) =>
            {
                let point = EcdheClientKeyExchange::decode(body)?;
                self.hs.peer_point = Some(point.to_vec());
                self.start_key_exchange_secret(io)?;
            }

            (HandshakeType::CertificateVerify, State::ClientKeyExchangeDone) if client_auth => {
                let signature = CertificateVerify::decode(body)?;
                let signed = self.hs.transcript.len() - raw.len();
                let data = self.hs.transcript[..signed].to_vec();
                self.start_signature_verify(io, &data, signature)?;
            }

            (HandshakeType::Finished, State::ChangeCipherSpecReceived) => {
                let verify = Finished::decode(body)?;
                self.stop_retransmit();
                self.hs.peer_verify = Some(verify);
                self.hs.peer_finished_offset = self.hs.transcript.len();
                self.hs.append_transcript(raw)?;
                self.set_state(State::FinishedReceived);
            }

            (msg_type, state) => {
                debug!("{} unexpected {:?} in {:?}", self.id, msg_type, state);
                return Err(AlertDescription::UnexpectedMessage);
            }
        }
        Ok(())
    }

    pub(crate) fn server_change_cipher_spec(&mut self) -> Result<(), AlertDescription> {
        let expected = if self.client_auth() {
            State::CertificateVerifyDone
        } else {
            State::ClientKeyExchangeDone
        };

        match self.state {
            s if s == expected => {}
            State::FinishedReceived | State::ChangeCipherSpecSent => {
                debug!("{} ignoring repeated ChangeCipherSpec", self.id);
                return Ok(());
            }
            s => {
                debug!("{} unexpected ChangeCipherSpec in {:?}", self.id, s);
                return Err(AlertDescription::UnexpectedMessage);
            }
        }

        self.on_receive_change_cipher_spec();
        self.set_state(State::ChangeCipherSpecReceived);
        self.hs.jobs.key_derive = KeyDerive::Start;
        Ok(())
    }
}
