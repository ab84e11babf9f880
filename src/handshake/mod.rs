//! Handshake engine shared by both roles.
//!
//! Holds the per handshake context, message framing in both directions,
//! flight retention for datagram retransmission and the jobs that turn secrets
//! into keys and Finished verify data.

use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::config::Config;
use crate::connection::{Connection, Io};
use crate::crypto::{
    poll_job, start_job, HandshakeJobs, JobOutput, JobPoll, JobRequest, JobState, KeyDerive,
    SignPhase, StreamMode, VerifyData,
};
use crate::timer::{RetransmitTimer, TimerEvent};
use crate::types::{AlertDescription, ContentType, HandshakeType, Role, TransportKind};

mod client;
pub(crate) mod extension;
pub(crate) mod message;
mod server;

use message::{HandshakeHeader, RANDOM_LEN, VERIFY_DATA_LEN};

/// State of one handshake. Reset when the connection reaches `Ok`, apart from
/// what is needed to answer a retransmitted final flight.
pub(crate) struct HandshakeContext {
    pub jobs: HandshakeJobs,

    /// Reassembly of the message currently being received.
    pub fragments: Buf,
    /// Body bytes of the current datagram message received so far.
    pub assembled: usize,
    pub transcript: Buf,

    pub client_random: Option<[u8; RANDOM_LEN]>,
    pub server_random: Option<[u8; RANDOM_LEN]>,
    pub premaster: Option<Zeroizing<Vec<u8>>>,
    pub master: Zeroizing<Vec<u8>>,

    /// Verify data from the peer's Finished.
    pub peer_verify: Option<[u8; VERIFY_DATA_LEN]>,
    /// Transcript length before the peer's Finished was appended.
    pub peer_finished_offset: usize,
    /// Peer certificate public key (SEC1).
    pub peer_key: Option<Vec<u8>>,
    /// Peer ECDHE point.
    pub peer_point: Option<Vec<u8>>,
    pub kx_public: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    pub signature_verified: bool,
    /// Server: signed part of ServerKeyExchange.
    pub ske_params: Vec<u8>,

    /// Client: the server asked for a certificate.
    pub cert_requested: bool,
    /// Client: a non-empty certificate was sent and must be proven.
    pub send_cert_verify: bool,
    /// Server: the client announced record_size_limit.
    pub peer_offered_limit: bool,

    // Datagram only.
    pub flight: Buf,
    pub timer: RetransmitTimer,
    pub cookie: Vec<u8>,
    pub send_seq: u16,
    pub next_receive_seq: u16,
    pub hello_count: u8,
    /// Record sequence number of the record being handled.
    pub record_seq: u64,
}

impl HandshakeContext {
    pub fn new(config: &Config) -> Self {
        HandshakeContext {
            jobs: HandshakeJobs::default(),
            fragments: Buf::with_capacity(config.fragment_buffer_size()),
            assembled: 0,
            transcript: Buf::with_capacity(config.transcript_size()),
            client_random: None,
            server_random: None,
            premaster: None,
            master: Zeroizing::new(Vec::new()),
            peer_verify: None,
            peer_finished_offset: 0,
            peer_key: None,
            peer_point: None,
            kx_public: None,
            signature: None,
            signature_verified: false,
            ske_params: Vec::new(),
            cert_requested: false,
            send_cert_verify: false,
            peer_offered_limit: false,
            flight: Buf::with_capacity(config.retransmit_buffer_size()),
            timer: RetransmitTimer::new(config.retransmit_initial_ticks(), config.retransmit_limit()),
            cookie: Vec::new(),
            send_seq: 0,
            next_receive_seq: 0,
            hello_count: 0,
            record_seq: 0,
        }
    }

    /// Drop transcript, secrets and reassembly state once the handshake is
    /// done. The flight, its timer and message sequencing survive.
    pub fn finish(&mut self, config: &Config) {
        let mut done = HandshakeContext::new(config);
        std::mem::swap(&mut done.flight, &mut self.flight);
        std::mem::swap(&mut done.timer, &mut self.timer);
        done.send_seq = self.send_seq;
        done.next_receive_seq = self.next_receive_seq;
        *self = done;
    }

    pub fn append_transcript(&mut self, message: &[u8]) -> Result<(), AlertDescription> {
        self.transcript.extend_from_slice(message).map_err(|_| {
            warn!(
                "Transcript overflow: {} + {} > {}",
                self.transcript.len(),
                message.len(),
                self.transcript.capacity()
            );
            AlertDescription::InternalError
        })
    }

    fn randoms(&self) -> Result<(&[u8; RANDOM_LEN], &[u8; RANDOM_LEN]), AlertDescription> {
        match (&self.client_random, &self.server_random) {
            (Some(c), Some(s)) => Ok((c, s)),
            _ => Err(AlertDescription::InternalError),
        }
    }
}

/// RFC 4279 premaster secret for plain PSK.
pub(crate) fn psk_premaster(psk: &[u8]) -> Zeroizing<Vec<u8>> {
    let n = (psk.len() as u16).to_be_bytes();
    let mut pms = Zeroizing::new(Vec::with_capacity(4 + 2 * psk.len()));
    pms.extend_from_slice(&n);
    pms.resize(2 + psk.len(), 0);
    pms.extend_from_slice(&n);
    pms.extend_from_slice(psk);
    pms
}

impl Connection {
    /// Frame and send a handshake message, fragmenting to the transmit limit.
    pub(crate) fn send_handshake(
        &mut self,
        io: &mut Io<'_>,
        msg_type: HandshakeType,
        body: &[u8],
        transcript: bool,
    ) -> Result<(), AlertDescription> {
        let kind = self.kind;
        let header = HandshakeHeader::whole(msg_type, body.len(), self.hs.send_seq);
        if kind == TransportKind::Datagram {
            self.hs.send_seq = self.hs.send_seq.wrapping_add(1);
        }

        let mut message = Vec::with_capacity(kind.handshake_header_len() + body.len());
        header.serialize(&mut message, kind);
        message.extend_from_slice(body);

        if transcript {
            self.hs.append_transcript(&message)?;
        }
        debug!("{} send {:?} ({} bytes)", self.id, msg_type, body.len());

        let max = self.max_record_payload();
        match kind {
            TransportKind::Stream => {
                for chunk in message.chunks(max) {
                    self.send_record(io, ContentType::Handshake, chunk)?;
                }
            }
            TransportKind::Datagram => {
                let per_fragment = max.saturating_sub(kind.handshake_header_len()).max(1);
                if body.len() <= per_fragment {
                    return self.send_record(io, ContentType::Handshake, &message);
                }
                for (i, chunk) in body.chunks(per_fragment).enumerate() {
                    let fragment_header = HandshakeHeader {
                        fragment_offset: i * per_fragment,
                        fragment_length: chunk.len(),
                        ..header
                    };
                    let mut fragment = Vec::with_capacity(kind.handshake_header_len() + chunk.len());
                    fragment_header.serialize(&mut fragment, kind);
                    fragment.extend_from_slice(chunk);
                    self.send_record(io, ContentType::Handshake, &fragment)?;
                }
            }
        }
        Ok(())
    }

    /// A handshake record arrived.
    pub(crate) fn handle_handshake_record(
        &mut self,
        io: &mut Io<'_>,
        payload: &[u8],
    ) -> Result<(), AlertDescription> {
        match self.kind {
            TransportKind::Stream => {
                self.hs.fragments.extend_from_slice(payload).map_err(|_| {
                    warn!("{} handshake message exceeds fragment buffer", self.id);
                    AlertDescription::InternalError
                })?;
                self.process_fragments(io)
            }
            TransportKind::Datagram => self.handle_datagram_fragment(io, payload),
        }
    }

    /// Handle every complete stream message in the fragment buffer. Stops early
    /// when a handler started a job the next message depends on.
    pub(crate) fn process_fragments(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        loop {
            if self.state.is_terminal() || self.hs.jobs.blocks_receive() {
                return Ok(());
            }
            let buffered = &self.hs.fragments;
            if buffered.len() < 4 {
                return Ok(());
            }
            let length = u32::from_be_bytes([0, buffered[1], buffered[2], buffered[3]]) as usize;
            if 4 + length > buffered.capacity() {
                warn!("{} handshake message of {} bytes exceeds fragment buffer", self.id, length);
                return Err(AlertDescription::InternalError);
            }
            if buffered.len() < 4 + length {
                return Ok(());
            }

            let raw = buffered[..4 + length].to_vec();
            self.hs.fragments.consume(4 + length);
            self.handle_message(io, HandshakeType::from_u8(raw[0]), &raw)?;
        }
    }

    fn handle_datagram_fragment(&mut self, io: &mut Io<'_>, payload: &[u8]) -> Result<(), AlertDescription> {
        let (body, header) = HandshakeHeader::parse(payload, TransportKind::Datagram)
            .map_err(|_| AlertDescription::DecodeError)?;

        if header.fragment_length != body.len() {
            return Err(AlertDescription::DecodeError);
        }
        if header.fragment_offset + header.fragment_length > header.length {
            return Err(AlertDescription::DecodeError);
        }

        if header.message_seq != self.hs.next_receive_seq {
            if header.message_seq.wrapping_add(1) == self.hs.next_receive_seq {
                self.resend_flight_once(io, "peer retransmitted its flight")?;
            } else {
                debug!(
                    "{} dropping {:?} with message_seq {} (expected {})",
                    self.id, header.msg_type, header.message_seq, self.hs.next_receive_seq
                );
            }
            return Ok(());
        }

        let header_len = TransportKind::Datagram.handshake_header_len();
        if header_len + header.length > self.hs.fragments.capacity() {
            warn!("{} handshake message of {} bytes exceeds fragment buffer", self.id, header.length);
            return Err(AlertDescription::InternalError);
        }

        if header.fragment_offset == 0 {
            self.hs.fragments.clear();
            let mut whole = Vec::with_capacity(header_len);
            HandshakeHeader::whole(header.msg_type, header.length, header.message_seq)
                .serialize(&mut whole, TransportKind::Datagram);
            self.hs
                .fragments
                .extend_from_slice(&whole)
                .and_then(|_| self.hs.fragments.extend_from_slice(body))
                .map_err(|_| AlertDescription::InternalError)?;
            self.hs.assembled = body.len();
        } else if self.continues_message(&header) {
            self.hs
                .fragments
                .extend_from_slice(body)
                .map_err(|_| AlertDescription::InternalError)?;
            self.hs.assembled += body.len();
        } else {
            debug!(
                "{} dropping non-contiguous fragment at {} (have {})",
                self.id, header.fragment_offset, self.hs.assembled
            );
            return Ok(());
        }

        if self.hs.assembled < header.length {
            return Ok(());
        }

        let raw = self.hs.fragments.to_vec();
        self.hs.fragments.clear();
        self.hs.assembled = 0;

        self.handle_message(io, header.msg_type, &raw)?;
        self.hs.next_receive_seq = self.hs.next_receive_seq.wrapping_add(1);
        Ok(())
    }

    /// Whether a fragment extends the message being reassembled.
    fn continues_message(&self, header: &HandshakeHeader) -> bool {
        let buffered = &self.hs.fragments;
        buffered.len() >= 4
            && header.fragment_offset == self.hs.assembled
            && buffered[0] == header.msg_type.as_u8()
            && u32::from_be_bytes([0, buffered[1], buffered[2], buffered[3]]) as usize == header.length
    }

    /// Dispatch a reassembled message, header included in `raw`.
    fn handle_message(
        &mut self,
        io: &mut Io<'_>,
        msg_type: HandshakeType,
        raw: &[u8],
    ) -> Result<(), AlertDescription> {
        if self.state.is_terminal() {
            return Ok(());
        }

        let appended_by_handler = matches!(
            msg_type,
            HandshakeType::ClientHello
                | HandshakeType::Finished
                | HandshakeType::HelloVerifyRequest
                | HandshakeType::HelloRequest
        );
        if !appended_by_handler {
            self.hs.append_transcript(raw)?;
        }

        let body = &raw[self.kind.handshake_header_len()..];
        debug!("{} received {:?} in {:?}", self.id, msg_type, self.state);

        match self.role {
            Role::Client => self.client_message(io, msg_type, raw, body),
            Role::Server => self.server_message(io, msg_type, raw, body),
        }
    }

    pub(crate) fn handle_change_cipher_spec(&mut self) -> Result<(), AlertDescription> {
        match self.role {
            Role::Client => self.client_change_cipher_spec(),
            Role::Server => self.server_change_cipher_spec(),
        }
    }

    /// Send ChangeCipherSpec and switch the write side.
    pub(crate) fn send_change_cipher_spec(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        self.send_record(io, ContentType::ChangeCipherSpec, &[1])?;
        self.write.switch();
        debug!("{} write side switched to epoch {}", self.id, self.write.epoch);
        Ok(())
    }

    /// Peer's ChangeCipherSpec: switch the read side.
    pub(crate) fn on_receive_change_cipher_spec(&mut self) {
        self.read.switch();
        self.window.reset();
        debug!("{} read side switched to epoch {}", self.id, self.read.epoch);
    }

    /// Keep a sent datagram for retransmission: `length(2) | datagram`.
    pub(crate) fn retain_datagram(&mut self, wire: &[u8]) -> Result<(), AlertDescription> {
        let len = (wire.len() as u16).to_be_bytes();
        let flight = &mut self.hs.flight;
        if flight.free() < 2 + wire.len() {
            warn!(
                "{} retransmit buffer overflow: {} + {} > {}",
                self.id,
                flight.len(),
                2 + wire.len(),
                flight.capacity()
            );
            return Err(AlertDescription::InternalError);
        }
        flight
            .extend_from_slice(&len)
            .and_then(|_| flight.extend_from_slice(wire))
            .map_err(|_| AlertDescription::InternalError)
    }

    /// Arm the retransmit timer for a new flight.
    pub(crate) fn start_retransmit(&mut self) {
        if self.kind == TransportKind::Datagram {
            self.hs.flight.clear();
            self.hs.timer.start();
        }
    }

    /// The peer's flight arrived: our previous flight is acknowledged.
    pub(crate) fn stop_retransmit(&mut self) {
        if self.kind == TransportKind::Datagram {
            self.hs.flight.clear();
            self.hs.timer.stop();
        }
    }

    /// Count the retransmit timer down, resending on expiry.
    pub(crate) fn tick_retransmit(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        if self.state.is_terminal()
            || self.hs.jobs.in_flight()
            || self.jobs.tx_in_flight()
            || self.jobs.rx_in_flight()
        {
            return Ok(());
        }

        match self.hs.timer.tick() {
            TimerEvent::Expired => {
                debug!("{} retransmit #{} in {:?}", self.id, self.hs.timer.count(), self.state);
                self.resend_flight(io)
            }
            TimerEvent::Exhausted => {
                warn!("{} retransmission limit reached in {:?}", self.id, self.state);
                Err(AlertDescription::InternalError)
            }
            TimerEvent::Idle | TimerEvent::Running => Ok(()),
        }
    }

    /// Resend the buffered flight, at most once per tick.
    pub(crate) fn resend_flight_once(&mut self, io: &mut Io<'_>, reason: &str) -> Result<(), AlertDescription> {
        if self.resent_this_tick || self.hs.flight.is_empty() {
            return Ok(());
        }
        debug!("{} resending flight: {}", self.id, reason);
        self.resend_flight(io)
    }

    fn resend_flight(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        self.resent_this_tick = true;
        let remote = self.remote(io);

        let mut rest: &[u8] = &self.hs.flight;
        while rest.len() >= 2 {
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let datagram = &rest[2..2 + len];
            if let Err(e) = io.transport.send(self.id, remote, datagram) {
                warn!("{} transport send failed: {}", self.id, e);
                self.tx_error = true;
                return Err(AlertDescription::InternalError);
            }
            rest = &rest[2 + len..];
        }
        Ok(())
    }

    /// Drive key derivation: master secret, then the key block.
    pub(crate) fn drive_key_derive(&mut self) -> Result<(), AlertDescription> {
        match self.hs.jobs.key_derive {
            KeyDerive::Start => {
                if !self.hs.jobs.prf.is_idle() {
                    return Ok(());
                }
                let (client_random, server_random) = self.hs.randoms()?;
                let mut seed = Vec::with_capacity(2 * RANDOM_LEN);
                seed.extend_from_slice(client_random);
                seed.extend_from_slice(server_random);

                let premaster = self.hs.premaster.take().ok_or(AlertDescription::InternalError)?;
                self.hs.jobs.prf.start(&premaster, b"master secret", &seed, 48);
                self.hs.jobs.key_derive = KeyDerive::Master;
            }
            KeyDerive::Master => {
                if let Some(master) = self.hs.jobs.prf.take_ready() {
                    self.hs.master = master;
                    let (client_random, server_random) = self.hs.randoms()?;
                    let mut seed = Vec::with_capacity(2 * RANDOM_LEN);
                    seed.extend_from_slice(server_random);
                    seed.extend_from_slice(client_random);

                    let len = self.params.key_block_len();
                    self.hs
                        .jobs
                        .prf
                        .start(&self.hs.master, b"key expansion", &seed, len);
                    self.hs.jobs.key_derive = KeyDerive::KeyBlock;
                } else if self.hs.jobs.prf.is_failed() {
                    self.hs.jobs.key_derive = KeyDerive::Failed;
                    return Err(AlertDescription::InternalError);
                }
            }
            KeyDerive::KeyBlock => {
                if let Some(block) = self.hs.jobs.prf.take_ready() {
                    self.install_keys(&block);
                    self.hs.jobs.key_derive = KeyDerive::Ready;
                    debug!("{} keys derived", self.id);
                } else if self.hs.jobs.prf.is_failed() {
                    self.hs.jobs.key_derive = KeyDerive::Failed;
                    return Err(AlertDescription::InternalError);
                }
            }
            KeyDerive::Idle | KeyDerive::Ready | KeyDerive::Failed => {}
        }
        Ok(())
    }

    /// Split the key block and install both directions.
    fn install_keys(&mut self, block: &[u8]) {
        let p = self.params;
        let (client_mac, rest) = block.split_at(p.mac_key_len);
        let (server_mac, rest) = rest.split_at(p.mac_key_len);
        let (client_key, rest) = rest.split_at(p.key_len);
        let (server_key, rest) = rest.split_at(p.key_len);
        let (client_iv, rest) = rest.split_at(p.iv_len);
        let server_iv = &rest[..p.iv_len];

        match self.role {
            Role::Client => {
                self.write.install(client_mac, client_key, client_iv);
                self.read.install(server_mac, server_key, server_iv);
            }
            Role::Server => {
                self.write.install(server_mac, server_key, server_iv);
                self.read.install(client_mac, client_key, client_iv);
            }
        }
    }

    /// Drive one of the two verify data computations.
    pub(crate) fn drive_verify_data(&mut self, io: &mut Io<'_>, server: bool) -> Result<(), AlertDescription> {
        let slot = if server {
            &mut self.hs.jobs.server_verify
        } else {
            &mut self.hs.jobs.client_verify
        };
        if slot.is_idle() {
            return Ok(());
        }
        let label: &[u8] = if server { b"server finished" } else { b"client finished" };

        let next = match std::mem::take(slot) {
            VerifyData::Start { upto } => {
                let request = JobRequest::Hash {
                    data: &self.hs.transcript[..upto],
                };
                match io.crypto.start(self.id, request) {
                    Ok(job) => VerifyData::Hash(job),
                    Err(e) => {
                        warn!("{} transcript hash refused: {}", self.id, e);
                        self.set_verify_data(server, VerifyData::Failed);
                        return Err(AlertDescription::InternalError);
                    }
                }
            }
            VerifyData::Hash(job) => match io.crypto.poll(job) {
                JobPoll::Pending => VerifyData::Hash(job),
                JobPoll::Done(JobOutput::Bytes(hash)) => VerifyData::AwaitPrf(hash),
                JobPoll::Done(other) => {
                    warn!("{} transcript hash returned {:?}", self.id, other);
                    self.set_verify_data(server, VerifyData::Failed);
                    return Err(AlertDescription::InternalError);
                }
                JobPoll::Failed(e) => {
                    warn!("{} transcript hash failed: {}", self.id, e);
                    self.set_verify_data(server, VerifyData::Failed);
                    return Err(AlertDescription::InternalError);
                }
            },
            VerifyData::AwaitPrf(hash) => {
                if self.hs.jobs.prf.is_idle() {
                    self.hs
                        .jobs
                        .prf
                        .start(&self.hs.master, label, &hash, VERIFY_DATA_LEN);
                    VerifyData::Prf
                } else {
                    VerifyData::AwaitPrf(hash)
                }
            }
            VerifyData::Prf => match self.hs.jobs.prf.take_ready() {
                Some(out) => {
                    let mut verify = [0u8; VERIFY_DATA_LEN];
                    verify.copy_from_slice(&out[..VERIFY_DATA_LEN]);
                    VerifyData::Ready(verify)
                }
                None if self.hs.jobs.prf.is_failed() => {
                    self.set_verify_data(server, VerifyData::Failed);
                    return Err(AlertDescription::InternalError);
                }
                None => VerifyData::Prf,
            },
            other => other,
        };

        self.set_verify_data(server, next);
        Ok(())
    }

    fn set_verify_data(&mut self, server: bool, value: VerifyData) {
        if server {
            self.hs.jobs.server_verify = value;
        } else {
            self.hs.jobs.client_verify = value;
        }
    }

    /// Submit or poll the random, signature, certificate and key exchange jobs.
    pub(crate) fn drive_random(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let jobs = &mut self.hs.jobs;
        if matches!(jobs.random, JobState::Start) {
            return start_job(
                &mut jobs.random,
                io.crypto,
                self.id,
                JobRequest::Random { len: RANDOM_LEN },
                (),
            );
        }
        let Some(((), outcome)) = poll_job(&jobs.random, io.crypto) else {
            return Ok(());
        };
        match outcome {
            Ok(JobOutput::Bytes(bytes)) if bytes.len() == RANDOM_LEN => {
                jobs.random = JobState::Ready(bytes);
                Ok(())
            }
            Ok(other) => {
                warn!("{} random returned {:?}", self.id, other);
                jobs.random.reset();
                Err(AlertDescription::InternalError)
            }
            Err(e) => {
                warn!("{} random failed: {}", self.id, e);
                jobs.random = JobState::Failed(e);
                Err(AlertDescription::InternalError)
            }
        }
    }

    pub(crate) fn drive_certificate_jobs(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        self.drive_sig_gen(io)?;
        self.drive_sig_verify(io)?;
        self.drive_cert_verify(io)?;
        self.drive_kx(io)
    }

    /// Signature generation. Streamed over four jobs for ServerKeyExchange.
    fn drive_sig_gen(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let Some((phase, outcome)) = poll_job(&self.hs.jobs.sig_gen, io.crypto) else {
            return Ok(());
        };
        let output = match outcome {
            Ok(JobOutput::Bytes(out)) => out,
            Ok(other) => {
                warn!("{} signature returned {:?}", self.id, other);
                self.hs.jobs.sig_gen.reset();
                return Err(AlertDescription::InternalError);
            }
            Err(e) => {
                warn!("{} signature failed in {:?}: {}", self.id, phase, e);
                self.hs.jobs.sig_gen = JobState::Failed(e);
                return Err(AlertDescription::InternalError);
            }
        };

        let key = self.signing_key.ok_or(AlertDescription::InternalError)?;
        let (data, next): (Vec<u8>, SignPhase) = match phase {
            SignPhase::ClientRandom => {
                let (_, server_random) = self.hs.randoms()?;
                (server_random.to_vec(), SignPhase::ServerRandom)
            }
            SignPhase::ServerRandom => (self.hs.ske_params.clone(), SignPhase::Params),
            SignPhase::Params => (Vec::new(), SignPhase::Finish),
            SignPhase::Finish | SignPhase::Single => {
                trace!("{} signature ready", self.id);
                self.hs.jobs.sig_gen = JobState::Ready(output);
                return Ok(());
            }
        };

        let mode = if next == SignPhase::Finish {
            StreamMode::Finish
        } else {
            StreamMode::Update
        };
        let request = JobRequest::Sign { key, mode, data: &data };
        start_job(&mut self.hs.jobs.sig_gen, io.crypto, self.id, request, next)
    }

    /// Begin the streamed ServerKeyExchange signature.
    pub(crate) fn start_key_exchange_signature(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let key = self.signing_key.ok_or(AlertDescription::InternalError)?;
        let client_random = *self.hs.randoms()?.0;
        let request = JobRequest::Sign {
            key,
            mode: StreamMode::Start,
            data: &client_random,
        };
        start_job(&mut self.hs.jobs.sig_gen, io.crypto, self.id, request, SignPhase::ClientRandom)
    }

    /// Sign the whole transcript for CertificateVerify.
    pub(crate) fn start_transcript_signature(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let key = self.signing_key.ok_or(AlertDescription::InternalError)?;
        let request = JobRequest::Sign {
            key,
            mode: StreamMode::Single,
            data: &self.hs.transcript,
        };
        start_job(&mut self.hs.jobs.sig_gen, io.crypto, self.id, request, SignPhase::Single)
    }

    fn drive_sig_verify(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let Some(((), outcome)) = poll_job(&self.hs.jobs.sig_verify, io.crypto) else {
            return Ok(());
        };
        match outcome {
            Ok(JobOutput::Verified) => {
                self.hs.jobs.sig_verify = JobState::Ready(());
                Ok(())
            }
            Ok(_) => {
                debug!("{} peer signature rejected", self.id);
                self.hs.jobs.sig_verify.reset();
                Err(AlertDescription::DecryptError)
            }
            Err(e) => {
                warn!("{} signature verify failed: {}", self.id, e);
                self.hs.jobs.sig_verify = JobState::Failed(e);
                Err(AlertDescription::InternalError)
            }
        }
    }

    fn drive_cert_verify(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let Some(((), outcome)) = poll_job(&self.hs.jobs.cert_verify, io.crypto) else {
            return Ok(());
        };
        match outcome {
            Ok(JobOutput::Bytes(key)) => {
                self.hs.jobs.cert_verify = JobState::Ready(key);
                Ok(())
            }
            Ok(_) => {
                debug!("{} peer certificate chain rejected", self.id);
                self.hs.jobs.cert_verify.reset();
                Err(AlertDescription::BadCertificate)
            }
            Err(e) => {
                warn!("{} certificate verify failed: {}", self.id, e);
                self.hs.jobs.cert_verify = JobState::Failed(e);
                Err(AlertDescription::InternalError)
            }
        }
    }

    fn drive_kx(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        if let Some(((), outcome)) = poll_job(&self.hs.jobs.kx_public, io.crypto) {
            match outcome {
                Ok(JobOutput::Bytes(public)) => {
                    self.hs.jobs.kx_public = JobState::Ready(public);
                }
                Ok(other) => {
                    warn!("{} key exchange returned {:?}", self.id, other);
                    self.hs.jobs.kx_public.reset();
                    return Err(AlertDescription::InternalError);
                }
                Err(e) => {
                    warn!("{} key exchange failed: {}", self.id, e);
                    self.hs.jobs.kx_public = JobState::Failed(e);
                    return Err(AlertDescription::InternalError);
                }
            }
        }

        let Some(((), outcome)) = poll_job(&self.hs.jobs.kx_secret, io.crypto) else {
            return Ok(());
        };
        match outcome {
            Ok(JobOutput::Bytes(secret)) => {
                self.hs.jobs.kx_secret = JobState::Ready(Zeroizing::new(secret));
                Ok(())
            }
            Ok(_) => {
                debug!("{} peer key exchange value rejected", self.id);
                self.hs.jobs.kx_secret.reset();
                Err(AlertDescription::IllegalParameter)
            }
            Err(e) => {
                warn!("{} shared secret failed: {}", self.id, e);
                self.hs.jobs.kx_secret = JobState::Failed(e);
                Err(AlertDescription::InternalError)
            }
        }
    }

    /// Move finished job results into the handshake context.
    pub(crate) fn collect_results(&mut self) {
        let hs = &mut self.hs;
        if let Some(key) = hs.jobs.cert_verify.take_ready() {
            hs.peer_key = Some(key);
        }
        if hs.jobs.sig_verify.take_ready().is_some() {
            hs.signature_verified = true;
        }
        if let Some(public) = hs.jobs.kx_public.take_ready() {
            hs.kx_public = Some(public);
        }
        if let Some(secret) = hs.jobs.kx_secret.take_ready() {
            hs.premaster = Some(secret);
        }
        if let Some(signature) = hs.jobs.sig_gen.take_ready() {
            hs.signature = Some(signature);
        }
    }

    /// Submit a job that only needs the peer's certificate list.
    pub(crate) fn start_chain_verify(&mut self, io: &mut Io<'_>, certificates: &[u8]) -> Result<(), AlertDescription> {
        let anchor = self
            .config
            .trust_anchor()
            .ok_or(AlertDescription::InternalError)?;
        let request = JobRequest::VerifyChain { certificates, anchor };
        start_job(&mut self.hs.jobs.cert_verify, io.crypto, self.id, request, ())
    }

    pub(crate) fn start_key_exchange_public(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        start_job(
            &mut self.hs.jobs.kx_public,
            io.crypto,
            self.id,
            JobRequest::KeyExchangePublic,
            (),
        )
    }

    pub(crate) fn start_key_exchange_secret(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let peer = self.hs.peer_point.as_deref().ok_or(AlertDescription::InternalError)?;
        let request = JobRequest::KeyExchangeSecret { peer };
        start_job(&mut self.hs.jobs.kx_secret, io.crypto, self.id, request, ())
    }

    pub(crate) fn start_signature_verify(
        &mut self,
        io: &mut Io<'_>,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), AlertDescription> {
        let public_key = self.hs.peer_key.as_deref().ok_or(AlertDescription::InternalError)?;
        let request = JobRequest::Verify {
            public_key,
            data,
            signature,
        };
        start_job(&mut self.hs.jobs.sig_verify, io.crypto, self.id, request, ())
    }

    /// Handshake complete.
    pub(crate) fn enter_ok(&mut self) {
        info!("{} connected ({:?})", self.id, self.params.suite);
        self.state = crate::types::State::Ok;
        self.hs.finish(&self.config);
        self.events.push_back(crate::connection::Event::Connected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn psk_premaster_layout() {
        let pms = psk_premaster(&[0xAA, 0xBB]);
        assert_eq!(&pms[..], &[0, 2, 0, 0, 0, 2, 0xAA, 0xBB]);
    }

    #[test]
    fn transcript_overflow_is_internal_error() {
        let config = Config::builder(
            Role::Client,
            TransportKind::Stream,
            crate::CipherSuite::PSK_AES_128_GCM_SHA256,
        )
        .psk(b"id", b"key")
        .transcript_size(8)
        .build()
        .unwrap();
        let mut hs = HandshakeContext::new(&config);
        assert!(hs.append_transcript(&[0; 6]).is_ok());
        assert_eq!(
            hs.append_transcript(&[0; 3]),
            Err(AlertDescription::InternalError)
        );
        assert_eq!(hs.transcript.len(), 6);
    }

    struct Discard;

    impl crate::engine::Transport for Discard {
        fn send(
            &mut self,
            _id: crate::engine::ConnectionId,
            _to: Option<std::net::SocketAddr>,
            _data: &[u8],
        ) -> Result<(), crate::error::TransportError> {
            Ok(())
        }
    }

    fn fragment(length: usize, offset: usize, body: &[u8]) -> Vec<u8> {
        let header = HandshakeHeader {
            msg_type: HandshakeType::ClientHello,
            length,
            message_seq: 0,
            fragment_offset: offset,
            fragment_length: body.len(),
        };
        let mut out = Vec::new();
        header.serialize(&mut out, TransportKind::Datagram);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn fragment_with_other_length_is_not_appended() {
        let config = std::sync::Arc::new(
            Config::builder(
                Role::Server,
                TransportKind::Datagram,
                crate::CipherSuite::PSK_NULL_SHA256,
            )
            .psk(b"id", b"key")
            .build()
            .unwrap(),
        );
        let channel = crate::connection::Channel::new();
        channel.open(0, &config);
        let mut conn = Connection::new(crate::engine::ConnectionId::new(0, 0), config).unwrap();
        let mut crypto = crate::SoftwareCryptoService::new();
        let mut transport = Discard;
        let mut io = Io {
            crypto: &mut crypto,
            transport: &mut transport,
            channel: &channel,
        };

        conn.handle_datagram_fragment(&mut io, &fragment(100, 0, &[7; 50])).unwrap();
        assert_eq!(conn.hs.assembled, 50);

        // Claims the message ends here, while the first fragment said 100.
        conn.handle_datagram_fragment(&mut io, &fragment(60, 50, &[7; 10])).unwrap();
        assert_eq!(conn.hs.assembled, 50);
        assert_eq!(conn.hs.next_receive_seq, 0);
    }

    #[test]
    fn finish_keeps_flight_and_sequencing() {
        let config = Config::builder(
            Role::Server,
            TransportKind::Datagram,
            crate::CipherSuite::PSK_NULL_SHA256,
        )
        .psk(b"id", b"key")
        .build()
        .unwrap();
        let mut hs = HandshakeContext::new(&config);
        hs.flight.extend_from_slice(&[0, 1, 9]).unwrap();
        hs.timer.start();
        hs.send_seq = 4;
        hs.next_receive_seq = 5;
        hs.append_transcript(&[1, 2, 3]).unwrap();
        hs.client_random = Some([1; 32]);

        hs.finish(&config);
        assert_eq!(&hs.flight[..], &[0, 1, 9]);
        assert!(hs.timer.is_armed());
        assert_eq!((hs.send_seq, hs.next_receive_seq), (4, 5));
        assert!(hs.transcript.is_empty());
        assert!(hs.client_random.is_none());
    }
}
