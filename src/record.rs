//! Record layer.
//!
//! Header codec, AEAD associated data and nonces, and the record send and
//! receive paths of a [`Connection`]. Protection runs through crypto jobs:
//! outbound protected records wait in the transmit queue and are sealed one
//! at a time in sequence order, inbound records are opened one at a time.

use zeroize::Zeroizing;

use crate::connection::{lock, Connection, Io};
use crate::crypto::{poll_job, start_job, JobOutput, JobRequest, RecordMeta};
use crate::types::{AlertDescription, CipherSuiteParams, ContentType, Role, State, TransportKind};

/// Explicit nonce carried in every AEAD record.
pub(crate) const EXPLICIT_NONCE_LEN: usize = 8;

/// GCM authentication tag length.
pub(crate) const TAG_LEN: usize = 16;

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub ctype: u8,
    pub version: u16,
    pub epoch: u16,
    pub seq: u64,
    pub length: usize,
}

/// Write a record header at `pos`.
///
/// `buf` must hold at least `pos + kind.record_header_len()` bytes.
pub(crate) fn write_header(
    buf: &mut [u8],
    pos: usize,
    kind: TransportKind,
    ctype: ContentType,
    epoch: u16,
    seq: u64,
    length: usize,
) {
    let out = &mut buf[pos..pos + kind.record_header_len()];
    out[0] = ctype.into();
    out[1..3].copy_from_slice(&kind.version().to_be_bytes());
    match kind {
        TransportKind::Stream => {
            out[3..5].copy_from_slice(&(length as u16).to_be_bytes());
        }
        TransportKind::Datagram => {
            out[3..5].copy_from_slice(&epoch.to_be_bytes());
            out[5..11].copy_from_slice(&seq.to_be_bytes()[2..]);
            out[11..13].copy_from_slice(&(length as u16).to_be_bytes());
        }
    }
}

/// Parse a record header. `None` if fewer than a header's worth of bytes.
pub(crate) fn parse_header(input: &[u8], kind: TransportKind) -> Option<RecordHeader> {
    if input.len() < kind.record_header_len() {
        return None;
    }
    let version = u16::from_be_bytes([input[1], input[2]]);
    let header = match kind {
        TransportKind::Stream => RecordHeader {
            ctype: input[0],
            version,
            epoch: 0,
            seq: 0,
            length: u16::from_be_bytes([input[3], input[4]]) as usize,
        },
        TransportKind::Datagram => {
            let mut seq = [0u8; 8];
            seq[2..].copy_from_slice(&input[5..11]);
            RecordHeader {
                ctype: input[0],
                version,
                epoch: u16::from_be_bytes([input[3], input[4]]),
                seq: u64::from_be_bytes(seq),
                length: u16::from_be_bytes([input[11], input[12]]) as usize,
            }
        }
    };
    Some(header)
}

/// Sequence number as used in AAD and MAC input.
///
/// For datagrams the epoch occupies the top 16 bits.
pub(crate) fn seq64(kind: TransportKind, epoch: u16, seq: u64) -> u64 {
    match kind {
        TransportKind::Stream => seq,
        TransportKind::Datagram => ((epoch as u64) << 48) | (seq & 0xFFFF_FFFF_FFFF),
    }
}

/// `seq(8) | type(1) | version(2) | length(2)`
pub(crate) fn aad(seq: u64, ctype: ContentType, version: u16, length: usize) -> [u8; 13] {
    let mut aad = [0u8; 13];
    aad[..8].copy_from_slice(&seq.to_be_bytes());
    aad[8] = ctype.into();
    aad[9..11].copy_from_slice(&version.to_be_bytes());
    aad[11..].copy_from_slice(&(length as u16).to_be_bytes());
    aad
}

/// Fixed IV followed by the explicit nonce.
pub(crate) fn nonce(iv: &[u8], explicit: &[u8]) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&iv[..4]);
    nonce[4..].copy_from_slice(&explicit[..EXPLICIT_NONCE_LEN]);
    nonce
}

/// MAC input of a NULL cipher record: the AAD followed by the payload.
pub(crate) fn mac_input(seq: u64, ctype: ContentType, version: u16, payload: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(13 + payload.len());
    input.extend_from_slice(&aad(seq, ctype, version, payload.len()));
    input.extend_from_slice(payload);
    input
}

/// Bytes a protected record adds on top of its payload, header excluded.
pub(crate) fn protection_overhead(params: &CipherSuiteParams) -> usize {
    if params.is_aead() {
        EXPLICIT_NONCE_LEN + TAG_LEN
    } else {
        params.mac_len
    }
}

/// Read or write half of a connection.
#[derive(Debug, Default)]
pub(crate) struct Direction {
    pub epoch: u16,
    pub seq: u64,
    /// Switched by ChangeCipherSpec.
    pub protected: bool,
    pub keys_installed: bool,
    pub mac_key: Zeroizing<Vec<u8>>,
    pub key: Zeroizing<Vec<u8>>,
    pub iv: Zeroizing<Vec<u8>>,
}

impl Direction {
    /// Apply a ChangeCipherSpec: new epoch, sequence restarts.
    pub fn switch(&mut self) {
        self.epoch += 1;
        self.seq = 0;
        self.protected = true;
    }

    pub fn install(&mut self, mac_key: &[u8], key: &[u8], iv: &[u8]) {
        self.mac_key = Zeroizing::new(mac_key.to_vec());
        self.key = Zeroizing::new(key.to_vec());
        self.iv = Zeroizing::new(iv.to_vec());
        self.keys_installed = true;
    }
}

impl Connection {
    /// Record overhead including the header, for the current write state.
    pub(crate) fn record_overhead(&self) -> usize {
        let header = self.kind.record_header_len();
        if self.write.protected {
            header + protection_overhead(self.params)
        } else {
            header
        }
    }

    /// Largest payload that fits one outgoing record.
    pub(crate) fn max_record_payload(&self) -> usize {
        self.transmit_limit.saturating_sub(self.record_overhead()).max(1)
    }

    /// Send one record.
    ///
    /// Plaintext records go straight to the transport. Once the write side is
    /// protected, records are queued and sealed in order by the tick.
    pub(crate) fn send_record(
        &mut self,
        io: &mut Io<'_>,
        ctype: ContentType,
        payload: &[u8],
    ) -> Result<(), AlertDescription> {
        let retain = self.kind == TransportKind::Datagram
            && self.state != State::Ok
            && ctype != ContentType::Alert;

        if self.write.protected {
            return self.queue_record(io, ctype, payload, retain);
        }

        let header = self.kind.record_header_len();
        let mut wire = vec![0u8; header];
        write_header(&mut wire, 0, self.kind, ctype, self.write.epoch, self.write.seq, payload.len());
        wire.extend_from_slice(payload);
        self.write.seq += 1;

        self.transmit(io, &wire, ctype, retain)
    }

    /// Queue a plaintext record for protection.
    ///
    /// Layout: `type(1) | retain(1) | length(2) | payload`.
    pub(crate) fn queue_record(
        &mut self,
        io: &mut Io<'_>,
        ctype: ContentType,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), AlertDescription> {
        lock(&io.channel.tx).enqueue(ctype, retain, payload).map_err(|_| {
            warn!("{} transmit queue full, dropping {:?}", self.id, ctype);
            AlertDescription::InternalError
        })
    }

    /// Hand a finished record to the transport.
    pub(crate) fn transmit(
        &mut self,
        io: &mut Io<'_>,
        wire: &[u8],
        ctype: ContentType,
        retain: bool,
    ) -> Result<(), AlertDescription> {
        if self.tx_error {
            return Err(AlertDescription::InternalError);
        }

        let stream = self.kind == TransportKind::Stream;
        if stream && !lock(&io.channel.tx).confirm.has_room(1) {
            warn!("{} transmit confirmation queue full", self.id);
            return Err(AlertDescription::InternalError);
        }

        let remote = self.remote(io);
        if let Err(e) = io.transport.send(self.id, remote, wire) {
            warn!("{} transport send failed: {}", self.id, e);
            self.tx_error = true;
            return Err(AlertDescription::InternalError);
        }
        trace!("{} sent {:?} record, {} bytes", self.id, ctype, wire.len());

        if stream {
            let mut tx = lock(&io.channel.tx);
            tx.confirm
                .push(wire.len(), ctype)
                .map_err(|_| AlertDescription::InternalError)?;
        } else if retain {
            self.retain_datagram(wire)?;
        }
        Ok(())
    }

    /// Start sealing the next queued record, if the write side is ready.
    pub(crate) fn protect_next(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        if !self.write.protected
            || !self.write.keys_installed
            || self.jobs.tx_in_flight()
            || self.tx_error
            || matches!(self.state, State::Closed | State::Error)
        {
            return Ok(());
        }

        let stream = self.kind == TransportKind::Stream;
        let (ctype, retain) = {
            let mut tx = lock(&io.channel.tx);
            if tx.queue.len() < 4 {
                return Ok(());
            }
            if stream && !tx.confirm.has_room(1) {
                // Wait for the transport to confirm earlier records.
                return Ok(());
            }
            let ctype = ContentType::try_from(tx.queue[0])?;
            let retain = tx.queue[1] != 0;
            let len = u16::from_be_bytes([tx.queue[2], tx.queue[3]]) as usize;
            self.staging.clear();
            self.staging.extend_from_slice(&tx.queue[4..4 + len]);
            tx.queue.consume(4 + len);
            (ctype, retain)
        };

        let meta = RecordMeta {
            ctype,
            epoch: self.write.epoch,
            seq: self.write.seq,
            retain,
        };
        self.write.seq += 1;

        let seq = seq64(self.kind, meta.epoch, meta.seq);
        let version = self.kind.version();

        if self.params.is_aead() {
            let explicit = seq.to_be_bytes();
            let nonce = nonce(&self.write.iv, &explicit);
            let aad = aad(seq, ctype, version, self.staging.len());
            let request = JobRequest::AeadSeal {
                key: &self.write.key,
                nonce: &nonce,
                aad: &aad,
                plaintext: &self.staging,
            };
            start_job(&mut self.jobs.encrypt, io.crypto, self.id, request, meta)
        } else {
            let alg = self.params.mac.ok_or(AlertDescription::InternalError)?;
            let input = mac_input(seq, ctype, version, &self.staging);
            let request = JobRequest::Mac {
                alg,
                key: &self.write.mac_key,
                data: &input,
            };
            start_job(&mut self.jobs.mac_gen, io.crypto, self.id, request, meta)
        }
    }

    /// Poll the sealing job and transmit the finished record.
    pub(crate) fn drive_encrypt(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let Some((meta, outcome)) = poll_job(&self.jobs.encrypt, io.crypto) else {
            return Ok(());
        };
        self.jobs.encrypt.reset();

        let ciphertext = match outcome {
            Ok(JobOutput::Bytes(c)) => c,
            Ok(other) => {
                warn!("{} encrypt returned {:?}", self.id, other);
                return Err(AlertDescription::InternalError);
            }
            Err(e) => {
                warn!("{} encrypt failed: {}", self.id, e);
                return Err(AlertDescription::InternalError);
            }
        };

        let header = self.kind.record_header_len();
        let body_len = EXPLICIT_NONCE_LEN + ciphertext.len();
        let mut wire = vec![0u8; header];
        write_header(&mut wire, 0, self.kind, meta.ctype, meta.epoch, meta.seq, body_len);
        wire.extend_from_slice(&seq64(self.kind, meta.epoch, meta.seq).to_be_bytes());
        wire.extend_from_slice(&ciphertext);

        self.transmit(io, &wire, meta.ctype, meta.retain)
    }

    /// Poll the MAC generation job and transmit the finished record.
    pub(crate) fn drive_mac_gen(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let Some((meta, outcome)) = poll_job(&self.jobs.mac_gen, io.crypto) else {
            return Ok(());
        };
        self.jobs.mac_gen.reset();

        let mac = match outcome {
            Ok(JobOutput::Bytes(m)) => m,
            Ok(other) => {
                warn!("{} MAC generation returned {:?}", self.id, other);
                return Err(AlertDescription::InternalError);
            }
            Err(e) => {
                warn!("{} MAC generation failed: {}", self.id, e);
                return Err(AlertDescription::InternalError);
            }
        };

        let header = self.kind.record_header_len();
        let mut wire = vec![0u8; header];
        write_header(
            &mut wire,
            0,
            self.kind,
            meta.ctype,
            meta.epoch,
            meta.seq,
            self.staging.len() + mac.len(),
        );
        wire.extend_from_slice(&self.staging);
        wire.extend_from_slice(&mac);

        self.transmit(io, &wire, meta.ctype, meta.retain)
    }

    /// Whether the receive path may take another record.
    fn receive_open(&self) -> bool {
        !self.state.is_terminal()
            && !self.jobs.rx_in_flight()
            && !self.hs.jobs.blocks_receive()
            && self.app_rx.free() >= self.config.max_record_size()
    }

    /// Version check. Lenient (major byte) while the peer may still be
    /// negotiating: a server awaiting ClientHello and a datagram client
    /// awaiting HelloVerifyRequest.
    fn version_acceptable(&self, version: u16) -> bool {
        let expected = self.kind.version();
        let lenient = match self.role {
            Role::Server => self.state == State::Default,
            Role::Client => self.kind == TransportKind::Datagram && self.state == State::ClientHelloDone,
        };
        if lenient {
            version >> 8 == expected >> 8
        } else {
            version == expected
        }
    }

    /// Pull complete records out of the receive buffer while the gate is open.
    pub(crate) fn receive(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let header_len = self.kind.record_header_len();

        loop {
            if self.kind == TransportKind::Stream && self.receive_open() {
                self.process_fragments(io)?;
            }
            if !self.receive_open() {
                return Ok(());
            }

            let header = {
                let mut rx = lock(&io.channel.rx);
                let datagram = self.kind == TransportKind::Datagram;
                let available = rx.pending().len();
                let Some(header) = parse_header(rx.pending(), self.kind) else {
                    if datagram && available > 0 {
                        debug!("{} dropping {} trailing datagram bytes", self.id, available);
                        rx.discard_datagram();
                        continue;
                    }
                    return Ok(());
                };

                if header.length + header_len > self.config.max_record_size() {
                    rx.clear();
                    return Err(AlertDescription::RecordOverflow);
                }
                if !self.version_acceptable(header.version) {
                    debug!("{} bad record version {:04x}", self.id, header.version);
                    rx.clear();
                    return Err(AlertDescription::DecodeError);
                }
                if ContentType::try_from(header.ctype).is_err() {
                    debug!("{} bad content type {}", self.id, header.ctype);
                    rx.clear();
                    return Err(AlertDescription::DecodeError);
                }
                if available < header_len + header.length {
                    if datagram {
                        debug!("{} dropping truncated datagram record", self.id);
                        rx.discard_datagram();
                        continue;
                    }
                    return Ok(());
                }

                self.working.clear();
                self.working
                    .extend_from_slice(&rx.pending()[header_len..header_len + header.length]);
                rx.consume(header_len + header.length);
                header
            };

            self.process_record(io, header)?;
        }
    }

    fn process_record(&mut self, io: &mut Io<'_>, header: RecordHeader) -> Result<(), AlertDescription> {
        let ctype = ContentType::try_from(header.ctype)?;

        if self.kind == TransportKind::Datagram {
            if header.epoch != self.read.epoch {
                if self.read.epoch.checked_sub(1) == Some(header.epoch) && ctype == ContentType::Handshake {
                    self.resend_flight_once(io, "previous epoch handshake")?;
                }
                debug!(
                    "{} dropping record from epoch {} (current {})",
                    self.id, header.epoch, self.read.epoch
                );
                return Ok(());
            }
            if !self.window.check(header.seq) {
                debug!("{} dropping replayed record seq {}", self.id, header.seq);
                return Ok(());
            }
        }

        self.hs.record_seq = header.seq;

        let seq = match self.kind {
            TransportKind::Stream => self.read.seq,
            TransportKind::Datagram => header.seq,
        };
        let meta = RecordMeta {
            ctype,
            epoch: header.epoch,
            seq,
            retain: false,
        };

        if self.read.protected {
            return self.start_unprotect(io, meta);
        }

        self.accept_record(meta);
        let payload = std::mem::take(&mut self.working);
        let result = self.dispatch(io, ctype, &payload);
        self.working = payload;
        result
    }

    fn start_unprotect(&mut self, io: &mut Io<'_>, meta: RecordMeta) -> Result<(), AlertDescription> {
        let seq = seq64(self.kind, meta.epoch, meta.seq);
        let version = self.kind.version();

        if self.params.is_aead() {
            if self.working.len() < EXPLICIT_NONCE_LEN + TAG_LEN {
                return Err(AlertDescription::DecodeError);
            }
            let (explicit, ciphertext) = self.working.split_at(EXPLICIT_NONCE_LEN);
            let nonce = nonce(&self.read.iv, explicit);
            let aad = aad(seq, meta.ctype, version, ciphertext.len() - TAG_LEN);
            let request = JobRequest::AeadOpen {
                key: &self.read.key,
                nonce: &nonce,
                aad: &aad,
                ciphertext,
            };
            start_job(&mut self.jobs.decrypt, io.crypto, self.id, request, meta)
        } else {
            let alg = self.params.mac.ok_or(AlertDescription::InternalError)?;
            let mac_len = self.params.mac_len;
            if self.working.len() < mac_len {
                return Err(AlertDescription::DecodeError);
            }
            let (payload, tag) = self.working.split_at(self.working.len() - mac_len);
            let input = mac_input(seq, meta.ctype, version, payload);
            let request = JobRequest::MacVerify {
                alg,
                key: &self.read.mac_key,
                data: &input,
                tag,
            };
            start_job(&mut self.jobs.mac_verify, io.crypto, self.id, request, meta)
        }
    }

    /// Poll decryption and dispatch the plaintext.
    pub(crate) fn drive_decrypt(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let Some((meta, outcome)) = poll_job(&self.jobs.decrypt, io.crypto) else {
            return Ok(());
        };
        self.jobs.decrypt.reset();

        let plaintext = match outcome {
            Ok(JobOutput::Bytes(p)) => p,
            Ok(JobOutput::Rejected) => {
                debug!("{} record authentication failed", self.id);
                return Err(AlertDescription::BadRecordMac);
            }
            Ok(JobOutput::Verified) => return Err(AlertDescription::InternalError),
            Err(e) => {
                warn!("{} decrypt failed: {}", self.id, e);
                return Err(AlertDescription::InternalError);
            }
        };

        if self.state.is_terminal() {
            return Ok(());
        }
        self.accept_record(meta);
        self.dispatch(io, meta.ctype, &plaintext)
    }

    /// Poll MAC verification and dispatch the payload.
    pub(crate) fn drive_mac_verify(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        let Some((meta, outcome)) = poll_job(&self.jobs.mac_verify, io.crypto) else {
            return Ok(());
        };
        self.jobs.mac_verify.reset();

        match outcome {
            Ok(JobOutput::Verified) => {}
            Ok(JobOutput::Rejected) => {
                debug!("{} record MAC mismatch", self.id);
                return Err(AlertDescription::BadRecordMac);
            }
            Ok(JobOutput::Bytes(_)) => return Err(AlertDescription::InternalError),
            Err(e) => {
                warn!("{} MAC verify failed: {}", self.id, e);
                return Err(AlertDescription::InternalError);
            }
        }

        if self.state.is_terminal() {
            return Ok(());
        }
        self.accept_record(meta);
        let mut record = std::mem::take(&mut self.working);
        let payload_len = record.len() - self.params.mac_len;
        let result = self.dispatch(io, meta.ctype, &record[..payload_len]);
        record.clear();
        self.working = record;
        result
    }

    /// Advance replay state for a record that passed verification.
    fn accept_record(&mut self, meta: RecordMeta) {
        match self.kind {
            TransportKind::Datagram => self.window.update(meta.seq),
            TransportKind::Stream => {
                if meta.ctype != ContentType::ChangeCipherSpec {
                    self.read.seq += 1;
                }
            }
        }
    }

    fn dispatch(&mut self, io: &mut Io<'_>, ctype: ContentType, payload: &[u8]) -> Result<(), AlertDescription> {
        match ctype {
            ContentType::Handshake => self.handle_handshake_record(io, payload),
            ContentType::ChangeCipherSpec => {
                if payload != [1] {
                    return Err(AlertDescription::DecodeError);
                }
                self.handle_change_cipher_spec()
            }
            ContentType::ApplicationData => {
                if self.state != State::Ok {
                    return Err(AlertDescription::UnexpectedMessage);
                }
                trace!("{} received {} bytes application data", self.id, payload.len());
                self.app_rx
                    .extend_from_slice(payload)
                    .map_err(|_| AlertDescription::InternalError)
            }
            ContentType::Alert => self.handle_alert(payload),
        }
    }

    fn handle_alert(&mut self, payload: &[u8]) -> Result<(), AlertDescription> {
        if payload.len() != 2 {
            return Err(AlertDescription::DecodeError);
        }
        let level = payload[0];
        let description = AlertDescription::from_u8(payload[1]);

        if description == AlertDescription::CloseNotify {
            debug!("{} received close_notify", self.id);
            self.close_request = true;
            return Ok(());
        }

        if level == 2 {
            warn!("{} received fatal alert {}", self.id, description);
            self.alert = Some(description);
            self.error = true;
            self.state = State::Closing;
        } else {
            debug!("{} ignoring warning alert {}", self.id, description);
        }
        Ok(())
    }
}
