//! Per connection context and its tick.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::Buf;
use crate::config::Config;
use crate::crypto::{CryptoService, KeyRef, RecordJobs};
use crate::engine::{ConnectionId, Transport};
use crate::handshake::HandshakeContext;
use crate::record::Direction;
use crate::txconfirm::TxConfirmation;
use crate::types::{
    AlertDescription, AlertLevel, CipherSuiteParams, ContentType, Role, State, TransportKind,
};
use crate::window::ReplayWindow;
use crate::Error;

/// Lock a channel side. A poisoned lock still guards plain bytes, so the
/// guard is recovered.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Receive side shared with the ingress context.
#[derive(Debug)]
pub(crate) struct RxSide {
    pub buf: Buf,
    /// Datagram server: the bound remote address.
    pub peer: Option<SocketAddr>,
    pub kind: TransportKind,
    /// Bind the first sender and drop datagrams from anyone else.
    pub bind_peer: bool,
    /// Lengths of the datagrams in `buf` not yet fully parsed.
    pub datagrams: VecDeque<usize>,
}

impl RxSide {
    /// Append received bytes, keeping datagram bounds.
    pub fn push(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(data)?;
        if self.kind == TransportKind::Datagram && !data.is_empty() {
            self.datagrams.push_back(data.len());
        }
        Ok(())
    }

    /// Bytes records are parsed from: the current datagram, or the whole stream.
    pub fn pending(&self) -> &[u8] {
        match self.kind {
            TransportKind::Stream => &self.buf,
            TransportKind::Datagram => {
                let len = self.datagrams.front().copied().unwrap_or(0);
                &self.buf[..len]
            }
        }
    }

    pub fn consume(&mut self, n: usize) {
        self.buf.consume(n);
        if let Some(front) = self.datagrams.front_mut() {
            *front = front.saturating_sub(n);
            if *front == 0 {
                self.datagrams.pop_front();
            }
        }
    }

    /// Drop what is left of the current datagram.
    pub fn discard_datagram(&mut self) {
        if let Some(len) = self.datagrams.pop_front() {
            self.buf.consume(len);
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.datagrams.clear();
    }
}

/// Transmit side shared with the ingress context.
#[derive(Debug)]
pub(crate) struct TxSide {
    /// Records waiting for protection: `type(1) | retain(1) | length(2) | payload`.
    pub queue: Buf,
    pub confirm: TxConfirmation,
    /// Records confirmed by the transport, not yet reported.
    pub confirmed: VecDeque<(usize, ContentType)>,
}

impl TxSide {
    pub fn enqueue(&mut self, ctype: ContentType, retain: bool, payload: &[u8]) -> Result<(), Error> {
        if self.queue.free() < 4 + payload.len() {
            return Err(Error::BufferFull);
        }
        let len = (payload.len() as u16).to_be_bytes();
        self.queue
            .extend_from_slice(&[ctype.into(), retain as u8, len[0], len[1]])?;
        self.queue.extend_from_slice(payload)
    }
}

/// The two buffers the ingress handle may touch, per slot.
#[derive(Debug)]
pub(crate) struct Channel {
    generation: AtomicU32,
    pub rx: Mutex<RxSide>,
    pub tx: Mutex<TxSide>,
}

impl Channel {
    pub fn new() -> Self {
        Channel {
            generation: AtomicU32::new(0),
            rx: Mutex::new(RxSide {
                buf: Buf::with_capacity(0),
                peer: None,
                kind: TransportKind::Stream,
                bind_peer: false,
                datagrams: VecDeque::new(),
            }),
            tx: Mutex::new(TxSide {
                queue: Buf::with_capacity(0),
                confirm: TxConfirmation::new(1),
                confirmed: VecDeque::new(),
            }),
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    /// Size the buffers for a new connection and publish its generation.
    pub fn open(&self, generation: u32, config: &Config) {
        *lock(&self.rx) = RxSide {
            buf: Buf::with_capacity(config.rx_buffer_size()),
            peer: None,
            kind: config.transport(),
            bind_peer: config.transport() == TransportKind::Datagram && config.role() == Role::Server,
            datagrams: VecDeque::new(),
        };
        *lock(&self.tx) = TxSide {
            queue: Buf::with_capacity(config.tx_buffer_size()),
            confirm: TxConfirmation::new(config.tx_confirmation_depth()),
            confirmed: VecDeque::new(),
        };
        self.generation.store(generation, Ordering::Release);
    }

    /// Invalidate handles to the released connection and drop its bytes.
    pub fn retire(&self, generation: u32) {
        self.generation.store(generation, Ordering::Release);
        lock(&self.rx).clear();
        let mut tx = lock(&self.tx);
        tx.queue.clear();
        tx.confirmed.clear();
    }
}

/// Everything a connection needs from the outside during a tick.
pub(crate) struct Io<'a> {
    pub crypto: &'a mut dyn CryptoService,
    pub transport: &'a mut dyn Transport,
    pub channel: &'a Channel,
}

/// Notification for the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Connected,
    /// Application payload bytes confirmed by a stream transport.
    TxConfirmed(usize),
    Closed,
    Failed(Option<AlertDescription>),
}

impl Event {
    fn is_final(&self) -> bool {
        matches!(self, Event::Closed | Event::Failed(_))
    }
}

pub(crate) struct Connection {
    pub id: ConnectionId,
    pub config: Arc<Config>,
    pub params: &'static CipherSuiteParams,
    pub role: Role,
    pub kind: TransportKind,
    pub state: State,
    /// Cleared once closed. The slot stays until released.
    pub active: bool,

    pub read: Direction,
    pub write: Direction,
    pub hs: HandshakeContext,
    pub jobs: RecordJobs,
    pub window: ReplayWindow,

    /// Record under verification or decryption.
    pub working: Vec<u8>,
    /// Plaintext of the record being protected.
    pub staging: Vec<u8>,
    /// Application data waiting for pickup.
    pub app_rx: Buf,
    pub events: VecDeque<Event>,

    pub close_request: bool,
    pub error: bool,
    pub tx_error: bool,
    pub alert: Option<AlertDescription>,

    pub signing_key: Option<KeyRef>,
    pub resent_this_tick: bool,
    /// Largest record we may send, lowered by record_size_limit.
    pub transmit_limit: usize,
}

impl Connection {
    pub fn new(id: ConnectionId, config: Arc<Config>) -> Result<Connection, Error> {
        let suite = config.cipher_suite();
        let params = suite.params().ok_or(Error::UnsupportedCipherSuite(suite))?;
        let max_record = config.max_record_size();
        let signing_key = config.signing_key().map(|k| config.resolve_key(k));

        Ok(Connection {
            id,
            params,
            role: config.role(),
            kind: config.transport(),
            state: State::Default,
            active: true,
            read: Direction::default(),
            write: Direction::default(),
            hs: HandshakeContext::new(&config),
            jobs: RecordJobs::default(),
            window: ReplayWindow::new(),
            working: Vec::with_capacity(max_record),
            staging: Vec::with_capacity(max_record),
            app_rx: Buf::with_capacity(config.app_rx_buffer_size()),
            events: VecDeque::new(),
            close_request: false,
            error: false,
            tx_error: false,
            alert: None,
            signing_key,
            resent_this_tick: false,
            transmit_limit: max_record,
            config,
        })
    }

    pub(crate) fn set_state(&mut self, state: State) {
        if self.state != state {
            debug!("{} {:?} -> {:?}", self.id, self.state, state);
            self.state = state;
        }
    }

    /// Begin the handshake. Only a client in `Default` moves.
    pub(crate) fn start_handshake(&mut self) {
        if self.role == Role::Client && self.state == State::Default {
            self.set_state(State::Start);
        }
    }

    /// Destination for outgoing datagrams of a server.
    pub(crate) fn remote(&self, io: &Io<'_>) -> Option<SocketAddr> {
        match (self.kind, self.role) {
            (TransportKind::Datagram, Role::Server) => lock(&io.channel.rx).peer,
            _ => None,
        }
    }

    /// Queue application data, split to the record payload limit.
    ///
    /// Returns how many bytes were accepted.
    pub(crate) fn write_application(&mut self, channel: &Channel, data: &[u8]) -> Result<usize, Error> {
        if self.state != State::Ok || self.close_request {
            return Err(Error::NotConnected);
        }

        let max = self.max_record_payload();
        let mut tx = lock(&channel.tx);
        let mut accepted = 0;
        for chunk in data.chunks(max) {
            if tx.enqueue(ContentType::ApplicationData, false, chunk).is_err() {
                break;
            }
            accepted += chunk.len();
        }

        if accepted == 0 && !data.is_empty() {
            return Err(Error::Busy);
        }
        trace!("{} queued {} of {} bytes", self.id, accepted, data.len());
        Ok(accepted)
    }

    /// Send an alert record. Nothing is sent once closing.
    pub(crate) fn send_alert(&mut self, io: &mut Io<'_>, level: AlertLevel, description: AlertDescription) {
        if self.state.is_terminal() {
            return;
        }
        debug!("{} send {:?} alert {}", self.id, level, description);

        let payload = [level.as_u8(), description.as_u8()];
        if self.send_record(io, ContentType::Alert, &payload).is_err() {
            self.error = true;
            self.set_state(State::Closing);
            return;
        }

        if level == AlertLevel::Fatal || description == AlertDescription::CloseNotify {
            self.set_state(State::Closing);
            if description != AlertDescription::CloseNotify {
                self.error = true;
            }
        }
    }

    /// Abandon the connection with a fatal alert.
    pub(crate) fn fail(&mut self, io: &mut Io<'_>, alert: AlertDescription) {
        if self.state.is_terminal() {
            return;
        }
        warn!("{} failed in {:?}: {}", self.id, self.state, alert);

        if self.tx_error {
            self.error = true;
            self.set_state(State::Closing);
            return;
        }

        self.send_alert(io, AlertLevel::Fatal, alert);
        self.set_state(State::Closing);
        self.error = true;
        self.alert = Some(alert);
    }

    /// Abort: closed at once, nothing more is sent.
    pub(crate) fn abort(&mut self) {
        if matches!(self.state, State::Closed | State::Error) {
            return;
        }
        info!("{} aborted", self.id);
        self.set_state(State::Closed);
        self.active = false;
        self.hs.timer.stop();
    }

    /// Close and error processing.
    pub(crate) fn process_state(&mut self, io: &mut Io<'_>) {
        if self.state == State::Closing {
            let drained = {
                let mut tx = lock(&io.channel.tx);
                if self.write.protected && !self.write.keys_installed {
                    // Nothing queued can ever be sealed.
                    tx.queue.clear();
                }
                tx.queue.is_empty() || self.tx_error
            };
            if drained && !self.jobs.tx_in_flight() {
                self.finish_close();
            }
            return;
        }

        if self.close_request && !self.state.is_terminal() {
            self.close_request = false;
            self.send_alert(io, AlertLevel::Warning, AlertDescription::CloseNotify);
        }
    }

    fn finish_close(&mut self) {
        self.active = false;
        self.hs.timer.stop();
        if self.error {
            self.set_state(State::Error);
            self.events.push_back(Event::Failed(self.alert));
        } else {
            info!("{} closed", self.id);
            self.set_state(State::Closed);
            self.events.push_back(Event::Closed);
        }
    }

    /// Submit or poll every crypto job, in a fixed order.
    fn drive_jobs(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        self.drive_key_derive()?;
        self.drive_verify_data(io, true)?;
        self.drive_verify_data(io, false)?;
        self.drive_decrypt(io)?;
        self.drive_encrypt(io)?;
        self.drive_mac_gen(io)?;
        self.drive_mac_verify(io)?;
        self.drive_random(io)?;
        self.hs.jobs.prf.drive(io.crypto, self.id)?;
        self.drive_certificate_jobs(io)
    }

    fn step(&mut self, io: &mut Io<'_>) -> Result<(), AlertDescription> {
        if self.kind == TransportKind::Datagram {
            self.tick_retransmit(io)?;
            if self.role == Role::Server {
                self.drive_cookie(io)?;
            }
        }

        match self.role {
            Role::Client => self.client_tick(io)?,
            Role::Server => self.server_tick(io)?,
        }

        self.process_state(io);
        self.drive_jobs(io)?;
        self.receive(io)?;
        self.protect_next(io)
    }

    /// Run the connection once.
    pub(crate) fn tick(&mut self, io: &mut Io<'_>) {
        if !self.active {
            return;
        }
        self.resent_this_tick = false;

        if let Err(alert) = self.step(io) {
            self.fail(io, alert);
            // Closing may already be complete, e.g. a plaintext alert.
            self.process_state(io);
        }
        self.drain_confirmations(io);
    }

    /// Turn transport confirmations into events.
    fn drain_confirmations(&mut self, io: &mut Io<'_>) {
        if self.kind != TransportKind::Stream {
            return;
        }
        loop {
            let Some((len, ctype)) = lock(&io.channel.tx).confirmed.pop_front() else {
                return;
            };
            match ctype {
                ContentType::ApplicationData => {
                    let payload = len.saturating_sub(self.record_overhead());
                    self.events.push_back(Event::TxConfirmed(payload));
                }
                ContentType::Handshake | ContentType::Alert => {
                    debug!("{} {:?} record of {} bytes confirmed", self.id, ctype, len);
                }
                ContentType::ChangeCipherSpec => {}
            }
        }
    }

    /// Next event, holding back the final one while application data is
    /// still waiting.
    pub(crate) fn next_event(&mut self) -> Option<Event> {
        let front = self.events.front()?;
        if front.is_final() && !self.app_rx.is_empty() {
            return None;
        }
        self.events.pop_front()
    }
}
