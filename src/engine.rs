//! The engine facade: a fixed arena of connections driven from outside.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::arena::Arena;
use crate::config::Config;
use crate::connection::{lock, Channel, Connection, Event, Io};
use crate::crypto::CryptoService;
use crate::error::TransportError;
use crate::types::{AlertDescription, ConnectionState, Role, State, TransportKind};
use crate::Error;

/// Handle of an open connection.
///
/// The generation makes handles of released connections invalid, even when
/// their slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: u32,
    generation: u32,
}

impl ConnectionId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        ConnectionId {
            index: index as u32,
            generation,
        }
    }

    /// Slot of the connection in the engine.
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn[{}.{}]", self.index, self.generation)
    }
}

/// Where outgoing wire bytes go.
pub trait Transport {
    /// Send one record (stream) or datagram. `to` is the bound peer of a
    /// datagram server, `None` otherwise.
    fn send(&mut self, id: ConnectionId, to: Option<SocketAddr>, data: &[u8]) -> Result<(), TransportError>;
}

/// Something for the upper layer, see [`Engine::poll_output`].
#[derive(Debug, PartialEq, Eq)]
pub enum Output<'a> {
    /// Handshake complete.
    Connected(ConnectionId),
    /// Received application data, copied into the caller's buffer.
    ApplicationData { id: ConnectionId, data: &'a [u8] },
    /// Application payload bytes the stream transport confirmed as sent.
    TxConfirmed { id: ConnectionId, len: usize },
    /// Closed gracefully.
    Closed(ConnectionId),
    /// Ended by an error. `alert` is the fatal alert sent or received, if any.
    Failed {
        id: ConnectionId,
        alert: Option<AlertDescription>,
    },
    /// Nothing to report.
    Idle,
}

/// Ingress entry points that may run outside the engine's owner.
///
/// Only the receive and transmit buffers of a slot are touched, each under its
/// own lock.
#[derive(Clone)]
pub struct Ingress {
    channels: Arc<[Channel]>,
}

impl Ingress {
    fn channel(&self, id: ConnectionId) -> Result<&Channel, Error> {
        let channel = self.channels.get(id.index()).ok_or(Error::InvalidHandle)?;
        if channel.generation() != id.generation {
            return Err(Error::InvalidHandle);
        }
        Ok(channel)
    }

    /// Bytes received from the transport. `from` is the sender of a datagram.
    ///
    /// The data is taken whole or not at all.
    pub fn rx_indication(&self, id: ConnectionId, from: Option<SocketAddr>, data: &[u8]) -> Result<(), Error> {
        let channel = self.channel(id)?;
        let mut rx = lock(&channel.rx);

        if rx.bind_peer {
            match (rx.peer, from) {
                (None, Some(addr)) => {
                    debug!("{} bound to {}", id, addr);
                    rx.peer = Some(addr);
                }
                (Some(bound), Some(addr)) if bound != addr => {
                    debug!("{} dropping datagram from {} (bound to {})", id, addr, bound);
                    return Ok(());
                }
                _ => {}
            }
        }

        if rx.buf.free() < data.len() {
            debug!(
                "{} receive buffer full: {} + {} > {}",
                id,
                rx.buf.len(),
                data.len(),
                rx.buf.capacity()
            );
            return Err(Error::BufferFull);
        }
        trace!("{} received {} bytes ({:?})", id, data.len(), rx.kind);
        rx.push(data)
    }

    /// The stream transport flushed `len` more bytes.
    pub fn tx_confirmation(&self, id: ConnectionId, len: usize) -> Result<(), Error> {
        let channel = self.channel(id)?;
        let mut tx = lock(&channel.tx);
        let done = tx.confirm.confirm(len);
        tx.confirmed.extend(done);
        Ok(())
    }
}

/// A set of TLS and DTLS connections sharing one crypto service.
pub struct Engine {
    connections: Arena<Connection>,
    ingress: Ingress,
    crypto: Box<dyn CryptoService>,
    /// Next slot to report output for.
    cursor: usize,
}

impl Engine {
    /// Create an engine with room for `capacity` connections.
    pub fn new(capacity: usize, crypto: Box<dyn CryptoService>) -> Self {
        let channels: Arc<[Channel]> = (0..capacity).map(|_| Channel::new()).collect();
        Engine {
            connections: Arena::with_capacity(capacity),
            ingress: Ingress { channels },
            crypto,
            cursor: 0,
        }
    }

    /// Handle for feeding ingress from another context.
    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    /// Open a connection. A client waits for [`Engine::connect`], a server for
    /// the peer's hello.
    pub fn open(&mut self, config: Arc<Config>) -> Result<ConnectionId, Error> {
        let (index, generation) = self.connections.vacant()?;
        let id = ConnectionId::new(index, generation);
        let connection = Connection::new(id, config.clone())?;

        self.ingress.channels[index].open(generation, &config);
        self.connections.insert(connection)?;
        info!(
            "{} open {:?} {:?} {:?}",
            id,
            config.role(),
            config.transport(),
            config.cipher_suite()
        );
        Ok(id)
    }

    fn connection(&mut self, id: ConnectionId) -> Result<&mut Connection, Error> {
        self.connections
            .get_mut(id.index(), id.generation)
            .ok_or(Error::InvalidHandle)
    }

    /// Start the client handshake.
    pub fn connect(&mut self, id: ConnectionId) -> Result<(), Error> {
        self.connection(id)?.start_handshake();
        Ok(())
    }

    /// Run every active connection once.
    pub fn tick(&mut self, transport: &mut dyn Transport) {
        let channels = &self.ingress.channels;
        for (index, _, connection) in self.connections.iter_mut() {
            let mut io = Io {
                crypto: &mut *self.crypto,
                transport: &mut *transport,
                channel: &channels[index],
            };
            connection.tick(&mut io);
        }
    }

    /// Queue application data. Returns how many bytes were taken.
    ///
    /// A datagram client that has not started yet starts its handshake and
    /// reports [`Error::NotConnected`], retry once connected.
    pub fn send(&mut self, id: ConnectionId, data: &[u8]) -> Result<usize, Error> {
        let channels = &self.ingress.channels;
        let connection = self
            .connections
            .get_mut(id.index(), id.generation)
            .ok_or(Error::InvalidHandle)?;

        if connection.state == State::Default
            && connection.role == Role::Client
            && connection.kind == TransportKind::Datagram
        {
            connection.start_handshake();
            return Err(Error::NotConnected);
        }

        connection.write_application(&channels[id.index()], data)
    }

    /// See [`Ingress::rx_indication`].
    pub fn rx_indication(&self, id: ConnectionId, from: Option<SocketAddr>, data: &[u8]) -> Result<(), Error> {
        self.ingress.rx_indication(id, from, data)
    }

    /// See [`Ingress::tx_confirmation`].
    pub fn tx_confirmation(&self, id: ConnectionId, len: usize) -> Result<(), Error> {
        self.ingress.tx_confirmation(id, len)
    }

    /// Close a connection.
    ///
    /// A graceful close sends close_notify after queued data and reports
    /// [`Output::Closed`]. An abort stops at once and reports nothing.
    pub fn close(&mut self, id: ConnectionId, abort: bool) -> Result<(), Error> {
        let channels = &self.ingress.channels;
        let connection = self
            .connections
            .get_mut(id.index(), id.generation)
            .ok_or(Error::InvalidHandle)?;

        if abort || connection.state == State::Default {
            connection.abort();
            lock(&channels[id.index()].tx).queue.clear();
        } else {
            connection.close_request = true;
        }
        Ok(())
    }

    /// Current state of the connection.
    pub fn state(&self, id: ConnectionId) -> Result<State, Error> {
        self.connections
            .get(id.index(), id.generation)
            .map(|c| c.state)
            .ok_or(Error::InvalidHandle)
    }

    pub fn connection_state(&self, id: ConnectionId) -> Result<ConnectionState, Error> {
        let state = self.state(id)?;
        Ok(if state == State::Ok {
            ConnectionState::Connected
        } else {
            ConnectionState::NotConnected
        })
    }

    /// Next output of any connection. Application data is copied into `buf`,
    /// a record larger than `buf` is returned over several calls.
    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Output<'a> {
        let capacity = self.connections.capacity();

        for n in 0..capacity {
            let index = (self.cursor + n) % capacity;
            let Some((_, connection)) = self.connections.at_mut(index) else {
                continue;
            };
            let id = connection.id;

            if let Some(event) = connection.next_event() {
                self.cursor = index;
                return match event {
                    Event::Connected => Output::Connected(id),
                    Event::TxConfirmed(len) => Output::TxConfirmed { id, len },
                    Event::Closed => Output::Closed(id),
                    Event::Failed(alert) => Output::Failed { id, alert },
                };
            }

            if !connection.app_rx.is_empty() && !buf.is_empty() {
                let len = connection.app_rx.len().min(buf.len());
                buf[..len].copy_from_slice(&connection.app_rx[..len]);
                connection.app_rx.consume(len);
                self.cursor = (index + 1) % capacity;
                return Output::ApplicationData { id, data: &buf[..len] };
            }
        }

        Output::Idle
    }

    /// Free the slot. The handle and any copies become invalid.
    pub fn release(&mut self, id: ConnectionId) -> Result<(), Error> {
        let (connection, generation) = self
            .connections
            .remove(id.index(), id.generation)
            .ok_or(Error::InvalidHandle)?;
        self.crypto.release(id);
        self.ingress.channels[id.index()].retire(generation);
        debug!("{} released in {:?}", id, connection.state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SoftwareCryptoService;
    use crate::types::CipherSuite;

    struct Sink(Vec<Vec<u8>>);

    impl Transport for Sink {
        fn send(&mut self, _: ConnectionId, _: Option<SocketAddr>, data: &[u8]) -> Result<(), TransportError> {
            self.0.push(data.to_vec());
            Ok(())
        }
    }

    fn config(role: Role, transport: TransportKind) -> Arc<Config> {
        Arc::new(
            Config::builder(role, transport, CipherSuite::PSK_NULL_SHA256)
                .psk(b"id", b"key")
                .max_record_size(256)
                .build()
                .unwrap(),
        )
    }

    fn engine(capacity: usize) -> Engine {
        Engine::new(capacity, Box::new(SoftwareCryptoService::new()))
    }

    #[test]
    fn released_handles_are_invalid() {
        let _ = env_logger::try_init();
        let mut engine = engine(1);
        let id = engine.open(config(Role::Server, TransportKind::Stream)).unwrap();
        assert!(matches!(
            engine.open(config(Role::Server, TransportKind::Stream)),
            Err(Error::NoFreeSlot)
        ));

        let ingress = engine.ingress();
        engine.release(id).unwrap();
        assert!(matches!(engine.state(id), Err(Error::InvalidHandle)));
        assert!(matches!(
            ingress.rx_indication(id, None, b"x"),
            Err(Error::InvalidHandle)
        ));

        let again = engine.open(config(Role::Server, TransportKind::Stream)).unwrap();
        assert_eq!(again.index(), id.index());
        assert_ne!(again, id);
        assert_eq!(engine.state(again).unwrap(), State::Default);
        assert_eq!(
            engine.connection_state(again).unwrap(),
            ConnectionState::NotConnected
        );
    }

    #[test]
    fn datagram_server_binds_first_sender() {
        let mut engine = engine(1);
        let id = engine.open(config(Role::Server, TransportKind::Datagram)).unwrap();
        let a: SocketAddr = "10.0.0.1:5684".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5684".parse().unwrap();

        engine.rx_indication(id, Some(a), &[1, 2]).unwrap();
        engine.rx_indication(id, Some(b), &[3]).unwrap();

        let channel = &engine.ingress.channels[0];
        let rx = lock(&channel.rx);
        assert_eq!(rx.peer, Some(a));
        assert_eq!(&rx.buf[..], &[1, 2]);
    }

    #[test]
    fn receive_buffer_overflow() {
        let mut engine = engine(1);
        let id = engine.open(config(Role::Server, TransportKind::Stream)).unwrap();
        engine.rx_indication(id, None, &[0; 500]).unwrap();
        assert!(matches!(
            engine.rx_indication(id, None, &[0; 100]),
            Err(Error::BufferFull)
        ));
    }

    #[test]
    fn datagram_client_send_starts_handshake() {
        let _ = env_logger::try_init();
        let mut engine = engine(2);
        let id = engine.open(config(Role::Client, TransportKind::Datagram)).unwrap();
        assert!(matches!(engine.send(id, b"hello"), Err(Error::NotConnected)));
        assert_eq!(engine.state(id).unwrap(), State::Start);

        let mut sink = Sink(Vec::new());
        for _ in 0..5 {
            engine.tick(&mut sink);
        }
        assert_eq!(engine.state(id).unwrap(), State::ClientHelloDone);
        assert_eq!(sink.0.len(), 1);
        // Record header then ClientHello.
        assert_eq!(&sink.0[0][..3], &[22, 0xFE, 0xFD]);
        assert_eq!(sink.0[0][13], 1);
    }

    #[test]
    fn abort_is_silent() {
        let mut engine = engine(1);
        let id = engine.open(config(Role::Client, TransportKind::Stream)).unwrap();
        engine.connect(id).unwrap();
        engine.close(id, true).unwrap();
        assert_eq!(engine.state(id).unwrap(), State::Closed);

        let mut sink = Sink(Vec::new());
        engine.tick(&mut sink);
        assert!(sink.0.is_empty());
        let mut buf = [0u8; 16];
        assert_eq!(engine.poll_output(&mut buf), Output::Idle);
    }
}
