//! Modbus TCP register server (serve role)
//!
//! A single task owns the listening socket and every client connection. Each
//! wake is driven by one readiness wait covering the accept, all clients and
//! the stop token. Requests are answered from the local [`RegisterMap`], and
//! every successful register write is relayed to the [`RecordSink`].

use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::Duration;

use bytes::BytesMut;
use futures::future::select_all;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::ValueType;
use crate::constants::{
    EXCEPTION_FLAG, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_TCP_FRAME_LEN,
};
use crate::descriptor_set::DescriptorSet;
use crate::error::{RelayError, RelayResult};
use crate::logging::hex_frame;
use crate::output::{build_records, Delivery, RecordSink, RecordSource};
use crate::protocol::{mbap_frame_len, reply_to_request, Framing};
use crate::register_map::RegisterMap;

/// Registers touched by a write request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRange {
    pub address: u16,
    pub count: u16,
}

/// Recognise FC06/FC16 requests in a raw frame.
///
/// `header_length` is the offset of the function code. FC06 always touches one
/// register; FC16 carries its count after the start address.
pub fn detect_write(frame: &[u8], header_length: usize) -> Option<WriteRange> {
    let pdu = frame.get(header_length..)?;
    let field = |offset: usize| -> Option<u16> {
        pdu.get(offset..offset + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    };

    match *pdu.first()? {
        FC_WRITE_SINGLE_REGISTER => Some(WriteRange {
            address: field(1)?,
            count: 1,
        }),
        FC_WRITE_MULTIPLE_REGISTERS => Some(WriteRange {
            address: field(1)?,
            count: field(3)?,
        }),
        _ => None,
    }
}

/// One accepted client
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: BytesMut,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::with_capacity(MAX_TCP_FRAME_LEN),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

enum Wake {
    Stop,
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Readable,
}

/// What to do with a connection after servicing it
enum Service {
    Keep,
    Close,
    Stop,
}

pub struct Listener<S> {
    listener: TcpListener,
    connections: DescriptorSet<Connection>,
    map: RegisterMap,
    sink: S,
    framing: Framing,
    reply_timeout: Duration,
}

impl<S: RecordSink> Listener<S> {
    /// Bind the server socket
    pub async fn bind(addr: SocketAddr, map: RegisterMap, sink: S) -> RelayResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::connection(format!("Unable to listen on {}: {}", addr, e)))?;
        Ok(Self::with_listener(listener, map, sink))
    }

    pub fn with_listener(listener: TcpListener, map: RegisterMap, sink: S) -> Self {
        let listen_fd = listener.as_raw_fd();
        Self {
            listener,
            connections: DescriptorSet::new(listen_fd),
            map,
            sink,
            framing: Framing::Tcp,
            reply_timeout: Duration::from_millis(1000),
        }
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Highest descriptor in use, the listening socket included
    pub fn max_fd(&self) -> std::os::fd::RawFd {
        self.connections.max_fd()
    }

    /// Serve until `token` is cancelled, then close every client
    pub async fn run(&mut self, token: &CancellationToken) -> RelayResult<()> {
        info!(
            "Serving {} holding registers on {}",
            self.map.len(),
            self.local_addr()?
        );

        let result = self.serve(token).await;

        for (fd, conn) in self.connections.drain() {
            debug!("Closing connection {} (fd {})", conn.peer, fd);
        }
        result
    }

    async fn serve(&mut self, token: &CancellationToken) -> RelayResult<()> {
        loop {
            match self.wait(token).await {
                Wake::Stop => return Ok(()),
                Wake::Accepted(Ok((stream, peer))) => {
                    let fd = stream.as_raw_fd();
                    self.connections.add(fd, Connection::new(stream, peer));
                    debug!(
                        "New connection from {} on socket {} (max fd {})",
                        peer,
                        fd,
                        self.connections.max_fd()
                    );
                }
                Wake::Accepted(Err(e)) => warn!("Server accept error: {}", e),
                Wake::Readable => {}
            }

            for fd in self.connections.fds() {
                match self.service(fd, token).await? {
                    Service::Keep => {}
                    Service::Close => {
                        if let Some(conn) = self.connections.remove(fd) {
                            debug!(
                                "Connection closed on socket {} ({}), max fd {}",
                                fd,
                                conn.peer,
                                self.connections.max_fd()
                            );
                        }
                    }
                    Service::Stop => return Ok(()),
                }
            }
        }
    }

    /// Block until the stop token fires, a client connects or any client is readable
    async fn wait(&self, token: &CancellationToken) -> Wake {
        let readable = async {
            if self.connections.is_empty() {
                std::future::pending::<()>().await;
            } else {
                let waits = self
                    .connections
                    .iter()
                    .map(|(_, conn)| Box::pin(conn.stream.readable()));
                let _ = select_all(waits).await;
            }
        };

        tokio::select! {
            _ = token.cancelled() => Wake::Stop,
            accepted = self.listener.accept() => Wake::Accepted(accepted),
            _ = readable => Wake::Readable,
        }
    }

    /// One non-blocking receive on `fd`, then answer every complete request
    async fn service(&mut self, fd: i32, token: &CancellationToken) -> RelayResult<Service> {
        let Some(conn) = self.connections.get_mut(fd) else {
            return Ok(Service::Keep);
        };

        match conn.stream.try_read_buf(&mut conn.buffer) {
            Ok(0) => return Ok(Service::Close),
            Ok(n) => debug!("Received {} bytes on socket {}", n, fd),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Service::Keep),
            Err(e) => {
                debug!("Receive error on socket {}: {}", fd, e);
                return Ok(Service::Close);
            }
        }

        loop {
            let frame_len = match mbap_frame_len(&conn.buffer) {
                Ok(Some(len)) if conn.buffer.len() >= len => len,
                Ok(_) => return Ok(Service::Keep),
                Err(e) => {
                    warn!("Dropping {}: {}", conn.peer, e);
                    return Ok(Service::Close);
                }
            };
            let frame = conn.buffer.split_to(frame_len);
            tracing::trace!("<- {}", hex_frame(&frame));

            let reply = match reply_to_request(self.framing, &frame, &mut self.map) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Dropping {}: {}", conn.peer, e);
                    return Ok(Service::Close);
                }
            };
            tracing::trace!("-> {}", hex_frame(&reply));
            match tokio::time::timeout(self.reply_timeout, conn.stream.write_all(&reply)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Reply to {} failed: {}", conn.peer, e);
                    return Ok(Service::Close);
                }
                Err(_) => {
                    debug!("Reply to {} timed out", conn.peer);
                    return Ok(Service::Close);
                }
            }

            let header_length = self.framing.header_length();
            let accepted = reply
                .get(header_length)
                .is_some_and(|fc| fc & EXCEPTION_FLAG == 0);
            let Some(range) = detect_write(&frame, header_length).filter(|_| accepted) else {
                continue;
            };
            debug!("Addr {}: {} values", range.address, range.count);

            let Some(values) = self.map.slice(range.address, range.count) else {
                warn!(
                    "Write of {} registers at {} lies outside the map",
                    range.count, range.address
                );
                continue;
            };
            let records = build_records(RecordSource::Map, range.address, ValueType::Integer16, values);
            if self.sink.deliver(&records, token).await? == Delivery::Abandoned {
                return Ok(Service::Stop);
            }
        }
    }
}
