use std::collections::hash_map::{Entry, HashMap};
use std::io::{self, prelude::*};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::{thread, time::Duration};

use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::backoff::{ExponentialBackoff, Retry};
use super::comm::{Communicator, Tag};
use super::mailbox::{Envelope, Mailbox};
use super::util;
use crate::error::{Error, Result};

const CXN_W_TIMEOUT: Duration = Duration::from_millis(2500);
const RETRY_WAIT: Duration = Duration::from_millis(250);
const RETRY_MAX_WAIT: Duration = Duration::from_millis(5000);
const MAX_SEND_ATTEMPTS: usize = 20;

/// Frames announcing more bytes than this are rejected by the reader.
pub const MAX_FRAME_SIZE: usize = 1 << 30;

type Outbound = (usize, Envelope);

/// What goes on the wire: an envelope numbered per destination. A frame is
/// resent when its ack is lost, so the receiver uses the number to drop the
/// copies it already delivered.
#[derive(Serialize, Deserialize)]
struct Frame {
    seq: u64,
    envelope: Envelope,
}

/// Per-source sequence numbers the reader threads expect next.
#[derive(Default)]
struct SeenSequences {
    next: Mutex<HashMap<usize, u64>>,
}

impl SeenSequences {
    /// Forward the frame's envelope unless that sequence number was already
    /// delivered from the same source. The lock is held across the forward,
    /// so two connections from one source cannot reorder.
    fn deliver(&self, frame: Frame, sink: &Sender<Envelope>) -> io::Result<()> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let source = frame.envelope.source;

        if next.get(&source).map_or(false, |&n| frame.seq < n) {
            warn!("dropping duplicate frame {} from rank {}", frame.seq, source);
            return Ok(());
        }
        next.insert(source, frame.seq + 1);
        sink.send(frame.envelope)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

/// Owns the threads behind a `TcpCommunicator`: one listener accepting peer
/// connections (plus one reader thread per connection), and one serial
/// sender that keeps a connection per destination rank. Every frame is a
/// length prefix followed by an rmp-serde encoded `Frame`; the receiver
/// acknowledges by echoing the byte count.
pub struct TcpHost {
    listen_thread: Option<thread::JoinHandle<()>>,
    send_thread: Option<thread::JoinHandle<()>>,
}

impl TcpHost {
    /// Bind this rank's address from `peers` and start the host.
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> Result<(Self, TcpCommunicator)> {
        let addr = *peers.get(rank).ok_or(Error::RankOutOfRange {
            rank,
            size: peers.len(),
        })?;
        Self::from_listener(rank, TcpListener::bind(addr)?, peers)
    }

    /// Start the host on an already bound listener. Binding before any peer
    /// starts sending means no connection attempt can race the bind.
    pub fn from_listener(
        rank: usize,
        listener: TcpListener,
        peers: Vec<SocketAddr>,
    ) -> Result<(Self, TcpCommunicator)> {
        let (send_sink, send_src) = crossbeam_channel::unbounded();
        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let size = peers.len();

        let host = TcpHost {
            send_thread: Some(Self::start_serial_sender(peers, send_src)),
            listen_thread: Some(Self::start_listener(listener, recv_sink)?),
        };
        let comm = TcpCommunicator {
            rank,
            size,
            send_sink: Some(send_sink),
            mailbox: Mailbox::new(recv_src),
        };
        Ok((host, comm))
    }

    /// Wait until every queued message has been delivered. The sender
    /// finishes once its communicator has been dropped.
    pub fn join(&mut self) {
        if let Some(handle) = self.send_thread.take() {
            if handle.join().is_err() {
                error!("tcp sender thread panicked")
            }
        }
        // The listener blocks in accept for the life of the process.
        self.listen_thread.take();
    }

    fn start_serial_sender(
        peers: Vec<SocketAddr>,
        send_src: crossbeam_channel::Receiver<Outbound>,
    ) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            let mut table: HashMap<usize, TcpStream> = HashMap::new();
            let mut next_seq: HashMap<usize, u64> = HashMap::new();

            for (rank, envelope) in send_src {
                let tag = envelope.tag;
                let seq = next_seq.entry(rank).or_insert(0);
                let frame = Frame { seq: *seq, envelope };
                *seq += 1;

                let frame = match rmp_serde::to_vec(&frame) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("failed to encode message for rank {}: {}", rank, e);
                        continue;
                    }
                };
                let outcome = ExponentialBackoff::new(RETRY_WAIT, RETRY_MAX_WAIT, 2)
                    .take(MAX_SEND_ATTEMPTS)
                    .retry(
                        || Self::deliver(&mut table, &peers, rank, &frame),
                        |e, delay| {
                            warn!("failed to send to {}: {}; retrying in {:?}", peers[rank], e, delay);
                            thread::sleep(delay)
                        },
                    );
                if let Some(Err(e)) = outcome {
                    error!(
                        "dropping message with tag {} to rank {} after {} attempts: {}",
                        tag, rank, MAX_SEND_ATTEMPTS, e
                    );
                }
            }
            debug!("tcp sender shutting down");
        })
    }

    fn deliver(
        table: &mut HashMap<usize, TcpStream>,
        peers: &[SocketAddr],
        rank: usize,
        frame: &[u8],
    ) -> io::Result<()> {
        let stream = match table.entry(rank) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let stream = TcpStream::connect(peers[rank])?;
                stream.set_write_timeout(Some(CXN_W_TIMEOUT))?;
                stream.set_nodelay(true)?;
                entry.insert(stream)
            }
        };
        let result = util::write_frame(&mut *stream, frame).and_then(|()| {
            let ack = util::read_usize(stream)?;
            if ack == frame.len() {
                Ok(())
            } else {
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("sent {} bytes but receiver acked {}", frame.len(), ack),
                ))
            }
        });
        if result.is_err() {
            table.remove(&rank);
        }
        result
    }

    fn start_listener(
        listener: TcpListener,
        recv_sink: Sender<Envelope>,
    ) -> Result<thread::JoinHandle<()>> {
        info!("listening on {}", listener.local_addr()?);
        let seen = Arc::new(SeenSequences::default());
        Ok(thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let sink = recv_sink.clone();
                        let seen = seen.clone();
                        thread::spawn(move || {
                            if let Err(e) = Self::handle_connection(stream, &seen, sink) {
                                debug!("{}", e)
                            }
                        });
                    }
                    Err(e) => error!("failed to accept connection: {}", e),
                }
            }
        }))
    }

    /// Read frames until the peer hangs up. The stream has no read timeout:
    /// a quiet peer is not a failed peer.
    fn handle_connection(
        mut stream: TcpStream,
        seen: &SeenSequences,
        recv_sink: Sender<Envelope>,
    ) -> io::Result<()> {
        let remote = stream.peer_addr()?;
        info!("receiving connection from {}", remote);
        loop {
            let bytes = match util::read_frame(&mut stream, MAX_FRAME_SIZE)? {
                Some(bytes) => bytes,
                None => {
                    info!("connection from {} closed", remote);
                    return Ok(());
                }
            };
            let frame: Frame = rmp_serde::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

            seen.deliver(frame, &recv_sink)?;
            stream.write_all(&bytes.len().to_le_bytes())?;
        }
    }
}

/// The `Communicator` face of a `TcpHost`.
pub struct TcpCommunicator {
    rank: usize,
    size: usize,
    send_sink: Option<Sender<Outbound>>,
    mailbox: Mailbox,
}

impl TcpCommunicator {
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.mailbox.set_timeout(timeout)
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()> {
        if rank >= self.size {
            return Err(Error::RankOutOfRange {
                rank,
                size: self.size,
            });
        }
        let envelope = Envelope {
            source: self.rank,
            tag,
            data: message,
        };
        self.send_sink
            .as_ref()
            .ok_or(Error::Disconnected)?
            .send((rank, envelope))
            .map_err(|_| Error::Disconnected)
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>> {
        self.mailbox.recv(source, tag)
    }

    fn probe(&self, source: usize, tag: Tag) -> Result<usize> {
        self.mailbox.probe(source, tag)
    }

    fn try_recv(&self, source: usize, tag: Tag) -> Result<Option<Vec<u8>>> {
        self.mailbox.try_recv(source, tag)
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        // Closing the outbound channel lets the sender thread drain and exit.
        self.send_sink.take();
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;

    use super::{Frame, TcpCommunicator, TcpHost};
    use crate::message::comm::{Communicator, ReduceOp};
    use crate::message::mailbox::Envelope;
    use crate::message::util;

    const TAG: u32 = 5;

    /// A receiving host on rank 1, and the address rank 0 would connect to.
    fn receiver() -> (TcpHost, TcpCommunicator, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (host, comm) = TcpHost::from_listener(1, listener, vec![addr, addr]).unwrap();
        (host, comm, addr)
    }

    /// Write a frame from rank 0 the way the sender thread does, and return
    /// its encoded size.
    fn write_raw(stream: &mut TcpStream, seq: u64, data: &[u8]) -> usize {
        let frame = Frame {
            seq,
            envelope: Envelope {
                source: 0,
                tag: TAG,
                data: data.to_vec(),
            },
        };
        let bytes = rmp_serde::to_vec(&frame).unwrap();
        util::write_frame(stream, &bytes).unwrap();
        bytes.len()
    }

    #[test]
    fn frame_resent_after_a_lost_ack_is_delivered_once() {
        let (mut host, comm, addr) = receiver();

        // the first attempt hangs up without waiting for the ack
        let mut first = TcpStream::connect(addr).unwrap();
        write_raw(&mut first, 0, b"a");
        drop(first);

        let mut retry = TcpStream::connect(addr).unwrap();
        let size = write_raw(&mut retry, 0, b"a");
        assert_eq!(util::read_usize(&mut retry).unwrap(), size);
        let size = write_raw(&mut retry, 1, b"b");
        assert_eq!(util::read_usize(&mut retry).unwrap(), size);

        assert_eq!(comm.recv(0, TAG).unwrap(), b"a");
        assert_eq!(comm.recv(0, TAG).unwrap(), b"b");
        assert!(comm.try_recv(0, TAG).unwrap().is_none());

        drop(retry);
        drop(comm);
        host.join();
    }

    #[test]
    fn oversized_frame_closes_only_that_connection() {
        let (mut host, comm, addr) = receiver();

        let mut corrupt = TcpStream::connect(addr).unwrap();
        corrupt.write_all(&usize::MAX.to_le_bytes()).unwrap();
        let mut byte = [0u8; 1];
        assert_eq!(corrupt.read(&mut byte).unwrap_or(0), 0);

        let mut good = TcpStream::connect(addr).unwrap();
        let size = write_raw(&mut good, 0, b"ok");
        assert_eq!(util::read_usize(&mut good).unwrap(), size);
        assert_eq!(comm.recv(0, TAG).unwrap(), b"ok");

        drop(comm);
        host.join();
    }

    #[test]
    fn three_ranks_exchange_over_loopback() {
        let listeners: Vec<_> = (0..3)
            .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
            .collect();
        let peers: Vec<_> = listeners.iter().map(|l| l.local_addr().unwrap()).collect();

        let handles: Vec<_> = listeners
            .into_iter()
            .enumerate()
            .map(|(rank, listener)| {
                let peers = peers.clone();
                thread::spawn(move || {
                    let (mut host, comm) = TcpHost::from_listener(rank, listener, peers).unwrap();
                    let next = (rank + 1) % 3;
                    let prev = (rank + 2) % 3;
                    comm.send_f64s(next, 177, &[rank as f64, 0.5]).unwrap();
                    let got = comm.recv_f64s(prev, 177).unwrap();
                    let total = comm.all_reduce_f64(9, &[rank as f64], ReduceOp::Sum).unwrap();
                    drop(comm);
                    host.join();
                    (got, total)
                })
            })
            .collect();

        for (rank, handle) in handles.into_iter().enumerate() {
            let (got, total) = handle.join().unwrap();
            assert_eq!(got, vec![((rank + 2) % 3) as f64, 0.5]);
            assert_eq!(total, vec![3.0]);
        }
    }
}
