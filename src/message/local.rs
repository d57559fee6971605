use std::time::Duration;

use crossbeam_channel::Sender;

use super::comm::{Communicator, Tag};
use super::mailbox::{Envelope, Mailbox};
use crate::error::{Error, Result};

/// A communicator whose ranks live in the same process, typically one per
/// thread. Every rank holds a sender to every other rank's mailbox.
///
pub struct LocalCommunicator {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    mailbox: Mailbox,
}

impl LocalCommunicator {
    /// Create `size` connected endpoints, in rank order.
    ///
    pub fn world(size: usize) -> Vec<LocalCommunicator> {
        let (sinks, srcs): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        srcs.into_iter()
            .enumerate()
            .map(|(rank, src)| LocalCommunicator {
                rank,
                peers: sinks.clone(),
                mailbox: Mailbox::new(src),
            })
            .collect()
    }

    /// Like `world`, but every receive gives up after `timeout`.
    ///
    pub fn world_with_timeout(size: usize, timeout: Option<Duration>) -> Vec<LocalCommunicator> {
        let mut world = Self::world(size);
        for comm in &mut world {
            comm.mailbox.set_timeout(timeout)
        }
        world
    }

    pub fn num_pending(&self) -> usize {
        self.mailbox.num_pending()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()> {
        let peer = self.peers.get(rank).ok_or(Error::RankOutOfRange {
            rank,
            size: self.peers.len(),
        })?;
        peer.send(Envelope {
            source: self.rank,
            tag,
            data: message,
        })
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




// ============================================================================
#[cfg(test)]
mod test {

    use std::thread;

    use super::LocalCommunicator;
    use crate::message::comm::{Communicator, ReduceOp};

    fn run_world<F, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(LocalCommunicator) -> T + Send + Sync + Copy + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalCommunicator::world(size)
            .into_iter()
            .map(|comm| thread::spawn(move || f(comm)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn point_to_point_ring() {
        let received = run_world(4, |comm| {
            let next = (comm.rank() + 1) % comm.size();
            let prev = (comm.rank() + comm.size() - 1) % comm.size();
            comm.send(next, 5, vec![comm.rank() as u8]).unwrap();
            comm.recv(prev, 5).unwrap()[0]
        });
        assert_eq!(received, vec![3, 0, 1, 2]);
    }

    #[test]
    fn broadcast_reaches_every_rank_from_any_root() {
        for size in 1..8 {
            for root in 0..size {
                let values = run_world(size, move |comm| {
                    let value = (comm.rank() == root).then(|| vec![42, root as u8]);
                    comm.broadcast(root, 1, value).unwrap()
                });
                assert!(values.iter().all(|v| v == &vec![42, root as u8]));
            }
        }
    }

    #[test]
    fn all_reduce_sums_and_maxes() {
        for size in 1..7 {
            let sums = run_world(size, |comm| {
                let r = comm.rank() as f64;
                comm.all_reduce_f64(2, &[r, 1.0], ReduceOp::Sum).unwrap()
            });
            let n = size as f64;
            assert!(sums.iter().all(|s| s == &vec![n * (n - 1.0) / 2.0, n]));

            let maxes = run_world(size, |comm| {
                let r = comm.rank() as i32;
                comm.all_reduce_i32(3, &[-5, r], ReduceOp::Max).unwrap()
            });
            assert!(maxes.iter().all(|m| m == &vec![-5, size as i32 - 1]));
        }
    }

    #[test]
    fn send_to_unknown_rank_is_an_error() {
        let world = LocalCommunicator::world(2);
        assert!(world[0].send(2, 0, vec![]).is_err());
    }
}
