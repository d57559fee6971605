use super::util;
use crate::error::Result;

/// Message tag. Messages are matched on (source, tag); two messages with the
/// same source and tag are received in the order they were sent.
///
pub type Tag = u32;

/// Element-wise combination used by the typed reductions.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

impl ReduceOp {
    pub fn apply_f64(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }

    pub fn apply_i32(self, a: i32, b: i32) -> i32 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
        }
    }
}

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, in-process
/// channels, or a higher level abstraction like MPI.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peers processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, tag: Tag, message: Vec<u8>) -> Result<()>;

    /// Must be implemented to receive the next message from `source` with
    /// the given tag. Blocks until one is ready. Messages which do not match
    /// stay queued for later receives.
    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>>;

    /// Block until a message from `source` with the given tag is ready, and
    /// return its size in bytes without consuming it.
    fn probe(&self, source: usize, tag: Tag) -> Result<usize>;

    /// Receive a matching message if one has already arrived.
    fn try_recv(&self, source: usize, tag: Tag) -> Result<Option<Vec<u8>>>;

    /// Implements a binomial tree broadcast from the root node. The message
    /// buffer must be `Some` if this is the root node, and it must be `None`
    /// otherwise.
    ///
    fn broadcast(&self, root: usize, tag: Tag, value: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let p = self.size();
        let r = (self.rank() + p - root) % p;
        let abs = |relative: usize| (relative + root) % p;

        let value = match value {
            Some(value) => value,
            None => self.recv(abs(r & (r.wrapping_sub(1))), tag)?,
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(abs(r + one), tag, value.clone())?
            }
        }
        Ok(value)
    }

    /// Implements a binomial tree reduce. All ranks return `None` except for
    /// the root.
    ///
    fn reduce<F>(&self, root: usize, tag: Tag, f: F, mut value: Vec<u8>) -> Result<Option<Vec<u8>>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>>,
    {
        let p = self.size();
        let r = (self.rank() + p - root) % p;
        let abs = |relative: usize| (relative + root) % p;

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv(abs(r + one), tag)?)?
                }
            } else {
                self.send(abs(r - one), tag, value)?;
                return Ok(None);
            }
        }
        Ok(Some(value))
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce<F>(&self, tag: Tag, f: F, value: Vec<u8>) -> Result<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Result<Vec<u8>>,
    {
        let reduced = self.reduce(0, tag, f, value)?;
        self.broadcast(0, tag, reduced)
    }

    /// Element-wise all-reduce of a slice of floats. Every rank must pass a
    /// slice of the same length.
    ///
    fn all_reduce_f64(&self, tag: Tag, values: &[f64], op: ReduceOp) -> Result<Vec<f64>> {
        let bytes = self.all_reduce(
            tag,
            |a, b| {
                let a = util::decode_f64s(&a)?;
                let b = util::decode_f64s(&b)?;
                util::check_len("all_reduce_f64", a.len(), b.len())?;
                let c: Vec<_> = a.iter().zip(&b).map(|(x, y)| op.apply_f64(*x, *y)).collect();
                Ok(util::encode_f64s(&c))
            },
            util::encode_f64s(values),
        )?;
        util::decode_f64s(&bytes)
    }

    /// Element-wise all-reduce of a slice of integers.
    ///
    fn all_reduce_i32(&self, tag: Tag, values: &[i32], op: ReduceOp) -> Result<Vec<i32>> {
        let bytes = self.all_reduce(
            tag,
            |a, b| {
                let a = util::decode_i32s(&a)?;
                let b = util::decode_i32s(&b)?;
                util::check_len("all_reduce_i32", a.len(), b.len())?;
                let c: Vec<_> = a.iter().zip(&b).map(|(x, y)| op.apply_i32(*x, *y)).collect();
                Ok(util::encode_i32s(&c))
            },
            util::encode_i32s(values),
        )?;
        util::decode_i32s(&bytes)
    }

    /// Broadcast a slice of floats from `root`.
    ///
    fn broadcast_f64s(&self, root: usize, tag: Tag, values: Option<&[f64]>) -> Result<Vec<f64>> {
        let bytes = self.broadcast(root, tag, values.map(util::encode_f64s))?;
        util::decode_f64s(&bytes)
    }

    fn broadcast_i32s(&self, root: usize, tag: Tag, values: Option<&[i32]>) -> Result<Vec<i32>> {
        let bytes = self.broadcast(root, tag, values.map(util::encode_i32s))?;
        util::decode_i32s(&bytes)
    }

    /// Send a slice of floats to a peer.
    ///
    fn send_f64s(&self, rank: usize, tag: Tag, values: &[f64]) -> Result<()> {
        self.send(rank, tag, util::encode_f64s(values))
    }

    /// Receive a slice of floats from a peer.
    ///
    fn recv_f64s(&self, source: usize, tag: Tag) -> Result<Vec<f64>> {
        util::decode_f64s(&self.recv(source, tag)?)
    }

    fn send_i32s(&self, rank: usize, tag: Tag, values: &[i32]) -> Result<()> {
        self.send(rank, tag, util::encode_i32s(values))
    }

    fn recv_i32s(&self, source: usize, tag: Tag) -> Result<Vec<i32>> {
        util::decode_i32s(&self.recv(source, tag)?)
    }
}
