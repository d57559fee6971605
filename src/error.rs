use thiserror::Error;

use crate::body::BodyId;

/**
 * Errors raised by the cross-rank exchange protocol, the coupling bridge, and
 * the message codecs. Local soft outcomes (duplicate insert, erase of an
 * absent pair, a lost coupled particle) are not errors; they are reported
 * through return values.
 */
#[derive(Debug, Error)]
pub enum Error {
    #[error("length mismatch in {context}: expected {expected}, got {actual}")]
    LengthMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("subdomain {0} cannot exchange state with itself")]
    SelfExchange(usize),

    #[error("rank {rank} out of range for {size} subdomains")]
    RankOutOfRange { rank: usize, size: usize },

    #[error("body {0} is not present in the body container")]
    MissingBody(BodyId),

    #[error("a receive from rank {0} is already outstanding")]
    OutstandingReceive(usize),

    #[error("no receive from rank {0} has been posted")]
    NoPendingReceive(usize),

    #[error("body {0} has a shape the coupling cannot describe")]
    UnsupportedShape(BodyId),

    #[error("communicator disconnected")]
    Disconnected,

    #[error("timed out waiting for tag {tag} from rank {rank}")]
    Timeout { rank: usize, tag: u32 },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("fluid domain bounding boxes have not been received")]
    MissingFluidDomains,
}

pub type Result<T> = std::result::Result<T, Error>;
