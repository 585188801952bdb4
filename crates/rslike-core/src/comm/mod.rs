//! Message passing between cooperating processes.
//!
//! Evaluation is distributed MPI-style: a world of ranks is split into disjoint
//! process groups and every collective call must be reached by all ranks of the
//! communicator it is made on.
//! [`Communicator`] is the transport seam, [`CommunicatorExt`] layers typed
//! collectives on top of it using `bincode`.
//! With the `mpi` feature, [`MpiComm`] runs the world across processes.

mod local;
#[cfg(feature = "mpi")]
mod mpi;
mod task_manager;

pub use local::LocalComm;
#[cfg(feature = "mpi")]
pub use self::mpi::MpiComm;
pub use task_manager::TaskManager;

use crate::errors::{RslikeError, RslikeResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

/// Tags at and above this value are reserved for collective operations.
pub const TAG_RESERVED: u32 = u32::MAX - 16;
const TAG_BCAST: u32 = TAG_RESERVED;
const TAG_GATHER: u32 = TAG_RESERVED + 1;
const TAG_SCATTER: u32 = TAG_RESERVED + 2;

/// Shared handle to a communicator.
pub type Comm = Arc<dyn Communicator>;

/// Point-to-point transport between the ranks of a process group.
///
/// Messages between a given pair of ranks with a given tag are delivered in order.
pub trait Communicator: Debug + Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn send_bytes(&self, dest: usize, tag: u32, data: Vec<u8>) -> RslikeResult<()>;

    /// Block until a message from `source` with `tag` arrives.
    fn recv_bytes(&self, source: usize, tag: u32) -> RslikeResult<Vec<u8>>;

    /// Partition the ranks by `color`, ordering each new group by `(key, rank)`.
    ///
    /// Collective. Ranks passing `None` take part but receive no communicator.
    fn split(&self, color: Option<usize>, key: usize) -> RslikeResult<Option<Comm>>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Collective: returns the root's payload on every rank.
    fn bcast_bytes(&self, data: Option<Vec<u8>>, root: usize) -> RslikeResult<Vec<u8>> {
        if self.rank() == root {
            let data = data.ok_or_else(|| {
                RslikeError::Communication("broadcast root has no payload".to_string())
            })?;
            for dest in (0..self.size()).filter(|&r| r != root) {
                self.send_bytes(dest, TAG_BCAST, data.clone())?;
            }
            Ok(data)
        } else {
            self.recv_bytes(root, TAG_BCAST)
        }
    }

    /// Collective: the root receives every rank's payload in rank order.
    fn gather_bytes(&self, data: Vec<u8>, root: usize) -> RslikeResult<Option<Vec<Vec<u8>>>> {
        if self.rank() == root {
            let mut gathered = Vec::with_capacity(self.size());
            for source in 0..self.size() {
                if source == root {
                    gathered.push(data.clone());
                } else {
                    gathered.push(self.recv_bytes(source, TAG_GATHER)?);
                }
            }
            Ok(Some(gathered))
        } else {
            self.send_bytes(root, TAG_GATHER, data)?;
            Ok(None)
        }
    }

    /// Collective: rank `i` receives the `i`-th payload of the root.
    fn scatter_bytes(&self, data: Option<Vec<Vec<u8>>>, root: usize) -> RslikeResult<Vec<u8>> {
        if self.rank() == root {
            let data = data.ok_or_else(|| {
                RslikeError::Communication("scatter root has no payload".to_string())
            })?;
            if data.len() != self.size() {
                return Err(RslikeError::Communication(format!(
                    "scatter needs {} payloads, got {}",
                    self.size(),
                    data.len()
                )));
            }
            let mut own = Vec::new();
            for (dest, payload) in data.into_iter().enumerate() {
                if dest == root {
                    own = payload;
                } else {
                    self.send_bytes(dest, TAG_SCATTER, payload)?;
                }
            }
            Ok(own)
        } else {
            self.recv_bytes(root, TAG_SCATTER)
        }
    }

    fn barrier(&self) -> RslikeResult<()> {
        self.gather_bytes(vec![], 0)?;
        self.bcast_bytes(if self.is_root() { Some(vec![]) } else { None }, 0)?;
        Ok(())
    }
}

fn encode<T: Serialize>(value: &T) -> RslikeResult<Vec<u8>> {
    bincode::serialize(value)
        .map_err(|e| RslikeError::Communication(format!("failed to encode message: {}", e)))
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> RslikeResult<T> {
    bincode::deserialize(data)
        .map_err(|e| RslikeError::Communication(format!("failed to decode message: {}", e)))
}

/// Typed messages over any [`Communicator`].
pub trait CommunicatorExt: Communicator {
    /// Broadcast the root's value; other ranks pass `None`.
    fn bcast<T: Serialize + DeserializeOwned>(&self, value: Option<T>, root: usize) -> RslikeResult<T> {
        if self.rank() == root {
            let value = value.ok_or_else(|| {
                RslikeError::Communication("broadcast root has no value".to_string())
            })?;
            self.bcast_bytes(Some(encode(&value)?), root)?;
            Ok(value)
        } else {
            decode(&self.bcast_bytes(None, root)?)
        }
    }

    fn gather<T: Serialize + DeserializeOwned>(&self, value: &T, root: usize) -> RslikeResult<Option<Vec<T>>> {
        match self.gather_bytes(encode(value)?, root)? {
            Some(all) => Ok(Some(
                all.iter().map(|d| decode(d)).collect::<RslikeResult<Vec<T>>>()?,
            )),
            None => Ok(None),
        }
    }

    fn allgather<T: Serialize + DeserializeOwned>(&self, value: &T) -> RslikeResult<Vec<T>> {
        let gathered = self.gather(value, 0)?;
        self.bcast(gathered, 0)
    }

    fn scatter<T: Serialize + DeserializeOwned>(&self, values: Option<Vec<T>>, root: usize) -> RslikeResult<T> {
        let payloads = match values {
            Some(values) if self.rank() == root => Some(
                values
                    .iter()
                    .map(encode)
                    .collect::<RslikeResult<Vec<_>>>()?,
            ),
            _ => None,
        };
        decode(&self.scatter_bytes(payloads, root)?)
    }

    fn send<T: Serialize>(&self, value: &T, dest: usize, tag: u32) -> RslikeResult<()> {
        self.send_bytes(dest, tag, encode(value)?)
    }

    fn recv<T: DeserializeOwned>(&self, source: usize, tag: u32) -> RslikeResult<T> {
        decode(&self.recv_bytes(source, tag)?)
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

/// Single-rank communicator used when no process group is configured.
#[derive(Debug, Default)]
pub struct SelfComm {
    queue: Mutex<HashMap<u32, VecDeque<Vec<u8>>>>,
}

impl SelfComm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to a fresh single-rank communicator.
    pub fn world() -> Comm {
        Arc::new(Self::new())
    }
}

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send_bytes(&self, dest: usize, tag: u32, data: Vec<u8>) -> RslikeResult<()> {
        if dest != 0 {
            return Err(RslikeError::Communication(format!(
                "rank {} does not exist in a single-rank communicator",
                dest
            )));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| RslikeError::Communication("mailbox lock poisoned".to_string()))?;
        queue.entry(tag).or_default().push_back(data);
        Ok(())
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> RslikeResult<Vec<u8>> {
        if source != 0 {
            return Err(RslikeError::Communication(format!(
                "rank {} does not exist in a single-rank communicator",
                source
            )));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| RslikeError::Communication("mailbox lock poisoned".to_string()))?;
        queue
            .get_mut(&tag)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| {
                RslikeError::Communication(format!(
                    "no message with tag {} was sent; receiving would block forever",
                    tag
                ))
            })
    }

    fn split(&self, color: Option<usize>, _key: usize) -> RslikeResult<Option<Comm>> {
        Ok(color.map(|_| SelfComm::world()))
    }
}
