//! [`Communicator`] backed by an MPI communicator, for worlds spanning several processes.
//!
//! Launch the program with `mpirun -n <size>` and build with the `mpi` feature.

use super::{Comm, Communicator, TAG_RESERVED};
use crate::errors::{RslikeError, RslikeResult};
use ::mpi::topology::{Color, SimpleCommunicator};
use ::mpi::traits::{Communicator as _, CommunicatorCollectives, Destination, Root, Source};
use ::mpi::{Tag, Threading};
use std::fmt;
use std::sync::Arc;

/// Number of MPI tags set aside for the reserved collective tags.
const NRESERVED: u32 = u32::MAX - TAG_RESERVED + 1;

/// Every MPI implementation accepts tags up to at least this value.
const MPI_TAG_UB: u32 = 32767;

/// Map a communicator tag onto the MPI tag range.
///
/// Reserved tags come first so that user tags keep their relative order.
fn mpi_tag(tag: u32) -> RslikeResult<Tag> {
    let mapped = if tag >= TAG_RESERVED {
        tag - TAG_RESERVED
    } else {
        tag.checked_add(NRESERVED).unwrap_or(u32::MAX)
    };
    if mapped > MPI_TAG_UB {
        return Err(RslikeError::Communication(format!(
            "tag {} does not fit in the MPI tag range",
            tag
        )));
    }
    Ok(mapped as Tag)
}

/// A process group of an MPI world.
///
/// The MPI environment is finalised when the [`::mpi::environment::Universe`] the world
/// was taken from is dropped, so it must outlive every `MpiComm`.
pub struct MpiComm {
    comm: SimpleCommunicator,
    rank: usize,
    size: usize,
}

// The library is initialised with `Threading::Multiple` in `MpiComm::init`, so the handle may
// be shared between threads.
unsafe impl Send for MpiComm {}
unsafe impl Sync for MpiComm {}

impl MpiComm {
    /// Wrap an MPI communicator.
    pub fn new(comm: SimpleCommunicator) -> Self {
        let rank = comm.rank() as usize;
        let size = comm.size() as usize;
        Self { comm, rank, size }
    }

    /// Initialise MPI and return the universe together with its world.
    ///
    /// Fails if MPI was already initialised or does not support concurrent calls.
    pub fn init() -> RslikeResult<(::mpi::environment::Universe, Comm)> {
        let (universe, threading) = ::mpi::initialize_with_threading(Threading::Multiple)
            .ok_or_else(|| RslikeError::Communication("MPI is already initialised".to_string()))?;
        if threading != Threading::Multiple {
            return Err(RslikeError::Communication(format!(
                "MPI provides {:?} threading, concurrent calls need {:?}",
                threading,
                Threading::Multiple
            )));
        }
        let world: Comm = Arc::new(Self::new(universe.world()));
        Ok((universe, world))
    }

    fn check_rank(&self, rank: usize) -> RslikeResult<i32> {
        if rank >= self.size {
            return Err(RslikeError::Communication(format!(
                "rank {} does not exist in a communicator of size {}",
                rank, self.size
            )));
        }
        Ok(rank as i32)
    }
}

impl fmt::Debug for MpiComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpiComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_bytes(&self, dest: usize, tag: u32, data: Vec<u8>) -> RslikeResult<()> {
        let dest = self.check_rank(dest)?;
        self.comm
            .process_at_rank(dest)
            .send_with_tag(&data[..], mpi_tag(tag)?);
        Ok(())
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> RslikeResult<Vec<u8>> {
        let source = self.check_rank(source)?;
        let (data, _status) = self
            .comm
            .process_at_rank(source)
            .receive_vec_with_tag::<u8>(mpi_tag(tag)?);
        Ok(data)
    }

    fn split(&self, color: Option<usize>, key: usize) -> RslikeResult<Option<Comm>> {
        let color = match color {
            Some(color) => Color::with_value(i32::try_from(color).map_err(|_| {
                RslikeError::Communication(format!("color {} is too large for MPI", color))
            })?),
            None => Color::undefined(),
        };
        let key = i32::try_from(key)
            .map_err(|_| RslikeError::Communication(format!("key {} is too large for MPI", key)))?;
        Ok(self
            .comm
            .split_by_color_with_key(color, key)
            .map(|comm| Arc::new(MpiComm::new(comm)) as Comm))
    }

    /// Broadcast the payload length, then the payload.
    fn bcast_bytes(&self, data: Option<Vec<u8>>, root: usize) -> RslikeResult<Vec<u8>> {
        let root_process = self.comm.process_at_rank(self.check_rank(root)?);
        let mut buffer = if self.rank == root {
            data.ok_or_else(|| {
                RslikeError::Communication("broadcast root has no payload".to_string())
            })?
        } else {
            Vec::new()
        };
        let mut len = buffer.len() as u64;
        root_process.broadcast_into(&mut len);
        if self.rank != root {
            buffer = vec![0; len as usize];
        }
        root_process.broadcast_into(&mut buffer[..]);
        Ok(buffer)
    }

    fn barrier(&self) -> RslikeResult<()> {
        self.comm.barrier();
        Ok(())
    }
}
