use super::{Comm, Communicator, CommunicatorExt};
use crate::errors::{RslikeError, RslikeResult};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Mailbox key: (communicator context, destination world rank, source rank, tag).
type MailboxKey = (String, usize, usize, u32);

#[derive(Default)]
struct Mailboxes {
    queues: HashMap<MailboxKey, VecDeque<Vec<u8>>>,
    aborted: bool,
}

/// State shared by every rank of a [`LocalComm`] world.
#[derive(Default)]
struct World {
    mailboxes: Mutex<Mailboxes>,
    arrived: Condvar,
}

impl World {
    fn post(&self, key: MailboxKey, data: Vec<u8>) -> RslikeResult<()> {
        let mut boxes = self
            .mailboxes
            .lock()
            .map_err(|_| RslikeError::Communication("mailbox lock poisoned".to_string()))?;
        boxes.queues.entry(key).or_default().push_back(data);
        self.arrived.notify_all();
        Ok(())
    }

    fn take(&self, key: &MailboxKey) -> RslikeResult<Vec<u8>> {
        let mut boxes = self
            .mailboxes
            .lock()
            .map_err(|_| RslikeError::Communication("mailbox lock poisoned".to_string()))?;
        loop {
            if let Some(data) = boxes.queues.get_mut(key).and_then(|q| q.pop_front()) {
                return Ok(data);
            }
            if boxes.aborted {
                return Err(RslikeError::Communication(
                    "a peer rank terminated abnormally".to_string(),
                ));
            }
            boxes = self
                .arrived
                .wait(boxes)
                .map_err(|_| RslikeError::Communication("mailbox lock poisoned".to_string()))?;
        }
    }

    fn abort(&self) {
        if let Ok(mut boxes) = self.mailboxes.lock() {
            boxes.aborted = true;
        }
        self.arrived.notify_all();
    }
}

/// Wakes blocked peers if a rank unwinds.
struct AbortOnPanic(Arc<World>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// In-process communicator where each rank is a thread.
///
/// Used to run multi-rank code paths without an MPI installation, most notably in tests.
pub struct LocalComm {
    world: Arc<World>,
    context: String,
    rank: usize,
    /// World ranks of the members, indexed by rank in this communicator.
    members: Vec<usize>,
    nsplits: AtomicUsize,
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("context", &self.context)
            .field("rank", &self.rank)
            .field("size", &self.members.len())
            .finish()
    }
}

impl LocalComm {
    /// Run `f` on `size` ranks, each on its own thread, and collect the results in rank order.
    ///
    /// A panic on any rank releases the others from blocking receives and is re-raised here.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(Comm) -> T + Sync,
    {
        let world = Arc::new(World::default());
        let members: Vec<usize> = (0..size).collect();
        thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let comm: Comm = Arc::new(LocalComm {
                        world: world.clone(),
                        context: "world".to_string(),
                        rank,
                        members: members.clone(),
                        nsplits: AtomicUsize::new(0),
                    });
                    let guard = AbortOnPanic(world.clone());
                    let f = &f;
                    scope.spawn(move || {
                        let _guard = guard;
                        f(comm)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(value) => value,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    fn world_rank(&self, rank: usize) -> RslikeResult<usize> {
        self.members.get(rank).copied().ok_or_else(|| {
            RslikeError::Communication(format!(
                "rank {} does not exist in a communicator of size {}",
                rank,
                self.members.len()
            ))
        })
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send_bytes(&self, dest: usize, tag: u32, data: Vec<u8>) -> RslikeResult<()> {
        let dest = self.world_rank(dest)?;
        self.world
            .post((self.context.clone(), dest, self.rank, tag), data)
    }

    fn recv_bytes(&self, source: usize, tag: u32) -> RslikeResult<Vec<u8>> {
        self.world_rank(source)?;
        let me = self.members[self.rank];
        self.world.take(&(self.context.clone(), me, source, tag))
    }

    fn split(&self, color: Option<usize>, key: usize) -> RslikeResult<Option<Comm>> {
        // Every rank splits in the same order so the counters agree
        let nsplit = self.nsplits.fetch_add(1, Ordering::SeqCst);
        let requests = self.allgather(&(color, key))?;
        let color = match color {
            Some(color) => color,
            None => return Ok(None),
        };
        let mut group: Vec<(usize, usize)> = requests
            .iter()
            .enumerate()
            .filter(|(_, (c, _))| *c == Some(color))
            .map(|(rank, (_, k))| (*k, rank))
            .collect();
        group.sort();
        let rank = group
            .iter()
            .position(|(_, r)| *r == self.rank)
            .ok_or_else(|| RslikeError::Communication("rank missing from its own group".to_string()))?;
        let members = group
            .iter()
            .map(|(_, r)| self.members[*r])
            .collect();
        Ok(Some(Arc::new(LocalComm {
            world: self.world.clone(),
            context: format!("{}/{}:{}", self.context, nsplit, color),
            rank,
            members,
            nsplits: AtomicUsize::new(0),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommunicatorExt;

    #[test]
    fn ranks_and_size() {
        let ranks = LocalComm::run(4, |comm| (comm.rank(), comm.size()));
        assert_eq!(ranks, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    #[test]
    fn collectives() {
        let results = LocalComm::run(3, |comm| {
            let value = comm
                .bcast(if comm.is_root() { Some(1.5f64) } else { None }, 0)
                .unwrap();
            let gathered = comm.gather(&(comm.rank() * 10), 0).unwrap();
            let all = comm.allgather(&comm.rank()).unwrap();
            let mine: usize = comm
                .scatter(if comm.is_root() { Some(vec![5, 6, 7]) } else { None }, 0)
                .unwrap();
            comm.barrier().unwrap();
            (value, gathered, all, mine)
        });
        for (rank, (value, gathered, all, mine)) in results.into_iter().enumerate() {
            assert_eq!(value, 1.5);
            assert_eq!(all, vec![0, 1, 2]);
            assert_eq!(mine, 5 + rank);
            if rank == 0 {
                assert_eq!(gathered, Some(vec![0, 10, 20]));
            } else {
                assert_eq!(gathered, None);
            }
        }
    }

    #[test]
    fn point_to_point_is_ordered() {
        let results = LocalComm::run(2, |comm| {
            if comm.rank() == 0 {
                for i in 0..5u32 {
                    comm.send(&i, 1, 3).unwrap();
                }
                vec![]
            } else {
                (0..5).map(|_| comm.recv::<u32>(0, 3).unwrap()).collect()
            }
        });
        assert_eq!(results[1], vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn split_into_groups() {
        let results = LocalComm::run(5, |comm| {
            // Rank 0 stays out, the others form two groups
            let color = if comm.rank() == 0 {
                None
            } else {
                Some((comm.rank() - 1) / 2)
            };
            let sub = comm.split(color, comm.rank()).unwrap();
            sub.map(|sub| {
                let total: Vec<usize> = sub.allgather(&comm.rank()).unwrap();
                (sub.rank(), sub.size(), total)
            })
        });
        assert_eq!(results[0], None);
        assert_eq!(results[1], Some((0, 2, vec![1, 2])));
        assert_eq!(results[2], Some((1, 2, vec![1, 2])));
        assert_eq!(results[3], Some((0, 2, vec![3, 4])));
        assert_eq!(results[4], Some((1, 2, vec![3, 4])));
    }

    #[test]
    fn peer_panic_releases_receivers() {
        let outcome = std::panic::catch_unwind(|| {
            LocalComm::run(2, |comm| {
                if comm.rank() == 1 {
                    panic!("rank 1 failed");
                }
                comm.recv::<u32>(1, 0).is_err()
            })
        });
        assert!(outcome.is_err());
    }
}
