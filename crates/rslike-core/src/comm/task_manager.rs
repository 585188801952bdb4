use super::Comm;
use crate::errors::{RslikeError, RslikeResult};
use tracing::debug;

/// Partition of a world into process groups that each run a share of `ntasks` tasks.
///
/// With more than one rank, rank 0 coordinates and the remaining ranks form groups of
/// `nprocs_per_task` ranks (leftover ranks join the last group).
/// With a single rank, that rank forms the only group and runs every task in turn.
/// Task `i` is assigned to group `i % ngroups`.
#[derive(Debug)]
pub struct TaskManager {
    world: Comm,
    ntasks: usize,
    nprocs_per_task: usize,
    ngroups: usize,
    group: Option<usize>,
    group_comm: Option<Comm>,
}

impl TaskManager {
    /// Split `world` into process groups.
    ///
    /// Collective over `world`.
    pub fn new(world: Comm, ntasks: usize, nprocs_per_task: usize) -> RslikeResult<Self> {
        if nprocs_per_task < 1 {
            return Err(RslikeError::Configuration(
                "nprocs_per_task must be at least 1".to_string(),
            ));
        }
        let size = world.size();
        let rank = world.rank();
        let (ngroups, group) = if size == 1 {
            (1, Some(0))
        } else {
            let workers = size - 1;
            let ngroups = (workers / nprocs_per_task).min(ntasks.max(1)).max(1);
            let group = if rank == 0 {
                None
            } else {
                Some(((rank - 1) / nprocs_per_task).min(ngroups - 1))
            };
            (ngroups, group)
        };
        let group_comm = world.split(group, rank)?;
        debug!(
            rank,
            size,
            ntasks,
            ngroups,
            group = ?group,
            "Partitioned ranks into process groups"
        );
        Ok(Self {
            world,
            ntasks,
            nprocs_per_task,
            ngroups,
            group,
            group_comm,
        })
    }

    /// Size each group so that the workers are shared evenly between `ntasks` tasks.
    pub fn use_all_procs(world: Comm, ntasks: usize) -> RslikeResult<Self> {
        let workers = world.size().saturating_sub(1);
        let nprocs_per_task = (workers / ntasks.max(1)).max(1);
        Self::new(world, ntasks, nprocs_per_task)
    }

    pub fn world(&self) -> &Comm {
        &self.world
    }

    pub fn ngroups(&self) -> usize {
        self.ngroups
    }

    pub fn ntasks(&self) -> usize {
        self.ntasks
    }

    pub fn nprocs_per_task(&self) -> usize {
        self.nprocs_per_task
    }

    /// Group of this rank; `None` for the coordinator.
    pub fn group(&self) -> Option<usize> {
        self.group
    }

    /// Communicator of this rank's group; `None` for the coordinator.
    pub fn group_comm(&self) -> Option<&Comm> {
        self.group_comm.as_ref()
    }

    /// Whether this rank is rank 0 of its group.
    pub fn is_group_root(&self) -> bool {
        self.group_comm.as_ref().map_or(false, |c| c.rank() == 0)
    }

    pub fn group_of(&self, task: usize) -> usize {
        task % self.ngroups
    }

    /// World rank of the root of the group running `task`.
    pub fn owner_of(&self, task: usize) -> usize {
        if self.world.size() == 1 {
            0
        } else {
            1 + self.group_of(task) * self.nprocs_per_task
        }
    }

    /// Tasks run by this rank's group, in increasing order.
    pub fn my_tasks(&self) -> Vec<usize> {
        match self.group {
            Some(group) => (0..self.ntasks)
                .filter(|&t| self.group_of(t) == group)
                .collect(),
            None => vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalComm, SelfComm};

    #[test]
    fn single_rank_runs_everything() {
        let tm = TaskManager::new(SelfComm::world(), 3, 1).unwrap();
        assert_eq!(tm.ngroups(), 1);
        assert_eq!(tm.my_tasks(), vec![0, 1, 2]);
        assert_eq!(tm.owner_of(2), 0);
        assert!(tm.is_group_root());
    }

    #[test]
    fn coordinator_and_groups() {
        let layouts = LocalComm::run(6, |world| {
            let tm = TaskManager::new(world, 2, 2).unwrap();
            (
                tm.group(),
                tm.my_tasks(),
                tm.is_group_root(),
                tm.group_comm().map(|c| c.size()),
                tm.owner_of(1),
            )
        });
        // Rank 0 coordinates; ranks 1-2 run task 0; ranks 3-5 run task 1
        assert_eq!(layouts[0], (None, vec![], false, None, 3));
        assert_eq!(layouts[1], (Some(0), vec![0], true, Some(2), 3));
        assert_eq!(layouts[2], (Some(0), vec![0], false, Some(2), 3));
        assert_eq!(layouts[3], (Some(1), vec![1], true, Some(3), 3));
        assert_eq!(layouts[5], (Some(1), vec![1], false, Some(3), 3));
    }

    #[test]
    fn more_tasks_than_groups() {
        let layouts = LocalComm::run(3, |world| {
            let tm = TaskManager::use_all_procs(world, 5).unwrap();
            (tm.ngroups(), tm.my_tasks())
        });
        assert_eq!(layouts[1], (2, vec![0, 2, 4]));
        assert_eq!(layouts[2], (2, vec![1, 3]));
    }
}
