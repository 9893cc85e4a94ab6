//! PID directory: a fixed-fan-out tree that assigns and
//! resolves PIDs without a flat array sized to `PID_MAX`.
//!
//! Grounded on `original_source/kern/proc/pid.c`'s `pid_tree`, which has two
//! bugs this rewrite fixes rather than carries forward: `pid_get_proc`/
//! `pid_remove_proc` recurse into `subtrees[i]` when a local pid exceeds the
//! target, but `subtrees[i]` spans the range *above* `local_pids[i]` — the
//! correct child for "pid is less than `local_pids[i]`" is `subtrees[i-1]`.
//! The source's `if (i = 0)` is also an assignment, not a comparison; this
//! rewrite's index arithmetic makes the `i == 0` boundary check explicit
//! instead of accidentally-always-true. Subtree disposal is expressed as
//! ordinary `Box` ownership (a child subtree is dropped when its recorded
//! size reaches zero) rather than the source's explicit parent pointer walk,
//! since Rust's ownership tree already knows how to free a `None` slot.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::config::{PID_DIR_SIZE, PID_MAX, PID_MIN};
use crate::error::Errno;
use crate::process::Pcb;
use crate::sync::SleepLock;

struct Node {
    local_pids: [Option<i32>; PID_DIR_SIZE],
    local_pcbs: [Option<Arc<Pcb>>; PID_DIR_SIZE],
    subtrees: [Option<Box<Node>>; PID_DIR_SIZE],
    subtree_sizes: [usize; PID_DIR_SIZE],
}

impl Node {
    fn empty() -> Self {
        Node {
            local_pids: [None; PID_DIR_SIZE],
            local_pcbs: Default::default(),
            subtrees: Default::default(),
            subtree_sizes: [0; PID_DIR_SIZE],
        }
    }

    fn allocate(&mut self, pcb: Arc<Pcb>, pid_min: i32, pid_max: i32) -> Option<i32> {
        for i in 0..PID_DIR_SIZE {
            if self.local_pcbs[i].is_none() {
                let pid = self.local_pids[i].unwrap_or_else(|| {
                    pid_min + (i as i32) * (pid_max - pid_min) / (PID_DIR_SIZE as i32)
                });
                self.local_pids[i] = Some(pid);
                self.local_pcbs[i] = Some(pcb);
                return Some(pid);
            }
        }

        let mut idx = 0;
        for i in 1..PID_DIR_SIZE {
            if self.subtree_sizes[i] < self.subtree_sizes[idx] {
                idx = i;
            }
        }
        if self.subtrees[idx].is_none() {
            self.subtrees[idx] = Some(Box::new(Node::empty()));
        }
        let sub_min = self.local_pids[idx].map(|p| p + 1).unwrap_or(pid_min);
        let sub_max = if idx + 1 < PID_DIR_SIZE {
            self.local_pids[idx + 1].map(|p| p - 1).unwrap_or(pid_max)
        } else {
            pid_max
        };
        let assigned = self.subtrees[idx].as_mut().unwrap().allocate(pcb, sub_min, sub_max);
        if assigned.is_some() {
            self.subtree_sizes[idx] += 1;
        }
        assigned
    }

    fn get(&self, pid: i32) -> Option<Arc<Pcb>> {
        for i in 0..PID_DIR_SIZE {
            match self.local_pids[i] {
                Some(p) if p == pid => return self.local_pcbs[i].clone(),
                Some(p) if pid < p => {
                    if i == 0 {
                        return None;
                    }
                    return self.subtrees[i - 1].as_ref()?.get(pid);
                }
                _ => {}
            }
        }
        self.subtrees[PID_DIR_SIZE - 1].as_ref()?.get(pid)
    }

    fn remove(&mut self, pid: i32) -> Option<Arc<Pcb>> {
        for i in 0..PID_DIR_SIZE {
            match self.local_pids[i] {
                Some(p) if p == pid => {
                    let pcb = self.local_pcbs[i].take();
                    let right_has = self.subtree_sizes[i] > 0;
                    let left_has = i > 0 && self.subtree_sizes[i - 1] > 0;
                    if !right_has && !left_has {
                        self.local_pids[i] = None;
                    }
                    return pcb;
                }
                Some(p) if pid < p => {
                    if i == 0 {
                        return None;
                    }
                    return self.remove_from_subtree(i - 1, pid);
                }
                _ => {}
            }
        }
        self.remove_from_subtree(PID_DIR_SIZE - 1, pid)
    }

    fn remove_from_subtree(&mut self, idx: usize, pid: i32) -> Option<Arc<Pcb>> {
        let removed = self.subtrees[idx].as_mut()?.remove(pid);
        if removed.is_some() {
            self.subtree_sizes[idx] -= 1;
            if self.subtree_sizes[idx] == 0 {
                self.subtrees[idx] = None;
            }
        }
        removed
    }

    fn is_empty(&self) -> bool {
        self.local_pids.iter().all(Option::is_none)
            && self.local_pcbs.iter().all(Option::is_none)
            && self.subtrees.iter().all(Option::is_none)
            && self.subtree_sizes.iter().all(|&n| n == 0)
    }
}

/// The directory lock sits at tier 2 of the crate's lock-ordering scheme:
/// acquired before the page-table structural lock, never while it or
/// anything below it is held.
pub struct PidDirectory {
    root: SleepLock<Node>,
}

impl PidDirectory {
    /// Installs `kernel` at the reserved slot 0.
    pub fn new(kernel: Arc<Pcb>) -> Self {
        let mut root = Node::empty();
        root.local_pids[0] = Some(crate::config::KERNEL_PID);
        root.local_pcbs[0] = Some(kernel);
        PidDirectory { root: SleepLock::new(root) }
    }

    pub fn allocate(&self, pcb: Arc<Pcb>) -> Result<i32, Errno> {
        self.root.lock().allocate(pcb, PID_MIN, PID_MAX).ok_or(Errno::ENPROC)
    }

    pub fn get(&self, pid: i32) -> Option<Arc<Pcb>> {
        self.root.lock().get(pid)
    }

    pub fn remove(&self, pid: i32) -> Option<Arc<Pcb>> {
        self.root.lock().remove(pid)
    }

    pub fn destroy(self) {
        debug_assert!(self.root.lock().is_empty(), "pid directory must be empty before destruction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Pcb;

    fn pcb(pid: i32) -> Arc<Pcb> {
        Arc::new(Pcb::for_test(pid))
    }

    #[test]
    fn allocate_assigns_distinct_pids_and_get_resolves_them() {
        let dir = PidDirectory::new(pcb(crate::config::KERNEL_PID));
        let mut pids = alloc::vec::Vec::new();
        for _ in 0..20 {
            pids.push(dir.allocate(pcb(0)).unwrap());
        }
        pids.sort_unstable();
        pids.dedup();
        assert_eq!(pids.len(), 20);
        for &pid in &pids {
            assert!(dir.get(pid).is_some());
        }
    }

    #[test]
    fn remove_then_get_returns_none() {
        let dir = PidDirectory::new(pcb(crate::config::KERNEL_PID));
        let pid = dir.allocate(pcb(0)).unwrap();
        assert!(dir.remove(pid).is_some());
        assert!(dir.get(pid).is_none());
    }

    #[test]
    fn fill_257_processes_then_drain_returns_to_empty_state() {
        let dir = PidDirectory::new(pcb(crate::config::KERNEL_PID));
        let mut pids = alloc::vec::Vec::new();
        for _ in 0..257 {
            pids.push(dir.allocate(pcb(0)).unwrap());
        }
        let mut sorted = pids.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 257, "all 257 pids must be pairwise distinct");
        for &pid in &pids {
            assert!((PID_MIN..=PID_MAX).contains(&pid));
            assert!(dir.get(pid).is_some());
        }

        for &pid in pids.iter().rev() {
            assert!(dir.remove(pid).is_some());
        }
        for &pid in &pids {
            assert!(dir.get(pid).is_none());
        }

        // A second full batch lands in a fully-drained tree and must again
        // be internally distinct and in range. Individual values may
        // coincide with the first batch's: the directory intentionally
        // hands back the same computed pid for a given slot once it frees
        // up, mirroring `pid_allocate_helper`'s `local_pids[i] != -1` reuse
        // in `original_source/kern/proc/pid.c`.
        let mut second = alloc::vec::Vec::new();
        for _ in 0..257 {
            second.push(dir.allocate(pcb(0)).unwrap());
        }
        let mut sorted2 = second.clone();
        sorted2.sort_unstable();
        sorted2.dedup();
        assert_eq!(sorted2.len(), 257);
        for &pid in &second {
            assert!((PID_MIN..=PID_MAX).contains(&pid));
        }
    }

    #[test]
    fn a_live_pid_is_never_handed_out_to_a_new_process() {
        let dir = PidDirectory::new(pcb(crate::config::KERNEL_PID));
        let mut pids = alloc::vec::Vec::new();
        for _ in 0..64 {
            pids.push(dir.allocate(pcb(0)).unwrap());
        }
        let mut removed = alloc::vec::Vec::new();
        for (i, &pid) in pids.iter().enumerate() {
            if i % 2 == 0 {
                dir.remove(pid);
                removed.push(pid);
            }
        }
        let still_live: alloc::vec::Vec<i32> = pids.iter().copied().filter(|p| !removed.contains(p)).collect();

        for _ in 0..32 {
            let new_pid = dir.allocate(pcb(0)).unwrap();
            assert!(!still_live.contains(&new_pid));
        }
    }

    #[test]
    fn many_allocations_still_resolve_after_interleaved_removal() {
        let dir = PidDirectory::new(pcb(crate::config::KERNEL_PID));
        let mut pids = alloc::vec::Vec::new();
        for _ in 0..64 {
            pids.push(dir.allocate(pcb(0)).unwrap());
        }
        for &pid in pids.iter().step_by(2) {
            dir.remove(pid);
        }
        for (i, &pid) in pids.iter().enumerate() {
            if i % 2 == 0 {
                assert!(dir.get(pid).is_none());
            } else {
                assert!(dir.get(pid).is_some());
            }
        }
    }
}
