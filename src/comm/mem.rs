//! In-process place group backed by threads.
//!
//! [`MemGroup`] runs one place per thread inside a single process, with a
//! FIFO mailbox per ordered pair of places. Because every place issues the
//! same collectives in the same order, per-pair FIFO delivery is enough to
//! line up rounds without any round tagging at this layer. This is the
//! substrate the tests run on and a stand-in for an MPI-like transport in
//! single-host deployments.

use std::collections::VecDeque;
use std::sync::{Arc, Barrier};

use parking_lot::{Condvar, Mutex};

use crate::comm::{displacements, PlaceGroup};
use crate::error::{Error, Result};

struct Shared {
    np: usize,
    // one FIFO queue per ordered (src, dst) pair, indexed src * np + dst
    mailboxes: Mutex<Vec<VecDeque<Vec<u8>>>>,
    available: Condvar,
    barrier: Barrier,
}

/// One place's handle onto an in-process group.
pub struct MemGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl MemGroup {
    /// Creates a group of `np` places, returning one handle per rank.
    ///
    /// Each handle is meant to be moved onto its own thread; all handles
    /// must participate in every collective.
    pub fn create(np: usize) -> Vec<MemGroup> {
        assert!(np > 0, "group must have at least one place");
        let shared = Arc::new(Shared {
            np,
            mailboxes: Mutex::new(vec![VecDeque::new(); np * np]),
            available: Condvar::new(),
            barrier: Barrier::new(np),
        });
        (0..np)
            .map(|rank| MemGroup {
                rank,
                shared: shared.clone(),
            })
            .collect()
    }

    fn send(&self, dst: usize, payload: Vec<u8>) {
        let mut boxes = self.shared.mailboxes.lock();
        boxes[self.rank * self.shared.np + dst].push_back(payload);
        self.shared.available.notify_all();
    }

    fn recv(&self, src: usize) -> Vec<u8> {
        let mut boxes = self.shared.mailboxes.lock();
        loop {
            if let Some(payload) = boxes[src * self.shared.np + self.rank].pop_front() {
                return payload;
            }
            self.shared.available.wait(&mut boxes);
        }
    }
}

impl PlaceGroup for MemGroup {
    fn size(&self) -> usize {
        self.shared.np
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn all_to_all_u64(&self, send: &[u64]) -> Result<Vec<u64>> {
        let np = self.shared.np;
        if send.is_empty() || send.len() % np != 0 {
            return Err(Error::Comm(format!(
                "all_to_all_u64 buffer of {} values is not a multiple of {np} places",
                send.len()
            )));
        }
        let k = send.len() / np;
        for dst in 0..np {
            let block = &send[dst * k..(dst + 1) * k];
            let mut bytes = Vec::with_capacity(k * 8);
            for v in block {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            self.send(dst, bytes);
        }
        let mut recv = Vec::with_capacity(np * k);
        for src in 0..np {
            let bytes = self.recv(src);
            if bytes.len() != k * 8 {
                return Err(Error::Comm(format!(
                    "rank {src} sent {} bytes, expected {}",
                    bytes.len(),
                    k * 8
                )));
            }
            for word in bytes.chunks_exact(8) {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(word);
                recv.push(u64::from_le_bytes(buf));
            }
        }
        Ok(recv)
    }

    fn all_to_all_v(
        &self,
        send: &[u8],
        send_counts: &[usize],
        recv_counts: &[usize],
    ) -> Result<Vec<u8>> {
        let np = self.shared.np;
        if send_counts.len() != np || recv_counts.len() != np {
            return Err(Error::Comm(format!(
                "count vectors must have one entry per place ({np})"
            )));
        }
        if send_counts.iter().sum::<usize>() != send.len() {
            return Err(Error::Comm(
                "send counts do not cover the send buffer".into(),
            ));
        }
        let offsets = displacements(send_counts);
        for dst in 0..np {
            self.send(dst, send[offsets[dst]..offsets[dst] + send_counts[dst]].to_vec());
        }
        let mut recv = Vec::with_capacity(recv_counts.iter().sum());
        for src in 0..np {
            let payload = self.recv(src);
            if payload.len() != recv_counts[src] {
                return Err(Error::Comm(format!(
                    "rank {src} sent {} bytes, expected {}",
                    payload.len(),
                    recv_counts[src]
                )));
            }
            recv.extend_from_slice(&payload);
        }
        Ok(recv)
    }

    fn all_gather(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let np = self.shared.np;
        for dst in 0..np {
            self.send(dst, data.to_vec());
        }
        Ok((0..np).map(|src| self.recv(src)).collect())
    }

    fn broadcast(&self, root: usize, data: Vec<u8>) -> Result<Vec<u8>> {
        let np = self.shared.np;
        if root >= np {
            return Err(Error::Comm(format!("broadcast root {root} out of range")));
        }
        if self.rank == root {
            for dst in 0..np {
                self.send(dst, data.clone());
            }
        }
        Ok(self.recv(root))
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_on_all<F, R>(np: usize, f: F) -> Vec<R>
    where
        F: Fn(MemGroup) -> R + Send + Sync + Clone + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = MemGroup::create(np)
            .into_iter()
            .map(|group| {
                let f = f.clone();
                thread::spawn(move || f(group))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_to_all_u64_exchanges_blocks() {
        let results = run_on_all(3, |group| {
            let rank = group.rank() as u64;
            // send (my rank, dst) to each destination
            let send: Vec<u64> = (0..3).flat_map(|dst| [rank, dst]).collect();
            group.all_to_all_u64(&send).unwrap()
        });
        for (rank, recv) in results.into_iter().enumerate() {
            for src in 0..3u64 {
                assert_eq!(recv[src as usize * 2], src);
                assert_eq!(recv[src as usize * 2 + 1], rank as u64);
            }
        }
    }

    #[test]
    fn all_to_all_v_routes_payloads() {
        let results = run_on_all(3, |group| {
            let rank = group.rank();
            // rank r sends r+1 copies of its rank byte to every place
            let payload = vec![rank as u8; rank + 1];
            let send: Vec<u8> = payload.repeat(3);
            let send_counts = vec![rank + 1; 3];
            let recv_counts = vec![1, 2, 3];
            group.all_to_all_v(&send, &send_counts, &recv_counts).unwrap()
        });
        for recv in results {
            assert_eq!(recv, vec![0, 1, 1, 2, 2, 2]);
        }
    }

    #[test]
    fn broadcast_delivers_root_payload() {
        let results = run_on_all(4, |group| group.broadcast(2, vec![group.rank() as u8]).unwrap());
        for recv in results {
            assert_eq!(recv, vec![2]);
        }
    }

    #[test]
    fn all_gather_collects_in_rank_order() {
        let results = run_on_all(3, |group| group.all_gather(&[group.rank() as u8]).unwrap());
        for recv in results {
            assert_eq!(recv, vec![vec![0], vec![1], vec![2]]);
        }
    }

    #[test]
    fn consecutive_collectives_stay_ordered() {
        let results = run_on_all(2, |group| {
            let mut seen = Vec::new();
            for round in 0..5u64 {
                let recv = group.all_to_all_u64(&[round, round]).unwrap();
                seen.push(recv);
            }
            seen
        });
        for seen in results {
            for (round, recv) in seen.into_iter().enumerate() {
                assert_eq!(recv, vec![round as u64, round as u64]);
            }
        }
    }
}
