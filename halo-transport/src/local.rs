//! In-process process group: every node is a thread, every ordered pair of
//! nodes is connected by its own FIFO channel.

use std::cell::Cell;

use crossbeam_channel::{unbounded, Receiver, Sender};
use halo_core::Rank;
use log::trace;

use crate::{CollectiveOp, CommError, Communicator, PayloadCodec, Traffic};

/// A message on a point-to-point link, tagged with the collective it
/// belongs to so that ranks running out of step are detected.
#[derive(Debug)]
struct Envelope {
    op: CollectiveOp,
    seq: u64,
    payload: Vec<u8>,
}

/// Factory for connected groups of [`LocalCommunicator`]s.
pub struct ProcessGroup;

impl ProcessGroup {
    /// Creates `size` communicators forming one group. Hand each one to its
    /// own thread.
    pub fn local(size: usize, codec: PayloadCodec) -> Vec<LocalCommunicator> {
        assert!(size > 0, "a process group needs at least one node");

        // senders[src][dst] and receivers[dst][src] are the two ends of one link
        let mut senders: Vec<Vec<Sender<Envelope>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Receiver<Envelope>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();

        for outgoing in senders.iter_mut() {
            for incoming in receivers.iter_mut() {
                let (tx, rx) = unbounded();
                outgoing.push(tx);
                incoming.push(rx);
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (senders, receivers))| LocalCommunicator {
                rank,
                size,
                codec,
                senders,
                receivers,
                seq: Cell::new(0),
                traffic: Cell::new(Traffic::default()),
            })
            .collect()
    }

    /// A group with a single member.
    pub fn single(codec: PayloadCodec) -> LocalCommunicator {
        Self::local(1, codec).remove(0)
    }
}

/// One node of an in-process group.
///
/// Not `Sync`: a communicator belongs to exactly one node thread.
pub struct LocalCommunicator {
    rank: Rank,
    size: usize,
    codec: PayloadCodec,
    /// indexed by destination rank
    senders: Vec<Sender<Envelope>>,
    /// indexed by source rank
    receivers: Vec<Receiver<Envelope>>,
    seq: Cell<u64>,
    traffic: Cell<Traffic>,
}

impl LocalCommunicator {
    fn begin(&self, op: CollectiveOp) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        trace!("rank {}: {:?} #{}", self.rank, op, seq);
        seq
    }

    fn check_rank(&self, rank: Rank) -> Result<(), CommError> {
        if rank < self.size {
            Ok(())
        } else {
            Err(CommError::InvalidRank { rank, size: self.size })
        }
    }

    fn send(&self, dst: Rank, op: CollectiveOp, seq: u64, payload: Vec<u8>) -> Result<(), CommError> {
        let mut traffic = self.traffic.get();
        traffic.messages += 1;
        traffic.bytes += payload.len() as u64;
        self.traffic.set(traffic);

        self.senders[dst]
            .send(Envelope { op, seq, payload })
            .map_err(|_| CommError::Disconnected { peer: dst })
    }

    fn recv(&self, src: Rank, op: CollectiveOp, seq: u64) -> Result<Vec<u8>, CommError> {
        let envelope = self.receivers[src]
            .recv()
            .map_err(|_| CommError::Disconnected { peer: src })?;

        if envelope.op != op || envelope.seq != seq {
            return Err(CommError::ProtocolMismatch {
                peer: src,
                expected: op,
                expected_seq: seq,
                got: envelope.op,
                got_seq: envelope.seq,
            });
        }
        Ok(envelope.payload)
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn codec(&self) -> PayloadCodec {
        self.codec
    }

    fn traffic(&self) -> Traffic {
        self.traffic.get()
    }

    fn broadcast_bytes(&self, root: Rank, payload: Option<Vec<u8>>) -> Result<Vec<u8>, CommError> {
        self.check_rank(root)?;
        let seq = self.begin(CollectiveOp::Broadcast);

        if self.rank == root {
            let payload = payload.ok_or(CommError::MissingRootValue { root })?;
            for dst in (0..self.size).filter(|&dst| dst != root) {
                self.send(dst, CollectiveOp::Broadcast, seq, payload.clone())?;
            }
            Ok(payload)
        } else {
            self.recv(root, CollectiveOp::Broadcast, seq)
        }
    }

    fn all_to_all_bytes(&self, mut outgoing: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, CommError> {
        if outgoing.len() != self.size {
            return Err(CommError::LengthMismatch {
                expected: self.size,
                got: outgoing.len(),
            });
        }
        let seq = self.begin(CollectiveOp::AllToAll);

        let own = std::mem::take(&mut outgoing[self.rank]);
        for (dst, payload) in outgoing.into_iter().enumerate() {
            if dst != self.rank {
                self.send(dst, CollectiveOp::AllToAll, seq, payload)?;
            }
        }

        let mut incoming = Vec::with_capacity(self.size);
        let mut own = Some(own);
        for src in 0..self.size {
            if src == self.rank {
                incoming.push(own.take().unwrap_or_default());
            } else {
                incoming.push(self.recv(src, CollectiveOp::AllToAll, seq)?);
            }
        }
        Ok(incoming)
    }

    fn gather_bytes(&self, root: Rank, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        self.check_rank(root)?;
        let seq = self.begin(CollectiveOp::Gather);

        if self.rank != root {
            self.send(root, CollectiveOp::Gather, seq, payload)?;
            return Ok(None);
        }

        let mut parts = Vec::with_capacity(self.size);
        let mut own = Some(payload);
        for src in 0..self.size {
            if src == root {
                parts.push(own.take().unwrap_or_default());
            } else {
                parts.push(self.recv(src, CollectiveOp::Gather, seq)?);
            }
        }
        Ok(Some(parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Runs `f` once per rank on its own thread and returns the results in
    /// rank order.
    fn run_group<R, F>(size: usize, codec: PayloadCodec, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(LocalCommunicator) -> R + Sync,
    {
        let comms = ProcessGroup::local(size, codec);
        let f = &f;
        thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| s.spawn(move || f(comm)))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let results = run_group(4, PayloadCodec::Binary, |comm| {
            let value = (comm.rank() == 2).then(|| "from two".to_string());
            comm.broadcast(2, value).unwrap()
        });
        assert!(results.iter().all(|v| v == "from two"));
    }

    #[test]
    fn all_to_all_routes_by_destination() {
        let results = run_group(3, PayloadCodec::Json, |comm| {
            let me = comm.rank();
            let outgoing: Vec<(usize, usize)> = (0..comm.size()).map(|dst| (me, dst)).collect();
            comm.all_to_all(outgoing).unwrap()
        });

        for (rank, received) in results.iter().enumerate() {
            let expected: Vec<(usize, usize)> = (0..3).map(|src| (src, rank)).collect();
            assert_eq!(received, &expected);
        }
    }

    #[test]
    fn reduce_folds_in_rank_order() {
        let results = run_group(4, PayloadCodec::Binary, |comm| {
            comm.reduce(1, vec![comm.rank()], |mut a, b| {
                a.extend(b);
                a
            })
            .unwrap()
        });

        assert_eq!(results[1], Some(vec![0, 1, 2, 3]));
        assert!(results.iter().enumerate().all(|(r, v)| r == 1 || v.is_none()));
    }

    #[test]
    fn all_reduce_agrees_everywhere() {
        let results = run_group(5, PayloadCodec::Binary, |comm| {
            comm.all_reduce(comm.rank() as u64 + 1, |a, b| a + b).unwrap()
        });
        assert!(results.iter().all(|&sum| sum == 15));
    }

    #[test]
    fn single_node_collectives_send_nothing() {
        let comm = ProcessGroup::single(PayloadCodec::Binary);
        assert_eq!(comm.all_to_all(vec![vec![1u8, 2]]).unwrap(), vec![vec![1u8, 2]]);
        assert_eq!(comm.broadcast(0, Some(9u32)).unwrap(), 9);
        assert_eq!(comm.all_reduce(3i32, |a, b| a + b).unwrap(), 3);
        comm.barrier().unwrap();
        assert_eq!(comm.traffic(), Traffic::default());
    }

    #[test]
    fn mismatched_collectives_are_detected() {
        let results = run_group(2, PayloadCodec::Binary, |comm| {
            if comm.rank() == 0 {
                // the barrier keeps rank 0 alive until rank 1 has sent
                comm.broadcast(0, Some(1u8)).and_then(|_| comm.barrier())
            } else {
                comm.all_to_all(vec![0u8, 0u8]).map(|_| ())
            }
        });

        assert!(matches!(
            results[0],
            Err(CommError::ProtocolMismatch {
                peer: 1,
                expected: CollectiveOp::Gather,
                got: CollectiveOp::AllToAll,
                ..
            })
        ));
        assert!(matches!(
            results[1],
            Err(CommError::ProtocolMismatch {
                peer: 0,
                expected: CollectiveOp::AllToAll,
                got: CollectiveOp::Broadcast,
                ..
            })
        ));
    }

    #[test]
    fn dropped_peer_reports_disconnect() {
        let mut comms = ProcessGroup::local(2, PayloadCodec::Binary);
        let survivor = comms.remove(0);
        drop(comms);

        let result = survivor.broadcast::<u8>(1, None);
        assert!(matches!(result, Err(CommError::Disconnected { peer: 1 })));
    }

    #[test]
    fn wrong_buffer_count_rejected() {
        let comm = ProcessGroup::single(PayloadCodec::Binary);
        let result = comm.all_to_all(vec![1u8, 2u8]);
        assert!(matches!(result, Err(CommError::LengthMismatch { expected: 1, got: 2 })));
    }
}
