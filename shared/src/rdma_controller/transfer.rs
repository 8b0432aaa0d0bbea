use std::{
    hint::spin_loop,
    ptr::{read_volatile, write_volatile},
};

use super::{
    send::{post_atomic, post_write, AtomicOp, LocalSlot, RemoteSlot, SendFlagBuilder},
    work_completion::{poll_cq, WorkCompletion, POLL_BATCH},
    IbResource, MAX_INLINE,
};
use crate::{
    config::{Role, RunLength, ATOMIC_SIZE},
    error::TransportError,
    transport::RawCounters,
};

/// Marker byte for the `seq`-th message. Never zero, so untouched memory never matches.
fn tag(seq: u64) -> u8 {
    (seq % 255) as u8 + 1
}

impl IbResource {
    /// Ping-pong of RDMA writes on the first queue pair. Each side spins on the last byte of
    /// its receive half until the peer's next marker lands there.
    pub(super) fn write_latency(
        &mut self,
        size: u64,
        length: RunLength,
    ) -> Result<RawCounters, TransportError> {
        let RunLength::Iterations(iterations) = length else {
            return Err(TransportError::Unsupported("duration-based write latency"));
        };

        let len = match usize::try_from(size) {
            Ok(len) if len > 0 && len <= self.max_size => len,
            _ => {
                return Err(TransportError::Other(format!(
                    "message size {size} outside the registered buffer"
                )))
            }
        };

        let (qp, remote) = match (self.qps.first(), self.remote.first()) {
            (Some(&qp), Some(remote)) => (qp, *remote),
            _ => return Err(TransportError::Other("no connected queue pair".into())),
        };

        let base = self.buffer.as_mut_ptr().cast::<u8>();
        let (poll_byte, post_half) = unsafe { (base.add(len - 1), base.add(self.max_size)) };
        let post_byte = unsafe { post_half.add(len - 1) };

        let local = LocalSlot {
            addr: post_half as u64,
            length: len as u32,
            lkey: self.lkey(),
        };
        let target = RemoteSlot {
            addr: remote.vaddr,
            rkey: remote.rkey,
        };

        let flags = if len <= MAX_INLINE as usize {
            SendFlagBuilder::new().signaled().inline().build()
        } else {
            SendFlagBuilder::new().signaled().build()
        };

        let sends_first = self.role == Role::Client;
        let mut completions = Vec::with_capacity(POLL_BATCH);
        let mut posted = Vec::with_capacity(iterations as usize);
        let (mut scnt, mut rcnt) = (0u64, 0u64);

        while scnt < iterations || rcnt < iterations {
            if rcnt < iterations && (scnt > 0 || !sends_first) {
                rcnt += 1;
                let expected = tag(self.recv_seq + rcnt);
                while unsafe { read_volatile(poll_byte) } != expected {
                    spin_loop();
                }
            }

            if scnt < iterations {
                scnt += 1;
                unsafe { write_volatile(post_byte, tag(self.send_seq + scnt)) };

                posted.push(self.clock.now());
                unsafe { post_write(qp, scnt, local, target, flags)? };
                self.wait_for_completions(&mut completions, 1)?;
            }
        }

        self.send_seq += iterations;
        self.recv_seq += iterations;

        let elapsed = match (posted.first(), posted.last()) {
            (Some(first), Some(last)) => last.duration_since(*first),
            _ => Default::default(),
        };

        Ok(RawCounters {
            size,
            messages: iterations,
            bytes: size * iterations,
            elapsed,
            samples: posted
                .windows(2)
                .map(|pair| pair[1].duration_since(pair[0]))
                .collect(),
        })
    }

    /// Keeps `tx_depth` atomics in flight on every queue pair until the run length is used up.
    pub(super) fn atomic_bandwidth(
        &mut self,
        op: AtomicOp,
        length: RunLength,
    ) -> Result<RawCounters, TransportError> {
        if self.qps.is_empty() || self.remote.len() < self.qps.len() {
            return Err(TransportError::Other("no connected queue pair".into()));
        }

        let (limit, deadline) = match length {
            RunLength::Iterations(n) => (n, None),
            RunLength::Duration(d) => (u64::MAX, Some(d)),
        };

        // Fetched values land in the second word; the first is the peers' target.
        let local = LocalSlot {
            addr: self.buffer.as_ptr() as u64 + ATOMIC_SIZE,
            length: ATOMIC_SIZE as u32,
            lkey: self.lkey(),
        };
        let targets: Vec<RemoteSlot> = self
            .remote
            .iter()
            .map(|dest| RemoteSlot {
                addr: dest.vaddr,
                rkey: dest.rkey,
            })
            .collect();

        let depth = u64::from(self.device.tx_depth);
        let flags = SendFlagBuilder::new().signaled().build();
        let mut outstanding = vec![0u64; self.qps.len()];
        let mut completions = Vec::with_capacity(POLL_BATCH);
        let (mut posted, mut completed) = (0u64, 0u64);

        let start = self.clock.now();

        loop {
            let in_time = deadline.map_or(true, |d| self.clock.now().duration_since(start) < d);

            if posted < limit && in_time {
                for (index, &qp) in self.qps.iter().enumerate() {
                    while outstanding[index] < depth && posted < limit {
                        unsafe { post_atomic(qp, index as u64, local, targets[index], op, flags)? };
                        outstanding[index] += 1;
                        posted += 1;
                    }
                }
            } else if outstanding.iter().all(|&n| n == 0) {
                break;
            }

            unsafe { poll_cq(self.cq, &mut completions)? };
            for wc in &completions {
                let wc = wc.check()?;
                outstanding[wc.wr_id() as usize] -= 1;
                completed += 1;
            }
        }

        let elapsed = self.clock.now().duration_since(start);

        Ok(RawCounters {
            size: ATOMIC_SIZE,
            messages: completed,
            bytes: completed * ATOMIC_SIZE,
            elapsed,
            samples: Vec::new(),
        })
    }

    fn wait_for_completions(
        &self,
        completions: &mut Vec<WorkCompletion>,
        mut count: usize,
    ) -> Result<(), TransportError> {
        while count > 0 {
            let polled = unsafe { poll_cq(self.cq, completions)? };
            for wc in completions.iter() {
                wc.check()?;
            }
            count = count.saturating_sub(polled);
        }

        Ok(())
    }
}
