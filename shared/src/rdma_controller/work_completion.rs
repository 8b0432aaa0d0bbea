use std::{fmt::Debug, mem::MaybeUninit, os::raw::c_int};

use rdma_sys::{ibv_cq, ibv_poll_cq, ibv_wc, ibv_wc_status};

use crate::error::TransportError;

/// Completions drained per poll.
pub(crate) const POLL_BATCH: usize = 16;

#[derive(Clone, Copy)]
pub struct WorkCompletion(ibv_wc);

impl WorkCompletion {
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    pub fn byte_len(&self) -> u32 {
        self.0.byte_len
    }

    pub fn is_success(&self) -> bool {
        self.0.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// A failed completion ends the run.
    pub fn check(self) -> Result<Self, TransportError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Completion {
                status: self.0.status as u32,
            })
        }
    }
}

impl Debug for WorkCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkCompletion")
            .field("wr_id", &self.0.wr_id)
            .field("status", &self.0.status)
            .field("opcode", &self.0.opcode)
            .field("byte_len", &self.0.byte_len)
            .finish()
    }
}

impl From<ibv_wc> for WorkCompletion {
    fn from(wc: ibv_wc) -> Self {
        WorkCompletion(wc)
    }
}

/// Drains up to [`POLL_BATCH`] completions into `completions`, replacing its contents.
///
/// # Safety
/// `cq` must be a live completion queue.
pub unsafe fn poll_cq(
    cq: *mut ibv_cq,
    completions: &mut Vec<WorkCompletion>,
) -> Result<usize, TransportError> {
    const WC_INIT: MaybeUninit<ibv_wc> = MaybeUninit::zeroed();

    let mut wc_buffer = [WC_INIT; POLL_BATCH];

    let num_polled = ibv_poll_cq(cq, POLL_BATCH as c_int, wc_buffer.as_mut_ptr().cast());

    if num_polled < 0 {
        return Err(super::verbs_error("ibv_poll_cq"));
    }

    completions.clear();
    completions.extend(
        wc_buffer[..num_polled as usize]
            .iter()
            .map(|wc| WorkCompletion::from(wc.assume_init_read())),
    );

    Ok(completions.len())
}
