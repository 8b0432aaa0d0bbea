use std::{mem::zeroed, ptr::null_mut};

use rdma_sys::*;

use super::check;
use crate::error::TransportError;

/// Where a work request lands on the remote side.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSlot {
    pub addr: u64,
    pub rkey: u32,
}

/// Local memory a work request reads from or writes into.
#[derive(Debug, Clone, Copy)]
pub struct LocalSlot {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

impl LocalSlot {
    fn sge(self) -> ibv_sge {
        ibv_sge {
            addr: self.addr,
            length: self.length,
            lkey: self.lkey,
        }
    }
}

/// # Safety
/// `qp` must be live and `local` must lie inside a registered region.
pub unsafe fn post_write(
    qp: *mut ibv_qp,
    wr_id: u64,
    local: LocalSlot,
    remote: RemoteSlot,
    send_flags: u32,
) -> Result<(), TransportError> {
    let mut list = local.sge();

    let mut send_wr = ibv_send_wr {
        wr_id,
        sg_list: &mut list,
        num_sge: 1,
        opcode: ibv_wr_opcode::IBV_WR_RDMA_WRITE,
        send_flags,
        ..zeroed()
    };
    send_wr.wr.rdma.remote_addr = remote.addr;
    send_wr.wr.rdma.rkey = remote.rkey;

    post(qp, &mut send_wr)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    FetchAndAdd { add: u64 },
    CompareAndSwap { compare: u64, swap: u64 },
}

/// # Safety
/// `qp` must be live, `local` must be an 8-byte registered slot and `remote.addr` 8-byte
/// aligned.
pub unsafe fn post_atomic(
    qp: *mut ibv_qp,
    wr_id: u64,
    local: LocalSlot,
    remote: RemoteSlot,
    op: AtomicOp,
    send_flags: u32,
) -> Result<(), TransportError> {
    let mut list = local.sge();

    let (opcode, compare_add, swap) = match op {
        AtomicOp::FetchAndAdd { add } => (ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD, add, 0),
        AtomicOp::CompareAndSwap { compare, swap } => {
            (ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP, compare, swap)
        }
    };

    let mut send_wr = ibv_send_wr {
        wr_id,
        sg_list: &mut list,
        num_sge: 1,
        opcode,
        send_flags,
        ..zeroed()
    };
    send_wr.wr.atomic.remote_addr = remote.addr;
    send_wr.wr.atomic.rkey = remote.rkey;
    send_wr.wr.atomic.compare_add = compare_add;
    send_wr.wr.atomic.swap = swap;

    post(qp, &mut send_wr)
}

/// # Safety
/// `qp` must be live and `local` must lie inside a registered region.
pub unsafe fn post_send(
    qp: *mut ibv_qp,
    wr_id: u64,
    local: LocalSlot,
    send_flags: u32,
) -> Result<(), TransportError> {
    let mut list = local.sge();

    let mut send_wr = ibv_send_wr {
        wr_id,
        sg_list: &mut list,
        num_sge: 1,
        opcode: ibv_wr_opcode::IBV_WR_SEND,
        send_flags,
        ..zeroed()
    };

    post(qp, &mut send_wr)
}

/// # Safety
/// `qp` must be live and `local` must lie inside a registered, writable region.
pub unsafe fn post_recv(
    qp: *mut ibv_qp,
    wr_id: u64,
    local: LocalSlot,
) -> Result<(), TransportError> {
    let mut bad_recv_wr = null_mut();
    let mut list = local.sge();

    let mut recv_wr = ibv_recv_wr {
        wr_id,
        sg_list: &mut list,
        num_sge: 1,
        ..zeroed()
    };

    check(
        ibv_post_recv(qp, &mut recv_wr, &mut bad_recv_wr),
        "ibv_post_recv",
    )
}

unsafe fn post(qp: *mut ibv_qp, send_wr: &mut ibv_send_wr) -> Result<(), TransportError> {
    let mut bad_send_wr = null_mut();
    check(ibv_post_send(qp, send_wr, &mut bad_send_wr), "ibv_post_send")
}

pub struct SendFlagBuilder {
    flags: u32,
}

impl SendFlagBuilder {
    pub fn new() -> Self {
        Self { flags: 0 }
    }

    pub fn signaled(mut self) -> Self {
        self.flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        self
    }

    pub fn inline(mut self) -> Self {
        self.flags |= ibv_send_flags::IBV_SEND_INLINE.0;
        self
    }

    pub fn build(self) -> u32 {
        self.flags
    }
}
