//! Connections made through the RDMA connection manager, and the control link built on one.

use std::{
    ffi::CString,
    io::{self, Read, Write},
    mem::zeroed,
    net::IpAddr,
    os::raw::c_int,
    ptr::{null, null_mut},
    thread,
};

use rdma_sys::*;
use tracing::debug;

use super::{
    check,
    memory_region::MemoryRegion,
    send::{post_recv, post_send, LocalSlot, SendFlagBuilder},
    verbs_error,
    work_completion::{poll_cq, WorkCompletion, POLL_BATCH},
};
use crate::{
    channel::{Backlog, CmLink},
    config::ConnectionType,
    error::TransportError,
};

const RESOLVE_TIMEOUT_MS: c_int = 2000;
const BACKLOG: c_int = 16;
const CM_RETRY: u8 = 7;

/// Creates the queue pair on a freshly resolved id and returns the read/atomic depth to
/// advertise.
pub(crate) type Attach<'a> = dyn FnMut(*mut rdma_cm_id) -> Result<u8, TransportError> + 'a;

struct AddrInfo(*mut rdma_addrinfo);

impl AddrInfo {
    fn resolve(node: Option<IpAddr>, port: u16, passive: bool) -> Result<Self, TransportError> {
        let invalid = |_| TransportError::Other("address contains a NUL byte".into());
        let node = node.map(|addr| CString::new(addr.to_string())).transpose().map_err(invalid)?;
        let service = CString::new(port.to_string()).map_err(invalid)?;

        unsafe {
            let mut hints: rdma_addrinfo = zeroed();
            hints.ai_port_space = rdma_port_space::RDMA_PS_TCP as c_int;
            if passive {
                hints.ai_flags = RAI_PASSIVE as c_int;
            }

            let mut res = null_mut();
            check(
                rdma_getaddrinfo(
                    node.as_ref().map_or(null(), |node| node.as_ptr()),
                    service.as_ptr(),
                    &hints,
                    &mut res,
                ),
                "rdma_getaddrinfo",
            )?;

            Ok(AddrInfo(res))
        }
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        unsafe { rdma_freeaddrinfo(self.0) };
    }
}

/// Waits for the next event on `channel` and fails unless it is `expected`.
unsafe fn expect_event(
    channel: *mut rdma_event_channel,
    expected: rdma_cm_event_type::Type,
) -> Result<*mut rdma_cm_id, TransportError> {
    let mut event = null_mut();
    check(rdma_get_cm_event(channel, &mut event), "rdma_get_cm_event")?;

    let (kind, id, status) = ((*event).event, (*event).id, (*event).status);
    rdma_ack_cm_event(event);

    if kind != expected {
        return Err(TransportError::Other(format!(
            "connection manager event {kind} (status {status}), expected {expected}"
        )));
    }

    Ok(id)
}

fn conn_param(rd_atomic: u8) -> rdma_conn_param {
    rdma_conn_param {
        responder_resources: rd_atomic,
        initiator_depth: rd_atomic,
        retry_count: CM_RETRY,
        rnr_retry_count: CM_RETRY,
        ..unsafe { zeroed() }
    }
}

pub(crate) struct CmListener {
    channel: *mut rdma_event_channel,
    id: *mut rdma_cm_id,
}

impl CmListener {
    pub fn bind(port: u16) -> Result<Self, TransportError> {
        unsafe {
            let channel = rdma_create_event_channel();
            if channel.is_null() {
                return Err(verbs_error("rdma_create_event_channel"));
            }

            let mut listener = CmListener {
                channel,
                id: null_mut(),
            };

            check(
                rdma_create_id(
                    channel,
                    &mut listener.id,
                    null_mut(),
                    rdma_port_space::RDMA_PS_TCP,
                ),
                "rdma_create_id",
            )?;

            let info = AddrInfo::resolve(None, port, true)?;
            check(rdma_bind_addr(listener.id, (*info.0).ai_src_addr), "rdma_bind_addr")?;
            check(rdma_listen(listener.id, BACKLOG), "rdma_listen")?;

            debug!(port, "connection manager listening");
            Ok(listener)
        }
    }

    /// Accepts the next connect request.
    pub fn accept(&self, attach: &mut Attach<'_>) -> Result<CmConnection, TransportError> {
        unsafe {
            let id = expect_event(self.channel, rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST)?;

            // Events of accepted ids arrive on the listener's channel.
            let connection = CmConnection {
                channel: null_mut(),
                id,
            };

            let rd_atomic = attach(id)?;
            let mut param = conn_param(rd_atomic);
            check(rdma_accept(id, &mut param), "rdma_accept")?;
            expect_event(self.channel, rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED)?;

            Ok(connection)
        }
    }
}

impl Drop for CmListener {
    fn drop(&mut self) {
        unsafe {
            if !self.id.is_null() {
                rdma_destroy_id(self.id);
            }
            rdma_destroy_event_channel(self.channel);
        }
    }
}

/// One established connection. Destroys its queue pair, if any, on drop.
pub(crate) struct CmConnection {
    /// Null when the events are owned by a listener.
    channel: *mut rdma_event_channel,
    id: *mut rdma_cm_id,
}

impl CmConnection {
    pub fn connect(
        server_addr: IpAddr,
        port: u16,
        attach: &mut Attach<'_>,
    ) -> Result<Self, TransportError> {
        unsafe {
            let channel = rdma_create_event_channel();
            if channel.is_null() {
                return Err(verbs_error("rdma_create_event_channel"));
            }

            let mut connection = CmConnection {
                channel,
                id: null_mut(),
            };

            check(
                rdma_create_id(
                    channel,
                    &mut connection.id,
                    null_mut(),
                    rdma_port_space::RDMA_PS_TCP,
                ),
                "rdma_create_id",
            )?;

            let info = AddrInfo::resolve(Some(server_addr), port, false)?;
            check(
                rdma_resolve_addr(
                    connection.id,
                    (*info.0).ai_src_addr,
                    (*info.0).ai_dst_addr,
                    RESOLVE_TIMEOUT_MS,
                ),
                "rdma_resolve_addr",
            )?;
            expect_event(channel, rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED)?;

            check(
                rdma_resolve_route(connection.id, RESOLVE_TIMEOUT_MS),
                "rdma_resolve_route",
            )?;
            expect_event(channel, rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED)?;

            let rd_atomic = attach(connection.id)?;
            let mut param = conn_param(rd_atomic);
            check(rdma_connect(connection.id, &mut param), "rdma_connect")?;
            expect_event(channel, rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED)?;

            debug!(%server_addr, port, "connection manager connected");
            Ok(connection)
        }
    }

    pub fn disconnect(&mut self) -> Result<(), TransportError> {
        unsafe { check(rdma_disconnect(self.id), "rdma_disconnect") }
    }
}

impl Drop for CmConnection {
    fn drop(&mut self) {
        unsafe {
            if !self.id.is_null() {
                if !(*self.id).qp.is_null() {
                    rdma_destroy_qp(self.id);
                }
                rdma_destroy_id(self.id);
            }
            if !self.channel.is_null() {
                rdma_destroy_event_channel(self.channel);
            }
        }
    }
}

const SLOT_SIZE: usize = 4096;
const RECV_SLOTS: usize = 16;
const SEND_SLOT: usize = RECV_SLOTS;

/// Verbs objects of the control link, on whichever device the connection resolved to.
struct LinkResources {
    pd: *mut ibv_pd,
    send_cq: *mut ibv_cq,
    recv_cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    buffer: Vec<u8>,
    mr: Option<MemoryRegion>,
}

impl LinkResources {
    fn new() -> Self {
        LinkResources {
            pd: null_mut(),
            send_cq: null_mut(),
            recv_cq: null_mut(),
            qp: null_mut(),
            buffer: vec![0; SLOT_SIZE * (RECV_SLOTS + 1)],
            mr: None,
        }
    }

    unsafe fn attach(&mut self, id: *mut rdma_cm_id) -> Result<u8, TransportError> {
        let verbs = (*id).verbs;

        self.pd = ibv_alloc_pd(verbs);
        if self.pd.is_null() {
            return Err(verbs_error("ibv_alloc_pd"));
        }

        self.send_cq = ibv_create_cq(verbs, 1, null_mut(), null_mut(), 0);
        self.recv_cq = ibv_create_cq(verbs, RECV_SLOTS as c_int, null_mut(), null_mut(), 0);
        if self.send_cq.is_null() || self.recv_cq.is_null() {
            return Err(verbs_error("ibv_create_cq"));
        }

        let mr = MemoryRegion::register_with(
            self.pd,
            &mut self.buffer,
            ibv_access_flags::IBV_ACCESS_LOCAL_WRITE,
        )
        .map_err(|source| TransportError::Verbs {
            call: "ibv_reg_mr",
            source,
        })?;
        self.mr = Some(mr);

        let mut attr = ibv_qp_init_attr {
            qp_type: ibv_qp_type::IBV_QPT_RC,
            send_cq: self.send_cq,
            recv_cq: self.recv_cq,
            cap: ibv_qp_cap {
                max_send_wr: 1,
                max_recv_wr: RECV_SLOTS as u32,
                max_send_sge: 1,
                max_recv_sge: 1,
                ..zeroed()
            },
            ..zeroed()
        };
        check(rdma_create_qp(id, self.pd, &mut attr), "rdma_create_qp")?;
        self.qp = (*id).qp;

        for slot in 0..RECV_SLOTS {
            self.post_slot(slot)?;
        }

        Ok(1)
    }

    fn slot(&self, slot: usize, length: usize) -> LocalSlot {
        LocalSlot {
            addr: self.buffer[slot * SLOT_SIZE..].as_ptr() as u64,
            length: length as u32,
            lkey: self.mr.as_ref().map_or(0, |mr| mr.lkey),
        }
    }

    unsafe fn post_slot(&self, slot: usize) -> Result<(), TransportError> {
        post_recv(self.qp, slot as u64, self.slot(slot, SLOT_SIZE))
    }
}

impl Drop for LinkResources {
    fn drop(&mut self) {
        self.mr = None;
        unsafe {
            if !self.send_cq.is_null() {
                ibv_destroy_cq(self.send_cq);
            }
            if !self.recv_cq.is_null() {
                ibv_destroy_cq(self.recv_cq);
            }
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
        }
    }
}

/// Partially consumed receive slot.
#[derive(Debug, Clone, Copy)]
struct Pending {
    slot: usize,
    offset: usize,
    len: usize,
}

/// Byte stream over SEND/RECV on a connection-manager connection.
pub(crate) struct CmControlLink {
    // Field order is drop order: the queue pair goes before the memory it uses.
    connection: CmConnection,
    listener: Option<CmListener>,
    resources: LinkResources,
    /// Scratch space for one poll.
    polled: Vec<WorkCompletion>,
    received: Backlog<WorkCompletion>,
    sent: Backlog<WorkCompletion>,
    pending: Option<Pending>,
}

unsafe impl Send for CmControlLink {}

impl CmControlLink {
    pub fn establish(connection_type: &ConnectionType) -> Result<Self, TransportError> {
        let mut resources = LinkResources::new();
        let mut attach = |id: *mut rdma_cm_id| unsafe { resources.attach(id) };

        let (connection, listener) = match *connection_type {
            ConnectionType::Server { port } => {
                let listener = CmListener::bind(port)?;
                (listener.accept(&mut attach)?, Some(listener))
            }
            ConnectionType::Client { server_addr, port } => {
                (CmConnection::connect(server_addr, port, &mut attach)?, None)
            }
        };

        Ok(CmControlLink {
            connection,
            listener,
            resources,
            polled: Vec::with_capacity(POLL_BATCH),
            received: Backlog::new(),
            sent: Backlog::new(),
            pending: None,
        })
    }

    fn next_received(&mut self) -> io::Result<WorkCompletion> {
        next_completion(self.resources.recv_cq, &mut self.received, &mut self.polled)
    }

    fn next_sent(&mut self) -> io::Result<WorkCompletion> {
        next_completion(self.resources.send_cq, &mut self.sent, &mut self.polled)
    }
}

/// Busy-polls `cq` for its oldest unconsumed completion, yielding between empty polls.
fn next_completion(
    cq: *mut ibv_cq,
    backlog: &mut Backlog<WorkCompletion>,
    polled: &mut Vec<WorkCompletion>,
) -> io::Result<WorkCompletion> {
    loop {
        let next = backlog
            .next_with(|queue| {
                unsafe { poll_cq(cq, polled) }?;
                queue.extend(polled.drain(..));
                Ok::<_, TransportError>(())
            })
            .map_err(io::Error::other)?;

        if let Some(wc) = next {
            return Ok(wc);
        }
        thread::yield_now();
    }
}

impl Read for CmControlLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if let Some(mut pending) = self.pending.take() {
                let n = buf.len().min(pending.len - pending.offset);
                let start = pending.slot * SLOT_SIZE + pending.offset;
                buf[..n].copy_from_slice(&self.resources.buffer[start..start + n]);
                pending.offset += n;

                if pending.offset == pending.len {
                    unsafe { self.resources.post_slot(pending.slot) }.map_err(io::Error::other)?;
                } else {
                    self.pending = Some(pending);
                }

                return Ok(n);
            }

            let wc = self.next_received()?;
            if !wc.is_success() {
                // Flushed receives: the peer is gone.
                return Ok(0);
            }

            let slot = wc.wr_id() as usize;
            let len = wc.byte_len() as usize;
            if len == 0 {
                unsafe { self.resources.post_slot(slot) }.map_err(io::Error::other)?;
                continue;
            }

            self.pending = Some(Pending {
                slot,
                offset: 0,
                len,
            });
        }
    }
}

impl Write for CmControlLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(SLOT_SIZE);
        let start = SEND_SLOT * SLOT_SIZE;
        self.resources.buffer[start..start + n].copy_from_slice(&buf[..n]);

        let slot = self.resources.slot(SEND_SLOT, n);
        let flags = SendFlagBuilder::new().signaled().build();
        unsafe { post_send(self.resources.qp, SEND_SLOT as u64, slot, flags) }
            .map_err(io::Error::other)?;

        let wc = self.next_sent()?;
        wc.check().map_err(|err| io::Error::new(io::ErrorKind::ConnectionReset, err))?;

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CmLink for CmControlLink {
    fn disconnect(&mut self) -> io::Result<()> {
        self.connection.disconnect().map_err(io::Error::other)?;
        debug!(listening = self.listener.is_some(), "control link disconnected");
        Ok(())
    }
}
