//! Verbs data path on top of rdma-core.

use std::{
    ffi::CStr,
    io,
    mem::{size_of, zeroed},
    os::raw::c_int,
    ptr::null_mut,
};

use quanta::Clock;
use rdma_sys::{ibv_qp_state::IBV_QPS_INIT, *};
use tracing::{debug, info, warn};

use self::{
    cm::{CmConnection, CmControlLink, CmListener},
    memory_region::MemoryRegion,
    send::AtomicOp,
};
use crate::{
    channel::CmLink,
    config::{
        Config, ConnectionStyle, ConnectionType, DeviceConfig, Role, RunLength, TransportMode,
        Verb, ATOMIC_SIZE,
    },
    error::TransportError,
    handshake::{destination::random_psn, PeerDestination},
    transport::{RawCounters, TransportResource},
};

mod cm;
mod memory_region;
mod send;
mod transfer;
mod work_completion;

/// Upper bound on outstanding RDMA reads and atomics per queue pair.
const MAX_OUT_READS: i32 = 16;

/// Writes up to this size are copied into the work request.
const MAX_INLINE: u32 = 220;

pub struct IbResource {
    device: DeviceConfig,
    connection_type: ConnectionType,
    connection_style: ConnectionStyle,
    transport_mode: TransportMode,
    /// Largest message of the run, one half of the buffer each way.
    max_size: usize,
    ctx: *mut ibv_context,
    /// Contexts handed out by the connection manager are not ours to close.
    owns_ctx: bool,
    pd: *mut ibv_pd,
    cq: *mut ibv_cq,
    qps: Vec<*mut ibv_qp>,
    cm_connections: Vec<CmConnection>,
    cm_listener: Option<CmListener>,
    buffer: Vec<u64>,
    mr: Option<MemoryRegion>,
    port_attr: ibv_port_attr,
    out_reads: u32,
    role: Role,
    local: Vec<PeerDestination>,
    remote: Vec<PeerDestination>,
    /// Write-latency markers sent and received so far, across calls.
    send_seq: u64,
    recv_seq: u64,
    clock: Clock,
}

impl IbResource {
    /// Opens the configured device. Over the connection manager the device is picked when the
    /// first connection resolves, so nothing is opened yet.
    pub fn open(device: DeviceConfig, config: &Config) -> Result<Self, TransportError> {
        let max_size = config
            .sizes()
            .into_iter()
            .max()
            .unwrap_or(ATOMIC_SIZE)
            .max(ATOMIC_SIZE);

        let mut resource = IbResource {
            device,
            connection_type: config.connection_type,
            connection_style: config.connection_style,
            transport_mode: config.transport_mode,
            max_size: usize::try_from(max_size)
                .map_err(|_| TransportError::Other(format!("message size {max_size} too large")))?,
            ctx: null_mut(),
            owns_ctx: false,
            pd: null_mut(),
            cq: null_mut(),
            qps: Vec::new(),
            cm_connections: Vec::new(),
            cm_listener: None,
            buffer: Vec::new(),
            mr: None,
            port_attr: unsafe { zeroed() },
            out_reads: 1,
            role: config.role(),
            local: Vec::new(),
            remote: Vec::new(),
            send_seq: 0,
            recv_seq: 0,
            clock: Clock::new(),
        };

        if resource.connection_style == ConnectionStyle::Socket {
            resource.open_device()?;
        }

        Ok(resource)
    }

    fn open_device(&mut self) -> Result<(), TransportError> {
        unsafe {
            let mut num_devices: c_int = 0;
            let devices = ibv_get_device_list(&mut num_devices);

            if devices.is_null() || num_devices == 0 {
                if !devices.is_null() {
                    ibv_free_device_list(devices);
                }
                return Err(TransportError::NoDevice);
            }

            let list = std::slice::from_raw_parts(devices, num_devices as usize);
            let chosen = list.iter().copied().find(|&device| {
                let name = CStr::from_ptr(ibv_get_device_name(device)).to_string_lossy();
                self.device.dev_name.as_deref().map_or(true, |wanted| wanted == name)
            });

            let Some(chosen) = chosen else {
                ibv_free_device_list(devices);
                return Err(TransportError::NoDevice);
            };

            let name = CStr::from_ptr(ibv_get_device_name(chosen))
                .to_string_lossy()
                .into_owned();

            self.ctx = ibv_open_device(chosen);
            ibv_free_device_list(devices);

            if self.ctx.is_null() {
                return Err(verbs_error("ibv_open_device"));
            }
            self.owns_ctx = true;

            info!(device = %name, port = self.device.ib_port, "opened RDMA device");

            self.attach_context(self.ctx)
        }
    }

    /// Allocates everything that hangs off a device context. Runs once.
    fn attach_context(&mut self, ctx: *mut ibv_context) -> Result<(), TransportError> {
        if !self.pd.is_null() {
            return Ok(());
        }

        unsafe {
            self.ctx = ctx;

            check(
                ibv_query_port(
                    ctx,
                    self.device.ib_port,
                    &mut self.port_attr as *mut ibv_port_attr as *mut _,
                ),
                "ibv_query_port",
            )?;

            if self.port_attr.state != ibv_port_state::IBV_PORT_ACTIVE {
                warn!(port = self.device.ib_port, "port is not active");
            }

            let mut dev_attr: ibv_device_attr = zeroed();
            check(ibv_query_device(ctx, &mut dev_attr), "ibv_query_device")?;
            self.out_reads = dev_attr.max_qp_rd_atom.clamp(1, MAX_OUT_READS) as u32;

            self.pd = ibv_alloc_pd(ctx);
            if self.pd.is_null() {
                return Err(verbs_error("ibv_alloc_pd"));
            }
        }

        Ok(())
    }

    fn create_cq(&mut self, num_qps: usize) -> Result<(), TransportError> {
        let depth = (self.device.tx_depth as usize * num_qps).max(1);

        unsafe {
            self.cq = ibv_create_cq(self.ctx, depth as c_int, null_mut(), null_mut(), 0);
        }

        if self.cq.is_null() {
            return Err(verbs_error("ibv_create_cq"));
        }

        Ok(())
    }

    fn register_buffer(&mut self) -> Result<(), TransportError> {
        let words = (2 * self.max_size).div_ceil(size_of::<u64>()).max(2);
        self.buffer = vec![0u64; words];

        let mr = unsafe { MemoryRegion::register(self.pd, &mut self.buffer) }
            .map_err(|source| TransportError::Verbs {
                call: "ibv_reg_mr",
                source,
            })?;

        self.mr = Some(mr);
        Ok(())
    }

    fn qp_init_attr(&self) -> ibv_qp_init_attr {
        let qp_type = match self.transport_mode {
            TransportMode::Uc => ibv_qp_type::IBV_QPT_UC,
            _ => ibv_qp_type::IBV_QPT_RC,
        };

        unsafe {
            ibv_qp_init_attr {
                qp_type,
                send_cq: self.cq,
                recv_cq: self.cq,
                cap: ibv_qp_cap {
                    max_send_wr: self.device.tx_depth,
                    max_recv_wr: 1,
                    max_send_sge: 1,
                    max_recv_sge: 1,
                    max_inline_data: MAX_INLINE,
                    ..zeroed()
                },
                ..zeroed()
            }
        }
    }

    fn create_socket_qps(&mut self, num_qps: usize) -> Result<(), TransportError> {
        self.create_cq(num_qps)?;
        self.register_buffer()?;

        for _ in 0..num_qps {
            let mut attr = self.qp_init_attr();
            let qp = unsafe { ibv_create_qp(self.pd, &mut attr) };

            if qp.is_null() {
                return Err(verbs_error("ibv_create_qp"));
            }

            self.qps.push(qp);
            self.modify_to_init(qp)?;
        }

        Ok(())
    }

    /// Every queue pair is its own connection-manager connection on the port after the
    /// control link's.
    fn create_cm_qps(&mut self, num_qps: usize) -> Result<(), TransportError> {
        let listener = self.cm_listener.take();
        let result = self.connect_cm_qps(listener.as_ref(), num_qps);
        self.cm_listener = listener;
        result
    }

    fn connect_cm_qps(
        &mut self,
        listener: Option<&CmListener>,
        num_qps: usize,
    ) -> Result<(), TransportError> {
        let connection_type = self.connection_type;
        let data_port = connection_type.port().wrapping_add(1);

        for index in 0..num_qps {
            let mut attach = |id: *mut rdma_cm_id| -> Result<u8, TransportError> {
                unsafe {
                    if self.pd.is_null() {
                        self.attach_context((*id).verbs)?;
                        self.create_cq(num_qps)?;
                        self.register_buffer()?;
                    }

                    let mut attr = self.qp_init_attr();
                    check(rdma_create_qp(id, self.pd, &mut attr), "rdma_create_qp")?;
                    self.qps.push((*id).qp);
                }
                Ok(self.out_reads as u8)
            };

            let connection = match (connection_type, listener) {
                (ConnectionType::Server { .. }, Some(listener)) => listener.accept(&mut attach)?,
                (ConnectionType::Server { .. }, None) => {
                    return Err(TransportError::Other(
                        "data listener missing, the control link was not opened".into(),
                    ))
                }
                (ConnectionType::Client { server_addr, .. }, _) => {
                    CmConnection::connect(server_addr, data_port, &mut attach)?
                }
            };

            debug!(qp = index, "queue pair connected through the connection manager");
            self.cm_connections.push(connection);
        }

        Ok(())
    }

    fn describe(&self) -> Result<Vec<PeerDestination>, TransportError> {
        let mut gid = [0u8; 16];

        if let Some(index) = self.device.gid_index {
            unsafe {
                let mut raw: ibv_gid = zeroed();
                check(
                    ibv_query_gid(self.ctx, self.device.ib_port, index, &mut raw),
                    "ibv_query_gid",
                )?;
                gid = raw.raw;
            }
        }

        let (rkey, vaddr) = match &self.mr {
            Some(mr) => (mr.rkey, self.buffer.as_ptr() as u64),
            None => (0, 0),
        };

        Ok(self
            .qps
            .iter()
            .map(|&qp| PeerDestination {
                lid: self.port_attr.lid,
                out_reads: self.out_reads,
                qpn: unsafe { (*qp).qp_num },
                psn: random_psn(),
                rkey,
                vaddr,
                gid,
                srqn: 0,
            })
            .collect())
    }

    fn modify_to_init(&self, qp: *mut ibv_qp) -> Result<(), TransportError> {
        unsafe {
            let mut qp_attr = ibv_qp_attr {
                qp_state: IBV_QPS_INIT,
                pkey_index: 0,
                port_num: self.device.ib_port,
                qp_access_flags: (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                    | ibv_access_flags::IBV_ACCESS_REMOTE_READ
                    | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC
                    | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE)
                    .0,
                ..zeroed()
            };

            check(
                ibv_modify_qp(
                    qp,
                    &mut qp_attr,
                    (ibv_qp_attr_mask::IBV_QP_STATE
                        | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
                        | ibv_qp_attr_mask::IBV_QP_PORT
                        | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS)
                        .0 as i32,
                ),
                "ibv_modify_qp(INIT)",
            )
        }
    }

    fn connect_qp_to_dest(
        &self,
        qp: *mut ibv_qp,
        local: &PeerDestination,
        dest: &PeerDestination,
    ) -> Result<(), TransportError> {
        let reliable = self.transport_mode != TransportMode::Uc;

        unsafe {
            let mut qp_attr = ibv_qp_attr {
                qp_state: ibv_qp_state::IBV_QPS_RTR,
                path_mtu: self.port_attr.active_mtu,
                dest_qp_num: dest.qpn,
                rq_psn: dest.psn,
                max_dest_rd_atomic: local.out_reads as u8,
                min_rnr_timer: 12,
                ah_attr: ibv_ah_attr {
                    is_global: 0,
                    dlid: dest.lid,
                    sl: 0,
                    src_path_bits: 0,
                    port_num: self.device.ib_port,
                    ..zeroed()
                },
                ..zeroed()
            };

            if dest.gid[8..].iter().any(|&byte| byte != 0) {
                qp_attr.ah_attr.is_global = 1;
                qp_attr.ah_attr.grh.dgid.raw = dest.gid;
                qp_attr.ah_attr.grh.sgid_index = self.device.gid_index.unwrap_or(0) as u8;
                qp_attr.ah_attr.grh.hop_limit = 0xff;
                qp_attr.ah_attr.grh.traffic_class = 0;
            }

            let mut mask = ibv_qp_attr_mask::IBV_QP_STATE
                | ibv_qp_attr_mask::IBV_QP_AV
                | ibv_qp_attr_mask::IBV_QP_PATH_MTU
                | ibv_qp_attr_mask::IBV_QP_DEST_QPN
                | ibv_qp_attr_mask::IBV_QP_RQ_PSN;
            if reliable {
                mask = mask
                    | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
                    | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
            }

            check(
                ibv_modify_qp(qp, &mut qp_attr, mask.0 as i32),
                "ibv_modify_qp(RTR)",
            )?;

            qp_attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
            qp_attr.timeout = 14;
            qp_attr.retry_cnt = 7;
            qp_attr.rnr_retry = 7;
            qp_attr.sq_psn = local.psn;
            qp_attr.max_rd_atomic = dest.out_reads as u8;

            let mut mask = ibv_qp_attr_mask::IBV_QP_STATE | ibv_qp_attr_mask::IBV_QP_SQ_PSN;
            if reliable {
                mask = mask
                    | ibv_qp_attr_mask::IBV_QP_TIMEOUT
                    | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
                    | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
                    | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
            }

            check(
                ibv_modify_qp(qp, &mut qp_attr, mask.0 as i32),
                "ibv_modify_qp(RTS)",
            )
        }
    }

    fn lkey(&self) -> u32 {
        self.mr.as_ref().map_or(0, |mr| mr.lkey)
    }
}

impl TransportResource for IbResource {
    fn create(
        &mut self,
        num_qps: usize,
        role: Role,
    ) -> Result<Vec<PeerDestination>, TransportError> {
        match self.transport_mode {
            TransportMode::Xrc => return Err(TransportError::Unsupported("XRC transport")),
            TransportMode::Dc => return Err(TransportError::Unsupported("DC transport")),
            TransportMode::Uc if self.device.verb != Verb::Write => {
                return Err(TransportError::Unsupported("atomics over UC"))
            }
            _ => {}
        }

        self.role = role;

        match self.connection_style {
            ConnectionStyle::Socket => self.create_socket_qps(num_qps)?,
            ConnectionStyle::ConnectionManager => self.create_cm_qps(num_qps)?,
        }

        self.local = self.describe()?;
        Ok(self.local.clone())
    }

    fn connect(&mut self, remote: &[PeerDestination]) -> Result<(), TransportError> {
        for ((&qp, local), dest) in self.qps.iter().zip(&self.local).zip(remote) {
            self.connect_qp_to_dest(qp, local, dest)?;
        }

        self.remote = remote.to_vec();
        Ok(())
    }

    fn prepare(&mut self, remote: &[PeerDestination]) -> Result<(), TransportError> {
        self.remote = remote.to_vec();
        Ok(())
    }

    fn run_transfer(
        &mut self,
        size: u64,
        length: RunLength,
    ) -> Result<RawCounters, TransportError> {
        match self.device.verb {
            Verb::Write => self.write_latency(size, length),
            Verb::FetchAndAdd => self.atomic_bandwidth(AtomicOp::FetchAndAdd { add: 1 }, length),
            Verb::CompareAndSwap => self.atomic_bandwidth(
                AtomicOp::CompareAndSwap {
                    compare: 0,
                    swap: 0,
                },
                length,
            ),
        }
    }

    /// Safe to call more than once.
    fn destroy(&mut self) -> Result<(), TransportError> {
        let mut first_error = None;
        let mut record = |ret: c_int, call: &'static str| {
            if let Err(err) = check(ret, call) {
                first_error.get_or_insert(err);
            }
        };

        unsafe {
            if self.cm_connections.is_empty() {
                for qp in self.qps.drain(..) {
                    record(ibv_destroy_qp(qp), "ibv_destroy_qp");
                }
            } else {
                self.qps.clear();
                self.cm_connections.clear();
            }

            self.mr = None;

            if !self.cq.is_null() {
                record(ibv_destroy_cq(self.cq), "ibv_destroy_cq");
                self.cq = null_mut();
            }

            if !self.pd.is_null() {
                record(ibv_dealloc_pd(self.pd), "ibv_dealloc_pd");
                self.pd = null_mut();
            }

            self.cm_listener = None;

            if self.owns_ctx && !self.ctx.is_null() {
                record(ibv_close_device(self.ctx), "ibv_close_device");
            }
            self.ctx = null_mut();
            self.owns_ctx = false;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn control_link(
        &mut self,
        connection_type: &ConnectionType,
    ) -> Result<Box<dyn CmLink>, TransportError> {
        if let ConnectionType::Server { port } = *connection_type {
            // The data listener has to exist before the client can get past the control link.
            self.cm_listener = Some(CmListener::bind(port.wrapping_add(1))?);
        }

        Ok(Box::new(CmControlLink::establish(connection_type)?))
    }
}

impl Drop for IbResource {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            warn!(%err, "releasing RDMA resources failed");
        }
    }
}

/// Maps a verbs return code to an error. Some calls return the errno, others set it.
pub(crate) fn check(ret: c_int, call: &'static str) -> Result<(), TransportError> {
    match ret {
        0 => Ok(()),
        errno if errno > 0 => Err(TransportError::Verbs {
            call,
            source: io::Error::from_raw_os_error(errno),
        }),
        _ => Err(verbs_error(call)),
    }
}

pub(crate) fn verbs_error(call: &'static str) -> TransportError {
    TransportError::Verbs {
        call,
        source: io::Error::last_os_error(),
    }
}
