/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Primitive data structures for interacting with ibverbs.
//!
//! Primitives:
//! - `IbverbsConfig`: adapter tunables for a single reliable connection:
//!   queue depths, path MTU, retry/timeout parameters, and the out-of-band
//!   exchange window.
//! - `RdmaDevice` / `RdmaPort`: inventory of an RDMA adapter and its ports,
//!   as reported by `ibv_query_device`/`ibv_query_port`.
//! - `Gid`: the 16-byte global fabric address of a port.
//! - `RdmaOperation`: the work-request opcodes this engine posts.
//! - `WorkCompletion`: one drained completion-queue entry.

use std::ffi::CStr;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Global fabric address (GID) of an adapter port.
///
/// An all-zero GID on the wire means the peer is reachable by LID-only
/// routing (InfiniBand subnet-local / RoCEv1).
#[derive(Default, Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Gid {
    raw: [u8; 16],
}

impl Gid {
    /// The raw 16 bytes, network order.
    pub fn raw(&self) -> [u8; 16] {
        self.raw
    }

    /// Rebuild a GID from its wire bytes.
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self { raw }
    }

    /// True when no global address was advertised (LID-only routing).
    pub fn is_zero(&self) -> bool {
        self.raw == [0u8; 16]
    }
}

impl From<rdma_sys::ibv_gid> for Gid {
    fn from(gid: rdma_sys::ibv_gid) -> Self {
        Self {
            raw: unsafe { gid.raw },
        }
    }
}

impl From<Gid> for rdma_sys::ibv_gid {
    fn from(gid: Gid) -> Self {
        let mut out = unsafe { std::mem::zeroed::<rdma_sys::ibv_gid>() };
        out.raw = gid.raw;
        out
    }
}

/// Adapter tunables for one reliable-connection queue pair.
///
/// All retry parameters are finite: retry exhaustion surfaces as a
/// completion error to the transfer engine, which owns the decision to
/// retry at the application level. `rnr_retry` must stay below 7 (the
/// IBTA infinite-retry sentinel), so a peer that never posts a receive
/// fails the send with an RNR-retry-exceeded completion instead of
/// stalling it forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbverbsConfig {
    /// Number of completion queue entries.
    pub cq_entries: i32,
    /// Physical port number on the device.
    pub port_num: u8,
    /// GID table index used for global routing.
    pub gid_index: u8,
    /// Maximum outstanding send work requests (the send-queue depth the
    /// transfer engine backpressures against).
    pub max_send_wr: u32,
    /// Maximum outstanding receive work requests.
    pub max_recv_wr: u32,
    /// Maximum scatter/gather elements per send work request.
    pub max_send_sge: u32,
    /// Maximum scatter/gather elements per receive work request.
    pub max_recv_sge: u32,
    /// Path MTU ceiling; clamped to the port's active MTU at RTR time.
    pub path_mtu: u32,
    /// Send retry count on transport errors.
    pub retry_cnt: u8,
    /// Retry count for receiver-not-ready conditions.
    pub rnr_retry: u8,
    /// Ack timeout exponent (4.096us * 2^qp_timeout).
    pub qp_timeout: u8,
    /// Minimum RNR NAK timer.
    pub min_rnr_timer: u8,
    /// Maximum outstanding RDMA reads at the destination.
    pub max_dest_rd_atomic: u8,
    /// Maximum outstanding RDMA reads at the initiator.
    pub max_rd_atomic: u8,
    /// Partition key index.
    pub pkey_index: u16,
    /// Initial packet sequence number (24 bits).
    pub psn: u32,
    /// Window for the out-of-band connection-record exchange.
    pub exchange_timeout: Duration,
}

/// Default RDMA parameters below are based on common values from rdma-core
/// examples. For high-performance or production use, consider tuning based
/// on ibv_query_device() results and workload characteristics.
impl Default for IbverbsConfig {
    fn default() -> Self {
        Self {
            cq_entries: 1024,
            port_num: 1,
            gid_index: 0,
            max_send_wr: 512,
            max_recv_wr: 512,
            max_send_sge: 30,
            max_recv_sge: 30,
            path_mtu: rdma_sys::ibv_mtu::IBV_MTU_4096,
            retry_cnt: 7,
            rnr_retry: 6, // 7 means retry forever

            qp_timeout: 14, // 4.096us * 2^14 = ~67ms
            min_rnr_timer: 12,
            max_dest_rd_atomic: 16,
            max_rd_atomic: 16,
            pkey_index: 0,
            psn: rand::random::<u32>() & 0xffffff,
            exchange_timeout: Duration::from_secs(5),
        }
    }
}

impl fmt::Display for IbverbsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IbverbsConfig {{ port_num: {}, gid_index: {}, max_send_wr: {}, max_recv_wr: {}, path_mtu: {}, retry_cnt: {}, rnr_retry: {}, qp_timeout: {}, min_rnr_timer: {}, pkey_index: {}, psn: 0x{:x}, exchange_timeout: {:?} }}",
            self.port_num,
            self.gid_index,
            self.max_send_wr,
            self.max_recv_wr,
            self.path_mtu,
            self.retry_cnt,
            self.rnr_retry,
            self.qp_timeout,
            self.min_rnr_timer,
            self.pkey_index,
            self.psn,
            self.exchange_timeout,
        )
    }
}

/// Represents an RDMA device in the system, e.g. "mlx5_0".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaDevice {
    /// The name of the RDMA device.
    pub name: String,
    vendor_id: u32,
    vendor_part_id: u32,
    hw_ver: u32,
    fw_ver: String,
    node_guid: u64,
    ports: Vec<RdmaPort>,
    max_qp: i32,
    max_cq: i32,
    max_mr: i32,
    max_pd: i32,
    max_qp_wr: i32,
    max_sge: i32,
}

impl RdmaDevice {
    /// Returns the name of the RDMA device.
    pub fn name(&self) -> &String {
        &self.name
    }

    /// Returns the first available RDMA device, if any.
    pub fn first_available() -> Option<RdmaDevice> {
        get_all_devices().into_iter().next()
    }

    /// Returns the node GUID of the RDMA device.
    pub fn node_guid(&self) -> u64 {
        self.node_guid
    }

    /// Returns the firmware version of the RDMA device.
    pub fn fw_ver(&self) -> &String {
        &self.fw_ver
    }

    /// Returns a reference to the ports available on the RDMA device.
    pub fn ports(&self) -> &Vec<RdmaPort> {
        &self.ports
    }

    /// Returns the maximum number of queue pairs supported.
    pub fn max_qp(&self) -> i32 {
        self.max_qp
    }

    /// Returns the maximum number of memory regions supported.
    pub fn max_mr(&self) -> i32 {
        self.max_mr
    }

    /// Returns the maximum number of work requests per queue pair.
    pub fn max_qp_wr(&self) -> i32 {
        self.max_qp_wr
    }
}

/// Port inventory of an RDMA device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdmaPort {
    /// The physical port number on the device.
    pub port_num: u8,
    /// The current state of the port.
    pub state: String,
    /// Base Local Identifier for the port.
    pub base_lid: u16,
    /// The link layer type (e.g., InfiniBand, Ethernet).
    pub link_layer: String,
    /// Global Identifier for the port at GID index 0.
    pub gid: String,
}

impl fmt::Display for RdmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "\tNumber of ports: {}", self.ports.len())?;
        writeln!(f, "\tFirmware version: {}", self.fw_ver)?;
        writeln!(f, "\tNode GUID: 0x{:016x}", self.node_guid)?;
        writeln!(f, "\tVendor ID: 0x{:x}", self.vendor_id)?;
        writeln!(f, "\tMax QPs: {}", self.max_qp)?;
        writeln!(f, "\tMax CQs: {}", self.max_cq)?;
        writeln!(f, "\tMax MRs: {}", self.max_mr)?;
        writeln!(f, "\tMax PDs: {}", self.max_pd)?;
        writeln!(f, "\tMax QP WRs: {}", self.max_qp_wr)?;
        writeln!(f, "\tMax SGE: {}", self.max_sge)?;
        for port in &self.ports {
            write!(f, "{}", port)?;
        }
        Ok(())
    }
}

impl fmt::Display for RdmaPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\tPort {}:", self.port_num)?;
        writeln!(f, "\t\tState: {}", self.state)?;
        writeln!(f, "\t\tBase lid: {}", self.base_lid)?;
        writeln!(f, "\t\tLink layer: {}", self.link_layer)?;
        writeln!(f, "\t\tGID: {}", self.gid)?;
        Ok(())
    }
}

/// Converts the given port state to a human-readable string.
pub fn get_port_state_str(state: rdma_sys::ibv_port_state::Type) -> String {
    unsafe {
        let c_str = rdma_sys::ibv_port_state_str(state);
        if c_str.is_null() {
            return "Unknown".to_string();
        }
        CStr::from_ptr(c_str).to_string_lossy().into_owned()
    }
}

/// Converts the given link layer type to a human-readable string.
pub fn get_link_layer_str(link_layer: u8) -> String {
    match link_layer {
        1 => "InfiniBand".to_string(),
        2 => "Ethernet".to_string(),
        _ => "Unknown".to_string(),
    }
}

/// Formats a GID into a human-readable string.
pub fn format_gid(gid: &[u8; 16]) -> String {
    format!(
        "{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}:{:02x}{:02x}",
        gid[0],
        gid[1],
        gid[2],
        gid[3],
        gid[4],
        gid[5],
        gid[6],
        gid[7],
        gid[8],
        gid[9],
        gid[10],
        gid[11],
        gid[12],
        gid[13],
        gid[14],
        gid[15]
    )
}

/// Retrieves information about all available RDMA devices in the system.
///
/// Returns an empty vector if no devices are found or if there was an error
/// querying the devices.
pub fn get_all_devices() -> Vec<RdmaDevice> {
    let mut devices = Vec::new();

    unsafe {
        let mut num_devices = 0;
        let device_list = rdma_sys::ibv_get_device_list(&mut num_devices);
        if device_list.is_null() || num_devices == 0 {
            return devices;
        }

        for i in 0..num_devices {
            let device = *device_list.add(i as usize);
            if device.is_null() {
                continue;
            }

            let context = rdma_sys::ibv_open_device(device);
            if context.is_null() {
                continue;
            }

            let device_name = CStr::from_ptr(rdma_sys::ibv_get_device_name(device))
                .to_string_lossy()
                .into_owned();

            let mut device_attr = std::mem::zeroed::<rdma_sys::ibv_device_attr>();
            if rdma_sys::ibv_query_device(context, &mut device_attr) != 0 {
                rdma_sys::ibv_close_device(context);
                continue;
            }

            let fw_ver = CStr::from_ptr(device_attr.fw_ver.as_ptr())
                .to_string_lossy()
                .into_owned();

            let mut rdma_device = RdmaDevice {
                name: device_name,
                vendor_id: device_attr.vendor_id,
                vendor_part_id: device_attr.vendor_part_id,
                hw_ver: device_attr.hw_ver,
                fw_ver,
                node_guid: device_attr.node_guid,
                ports: Vec::new(),
                max_qp: device_attr.max_qp,
                max_cq: device_attr.max_cq,
                max_mr: device_attr.max_mr,
                max_pd: device_attr.max_pd,
                max_qp_wr: device_attr.max_qp_wr,
                max_sge: device_attr.max_sge,
            };

            for port_num in 1..=device_attr.phys_port_cnt {
                let mut port_attr = std::mem::zeroed::<rdma_sys::ibv_port_attr>();
                if rdma_sys::___ibv_query_port(
                    context,
                    port_num,
                    &mut port_attr as *mut rdma_sys::ibv_port_attr as *mut _,
                ) != 0
                {
                    continue;
                }

                let mut gid = std::mem::zeroed::<rdma_sys::ibv_gid>();
                let gid_str = if rdma_sys::ibv_query_gid(context, port_num, 0, &mut gid) == 0 {
                    format_gid(&gid.raw)
                } else {
                    "N/A".to_string()
                };

                rdma_device.ports.push(RdmaPort {
                    port_num,
                    state: get_port_state_str(port_attr.state),
                    base_lid: port_attr.lid,
                    link_layer: get_link_layer_str(port_attr.link_layer),
                    gid: gid_str,
                });
            }

            devices.push(rdma_device);
            rdma_sys::ibv_close_device(context);
        }

        rdma_sys::ibv_free_device_list(device_list);
    }

    devices
}

/// Cached result of ibverbs support check.
static IBVERBS_SUPPORTED_CACHE: OnceLock<bool> = OnceLock::new();

/// Checks if ibverbs devices can be retrieved successfully.
///
/// The result is cached after the first call, making subsequent calls
/// essentially free.
pub fn ibverbs_supported() -> bool {
    *IBVERBS_SUPPORTED_CACHE.get_or_init(ibverbs_supported_impl)
}

fn ibverbs_supported_impl() -> bool {
    unsafe {
        let mut num_devices = 0;
        let device_list = rdma_sys::ibv_get_device_list(&mut num_devices);
        if !device_list.is_null() {
            rdma_sys::ibv_free_device_list(device_list);
        }
        num_devices > 0
    }
}

/// The work-request opcodes this engine posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaOperation {
    /// One-sided RDMA write into a peer-advertised region.
    Write,
    /// Two-sided send, consumed by a posted receive on the peer.
    Send,
    /// Receive posting (consumes incoming sends).
    Recv,
}

impl From<RdmaOperation> for rdma_sys::ibv_wr_opcode::Type {
    fn from(op: RdmaOperation) -> Self {
        match op {
            RdmaOperation::Write => rdma_sys::ibv_wr_opcode::IBV_WR_RDMA_WRITE,
            RdmaOperation::Send => rdma_sys::ibv_wr_opcode::IBV_WR_SEND,
            RdmaOperation::Recv => panic!("recv is not a send-side opcode"),
        }
    }
}

/// One drained completion-queue entry.
///
/// Entries are produced in the order the adapter retires work requests,
/// which for multiple in-flight requests is not necessarily post order;
/// reconcile by `wr_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkCompletion {
    /// The application-assigned work-request id.
    pub wr_id: u64,
    /// Adapter status code (`ibv_wc_status`); 0 is success.
    pub status: u32,
    /// The retired operation (`ibv_wc_opcode`); undefined on failed
    /// completions.
    pub opcode: u32,
    /// Bytes transferred, meaningful for successful completions.
    pub byte_count: u32,
    /// Vendor-specific error detail for failed completions.
    pub vendor_err: u32,
}

impl WorkCompletion {
    /// True when the adapter retired the request successfully.
    pub fn is_success(&self) -> bool {
        self.status == rdma_sys::ibv_wc_status::IBV_WC_SUCCESS
    }

    /// True when the request was flushed because the pair entered ERROR.
    pub fn is_flush(&self) -> bool {
        self.status == rdma_sys::ibv_wc_status::IBV_WC_WR_FLUSH_ERR
    }

    /// Human-readable adapter status.
    pub fn status_str(&self) -> String {
        unsafe {
            let c_str = rdma_sys::ibv_wc_status_str(self.status);
            if c_str.is_null() {
                return format!("status {}", self.status);
            }
            CStr::from_ptr(c_str).to_string_lossy().into_owned()
        }
    }

    /// A completion representing a request flushed during queue-pair
    /// failure, for requests the adapter will never individually report.
    pub(crate) fn flushed(wr_id: u64) -> Self {
        Self {
            wr_id,
            status: rdma_sys::ibv_wc_status::IBV_WC_WR_FLUSH_ERR,
            opcode: 0,
            byte_count: 0,
            vendor_err: 0,
        }
    }
}

impl From<rdma_sys::ibv_wc> for WorkCompletion {
    fn from(wc: rdma_sys::ibv_wc) -> Self {
        WorkCompletion {
            wr_id: wc.wr_id,
            status: wc.status,
            opcode: wc.opcode,
            byte_count: wc.byte_len,
            vendor_err: wc.vendor_err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_all_devices() {
        // Skip test if RDMA devices are not available
        let devices = get_all_devices();
        if devices.is_empty() {
            println!("Skipping test: RDMA devices not available");
            return;
        }
        let device = &devices[0];
        assert!(!device.name().is_empty(), "device name should not be empty");
        assert!(
            !device.ports().is_empty(),
            "device should have at least one port"
        );
    }

    #[test]
    fn test_device_display() {
        if let Some(device) = RdmaDevice::first_available() {
            let display_output = format!("{}", device);
            assert!(
                display_output.contains(&device.name),
                "display should include device name"
            );
            assert!(
                display_output.contains(device.fw_ver()),
                "display should include firmware version"
            );
        }
    }

    #[test]
    fn test_format_gid() {
        let gid = [
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];
        let formatted = format_gid(&gid);
        assert_eq!(formatted, "1234:5678:9abc:def0:1122:3344:5566:7788");
    }

    #[test]
    fn test_default_config_is_finite() {
        let config = IbverbsConfig::default();
        assert!(config.psn <= 0xffffff, "psn must fit 24 bits");
        assert!(config.retry_cnt < 8, "retry_cnt is a 3-bit field");
        assert!(
            config.rnr_retry < 7,
            "rnr_retry 7 is the infinite-retry sentinel"
        );
        assert!(config.max_send_wr > 0);
        assert!(config.exchange_timeout > Duration::ZERO);
    }

    #[test]
    fn test_gid_zero_roundtrip() {
        let gid = Gid::default();
        assert!(gid.is_zero());
        let raw = gid.raw();
        assert_eq!(Gid::from_raw(raw), gid);

        let ibv: rdma_sys::ibv_gid = gid.into();
        assert_eq!(Gid::from(ibv), gid);
    }

    #[test]
    fn test_work_completion_flushed() {
        let wc = WorkCompletion::flushed(7);
        assert_eq!(wc.wr_id, 7);
        assert!(!wc.is_success());
        assert!(wc.is_flush());
    }
}
