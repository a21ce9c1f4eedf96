//! Packet model.
//!
//! A packet is a tagged payload variant plus a network-header envelope; a
//! MAC header is attached once the frame is handed to TSCH. The variants
//! cover every frame type the stack exchanges; a frame never carries fields
//! that do not belong to its type.

use serde_json::{Value, json};

use crate::address::{Ipv6Addr, MacAddr};
use crate::mote::tsch::CellOptions;

/// Default hop limit of freshly generated packets.
pub const INITIAL_HOP_LIMIT: u8 = 64;

/// Nominal lengths (bytes) of control frames, used for the fragmentation
/// decision and for the log output. Control frames stay below the
/// fragmentation threshold.
pub const LENGTH_DIO: usize = 76;
pub const LENGTH_DAO: usize = 20;
pub const LENGTH_EB: usize = 35;
pub const LENGTH_JOIN: usize = 40;
pub const LENGTH_SIXP: usize = 30;
pub const LENGTH_KEEPALIVE: usize = 8;

/// Frame types, used for dispatch and logging.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketType {
    Data,
    Frag,
    Dio,
    Dao,
    Eb,
    JoinRequest,
    JoinResponse,
    SixP,
    KeepAlive,
}

impl PacketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketType::Data => "DATA",
            PacketType::Frag => "FRAG",
            PacketType::Dio => "DIO",
            PacketType::Dao => "DAO",
            PacketType::Eb => "EB",
            PacketType::JoinRequest => "JOIN_REQUEST",
            PacketType::JoinResponse => "JOIN_RESPONSE",
            PacketType::SixP => "SIXP",
            PacketType::KeepAlive => "KEEPALIVE",
        }
    }
}

/// Why a packet was dropped. Closed set; every drop is logged with one of
/// these reasons.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DropReason {
    NoRoute,
    TxQueueFull,
    NoTxCells,
    MaxRetries,
    TimeExceeded,
    RankError,
    ReassemblyBufferFull,
    VrbTableFull,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NoRoute => "NO_ROUTE",
            DropReason::TxQueueFull => "TXQUEUE_FULL",
            DropReason::NoTxCells => "NO_TX_CELLS",
            DropReason::MaxRetries => "MAX_RETRIES",
            DropReason::TimeExceeded => "TIME_EXCEEDED",
            DropReason::RankError => "RANK_ERROR",
            DropReason::ReassemblyBufferFull => "REASSEMBLY_BUFFER_FULL",
            DropReason::VrbTableFull => "VRB_TABLE_FULL",
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct DataPayload {
    /// Monotonic per-source application counter.
    pub appcounter: u32,
    /// ASN at which the source generated the packet; the root derives the
    /// end-to-end latency from it.
    pub asn_at_source: u64,
}

#[derive(Clone, PartialEq, Debug)]
pub struct DioPayload {
    pub rank: u16,
    /// Global address of the DAG root.
    pub dodag_id: Ipv6Addr,
}

#[derive(Clone, PartialEq, Debug)]
pub struct DaoPayload {
    /// Global address of the advertising mote.
    pub child: Ipv6Addr,
    /// MAC address of its preferred parent.
    pub parent: MacAddr,
}

#[derive(Clone, PartialEq, Debug)]
pub struct EbPayload {
    /// DAGRank(rank) - 1; 0 when sent by the root.
    pub join_metric: u8,
}

#[derive(Clone, PartialEq, Debug)]
pub struct JoinPayload {
    /// Pledge identity echoed by the JRC so the stateless join proxy can
    /// deliver the response.
    pub stateless_proxy: Option<MacAddr>,
}

/// One fragment of a larger datagram. The first fragment carries the full
/// network header of the datagram; the last one carries the original
/// payload so reassembly can rebuild the packet.
#[derive(Clone, PartialEq, Debug)]
pub struct FragPayload {
    pub datagram_tag: u32,
    pub datagram_size: usize,
    pub datagram_offset: usize,
    /// Length of this fragment.
    pub length: usize,
    /// Present on the last fragment only.
    pub original: Option<Box<Payload>>,
}

impl FragPayload {
    pub fn is_first(&self) -> bool {
        self.datagram_offset == 0
    }

    pub fn is_last(&self) -> bool {
        self.datagram_offset + self.length >= self.datagram_size
    }
}

/// 6P message class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SixPMsgType {
    Request,
    Response,
    Confirmation,
}

impl SixPMsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SixPMsgType::Request => "REQUEST",
            SixPMsgType::Response => "RESPONSE",
            SixPMsgType::Confirmation => "CONFIRMATION",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SixPCommand {
    Add,
    Delete,
    Relocate,
    Count,
    List,
    Clear,
    Signal,
}

impl SixPCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SixPCommand::Add => "ADD",
            SixPCommand::Delete => "DELETE",
            SixPCommand::Relocate => "RELOCATE",
            SixPCommand::Count => "COUNT",
            SixPCommand::List => "LIST",
            SixPCommand::Clear => "CLEAR",
            SixPCommand::Signal => "SIGNAL",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SixPReturnCode {
    Success,
    ErrSeqNum,
    ErrBusy,
    ErrNoRes,
    ErrReset,
    ErrCellList,
    ErrVersion,
    ErrSfId,
}

impl SixPReturnCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SixPReturnCode::Success => "SUCCESS",
            SixPReturnCode::ErrSeqNum => "ERR_SEQNUM",
            SixPReturnCode::ErrBusy => "ERR_BUSY",
            SixPReturnCode::ErrNoRes => "ERR_NORES",
            SixPReturnCode::ErrReset => "ERR_RESET",
            SixPReturnCode::ErrCellList => "ERR_CELLLIST",
            SixPReturnCode::ErrVersion => "ERR_VERSION",
            SixPReturnCode::ErrSfId => "ERR_SFID",
        }
    }
}

/// Command for requests, return code for responses and confirmations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SixPCode {
    Command(SixPCommand),
    Return(SixPReturnCode),
}

impl SixPCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SixPCode::Command(c) => c.as_str(),
            SixPCode::Return(r) => r.as_str(),
        }
    }
}

/// A (slot offset, channel offset) pair exchanged in 6P cell lists.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SixPCellDescr {
    pub slot_offset: u32,
    pub channel_offset: u32,
}

#[derive(Clone, PartialEq, Debug)]
pub struct SixPPayload {
    pub msg_type: SixPMsgType,
    pub code: SixPCode,
    pub seq_num: u8,
    pub cell_options: CellOptions,
    pub num_cells: usize,
    pub cell_list: Vec<SixPCellDescr>,
    /// RELOCATE only: cells proposed as replacements.
    pub candidate_cell_list: Vec<SixPCellDescr>,
    /// RELOCATE only: cells to move away from.
    pub relocation_cell_list: Vec<SixPCellDescr>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Payload {
    Data(DataPayload),
    Frag(FragPayload),
    Dio(DioPayload),
    Dao(DaoPayload),
    Eb(EbPayload),
    JoinRequest(JoinPayload),
    JoinResponse(JoinPayload),
    SixP(SixPPayload),
    KeepAlive,
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::Data(_) => PacketType::Data,
            Payload::Frag(_) => PacketType::Frag,
            Payload::Dio(_) => PacketType::Dio,
            Payload::Dao(_) => PacketType::Dao,
            Payload::Eb(_) => PacketType::Eb,
            Payload::JoinRequest(_) => PacketType::JoinRequest,
            Payload::JoinResponse(_) => PacketType::JoinResponse,
            Payload::SixP(_) => PacketType::SixP,
            Payload::KeepAlive => PacketType::KeepAlive,
        }
    }
}

/// Network-layer header, present on every packet.
#[derive(Clone, PartialEq, Debug)]
pub struct NetHeader {
    pub src_ip: Ipv6Addr,
    pub dst_ip: Ipv6Addr,
    pub hop_limit: u8,
    pub packet_length: usize,
    /// Remaining hops of a source-routed downward packet.
    pub source_route: Option<Vec<Ipv6Addr>>,
    pub downward: bool,
    pub rank_error: bool,
}

impl NetHeader {
    pub fn new(src_ip: Ipv6Addr, dst_ip: Ipv6Addr, packet_length: usize) -> Self {
        NetHeader {
            src_ip,
            dst_ip,
            hop_limit: INITIAL_HOP_LIMIT,
            packet_length,
            source_route: None,
            downward: false,
            rank_error: false,
        }
    }
}

/// Link-layer header, attached by TSCH on enqueue.
#[derive(Clone, PartialEq, Debug)]
pub struct MacHeader {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub retries_left: u8,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Packet {
    pub payload: Payload,
    pub net: NetHeader,
    pub mac: Option<MacHeader>,
}

impl Packet {
    pub fn new(payload: Payload, net: NetHeader) -> Self {
        Packet { payload, net, mac: None }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }

    pub fn is_broadcast(&self) -> bool {
        self.mac.as_ref().is_some_and(|m| m.dst_mac.is_broadcast())
    }

    /// Compact JSON rendering for log lines.
    pub fn log_summary(&self) -> Value {
        let mut obj = json!({
            "type": self.packet_type().as_str(),
            "net": {
                "srcIp": self.net.src_ip.to_string(),
                "dstIp": self.net.dst_ip.to_string(),
                "hop_limit": self.net.hop_limit,
                "packet_length": self.net.packet_length,
            },
        });
        if let Some(mac) = &self.mac {
            obj["mac"] = json!({
                "srcMac": mac.src_mac.to_string(),
                "dstMac": mac.dst_mac.to_string(),
                "retriesLeft": mac.retries_left,
            });
        }
        match &self.payload {
            Payload::Data(d) => {
                obj["app"] = json!({
                    "appcounter": d.appcounter,
                    "asn_at_source": d.asn_at_source,
                });
            }
            Payload::Frag(fr) => {
                obj["app"] = json!({
                    "datagram_tag": fr.datagram_tag,
                    "datagram_size": fr.datagram_size,
                    "datagram_offset": fr.datagram_offset,
                    "length": fr.length,
                });
            }
            Payload::Dio(d) => {
                obj["app"] = json!({ "rank": d.rank });
            }
            Payload::Eb(eb) => {
                obj["app"] = json!({ "join_metric": eb.join_metric });
            }
            Payload::SixP(sp) => {
                obj["app"] = json!({
                    "msgType": sp.msg_type.as_str(),
                    "code": sp.code.as_str(),
                    "seqNum": sp.seq_num,
                });
            }
            _ => {}
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MacAddr;

    fn data_packet() -> Packet {
        let src = Ipv6Addr::Global(2);
        let dst = Ipv6Addr::Global(0x1_0000);
        Packet::new(
            Payload::Data(DataPayload { appcounter: 7, asn_at_source: 1234 }),
            NetHeader::new(src, dst, 90),
        )
    }

    #[test]
    fn packet_type_follows_payload() {
        assert_eq!(data_packet().packet_type(), PacketType::Data);
        let frag = Payload::Frag(FragPayload {
            datagram_tag: 1,
            datagram_size: 180,
            datagram_offset: 90,
            length: 90,
            original: Some(Box::new(Payload::KeepAlive)),
        });
        assert_eq!(frag.packet_type(), PacketType::Frag);
    }

    #[test]
    fn frag_boundaries() {
        let first = FragPayload {
            datagram_tag: 1,
            datagram_size: 180,
            datagram_offset: 0,
            length: 90,
            original: None,
        };
        assert!(first.is_first());
        assert!(!first.is_last());
        let last = FragPayload { datagram_offset: 90, ..first };
        assert!(last.is_last());
    }

    #[test]
    fn log_summary_has_mac_after_enqueue() {
        let mut p = data_packet();
        assert!(p.log_summary().get("mac").is_none());
        p.mac = Some(MacHeader {
            src_mac: MacAddr::from_mote_id(2),
            dst_mac: MacAddr::from_mote_id(0),
            retries_left: 5,
        });
        let summary = p.log_summary();
        assert_eq!(summary["mac"]["dstMac"], "02-00-00-00-00-01-00-00");
        assert_eq!(summary["app"]["appcounter"], 7);
    }

    #[test]
    fn drop_reason_strings_are_the_closed_set() {
        let all = [
            DropReason::NoRoute,
            DropReason::TxQueueFull,
            DropReason::NoTxCells,
            DropReason::MaxRetries,
            DropReason::TimeExceeded,
            DropReason::RankError,
            DropReason::ReassemblyBufferFull,
            DropReason::VrbTableFull,
        ];
        let strings: Vec<_> = all.iter().map(|r| r.as_str()).collect();
        assert_eq!(
            strings,
            vec![
                "NO_ROUTE",
                "TXQUEUE_FULL",
                "NO_TX_CELLS",
                "MAX_RETRIES",
                "TIME_EXCEEDED",
                "RANK_ERROR",
                "REASSEMBLY_BUFFER_FULL",
                "VRB_TABLE_FULL",
            ]
        );
    }
}
