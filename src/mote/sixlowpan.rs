//! 6LoWPAN adaptation layer.
//!
//! Fragments outgoing datagrams above the link payload limit, reassembles
//! or fragment-forwards incoming ones, and resolves the next-hop MAC
//! address: source route for downward traffic, direct MAC for on-link
//! link-local destinations, the join proxy before RPL has a DODAG, and the
//! preferred parent otherwise.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::MacAddr;
use crate::connectivity::Connectivity;
use crate::mote::{Mote, app, rpl, secjoin, sf, tsch};
use crate::packet::{DropReason, FragPayload, MacHeader, NetHeader, Packet, PacketType, Payload};
use crate::settings::{Fragmentation, VrbPolicy};
use crate::simulation::SimCtx;

/// Seconds before an unfinished reassembly or VRB entry expires.
const REASSEMBLY_LIFETIME_SEC: f64 = 60.0;

struct ReassemblyEntry {
    expiration_asn: u64,
    datagram_size: usize,
    /// (offset, length) of every fragment seen so far.
    received: Vec<(usize, usize)>,
    net_from_first: Option<NetHeader>,
    payload_from_last: Option<Payload>,
    mac_from_last: Option<MacHeader>,
}

struct VrbEntry {
    next_hop: MacAddr,
    outgoing_tag: u32,
    expiration_asn: u64,
    next_offset: usize,
}

pub struct SixLowpan {
    /// MAC addresses observed as packet sources.
    pub on_link_neighbors: BTreeSet<MacAddr>,
    next_datagram_tag: u32,
    reassembly: BTreeMap<(MacAddr, u32), ReassemblyEntry>,
    vrb: BTreeMap<(MacAddr, u32), VrbEntry>,
}

impl SixLowpan {
    pub fn new() -> Self {
        SixLowpan {
            on_link_neighbors: BTreeSet::new(),
            next_datagram_tag: 0,
            reassembly: BTreeMap::new(),
            vrb: BTreeMap::new(),
        }
    }

    fn next_tag(&mut self) -> u32 {
        let tag = self.next_datagram_tag;
        self.next_datagram_tag = self.next_datagram_tag.wrapping_add(1);
        tag
    }

    pub fn vrb_len(&self) -> usize {
        self.vrb.len()
    }

    /// Pre-load a VRB entry. Tests and experiments only.
    pub fn vrb_insert_raw(&mut self, src: MacAddr, tag: u32, next_hop: MacAddr, expiration: u64) {
        self.vrb.insert(
            (src, tag),
            VrbEntry { next_hop, outgoing_tag: 0, expiration_asn: expiration, next_offset: 0 },
        );
    }

    pub fn reset(&mut self) {
        self.on_link_neighbors.clear();
        self.reassembly.clear();
        self.vrb.clear();
    }
}

/// Record a frame source as an on-link neighbour.
pub fn remember_neighbor(mote: &mut Mote, ctx: &mut SimCtx, neighbor: MacAddr) {
    if neighbor.is_broadcast() || neighbor == mote.mac_addr {
        return;
    }
    if mote.lowpan.on_link_neighbors.insert(neighbor) {
        sf::indication_neighbor_added(mote, ctx, neighbor);
    }
}

/// Send a packet originated by an upper layer of this mote.
pub fn send(mote: &mut Mote, ctx: &mut SimCtx, mut packet: Packet) -> bool {
    let Some(next_hop) = resolve_next_hop(mote, &mut packet) else {
        crate::mote::drop_packet(ctx, mote.id, packet, DropReason::NoRoute);
        return false;
    };
    fragment_and_enqueue(mote, ctx, packet, next_hop)
}

fn resolve_next_hop(mote: &mut Mote, packet: &mut Packet) -> Option<MacAddr> {
    // downward, source-routed: consume the next hop
    if packet.net.downward {
        if let Some(route) = packet.net.source_route.as_mut() {
            if !route.is_empty() {
                let next = route.remove(0);
                if route.is_empty() {
                    packet.net.source_route = None;
                }
                return next.mac_addr();
            }
        }
    }

    // on-link link-local destination
    if packet.net.dst_ip.is_link_local() {
        if let Some(mac) = packet.net.dst_ip.mac_addr() {
            if mote.lowpan.on_link_neighbors.contains(&mac) {
                return Some(mac);
            }
        }
    }

    // before RPL has a DODAG, everything goes through the join proxy
    if !mote.secjoin.joined || mote.rpl.dodag_id.is_none() {
        return mote.tsch.join_proxy;
    }

    mote.rpl.preferred_parent
}

/// Split into fragments when the payload exceeds the link limit, attach MAC
/// headers and hand everything to TSCH.
fn fragment_and_enqueue(mote: &mut Mote, ctx: &mut SimCtx, packet: Packet, next_hop: MacAddr) -> bool {
    let max_payload = ctx.settings.tsch_max_payload_len;
    let needs_fragmentation =
        packet.net.packet_length > max_payload && packet.packet_type() != PacketType::Frag;

    if !needs_fragmentation {
        let mut frame = packet;
        frame.mac = Some(MacHeader {
            src_mac: mote.mac_addr,
            dst_mac: next_hop,
            retries_left: tsch::TSCH_MAXTXRETRIES,
        });
        return tsch::enqueue(mote, ctx, frame);
    }

    let datagram_size = packet.net.packet_length;
    let datagram_tag = mote.lowpan.next_tag();
    let mut all_enqueued = true;
    let mut offset = 0usize;
    while offset < datagram_size {
        let length = max_payload.min(datagram_size - offset);
        let is_first = offset == 0;
        let is_last = offset + length >= datagram_size;

        // the first fragment carries the routing information, the last one
        // the original payload
        let mut net = packet.net.clone();
        net.packet_length = length;
        if !is_first {
            net.source_route = None;
        }
        let frag = FragPayload {
            datagram_tag,
            datagram_size,
            datagram_offset: offset,
            length,
            original: if is_last { Some(Box::new(packet.payload.clone())) } else { None },
        };
        let mut frame = Packet::new(Payload::Frag(frag), net);
        frame.mac = Some(MacHeader {
            src_mac: mote.mac_addr,
            dst_mac: next_hop,
            retries_left: tsch::TSCH_MAXTXRETRIES,
        });
        all_enqueued &= tsch::enqueue(mote, ctx, frame);
        offset += length;
    }
    all_enqueued
}

/// Entry point for frames delivered by TSCH.
pub fn recv(mote: &mut Mote, conn: &Connectivity, ctx: &mut SimCtx, packet: Packet) {
    if packet.packet_type() == PacketType::Frag {
        let for_me = packet.net.dst_ip.host() == Some(mote.mac_addr.host());
        if for_me || ctx.settings.fragmentation == Fragmentation::PerHopReassembly {
            if let Some(reassembled) = reassembly_insert(mote, ctx, packet) {
                deliver_or_forward(mote, conn, ctx, reassembled);
            }
        } else {
            vrb_forward(mote, ctx, packet);
        }
        return;
    }
    deliver_or_forward(mote, conn, ctx, packet);
}

fn deliver_or_forward(mote: &mut Mote, _conn: &Connectivity, ctx: &mut SimCtx, packet: Packet) {
    let for_me = packet.net.dst_ip.host() == Some(mote.mac_addr.host());
    if for_me {
        match packet.packet_type() {
            PacketType::Data => app::recv(mote, ctx, packet),
            PacketType::Dao => rpl::action_receive_dao(mote, ctx, &packet),
            PacketType::JoinRequest | PacketType::JoinResponse => {
                secjoin::recv(mote, ctx, packet);
            }
            _ => {}
        }
        return;
    }
    forward(mote, ctx, packet);
}

/// Forward a packet that is not for us.
fn forward(mote: &mut Mote, ctx: &mut SimCtx, mut packet: Packet) {
    // an upward packet arriving from our own preferred parent means the
    // routing state disagrees somewhere along the path
    if !packet.net.downward {
        let from_parent = packet
            .mac
            .as_ref()
            .is_some_and(|m| mote.rpl.preferred_parent == Some(m.src_mac));
        if from_parent {
            if packet.net.rank_error {
                mote.rpl.kick_dio();
                crate::mote::drop_packet(ctx, mote.id, packet, DropReason::RankError);
                return;
            }
            packet.net.rank_error = true;
        }
    }

    if packet.net.hop_limit <= 1 {
        crate::mote::drop_packet(ctx, mote.id, packet, DropReason::TimeExceeded);
        return;
    }
    packet.net.hop_limit -= 1;
    packet.mac = None;

    let Some(next_hop) = resolve_next_hop(mote, &mut packet) else {
        crate::mote::drop_packet(ctx, mote.id, packet, DropReason::NoRoute);
        return;
    };
    fragment_and_enqueue(mote, ctx, packet, next_hop);
}

/// Store one fragment; returns the rebuilt packet when it was the missing
/// piece.
fn reassembly_insert(mote: &mut Mote, ctx: &mut SimCtx, packet: Packet) -> Option<Packet> {
    let asn = ctx.engine.asn();
    let src_mac = packet.mac.as_ref().expect("fragment without MAC header").src_mac;
    let (tag, size, offset, length, is_first, original) = {
        let Payload::Frag(frag) = &packet.payload else {
            unreachable!("reassembly of non-fragment")
        };
        (
            frag.datagram_tag,
            frag.datagram_size,
            frag.datagram_offset,
            frag.length,
            frag.is_first(),
            frag.original.clone(),
        )
    };
    let key = (src_mac, tag);

    mote.lowpan.reassembly.retain(|_, entry| entry.expiration_asn > asn);

    if !mote.lowpan.reassembly.contains_key(&key) {
        // buffers are bounded everywhere but at the root
        let capacity = ctx.settings.sixlowpan_reassembly_buffers_num;
        if !mote.dag_root && mote.lowpan.reassembly.len() >= capacity {
            crate::mote::drop_packet(ctx, mote.id, packet, DropReason::ReassemblyBufferFull);
            return None;
        }
        mote.lowpan.reassembly.insert(
            key,
            ReassemblyEntry {
                expiration_asn: asn + ctx.settings.seconds_to_slots(REASSEMBLY_LIFETIME_SEC),
                datagram_size: size,
                received: Vec::new(),
                net_from_first: None,
                payload_from_last: None,
                mac_from_last: None,
            },
        );
    }

    let entry = mote.lowpan.reassembly.get_mut(&key).expect("entry just ensured");
    if entry.received.iter().any(|(seen_offset, _)| *seen_offset == offset) {
        // duplicate fragments are silently ignored
        return None;
    }
    entry.received.push((offset, length));
    if is_first {
        entry.net_from_first = Some(packet.net.clone());
    }
    if let Some(original) = original {
        entry.payload_from_last = Some(*original);
        entry.mac_from_last = packet.mac.clone();
    }

    let total: usize = entry.received.iter().map(|(_, len)| len).sum();
    if total < entry.datagram_size
        || entry.net_from_first.is_none()
        || entry.payload_from_last.is_none()
    {
        return None;
    }

    let entry = mote.lowpan.reassembly.remove(&key).expect("complete entry");
    let mut net = entry.net_from_first.expect("checked above");
    net.packet_length = entry.datagram_size;
    let mut rebuilt = Packet::new(entry.payload_from_last.expect("checked above"), net);
    rebuilt.mac = entry.mac_from_last;
    Some(rebuilt)
}

/// Fragment forwarding: rewrite and relay fragments through the VRB table
/// without reassembling.
fn vrb_forward(mote: &mut Mote, ctx: &mut SimCtx, mut packet: Packet) {
    let asn = ctx.engine.asn();
    let src_mac = packet.mac.as_ref().expect("fragment without MAC header").src_mac;
    let policies = ctx.settings.fragmentation_ff_discard_vrb_entry_policy.clone();

    mote.lowpan.vrb.retain(|_, entry| entry.expiration_asn > asn);

    let (incoming_tag, is_first, is_last, offset, length) = {
        let Payload::Frag(frag) = &packet.payload else { unreachable!() };
        (frag.datagram_tag, frag.is_first(), frag.is_last(), frag.datagram_offset, frag.length)
    };
    let key = (src_mac, incoming_tag);

    let (next_hop, outgoing_tag) = if is_first {
        if mote.lowpan.vrb.len() >= ctx.settings.fragmentation_ff_vrb_table_size {
            crate::mote::drop_packet(ctx, mote.id, packet, DropReason::VrbTableFull);
            return;
        }
        let Some(next_hop) = resolve_next_hop(mote, &mut packet) else {
            crate::mote::drop_packet(ctx, mote.id, packet, DropReason::NoRoute);
            return;
        };
        let outgoing_tag = mote.lowpan.next_tag();
        mote.lowpan.vrb.insert(
            key,
            VrbEntry {
                next_hop,
                outgoing_tag,
                expiration_asn: asn + ctx.settings.seconds_to_slots(REASSEMBLY_LIFETIME_SEC),
                next_offset: length,
            },
        );
        (next_hop, outgoing_tag)
    } else {
        let Some(entry) = mote.lowpan.vrb.get_mut(&key) else {
            // no flow state for this fragment
            crate::mote::drop_packet(ctx, mote.id, packet, DropReason::NoRoute);
            return;
        };
        if policies.contains(&VrbPolicy::MissingFragment) && offset != entry.next_offset {
            mote.lowpan.vrb.remove(&key);
            crate::mote::drop_packet(ctx, mote.id, packet, DropReason::NoRoute);
            return;
        }
        entry.next_offset = offset + length;
        let result = (entry.next_hop, entry.outgoing_tag);
        if policies.contains(&VrbPolicy::LastFragment) && is_last {
            mote.lowpan.vrb.remove(&key);
        }
        result
    };

    if packet.net.hop_limit <= 1 {
        crate::mote::drop_packet(ctx, mote.id, packet, DropReason::TimeExceeded);
        return;
    }
    packet.net.hop_limit -= 1;

    if let Payload::Frag(frag) = &mut packet.payload {
        frag.datagram_tag = outgoing_tag;
    }
    packet.mac = Some(MacHeader {
        src_mac: mote.mac_addr,
        dst_mac: next_hop,
        retries_left: tsch::TSCH_MAXTXRETRIES,
    });
    tsch::enqueue(mote, ctx, packet);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_counter_wraps() {
        let mut lowpan = SixLowpan::new();
        lowpan.next_datagram_tag = u32::MAX;
        assert_eq!(lowpan.next_tag(), u32::MAX);
        assert_eq!(lowpan.next_tag(), 0);
    }

    #[test]
    fn reset_clears_state() {
        let mut lowpan = SixLowpan::new();
        lowpan.on_link_neighbors.insert(MacAddr::from_mote_id(1));
        lowpan.vrb_insert_raw(MacAddr::from_mote_id(1), 0, MacAddr::from_mote_id(0), 100);
        lowpan.reset();
        assert!(lowpan.on_link_neighbors.is_empty());
        assert_eq!(lowpan.vrb_len(), 0);
    }
}
