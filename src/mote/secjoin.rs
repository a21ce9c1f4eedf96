//! Secure join.
//!
//! A pledge exchanges one request/response pair with the JRC (the DAG
//! root), relayed by the join proxy whose EB synchronised it. The proxy is
//! stateless: the JRC echoes the pledge identity in the response so the
//! proxy knows where to deliver it. Retransmissions back off exponentially;
//! a pledge that gives up desynchronises and hunts for another EB.

use rand::Rng;
use serde_json::json;

use crate::address::Ipv6Addr;
use crate::engine::{EventKind, SlotOrder};
use crate::mote::{Mote, app, rpl, sf, sixlowpan, tsch};
use crate::packet::{DropReason, JoinPayload, LENGTH_JOIN, NetHeader, Packet, Payload};
use crate::simlog::types as logtypes;
use crate::simulation::SimCtx;

pub const SECJOIN_TIMEOUT_BASE_SEC: f64 = 2.0;
pub const SECJOIN_TIMEOUT_RANDOM_FACTOR: f64 = 1.5;
pub const SECJOIN_MAX_RETRANSMIT: u32 = 4;

pub struct SecJoin {
    pub joined: bool,
    retransmission_count: u32,
    current_timeout_sec: f64,
}

impl SecJoin {
    pub fn new() -> Self {
        SecJoin { joined: false, retransmission_count: 0, current_timeout_sec: 0.0 }
    }

    pub fn reset(&mut self) {
        self.joined = false;
        self.retransmission_count = 0;
        self.current_timeout_sec = 0.0;
    }
}

/// Entered right after EB synchronisation.
pub fn start_join(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.secjoin.joined {
        return;
    }
    if !ctx.settings.secjoin_enabled {
        set_joined(mote, ctx);
        return;
    }
    mote.secjoin.retransmission_count = 0;
    mote.secjoin.current_timeout_sec = ctx
        .rng
        .gen_range(SECJOIN_TIMEOUT_BASE_SEC..SECJOIN_TIMEOUT_BASE_SEC * SECJOIN_TIMEOUT_RANDOM_FACTOR);
    send_join_request(mote, ctx);
    schedule_retransmission(mote, ctx);
}

fn send_join_request(mote: &mut Mote, ctx: &mut SimCtx) {
    let Some(proxy) = mote.tsch.join_proxy else { return };
    ctx.log.log(ctx.engine.asn(), logtypes::SECJOIN_TX, json!({ "_mote_id": mote.id }));
    let packet = Packet::new(
        Payload::JoinRequest(JoinPayload { stateless_proxy: None }),
        NetHeader::new(mote.link_local_addr(), Ipv6Addr::LinkLocal(proxy.host()), LENGTH_JOIN),
    );
    sixlowpan::send(mote, ctx, packet);
}

fn schedule_retransmission(mote: &mut Mote, ctx: &mut SimCtx) {
    let slots = ctx.settings.seconds_to_slots(mote.secjoin.current_timeout_sec).max(1);
    let asn = ctx.engine.asn();
    ctx.engine.schedule(
        asn + slots,
        SlotOrder::Stack,
        EventKind::SecJoinRetransmit { mote: mote.id },
    );
}

pub fn on_retransmission_timer(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.secjoin.joined || !mote.tsch.is_sync {
        return;
    }
    if mote.secjoin.retransmission_count >= SECJOIN_MAX_RETRANSMIT {
        // give up and look for another join proxy
        tsch::desync(mote, ctx);
        return;
    }
    mote.secjoin.retransmission_count += 1;
    mote.secjoin.current_timeout_sec *= 2.0;
    send_join_request(mote, ctx);
    schedule_retransmission(mote, ctx);
}

fn set_joined(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.secjoin.joined {
        return;
    }
    mote.secjoin.joined = true;
    ctx.engine.cancel(&EventKind::SecJoinRetransmit { mote: mote.id });
    ctx.log.log(
        ctx.engine.asn(),
        logtypes::SECJOIN_JOINED,
        json!({
            "_mote_id": mote.id,
            "join_proxy": mote.tsch.join_proxy.map(|p| p.to_string()),
        }),
    );
    sf::indication_joined(mote, ctx);
    app::start(mote, ctx);
}

/// Join traffic delivered by 6LoWPAN.
pub fn recv(mote: &mut Mote, ctx: &mut SimCtx, packet: Packet) {
    match &packet.payload {
        Payload::JoinRequest(request) => {
            if mote.dag_root {
                jrc_handle_request(mote, ctx, &packet, request.clone());
            } else {
                proxy_relay_request(mote, ctx, &packet);
            }
        }
        Payload::JoinResponse(response) => match response.stateless_proxy {
            Some(pledge) if pledge != mote.mac_addr => {
                // we are the stateless proxy; hand the response to the
                // pledge next door
                let delivery = Packet::new(
                    Payload::JoinResponse(JoinPayload { stateless_proxy: None }),
                    NetHeader::new(
                        mote.link_local_addr(),
                        Ipv6Addr::LinkLocal(pledge.host()),
                        LENGTH_JOIN,
                    ),
                );
                sixlowpan::send(mote, ctx, delivery);
            }
            _ => set_joined(mote, ctx),
        },
        _ => {}
    }
}

/// The JRC answers every request, echoing the stateless proxy element.
fn jrc_handle_request(mote: &mut Mote, ctx: &mut SimCtx, packet: &Packet, request: JoinPayload) {
    match request.stateless_proxy {
        Some(_pledge) => {
            // relayed by a proxy: source-route the response back to it
            let Some(proxy_host) = packet.net.src_ip.host() else { return };
            let mut net =
                NetHeader::new(mote.global_addr(), Ipv6Addr::Global(proxy_host), LENGTH_JOIN);
            net.downward = true;
            match rpl::compute_source_route(mote, proxy_host) {
                Ok(route) => net.source_route = Some(route),
                Err(_) => {
                    let response = Packet::new(
                        Payload::JoinResponse(JoinPayload {
                            stateless_proxy: request.stateless_proxy,
                        }),
                        net,
                    );
                    crate::mote::drop_packet(ctx, mote.id, response, DropReason::NoRoute);
                    return;
                }
            }
            let response = Packet::new(
                Payload::JoinResponse(JoinPayload { stateless_proxy: request.stateless_proxy }),
                net,
            );
            sixlowpan::send(mote, ctx, response);
        }
        None => {
            // the pledge is our own neighbour; we are proxy and JRC at once
            let response = Packet::new(
                Payload::JoinResponse(JoinPayload { stateless_proxy: None }),
                NetHeader::new(mote.link_local_addr(), packet.net.src_ip, LENGTH_JOIN),
            );
            sixlowpan::send(mote, ctx, response);
        }
    }
}

/// A join proxy rewrites the pledge's request and forwards it to the JRC.
fn proxy_relay_request(mote: &mut Mote, ctx: &mut SimCtx, packet: &Packet) {
    let Some(pledge_mac) = packet.net.src_ip.mac_addr() else { return };
    let Some(dodag_id) = mote.rpl.dodag_id else {
        // cannot relay before having a route towards the root
        let orphan = packet.clone();
        crate::mote::drop_packet(ctx, mote.id, orphan, DropReason::NoRoute);
        return;
    };
    let relayed = Packet::new(
        Payload::JoinRequest(JoinPayload { stateless_proxy: Some(pledge_mac) }),
        NetHeader::new(mote.global_addr(), dodag_id, LENGTH_JOIN),
    );
    sixlowpan::send(mote, ctx, relayed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmission_constants_follow_coap() {
        assert_eq!(SECJOIN_MAX_RETRANSMIT, 4);
        assert!(SECJOIN_TIMEOUT_RANDOM_FACTOR > 1.0);
    }

    #[test]
    fn reset_clears_join_state() {
        let mut secjoin = SecJoin::new();
        secjoin.joined = true;
        secjoin.retransmission_count = 3;
        secjoin.reset();
        assert!(!secjoin.joined);
        assert_eq!(secjoin.retransmission_count, 0);
    }
}
