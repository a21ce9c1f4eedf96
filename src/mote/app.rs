//! Application layer.
//!
//! Periodic upstream DATA towards the DAG root, started once the mote is
//! joined and has a parent. Each packet carries a monotonic counter and
//! the ASN it was generated at; the root derives end-to-end latency and
//! hop count on reception.

use rand::Rng;
use serde_json::json;

use crate::engine::{EventKind, SlotOrder};
use crate::mote::{Mote, sixlowpan};
use crate::packet::{DataPayload, INITIAL_HOP_LIMIT, NetHeader, Packet, Payload};
use crate::simlog::types as logtypes;
use crate::simulation::SimCtx;

pub struct App {
    pub appcounter: u32,
    pub running: bool,
}

impl App {
    pub fn new() -> Self {
        App { appcounter: 0, running: false }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }
}

/// Begin periodic generation. A no-op for the root, for an unconnected
/// mote, or when the application is disabled (`app_pkPeriod` 0).
pub fn start(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.app.running
        || mote.dag_root
        || ctx.settings.app_pk_period <= 0.0
        || !mote.secjoin.joined
        || mote.rpl.preferred_parent.is_none()
    {
        return;
    }
    mote.app.running = true;
    schedule_next(mote, ctx);
}

fn schedule_next(mote: &Mote, ctx: &mut SimCtx) {
    let period = ctx.settings.app_pk_period;
    let variance = ctx.settings.app_pk_period_var;
    let jitter = if variance > 0.0 { 1.0 + ctx.rng.gen_range(-variance..variance) } else { 1.0 };
    let slots = ctx.settings.seconds_to_slots(period * jitter).max(1);
    let asn = ctx.engine.asn();
    ctx.engine.schedule(asn + slots, SlotOrder::Stack, EventKind::AppSendPacket { mote: mote.id });
}

pub fn on_send_timer(mote: &mut Mote, ctx: &mut SimCtx) {
    if !mote.app.running {
        return;
    }
    send_single_packet(mote, ctx);
    schedule_next(mote, ctx);
}

/// Generate one upstream DATA packet.
pub fn send_single_packet(mote: &mut Mote, ctx: &mut SimCtx) {
    let Some(dodag_id) = mote.rpl.dodag_id else { return };
    let asn = ctx.engine.asn();
    let appcounter = mote.app.appcounter;
    mote.app.appcounter += 1;

    ctx.log.log(
        asn,
        logtypes::APP_TX,
        json!({
            "_mote_id": mote.id,
            "appcounter": appcounter,
            "dstIp": dodag_id.to_string(),
            "packet_length": ctx.settings.app_pk_length,
        }),
    );

    let packet = Packet::new(
        Payload::Data(DataPayload { appcounter, asn_at_source: asn }),
        NetHeader::new(mote.global_addr(), dodag_id, ctx.settings.app_pk_length),
    );
    sixlowpan::send(mote, ctx, packet);
}

/// DATA arriving at its final destination.
pub fn recv(mote: &mut Mote, ctx: &mut SimCtx, packet: Packet) {
    let Payload::Data(data) = &packet.payload else { return };
    let asn = ctx.engine.asn();
    ctx.log.log(
        asn,
        logtypes::APP_RX,
        json!({
            "_mote_id": mote.id,
            "appcounter": data.appcounter,
            "srcIp": packet.net.src_ip.to_string(),
            "asn_at_source": data.asn_at_source,
            "latency_slots": asn.saturating_sub(data.asn_at_source),
            "hops": (INITIAL_HOP_LIMIT - packet.net.hop_limit) as u32 + 1,
            "packet_length": packet.net.packet_length,
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_starts_stopped() {
        let app = App::new();
        assert!(!app.running);
        assert_eq!(app.appcounter, 0);
    }
}
