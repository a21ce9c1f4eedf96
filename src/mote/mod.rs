//! A mote and its protocol stack.
//!
//! Every mote wholly owns its layer state; motes only influence each other
//! through the connectivity layer. Mote 0 is the DAG root: it boots
//! synchronised and joined, everyone else hunts for an EB first.

pub mod app;
pub mod radio;
pub mod rpl;
pub mod secjoin;
pub mod sf;
pub mod sixlowpan;
pub mod sixp;
pub mod tsch;

use rand::rngs::StdRng;
use serde_json::json;

use crate::address::{Ipv6Addr, MacAddr, MoteId};
use crate::packet::{DropReason, Packet};
use crate::settings::Settings;
use crate::simlog::types as logtypes;
use crate::simulation::SimCtx;

pub struct Mote {
    pub id: MoteId,
    pub mac_addr: MacAddr,
    pub dag_root: bool,
    pub radio: radio::Radio,
    pub tsch: tsch::Tsch,
    pub lowpan: sixlowpan::SixLowpan,
    pub rpl: rpl::Rpl,
    pub secjoin: secjoin::SecJoin,
    pub sixp: sixp::SixP,
    pub sf: sf::Sf,
    pub app: app::App,
}

impl Mote {
    pub fn new(id: MoteId, settings: &Settings, rng: &mut StdRng) -> Self {
        Mote {
            id,
            mac_addr: MacAddr::from_mote_id(id),
            dag_root: id == 0,
            radio: radio::Radio::new(rng),
            tsch: tsch::Tsch::new(settings.tsch_slotframe_length),
            lowpan: sixlowpan::SixLowpan::new(),
            rpl: rpl::Rpl::new(),
            secjoin: secjoin::SecJoin::new(),
            sixp: sixp::SixP::new(),
            sf: sf::Sf::new(settings.sf_class),
            app: app::App::new(),
        }
    }

    pub fn link_local_addr(&self) -> Ipv6Addr {
        Ipv6Addr::link_local_of(self.mac_addr)
    }

    pub fn global_addr(&self) -> Ipv6Addr {
        Ipv6Addr::global_of(self.mac_addr)
    }

    pub fn is_my_ipv6_addr(&self, addr: Ipv6Addr) -> bool {
        addr.host() == Some(self.mac_addr.host())
    }
}

/// Called once per mote before the engine starts.
pub fn boot(mote: &mut Mote, ctx: &mut SimCtx) {
    if mote.dag_root {
        mote.tsch.is_sync = true;
        mote.secjoin.joined = true;
        mote.rpl.init_root(mote.global_addr());
        tsch::install_minimal_cell(mote, ctx);
        tsch::schedule_next_active_slot(mote, ctx);
        sf::indication_joined(mote, ctx);
    } else if mote.tsch.is_sync {
        // pre-seeded state (static experiments): wake the timers up
        tsch::schedule_next_active_slot(mote, ctx);
        tsch::start_keep_alive(mote, ctx);
        if mote.rpl.dodag_id.is_some() {
            rpl::start_dao(mote, ctx);
        }
        app::start(mote, ctx);
    } else {
        tsch::start_eb_hunt(mote, ctx);
    }
}

/// Drop a packet with a logged reason. The packet is consumed; nothing can
/// process it afterwards.
pub fn drop_packet(ctx: &mut SimCtx, mote_id: MoteId, packet: Packet, reason: DropReason) {
    ctx.log.log(
        ctx.engine.asn(),
        logtypes::PACKET_DROPPED,
        json!({
            "_mote_id": mote_id,
            "reason": reason.as_str(),
            "packet": packet.log_summary(),
        }),
    );
    drop(packet);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn mote_zero_is_the_root() {
        let settings = Settings::default();
        let mut rng = StdRng::seed_from_u64(1);
        let root = Mote::new(0, &settings, &mut rng);
        let other = Mote::new(3, &settings, &mut rng);
        assert!(root.dag_root);
        assert!(!other.dag_root);
        assert_eq!(root.mac_addr.to_string(), "02-00-00-00-00-01-00-00");
    }

    #[test]
    fn ipv6_ownership_ignores_scope() {
        let settings = Settings::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mote = Mote::new(2, &settings, &mut rng);
        assert!(mote.is_my_ipv6_addr(mote.link_local_addr()));
        assert!(mote.is_my_ipv6_addr(mote.global_addr()));
        assert!(!mote.is_my_ipv6_addr(Ipv6Addr::Global(5)));
    }
}
