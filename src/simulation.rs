//! Simulation lifecycle.
//!
//! `Simulation` owns everything a run needs: the settings, the event
//! engine, the event log, the single seeded PRNG, the connectivity matrix
//! and the mote arena. There is no global state; components receive the
//! context by reference. Given identical settings and seed, two runs
//! produce byte-identical logs.

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;

use crate::address::MacAddr;
use crate::connectivity::Connectivity;
use crate::engine::{Engine, EventKind, SlotOrder};
use crate::mote::tsch::CellOptions;
use crate::mote::rpl::RPL_MIN_HOP_RANK_INCREASE;
use crate::mote::{self, Mote, app, rpl, secjoin, sf, sixp, tsch};
use crate::settings::Settings;
use crate::simlog::{LogSink, SimLog, types as logtypes};

/// Everything the stack layers need besides the mote itself.
pub struct SimCtx {
    pub settings: Settings,
    pub engine: Engine,
    pub log: SimLog,
    pub rng: StdRng,
}

pub struct Simulation {
    pub ctx: SimCtx,
    pub connectivity: Connectivity,
    pub motes: Vec<Mote>,
    started: bool,
    finalized: bool,
}

impl Simulation {
    pub fn new(settings: Settings, run_id: u64, sink: LogSink) -> Result<Self, String> {
        settings.validate()?;

        let mut rng = StdRng::seed_from_u64(settings.exec_random_seed.wrapping_add(run_id));
        let connectivity = Connectivity::new(&settings, &mut rng)?;
        let motes = (0..settings.exec_num_motes)
            .map(|id| Mote::new(id, &settings, &mut rng))
            .collect();

        let mut log = SimLog::new(sink, run_id);
        log.log_settings(&settings);

        Ok(Simulation {
            ctx: SimCtx { settings, engine: Engine::new(), log, rng },
            connectivity,
            motes,
            started: false,
            finalized: false,
        })
    }

    /// Boot every mote and arm the propagation and end-of-run events.
    /// Idempotent; `run` and `run_until_asn` call it on first use.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for id in 0..self.motes.len() {
            mote::boot(&mut self.motes[id], &mut self.ctx);
        }
        self.ctx.engine.schedule(1, SlotOrder::Propagate, EventKind::Propagate);
        self.ctx.engine.schedule(
            self.ctx.settings.run_length_slots().max(2),
            SlotOrder::EndOfSlot,
            EventKind::EndOfSimulation,
        );
    }

    /// Run the event loop to the end of the last slotframe.
    pub fn run(&mut self) {
        self.start();
        while !self.ctx.engine.is_stopped() {
            let Some((_asn, kind)) = self.ctx.engine.pop() else { break };
            self.dispatch(kind);
        }
        self.finalize();
    }

    /// Dispatch events up to and including `target` ASN, then pause.
    pub fn run_until_asn(&mut self, target: u64) {
        self.start();
        while !self.ctx.engine.is_stopped() {
            match self.ctx.engine.peek_asn() {
                Some(asn) if asn <= target => {
                    let (_, kind) = self.ctx.engine.pop().expect("event just peeked");
                    self.dispatch(kind);
                }
                _ => break,
            }
        }
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.log_radio_stats();
        self.ctx.log.flush();
    }

    fn dispatch(&mut self, kind: EventKind) {
        match kind {
            EventKind::Propagate => {
                self.connectivity.propagate(&mut self.motes, &mut self.ctx);
            }
            EventKind::EndOfSimulation => self.ctx.engine.stop(),
            EventKind::TschActiveSlot { mote } => {
                tsch::on_active_slot(&mut self.motes[mote], &mut self.ctx);
            }
            EventKind::TschListenForEb { mote } => {
                tsch::on_listen_for_eb(&mut self.motes[mote], &mut self.ctx);
            }
            EventKind::TschKeepAlive { mote } => {
                tsch::on_keep_alive(&mut self.motes[mote], &mut self.ctx);
            }
            EventKind::AppSendPacket { mote } => {
                app::on_send_timer(&mut self.motes[mote], &mut self.ctx);
            }
            EventKind::RplSendDao { mote } => {
                rpl::on_send_dao(&mut self.motes[mote], &mut self.ctx);
            }
            EventKind::SecJoinRetransmit { mote } => {
                secjoin::on_retransmission_timer(&mut self.motes[mote], &mut self.ctx);
            }
            EventKind::SixPTimeout { mote, peer, initiator } => {
                sixp::on_timeout(&mut self.motes[mote], &mut self.ctx, peer, initiator);
            }
            EventKind::MsfHousekeeping { mote } => {
                sf::on_housekeeping(&mut self.motes[mote], &mut self.ctx);
            }
        }
    }

    fn log_radio_stats(&mut self) {
        let asn = self.ctx.engine.asn();
        for mote in &self.motes {
            let mut fields = mote.radio.stats.log_fields();
            fields["_mote_id"] = json!(mote.id);
            self.ctx.log.log(asn, logtypes::RADIO_STATS, fields);
        }
    }

    /// Pre-seed a linear DODAG: mote i is synced, joined and parented to
    /// mote i-1, ranks cascading from the root. Call before `run`.
    pub fn force_initial_routing_state(&mut self) {
        let n = self.motes.len();
        let root_global = self.motes[0].global_addr();
        for id in 1..n {
            let parent_mac = MacAddr::from_mote_id(id - 1);
            let mote = &mut self.motes[id];
            mote.tsch.is_sync = true;
            mote.tsch.asn_last_sync = 0;
            mote.tsch.join_proxy = Some(parent_mac);
            mote.secjoin.joined = true;
            mote.rpl.preferred_parent = Some(parent_mac);
            mote.rpl.rank = Some((id as u16 + 1) * RPL_MIN_HOP_RANK_INCREASE);
            mote.rpl.neighbor_ranks.insert(parent_mac, id as u16 * RPL_MIN_HOP_RANK_INCREASE);
            mote.rpl.dodag_id = Some(root_global);
            mote.lowpan.on_link_neighbors.insert(parent_mac);
            if id + 1 < n {
                mote.lowpan.on_link_neighbors.insert(MacAddr::from_mote_id(id + 1));
            }
            tsch::install_minimal_cell(&mut self.motes[id], &mut self.ctx);
        }
        if n > 1 {
            self.motes[0].lowpan.on_link_neighbors.insert(MacAddr::from_mote_id(1));
            // the root learns its routes from DAOs; seed them too
            for id in 1..n {
                let parent_mac = MacAddr::from_mote_id(id - 1);
                let child_global = self.motes[id].global_addr();
                rpl::action_receive_dao(
                    &mut self.motes[0],
                    &mut self.ctx,
                    &crate::packet::Packet::new(
                        crate::packet::Payload::Dao(crate::packet::DaoPayload {
                            child: child_global,
                            parent: parent_mac,
                        }),
                        crate::packet::NetHeader::new(child_global, root_global, 20),
                    ),
                );
            }
        }
    }

    /// Install a cascading static schedule on top of the linear DODAG:
    /// mote i transmits to its parent at slot offset i, the parent listens
    /// there. Call before `run`.
    pub fn force_initial_scheduling_state(&mut self) {
        let n = self.motes.len();
        assert!(
            n as u32 <= self.ctx.settings.tsch_slotframe_length,
            "cascading schedule needs one slot per mote"
        );
        let num_chans = self.ctx.settings.phy_num_chans;
        for id in 1..n {
            let slot = id as u32;
            let channel = (id % num_chans as usize) as u32;
            let parent_mac = MacAddr::from_mote_id(id - 1);
            let child_mac = MacAddr::from_mote_id(id);
            tsch::add_cell(
                &mut self.motes[id],
                &mut self.ctx,
                0,
                slot,
                channel,
                CellOptions::TX,
                Some(parent_mac),
            );
            tsch::add_cell(
                &mut self.motes[id - 1],
                &mut self.ctx,
                0,
                slot,
                channel,
                CellOptions::RX,
                Some(child_mac),
            );
        }
    }

    pub fn force_initial_routing_and_scheduling_state(&mut self) {
        self.force_initial_routing_state();
        self.force_initial_scheduling_state();
    }
}

/// Convenience wrapper: build, run, return the finished simulation.
pub fn run_simulation(settings: Settings, run_id: u64, sink: LogSink) -> Result<Simulation, String> {
    let mut simulation = Simulation::new(settings, run_id, sink)?;
    simulation.run();
    Ok(simulation)
}
