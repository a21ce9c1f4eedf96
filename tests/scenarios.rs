//! End-to-end scenarios over the JSON event log.
//!
//! Each test builds a small deterministic network, runs it, and asserts on
//! the parsed log lines, the same way the external KPI tooling consumes
//! them.

use serde_json::Value;

use sixtisch_sim::Settings;
use sixtisch_sim::address::{Ipv6Addr, MacAddr};
use sixtisch_sim::mote::tsch::{self, CellOptions, TSCH_MAXTXRETRIES, TSCH_QUEUE_SIZE};
use sixtisch_sim::mote::{app, sixlowpan, sixp};
use sixtisch_sim::packet::{
    DaoPayload, DataPayload, FragPayload, JoinPayload, MacHeader, NetHeader, Packet, Payload,
    SixPCellDescr, SixPCode, SixPCommand, SixPMsgType, SixPPayload,
};
use sixtisch_sim::settings::{ConnClass, Fragmentation, SfClass};
use sixtisch_sim::simlog::{LogSink, types};
use sixtisch_sim::simulation::Simulation;

/// A network with every optional traffic source switched off.
fn quiet_settings(num_motes: usize, num_slotframes: u64) -> Settings {
    Settings {
        exec_num_motes: num_motes,
        exec_num_slotframes_per_run: num_slotframes,
        exec_random_seed: 5,
        conn_class: ConnClass::Linear,
        sf_class: SfClass::SfNone,
        app_pk_period: 0.0,
        app_pk_period_var: 0.0,
        rpl_dao_period: 0.0,
        tsch_prob_bcast_eb_dio_prob: 0.0,
        tsch_prob_bcast_dio_prob: 0.0,
        tsch_keep_alive_interval: 0.0,
        secjoin_enabled: false,
        ..Settings::default()
    }
}

fn entries(sim: &Simulation, event_type: &str) -> Vec<Value> {
    sim.ctx.log.entries_of_type(event_type)
}

fn entries_of_mote(sim: &Simulation, event_type: &str, mote_id: usize) -> Vec<Value> {
    entries(sim, event_type)
        .into_iter()
        .filter(|e| e["_mote_id"] == mote_id)
        .collect()
}

fn global_addr_of(id: usize) -> String {
    Ipv6Addr::global_of(MacAddr::from_mote_id(id)).to_string()
}

fn unicast(payload: Payload, src: usize, dst: usize, length: usize) -> Packet {
    let src_mac = MacAddr::from_mote_id(src);
    let dst_mac = MacAddr::from_mote_id(dst);
    let mut packet = Packet::new(
        payload,
        NetHeader::new(
            Ipv6Addr::global_of(src_mac),
            Ipv6Addr::global_of(dst_mac),
            length,
        ),
    );
    packet.mac = Some(MacHeader { src_mac, dst_mac, retries_left: TSCH_MAXTXRETRIES });
    packet
}

/// Scenario: linear topology with perfect links, static cascading
/// schedule, periodic upstream traffic. Everything sent early enough to
/// drain is delivered, and the hop count equals the source id.
#[test]
fn linear_topology_without_loss_delivers_everything() {
    let settings = Settings {
        app_pk_period: 10.0,
        exec_num_slotframes_per_run: 100,
        ..quiet_settings(6, 100)
    };
    let run_length = settings.run_length_slots();
    let mut sim = Simulation::new(settings, 0, LogSink::Memory(Vec::new())).unwrap();
    sim.force_initial_routing_and_scheduling_state();
    sim.run();

    let app_tx = entries(&sim, types::APP_TX);
    let app_rx = entries(&sim, types::APP_RX);
    assert!(!app_rx.is_empty(), "no packet reached the root");

    // packets generated close to the end of the run may still be in
    // flight when the engine stops
    let cutoff = run_length - 12 * 101;
    for tx in app_tx.iter().filter(|tx| tx["_asn"].as_u64().unwrap() <= cutoff) {
        let source = tx["_mote_id"].as_u64().unwrap() as usize;
        let counter = tx["appcounter"].as_u64().unwrap();
        let matched = app_rx.iter().any(|rx| {
            rx["appcounter"].as_u64() == Some(counter)
                && rx["srcIp"] == global_addr_of(source).as_str()
        });
        assert!(matched, "app.tx {} of mote {} was never received", counter, source);
    }

    for rx in &app_rx {
        let src = rx["srcIp"].as_str().unwrap();
        let source_id =
            (1..6).find(|id| global_addr_of(*id) == src).expect("rx from unknown source");
        assert_eq!(
            rx["hops"].as_u64().unwrap(),
            source_id as u64,
            "hop count must equal the source id on a linear chain"
        );
    }
}

/// Scenario: a dead link exhausts the retransmission budget and drops the
/// packet with MAX_RETRIES.
#[test]
fn single_hop_retransmission_exhaustion() {
    let mut sim =
        Simulation::new(quiet_settings(2, 10), 0, LogSink::Memory(Vec::new())).unwrap();
    sim.force_initial_routing_and_scheduling_state();
    sim.connectivity.set_link(0, 1, 0.0, -60.0);
    sim.connectivity.set_link(1, 0, 0.0, -60.0);

    app::send_single_packet(&mut sim.motes[1], &mut sim.ctx);
    sim.run();

    let txdone: Vec<Value> = entries_of_mote(&sim, types::TSCH_TXDONE, 1)
        .into_iter()
        .filter(|e| e["packet"]["type"] == "DATA")
        .collect();
    assert_eq!(txdone.len(), 1 + TSCH_MAXTXRETRIES as usize);
    for entry in &txdone {
        assert_eq!(entry["isACKed"], false);
    }

    let dropped = entries_of_mote(&sim, types::PACKET_DROPPED, 1);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0]["reason"], "MAX_RETRIES");

    assert!(entries(&sim, types::APP_RX).is_empty());
}

/// Scenario: with only the minimal shared cell, retransmissions back off;
/// consecutive attempts cannot all land one slotframe apart.
#[test]
fn shared_cell_retransmissions_back_off() {
    let settings = quiet_settings(2, 200);
    let slotframe_length = settings.tsch_slotframe_length as u64;
    let mut sim = Simulation::new(settings, 0, LogSink::Memory(Vec::new())).unwrap();
    // routing state only: no dedicated cells, everything rides the
    // minimal shared cell
    sim.force_initial_routing_state();
    sim.connectivity.set_link(0, 1, 0.0, -60.0);
    sim.connectivity.set_link(1, 0, 0.0, -60.0);

    app::send_single_packet(&mut sim.motes[1], &mut sim.ctx);
    sim.run();

    let timestamps: Vec<u64> = entries_of_mote(&sim, types::TSCH_TXDONE, 1)
        .into_iter()
        .filter(|e| e["packet"]["type"] == "DATA")
        .map(|e| e["_asn"].as_u64().unwrap())
        .collect();
    assert_eq!(timestamps.len(), 1 + TSCH_MAXTXRETRIES as usize);

    let gaps: Vec<u64> =
        timestamps.windows(2).map(|pair| pair[1] - pair[0]).collect();
    assert!(
        gaps.iter().any(|gap| *gap > slotframe_length),
        "every retransmission happened on the very next slotframe: {:?}",
        gaps
    );
}

/// Scenario: a full TX queue rejects every queueable frame type with
/// TXQUEUE_FULL.
#[test]
fn full_tx_queue_rejects_every_frame_type() {
    let mut sim =
        Simulation::new(quiet_settings(2, 2), 0, LogSink::Memory(Vec::new())).unwrap();
    sim.force_initial_routing_state();

    for i in 0..TSCH_QUEUE_SIZE {
        let filler = unicast(
            Payload::Data(DataPayload { appcounter: i as u32, asn_at_source: 0 }),
            1,
            0,
            50,
        );
        sim.motes[1].tsch.tx_queue.push(filler);
    }
    assert_eq!(sim.motes[1].tsch.tx_queue.len(), TSCH_QUEUE_SIZE);

    let frames = vec![
        unicast(Payload::Data(DataPayload { appcounter: 99, asn_at_source: 0 }), 1, 0, 50),
        unicast(
            Payload::Frag(FragPayload {
                datagram_tag: 1,
                datagram_size: 180,
                datagram_offset: 0,
                length: 90,
                original: None,
            }),
            1,
            0,
            90,
        ),
        unicast(Payload::JoinRequest(JoinPayload { stateless_proxy: None }), 1, 0, 40),
        unicast(Payload::JoinResponse(JoinPayload { stateless_proxy: None }), 1, 0, 40),
        unicast(
            Payload::Dao(DaoPayload {
                child: Ipv6Addr::global_of(MacAddr::from_mote_id(1)),
                parent: MacAddr::from_mote_id(0),
            }),
            1,
            0,
            20,
        ),
        unicast(
            Payload::SixP(SixPPayload {
                msg_type: SixPMsgType::Request,
                code: SixPCode::Command(SixPCommand::Count),
                seq_num: 0,
                cell_options: CellOptions::empty(),
                num_cells: 0,
                cell_list: Vec::new(),
                candidate_cell_list: Vec::new(),
                relocation_cell_list: Vec::new(),
            }),
            1,
            0,
            30,
        ),
    ];

    for frame in frames {
        assert!(!tsch::enqueue(&mut sim.motes[1], &mut sim.ctx, frame));
    }

    let dropped: Vec<Value> = entries_of_mote(&sim, types::PACKET_DROPPED, 1)
        .into_iter()
        .filter(|e| e["reason"] == "TXQUEUE_FULL")
        .collect();
    assert_eq!(dropped.len(), 6);
    assert_eq!(sim.motes[1].tsch.tx_queue.len(), TSCH_QUEUE_SIZE);
}

/// Scenario: fragment forwarding with a saturated VRB table drops fresh
/// first fragments with VRB_TABLE_FULL.
#[test]
fn vrb_table_full_drops_fresh_datagrams() {
    let settings = Settings {
        fragmentation: Fragmentation::FragmentForwarding,
        fragmentation_ff_vrb_table_size: 50,
        ..quiet_settings(3, 2)
    };
    let mut sim = Simulation::new(settings, 0, LogSink::Memory(Vec::new())).unwrap();
    sim.force_initial_routing_state();

    let leaf = MacAddr::from_mote_id(2);
    let root = MacAddr::from_mote_id(0);
    for i in 0..50 {
        sim.motes[1].lowpan.vrb_insert_raw(leaf, 1000 + i, root, 6000);
    }

    // a first fragment of a fresh datagram travelling leaf -> root
    let mut frag = Packet::new(
        Payload::Frag(FragPayload {
            datagram_tag: 7,
            datagram_size: 180,
            datagram_offset: 0,
            length: 90,
            original: None,
        }),
        NetHeader::new(Ipv6Addr::global_of(leaf), Ipv6Addr::global_of(root), 90),
    );
    frag.mac = Some(MacHeader {
        src_mac: leaf,
        dst_mac: MacAddr::from_mote_id(1),
        retries_left: TSCH_MAXTXRETRIES,
    });

    sixlowpan::recv(&mut sim.motes[1], &sim.connectivity, &mut sim.ctx, frag);

    let dropped = entries_of_mote(&sim, types::PACKET_DROPPED, 1);
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0]["reason"], "VRB_TABLE_FULL");
    assert_eq!(sim.motes[1].lowpan.vrb_len(), 50);
}

/// Scenario: EB-driven synchronisation followed by the secure join, in
/// order, through the root acting as join proxy and JRC.
#[test]
fn eb_sync_then_secure_join() {
    let settings = Settings {
        exec_num_motes: 2,
        exec_num_slotframes_per_run: 300,
        exec_random_seed: 1,
        conn_class: ConnClass::Linear,
        sf_class: SfClass::Msf,
        phy_num_chans: 4,
        secjoin_enabled: true,
        app_pk_period: 0.0,
        rpl_dao_period: 0.0,
        tsch_keep_alive_interval: 0.0,
        ..Settings::default()
    };
    let mut sim = Simulation::new(settings, 0, LogSink::Memory(Vec::new())).unwrap();
    sim.run();

    let root_mac = MacAddr::from_mote_id(0).to_string();

    let synced = entries_of_mote(&sim, types::TSCH_SYNCED, 1);
    assert!(!synced.is_empty(), "the pledge never heard an EB");
    let synced_asn = synced[0]["_asn"].as_u64().unwrap();
    assert_eq!(synced[0]["join_proxy"], root_mac.as_str());

    let join_tx = entries_of_mote(&sim, types::SECJOIN_TX, 1);
    assert!(!join_tx.is_empty(), "the pledge never sent a join request");
    assert!(join_tx[0]["_asn"].as_u64().unwrap() >= synced_asn);

    let joined = entries_of_mote(&sim, types::SECJOIN_JOINED, 1);
    assert!(!joined.is_empty(), "the pledge never joined");
    assert!(joined[0]["_asn"].as_u64().unwrap() > synced_asn);
    assert_eq!(joined[0]["join_proxy"], root_mac.as_str());

    // log-line ordering on the pledge: synced, then secjoin.tx, then
    // secjoin.joined
    let lines = sim.ctx.log.lines().unwrap();
    let position = |event_type: &str| {
        lines
            .iter()
            .position(|l| {
                let v: Value = serde_json::from_str(l).unwrap();
                v["_type"] == event_type && v["_mote_id"] == 1
            })
            .unwrap()
    };
    let p_synced = position(types::TSCH_SYNCED);
    let p_join_tx = position(types::SECJOIN_TX);
    let p_joined = position(types::SECJOIN_JOINED);
    assert!(p_synced < p_join_tx && p_join_tx < p_joined);
}

/// Round-trip law: a fragmented datagram is reassembled at the root into
/// an application-equivalent packet.
#[test]
fn fragmentation_reassembles_at_the_root() {
    let settings = Settings { app_pk_length: 250, ..quiet_settings(2, 10) };
    let mut sim = Simulation::new(settings, 0, LogSink::Memory(Vec::new())).unwrap();
    sim.force_initial_routing_and_scheduling_state();

    app::send_single_packet(&mut sim.motes[1], &mut sim.ctx);
    sim.run();

    let app_rx = entries(&sim, types::APP_RX);
    assert_eq!(app_rx.len(), 1);
    assert_eq!(app_rx[0]["appcounter"], 0);
    assert_eq!(app_rx[0]["packet_length"], 250);
    assert_eq!(app_rx[0]["srcIp"], global_addr_of(1).as_str());
    assert_eq!(app_rx[0]["hops"], 1);
}

/// Round-trip law: a completed 6P ADD of k cells followed by a 6P DELETE
/// of the same k cells restores both schedules.
#[test]
fn sixp_add_then_delete_restores_schedules() {
    let settings = Settings { sf_class: SfClass::Msf, ..quiet_settings(2, 100) };
    let mut sim = Simulation::new(settings, 0, LogSink::Memory(Vec::new())).unwrap();
    sim.force_initial_routing_state();
    sim.start();

    let root_mac = MacAddr::from_mote_id(0);
    let initiator_cells_before = sim.motes[1].tsch.num_cells();
    let responder_cells_before = sim.motes[0].tsch.num_cells();

    let proposed = vec![
        SixPCellDescr { slot_offset: 40, channel_offset: 2 },
        SixPCellDescr { slot_offset: 60, channel_offset: 3 },
    ];
    assert!(sixp::send_request(
        &mut sim.motes[1],
        &mut sim.ctx,
        root_mac,
        SixPCommand::Add,
        CellOptions::TX,
        2,
        proposed,
        Vec::new(),
        Vec::new(),
    ));
    sim.run_until_asn(2000);

    // the responder may decline a proposed slot its own schedule already
    // uses; whatever was agreed must be symmetric on both sides
    let added = sim.motes[1].tsch.cells_with(root_mac);
    assert!(!added.is_empty(), "ADD installed no cells");
    assert_eq!(sim.motes[0].tsch.cells_with(MacAddr::from_mote_id(1)).len(), added.len());
    assert_eq!(entries_of_mote(&sim, types::SIXP_TRANSACTION_COMPLETED, 1).len(), 1);

    let delete_list: Vec<SixPCellDescr> = added
        .iter()
        .map(|(_, slot, channel)| SixPCellDescr { slot_offset: *slot, channel_offset: *channel })
        .collect();
    let num_delete = delete_list.len();
    assert!(sixp::send_request(
        &mut sim.motes[1],
        &mut sim.ctx,
        root_mac,
        SixPCommand::Delete,
        CellOptions::TX,
        num_delete,
        delete_list,
        Vec::new(),
        Vec::new(),
    ));
    sim.run_until_asn(4000);

    assert_eq!(sim.motes[1].tsch.num_cells(), initiator_cells_before);
    assert_eq!(sim.motes[0].tsch.num_cells(), responder_cells_before);
    assert!(sim.motes[1].tsch.cells_with(root_mac).is_empty());
    assert!(sim.motes[0].tsch.cells_with(MacAddr::from_mote_id(1)).is_empty());

    // both completions advanced the per-peer SeqNum
    assert_eq!(sim.motes[1].sixp.seq_num_of(root_mac), 2);
    assert_eq!(sim.motes[0].sixp.seq_num_of(MacAddr::from_mote_id(1)), 2);
}

/// A trace file seeds the connectivity matrix from its first rows.
#[test]
fn trace_connectivity_seeds_the_matrix() {
    let path = std::env::temp_dir().join("sixtisch_sim_trace_test.csv");
    std::fs::write(
        &path,
        "datetime,src,dst,channel,pdr,rssi\n\
         2020-01-01 00:00:00,0,1,0,1.0,-60\n\
         2020-01-01 00:00:00,1,0,0,1.0,-60\n",
    )
    .unwrap();

    let settings = Settings {
        conn_class: ConnClass::Trace,
        conn_trace: Some(path.to_string_lossy().to_string()),
        phy_num_chans: 1,
        ..quiet_settings(2, 5)
    };
    let mut sim = Simulation::new(settings, 0, LogSink::Memory(Vec::new())).unwrap();
    assert_eq!(sim.connectivity.get_pdr(0, 1, 0), 1.0);
    assert_eq!(sim.connectivity.get_rssi(1, 0, 0), -60.0);
    sim.run();
}
