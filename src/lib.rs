//! # 6TiSCH mesh simulator
//!
//! A discrete-event simulator of a 6TiSCH low-power wireless mesh: motes
//! synchronised on a time-slotted channel-hopping schedule, running RPL
//! over 6LoWPAN with 6P-negotiated cells, driven by a single deterministic
//! event queue keyed by the Absolute Slot Number.
//!
//! ## Architecture overview
//!
//! - [`engine`]: the absolute-time event queue; the only synchronisation
//!   mechanism in the simulator.
//! - [`connectivity`]: the link matrix and the per-slot propagation and
//!   interference resolution bridging transmitters to receivers.
//! - [`mote`]: the per-mote stack (radio, TSCH, 6LoWPAN, RPL, secure
//!   join, 6P, scheduling function, application).
//! - [`simulation`]: ties settings, engine, log, PRNG, connectivity and
//!   the mote arena into one run.
//!
//! Runs emit one JSON object per event on the [`simlog`] sink; KPI
//! extraction happens in external tooling.

pub mod address;
pub mod connectivity;
pub mod engine;
pub mod mote;
pub mod packet;
pub mod settings;
pub mod simlog;
pub mod simulation;

pub use settings::Settings;
pub use simulation::{Simulation, run_simulation};
