//! Device drivers: the interrupt controller and timer hardware the core
//! kernel depends on. Everything else lives behind future bus work.

pub mod hpet;
pub mod lapic;
