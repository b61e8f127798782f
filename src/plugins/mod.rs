//! Subsystems built on the ledger store: catalog, parties, users and the
//! order command surface.

pub mod catalog;
pub mod orders;
pub mod party;
pub mod users;
