//! Core modules: storage plumbing, identity, and the energy ledger itself.
//!
//! Everything that touches the database goes through [`broker::DbBroker`];
//! everything that moves a party's budget lives in [`ledger`].

pub mod broker;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod schemas;
pub mod store;
pub mod time;
