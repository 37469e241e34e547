pub mod auth;
pub mod availability;
pub mod booking;
pub mod calendar;
pub mod config;
pub mod form;
pub mod limits;
pub mod mail;
pub mod model;
pub mod observability;
pub mod repo;
pub mod session;
pub mod store;
pub mod upkeep;
pub mod wal;
