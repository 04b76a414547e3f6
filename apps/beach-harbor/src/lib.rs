//! Beach Harbor hands out game-server droplets: it reuses idle ones, provisions
//! new ones on demand and reclaims them when the game server signs off.

pub mod cli;
pub mod config;
pub mod orchestrator;
pub mod provision;
pub mod registry;
pub mod routes;
pub mod state;
