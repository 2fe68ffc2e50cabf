//! WebSocket bridge between browser clients and client sessions

mod server;

pub use server::ControlServer;
