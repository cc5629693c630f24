//! Backend for a freelance marketplace: clients post projects, freelancers bid,
//! accepted bids are paid through a simulated escrow, and participants chat in
//! real time over WebSocket rooms.

pub mod common;
pub mod server;
