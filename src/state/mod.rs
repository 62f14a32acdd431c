// Session and event state consulted by chain rules

pub mod events;
pub mod session;
