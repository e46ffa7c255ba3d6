//! Data types shared between the supervisor daemon and anything that reads its state.
//!
//! Everything in here is plain data: the operational [`server::ServerSettings`],
//! the console reply payloads, the directory wire records and the status report
//! handed to a front end.

pub mod console;
pub mod directory;
pub mod server;
