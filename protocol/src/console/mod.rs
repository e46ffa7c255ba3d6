mod players;
mod statistics;

pub use players::{PlayerRecord, PlayerSnapshot};
pub use statistics::ServerStatistics;
