mod controller;
mod helper;

pub use controller::{KillReport, LaunchError, ProcessControl, ProcessHandle, ServerProcess};
pub use helper::ProcessHelper;
