mod client;

pub use client::{Console, ConsoleClient, ConsoleEndpoint, ConsoleError};
