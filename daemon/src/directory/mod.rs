mod client;

pub use client::{Directory, DirectoryClient, DirectoryError};
