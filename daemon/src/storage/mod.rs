pub mod file;

pub use file::{Config, FileIoWithBackup};
