pub mod app;
pub mod config;
pub mod console;
pub mod directory;
pub mod process;
pub mod runtime;
pub mod settings;
pub mod storage;
pub mod supervisor;
