// Utility modules shared by the network primitives and the CLI
pub mod command;
pub mod constants;
pub mod filesystem;
pub mod logger;
pub mod process;
