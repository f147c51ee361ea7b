pub mod builder;
pub mod config;
pub mod error;
pub mod gateway;
pub mod job;
pub mod node;
pub mod process;
pub mod protocol;
pub mod remote;
pub mod scheduler;
pub mod shutdown;
pub mod status;
