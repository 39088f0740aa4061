pub mod config;
pub mod error;
pub mod io_struct;
pub mod middleware;
pub mod relay;
pub mod relay_state;
pub mod server;
pub mod upstream;
