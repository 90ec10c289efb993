pub mod config;
pub mod err;
pub mod rpc;
pub mod stages;
pub mod tensor;
pub mod timelog;
pub mod utils;
pub mod vision;
