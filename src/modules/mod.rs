pub mod assembler;
pub mod audit;
pub mod authorization;
pub mod crypto;
pub mod delivery;
pub mod manifest;
pub mod media_api;
pub mod pipeline;
pub mod session_store;
pub mod tools;
pub mod workspace;
