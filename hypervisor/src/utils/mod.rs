pub mod addresses;
pub mod alloc;
pub mod logger;
pub mod processor;
