pub mod capture_provider;
pub mod permissions;
pub mod transport;
