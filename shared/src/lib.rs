pub mod authorizations;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod flows;
pub mod primitives;
pub mod rpc;
pub mod store;
pub mod utils;

pub use rsa;
