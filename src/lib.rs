pub mod cryptography;
pub mod message;
pub mod pathkey;
pub mod peer;
pub mod server;
pub mod store;
pub mod transport;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const ID_SIZE: usize = 32;
pub const CIPHER_CHUNK_SIZE: usize = 32 * 1024;
