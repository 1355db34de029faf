pub mod hash;
pub mod mime;
pub mod narinfo;
pub mod nix_base32;
pub mod signing;
pub mod store_path;

pub use hash::Hash;
pub use narinfo::NarInfo;
pub use signing::Keypair;
pub use store_path::StorePathHash;
