pub mod mirror;
pub mod owner;
pub mod store;

pub use owner::owner_id;
pub use store::{PutKeys, SignatureStore, StoreStats};
