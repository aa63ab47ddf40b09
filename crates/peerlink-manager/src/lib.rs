pub mod manager;
pub mod pool;

pub use manager::PoolManager;
pub use pool::PeerPool;
