pub mod storage;
pub mod sweeper;

pub use storage::MemoryStore;
pub use sweeper::KeySweeper;
