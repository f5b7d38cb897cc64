mod fs;
mod mock;

pub use fs::FsBackend;
pub use mock::MockBackend;
