pub mod directory;

pub use directory::{CompanyConfig, DirectoryConfig};
