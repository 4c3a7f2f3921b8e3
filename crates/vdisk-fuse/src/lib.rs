pub mod config;
pub mod fs;
pub mod inode;
pub mod mapping;

pub use config::MountConfig;
pub use fs::VdiskFs;
pub use inode::{InodeTable, ROOT_INO};
pub use mapping::{access_from_flags, create_disposition, errno, info_to_fileattr, open_disposition};
