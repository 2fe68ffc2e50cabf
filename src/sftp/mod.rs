//! SFTP file transfer module
//!
//! Recursive push of the local job folder and pull of simulation results.

pub mod error;
pub mod path_utils;
pub mod remote_fs;
pub mod transfer;

pub use error::SftpError;
pub use remote_fs::{RemoteEntry, RemoteFs, SftpFs};
pub use transfer::{
    timestamp_dir_name, PullFilters, TransferDirection, TransferEngine, TransferEvent,
    TransferFailure, TransferReport,
};
