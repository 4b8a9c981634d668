#![warn(missing_docs)]
//! Session broker: channels with buffered remote calls and owned objects,
//! relayed between players over a framed TCP + UDP protocol.

pub mod admin;
pub mod broker;
pub mod channel;
pub mod config;
pub mod directory;
pub mod error;
pub mod objects;
pub mod persist;
pub mod rfc;
mod server;
pub mod store;

pub use admin::EntryList;
pub use broker::{Broker, BrokerServices, IoBatch, Outbound, SNAPSHOT_FILE};
pub use channel::{Channel, ChannelLedgers, ChannelSettings, LeaveOutcome, RfcOutcome};
pub use config::{BrokerConfig, DEFAULT_CONFIG_PATH};
pub use directory::{DirectoryLink, NullDirectory, ServerAdvertisement};
pub use error::{PersistError, StoreError, Violation};
pub use objects::{CreatedObject, ObjectLedger};
pub use rfc::{BufferedRfc, RfcLedger};
pub use server::BrokerServer;
pub use store::{
    is_reserved_name, FileStore, FsFileStore, MemoryFileStore, StoreRequest, RESERVED_FILES,
};
