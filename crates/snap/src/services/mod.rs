//! SNAP services. Each has a device-side server and a client half.

pub mod cfg;
pub mod fldt;
pub mod info;
pub mod msgr;
pub mod prvs;

pub use cfg::{CfgClient, CfgHandler, CfgServer, MessengerChannels, MessengerConfig, UserConfig, WifiConfig};
pub use fldt::{FileInfoMsg, FldtClient, FldtServer, GotFile, GotFileCallback};
pub use info::{
    start_notification, EnumElement, GeneralInfo, InfoClient, InfoHandler, InfoServer, StatInfo,
    INFO_GENERAL, INFO_STATISTICS,
};
pub use msgr::{msgr_start_notification, MsgrClient, MsgrClientHandler, MsgrServer, MsgrServerHandler};
pub use prvs::{DnidElement, PrvsClient, PrvsDeviceInfo, PrvsServer, SignedPubkey};
