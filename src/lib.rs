//! Peer discovery on the local network, a Kademlia routing table of the discovered peers, and
//! parallel download of files from every peer holding them.
//!
//! Peers find each other by multicasting a small announcement over UDP. Whoever hears it
//! handshakes with the announcer over TCP, after which both sides bootstrap their routing table
//! from each other. Files shared by peers are then fetched with [`LanService::download_file`],
//! which splits large files among all the peers holding the exact same copy.

mod action;
mod config;
mod discovery;
mod download;
mod handler;
mod id;
mod message;
mod provider;
mod range;
mod routing;
mod rpc;
mod server;
mod service;
mod socket;
mod storage;
mod transport;

pub use crate::config::{
    Config, IpVersion, DEFAULT_ALTERNATE_PORTS, DEFAULT_MULTICAST_V4, DEFAULT_MULTICAST_V6,
    DEFAULT_PORT,
};
pub use crate::discovery::{DiscoveryStatsSnapshot, InterfaceProbe, RouteProbe, StaticProbe};
pub use crate::download::{DownloadError, DownloadRequest};
pub use crate::handler::{DebugState, ServiceEvent};
pub use crate::id::{Distance, Identifier, LengthError, ID_LEN};
pub use crate::message::{Announcement, FileChunk, FileQuery, FileStatus, PROTOCOL_VERSION};
pub use crate::provider::{FileProvider, FolderProvider, NoFiles};
pub use crate::range::ByteRange;
pub use crate::routing::contact::{ContactInfo, ContactStatus};
pub use crate::service::{LanService, ServiceBuilder, StartError};
