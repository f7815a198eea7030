//! Tunnel endpoint discovery.
//!
//! Every node publishes the local address of each overlay device under
//! `<root>/vxlan/<device>/<address>` and watches the whole prefix to learn
//! its peers.
//!
//! - [`registry`] - publishing and listing endpoint records
//! - [`watcher`] - turning watch updates into peer changes for a device sink

pub mod registry;
pub mod watcher;

pub use registry::EndpointRegistry;
pub use watcher::{EndpointSink, EndpointWatcher, LoggingSink, PeerChange, SinkError};

use crate::error::{IpamError, IpamResult};
use crate::pool::{ClaimRecord, KeyLayout};
use crate::store::KeyValue;
use std::net::Ipv4Addr;

/// One node's endpoint on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub device: String,
    pub address: Ipv4Addr,
    pub owner: String,
}

impl Endpoint {
    pub fn from_kv(layout: &KeyLayout, kv: &KeyValue) -> IpamResult<Self> {
        let (device, address) = layout.parse_endpoint_key(&kv.key).ok_or_else(|| IpamError::Codec {
            key: kv.key.clone(),
            message: "not an endpoint key".to_string(),
        })?;
        let record = ClaimRecord::decode(&kv.key, &kv.value)?;
        Ok(Self {
            device,
            address,
            owner: record.owner,
        })
    }
}
