//! # Descriptor Publisher
//!
//! Keeps this node's signed [`PeerDescriptor`] alive in the DHT. On start it signs
//! and publishes immediately, then re-signs and republishes every
//! `republish_interval` until cancelled. The descriptor TTL is longer than the
//! interval, so a live node's record never lapses.
//!
//! A failed round is logged and the next tick tries again; publishing never takes
//! the node down.
//!
//! The most recently signed descriptor is kept in a [`DescriptorSlot`] that the
//! overlay client reads when it performs handshakes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::descriptor::{Endpoints, PeerDescriptor};
use crate::dht::DhtNode;
use crate::identity::Keypair;
use crate::protocols::DhtRpc;

/// The latest self-descriptor, shared with whoever needs to present it.
pub type DescriptorSlot = Arc<RwLock<Option<PeerDescriptor>>>;

pub fn descriptor_slot() -> DescriptorSlot {
    Arc::new(RwLock::new(None))
}

pub struct DescriptorPublisher<N: DhtRpc> {
    dht: DhtNode<N>,
    keypair: Keypair,
    endpoints: Endpoints,
    capabilities: u32,
    ttl: Duration,
    interval: Duration,
    slot: DescriptorSlot,
}

impl<N: DhtRpc> DescriptorPublisher<N> {
    pub fn new(
        dht: DhtNode<N>,
        keypair: Keypair,
        endpoints: Endpoints,
        capabilities: u32,
        ttl: Duration,
        interval: Duration,
        slot: DescriptorSlot,
    ) -> Self {
        Self {
            dht,
            keypair,
            endpoints,
            capabilities,
            ttl,
            interval,
            slot,
        }
    }

    /// Sign a fresh descriptor and make it the current one.
    pub fn sign_descriptor(&self) -> PeerDescriptor {
        let descriptor =
            PeerDescriptor::sign(&self.keypair, self.endpoints.clone(), self.capabilities, self.ttl);
        *self.slot.write() = Some(descriptor.clone());
        descriptor
    }

    pub fn current(&self) -> Option<PeerDescriptor> {
        self.slot.read().clone()
    }

    /// One publish round. Returns how many remote peers accepted the descriptor.
    pub async fn publish_once(&self) -> Result<usize> {
        let descriptor = self.sign_descriptor();
        let accepted = self.dht.publish(descriptor).await?;
        debug!(accepted, "published self descriptor");
        Ok(accepted)
    }

    /// Publish now, then on every interval tick until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                peer = %self.keypair.peer_id().short(),
                interval_secs = self.interval.as_secs(),
                "descriptor publisher started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.publish_once().await {
                            warn!(error = %e, "descriptor publish failed; retrying next interval");
                        }
                    }
                }
            }
            debug!("descriptor publisher stopped");
        })
    }
}
