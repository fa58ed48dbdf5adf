//! # Certificate Pin Store (TOFU)
//!
//! Maps an identifier (`host:port` or peer id hex) to the fingerprint of the
//! certificate first seen there. The first successful connection pins; later
//! connections must present the same fingerprint.
//!
//! A pin is never replaced. A different fingerprint is reported as
//! [`PinCheck::Mismatch`] and the caller aborts the connection; recovering from a
//! legitimate key change is an operator action ([`PinStore::remove_pin`]).

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::identity::now_ms;
use crate::messages;
use crate::store::KeyValueStore;

const PIN_NAMESPACE: &str = "pins";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinCheck {
    /// First contact: nothing recorded for this identifier.
    NotPinned,
    Valid,
    Mismatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificatePin {
    pub identifier: String,
    pub fingerprint: String,
    pub first_seen_at: u64,
}

#[derive(Clone)]
pub struct PinStore {
    store: Arc<dyn KeyValueStore>,
}

fn normalize(fingerprint: &str) -> String {
    fingerprint.trim().to_ascii_lowercase()
}

impl PinStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Record `fingerprint` for `identifier` unless a pin already exists.
    /// Returns `true` when a new pin was written.
    pub fn set_pin(&self, identifier: &str, fingerprint: &str) -> Result<bool> {
        let pin = CertificatePin {
            identifier: identifier.to_string(),
            fingerprint: normalize(fingerprint),
            first_seen_at: now_ms(),
        };
        let bytes = messages::serialize(&pin).context("failed to encode pin")?;
        let written = self
            .store
            .put_if_absent(PIN_NAMESPACE, identifier, &bytes)
            .context("failed to persist pin")?;
        if written {
            info!(identifier = %identifier, fingerprint = %pin.fingerprint, "pinned certificate on first use");
        }
        Ok(written)
    }

    pub fn check_pin(&self, identifier: &str, fingerprint: &str) -> Result<PinCheck> {
        let Some(pin) = self.get_pin(identifier)? else {
            return Ok(PinCheck::NotPinned);
        };
        if pin.fingerprint == normalize(fingerprint) {
            Ok(PinCheck::Valid)
        } else {
            warn!(
                event = "security",
                identifier = %identifier,
                "certificate fingerprint does not match pin"
            );
            Ok(PinCheck::Mismatch)
        }
    }

    pub fn get_pin(&self, identifier: &str) -> Result<Option<CertificatePin>> {
        let Some(bytes) = self
            .store
            .get(PIN_NAMESPACE, identifier)
            .context("failed to read pin")?
        else {
            return Ok(None);
        };
        let pin = messages::deserialize_bounded(&bytes).context("corrupt pin record")?;
        Ok(Some(pin))
    }

    pub fn remove_pin(&self, identifier: &str) -> Result<()> {
        self.store.delete(PIN_NAMESPACE, identifier)?;
        info!(identifier = %identifier, "removed certificate pin");
        Ok(())
    }

    pub fn pinned_identifiers(&self) -> Result<Vec<String>> {
        self.store.keys(PIN_NAMESPACE)
    }
}
