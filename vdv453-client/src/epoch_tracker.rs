/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

use log::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::hooks::Hooks;
use crate::services::Service;
use crate::storage::{daten_version_id_key, start_dienst_zst_key, Storage, EPOCH_TTL};
use crate::subscription_manager::SubscriptionManager;
use crate::xml::element::XmlElement;
use crate::xml::zst::parse_zst;

/// Identity of the remote's current service instance, as reported in `StatusAntwort` and `ClientStatusAnfrage`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEpoch {
    pub start_dienst_zst: Option<String>,
    pub daten_version_id: Option<String>,
}

impl RemoteEpoch {
    /// Read `StartDienstZst` and `DatenVersionID` children of `element`
    pub fn from_element(element: &XmlElement) -> Self {
        RemoteEpoch {
            start_dienst_zst: element.child_text("StartDienstZst").map(String::from),
            daten_version_id: element.child_text("DatenVersionID").map(String::from),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_dienst_zst.is_none() && self.daten_version_id.is_none()
    }
}

/// Outcome of observing a `RemoteEpoch`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochChange {
    /// Nothing was known before
    Baseline,
    Unchanged,
    /// The remote restarted, but kept its data (and our subscriptions)
    Restarted,
    /// The remote restarted with new data, all local subscriptions of the service were canceled
    Reset { canceled: usize },
}

fn same_start(stored: &str, observed: &str) -> bool {
    match (parse_zst(stored), parse_zst(observed)) {
        (Ok(stored), Ok(observed)) => stored == observed,
        _ => stored == observed,
    }
}

/// Detects the remote party losing its subscription state, by comparing each observed epoch with the last stored one.
pub(crate) struct EpochTracker {
    storage: Arc<dyn Storage>,
    hooks: Arc<dyn Hooks>,
    subscription_manager: Arc<SubscriptionManager>,
    // observations of the same service must not interleave
    lock: Mutex<()>,
}

impl EpochTracker {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        hooks: Arc<dyn Hooks>,
        subscription_manager: Arc<SubscriptionManager>,
    ) -> Self {
        EpochTracker {
            storage,
            hooks,
            subscription_manager,
            lock: Mutex::new(()),
        }
    }

    pub(crate) async fn observe(&self, service: Service, observed: &RemoteEpoch) -> Result<EpochChange> {
        if observed.is_empty() {
            return Ok(EpochChange::Unchanged);
        }
        let _lock = self.lock.lock().await;

        let start_key = start_dienst_zst_key(service);
        let version_key = daten_version_id_key(service);
        let stored_start = self.storage.get(&start_key).await?;
        let stored_version = self.storage.get(&version_key).await?;

        let change = if stored_start.is_none() && stored_version.is_none() {
            EpochChange::Baseline
        } else {
            let start_changed = match (&stored_start, &observed.start_dienst_zst) {
                (Some(stored), Some(observed)) => !same_start(stored, observed),
                _ => false,
            };
            let version_changed = match (&stored_version, &observed.daten_version_id) {
                (Some(stored), Some(observed)) => stored != observed,
                _ => false,
            };

            if start_changed && version_changed {
                warn!(
                    "Remote {service} service restarted with new data ({stored_start:?}/{stored_version:?} -> {:?}/{:?})",
                    observed.start_dienst_zst, observed.daten_version_id
                );
                let canceled = self.subscription_manager.reset_by_remote(service).await?;
                EpochChange::Reset { canceled }
            } else if start_changed {
                info!(
                    "Remote {service} service restarted at {:?}",
                    observed.start_dienst_zst
                );
                EpochChange::Restarted
            } else {
                EpochChange::Unchanged
            }
        };

        if let Some(start) = &observed.start_dienst_zst {
            self.storage
                .set(&start_key, start.clone(), Some(EPOCH_TTL))
                .await?;
        }
        if let Some(version) = &observed.daten_version_id {
            self.storage
                .set(&version_key, version.clone(), Some(EPOCH_TTL))
                .await?;
        }

        if let EpochChange::Reset { canceled } = change {
            self.hooks.subscriptions_reset_by_remote(service, canceled);
        }
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_epoch_from_element() {
        let element = XmlElement::new("StatusAntwort")
            .with_child(XmlElement::new("Status").with_attribute("Ergebnis", "ok"))
            .with_child(XmlElement::new("StartDienstZst").with_text("2024-04-11T03:00:00Z"))
            .with_child(XmlElement::new("DatenVersionID").with_text(" 42 "));
        let epoch = RemoteEpoch::from_element(&element);
        assert_eq!(
            epoch.start_dienst_zst.as_deref(),
            Some("2024-04-11T03:00:00Z")
        );
        assert_eq!(epoch.daten_version_id.as_deref(), Some("42"));
        assert!(RemoteEpoch::from_element(&XmlElement::new("StatusAntwort")).is_empty());
    }

    #[test]
    fn test_same_start_compares_instants() {
        assert!(same_start("2024-04-11T03:00:00Z", "2024-04-11T05:00:00+02:00"));
        assert!(!same_start("2024-04-11T03:00:00Z", "2024-04-11T03:00:01Z"));
        assert!(same_start("gestern", "gestern"));
    }
}
