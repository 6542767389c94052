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
use std::sync::Arc;

use crate::abort::AbortToken;
use crate::error::Result;
use crate::fetch_engine::FetchEngine;
use crate::services::Service;
use crate::subscription_manager::SubscriptionLedger;

/// Reacts to `DatenBereitAnfrage`s of the remote by fetching the announced data.
pub(crate) struct PushHandler {
    ledger: SubscriptionLedger,
    fetch_engine: Arc<FetchEngine>,
    root: AbortToken,
}

impl PushHandler {
    pub(crate) fn new(
        ledger: SubscriptionLedger,
        fetch_engine: Arc<FetchEngine>,
        root: AbortToken,
    ) -> Self {
        PushHandler {
            ledger,
            fetch_engine,
            root,
        }
    }

    /// Returns whether the notification is acknowledged positively, i.e. whether we have any `service` subscriptions.
    /// The fetch itself runs in the background.
    pub(crate) async fn on_daten_bereit(&self, service: Service) -> Result<bool> {
        if self.ledger.count(service).await? == 0 {
            debug!("DatenBereitAnfrage for {service} without any subscriptions");
            return Ok(false);
        }

        let fetch_engine = self.fetch_engine.clone();
        let token = self.root.clone();
        let fetch = tokio::spawn(async move {
            // a fetch already running picks this up with one more pass
            fetch_engine.mark_received_while_fetching(service);
            fetch_engine
                .fetch_until_no_more_available(service, None, &token)
                .await;
        });

        // per-pass errors are absorbed by the fetch engine, a panic here is a bug
        tokio::spawn(async move {
            if let Err(e) = fetch.await {
                if e.is_panic() {
                    error!("Fetching {service} data after DatenBereitAnfrage panicked: {e}");
                    std::process::abort();
                }
            }
        });
        Ok(true)
    }
}
