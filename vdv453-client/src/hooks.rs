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
use std::time::Duration;

use crate::abort::AbortReason;
use crate::error::Vdv453Error;
use crate::services::Service;
use crate::subscription_manager::Subscription;

/// Observation points of the client, e.g. for metrics. All methods default to doing nothing.
///
/// Hooks are called synchronously from the client's tasks and must not block.
#[allow(unused_variables)]
pub trait Hooks: Send + Sync {
    fn subscription_created(&self, subscription: &Subscription, elapsed: Duration) {}
    fn subscription_restored(&self, subscription: &Subscription) {}
    fn subscription_expired(&self, subscription: &Subscription) {}
    fn subscription_canceled(&self, subscription: &Subscription, reason: AbortReason) {}
    fn subscriptions_reset_by_remote(&self, service: Service, count: usize) {}

    fn manual_fetch_started(&self, service: Service) {}
    fn manual_fetch_succeeded(&self, service: Service, elements: usize, elapsed: Duration) {}
    fn manual_fetch_failed(&self, service: Service, error: &Vdv453Error, elapsed: Duration) {}

    fn page_fetched(&self, service: Service, iteration: usize, elements: usize, elapsed: Duration) {}

    /// A fetch pass triggered by polling or a `DatenBereitAnfrage`
    fn data_fetch_started(&self, service: Service) {}
    fn data_fetch_succeeded(&self, service: Service, elements: usize, elapsed: Duration) {}
    fn data_fetch_failed(&self, service: Service, error: &Vdv453Error, elapsed: Duration) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

impl Hooks for NoopHooks {}

/// `Hooks` writing every observation to the log
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingHooks;

impl Hooks for LoggingHooks {
    fn subscription_created(&self, subscription: &Subscription, elapsed: Duration) {
        info!(
            "Subscribed to {} with AboID {} until {} ({elapsed:?})",
            subscription.service, subscription.id, subscription.expires_at
        );
    }

    fn subscription_restored(&self, subscription: &Subscription) {
        info!(
            "Restored {} subscription {} (expires {})",
            subscription.service, subscription.id, subscription.expires_at
        );
    }

    fn subscription_expired(&self, subscription: &Subscription) {
        info!(
            "{} subscription {} expired",
            subscription.service, subscription.id
        );
    }

    fn subscription_canceled(&self, subscription: &Subscription, reason: AbortReason) {
        info!(
            "{} subscription {} canceled: {reason}",
            subscription.service, subscription.id
        );
    }

    fn subscriptions_reset_by_remote(&self, service: Service, count: usize) {
        warn!("Remote lost its {service} subscriptions, {count} local subscriptions reset");
    }

    fn manual_fetch_started(&self, service: Service) {
        debug!("Manual {service} fetch started");
    }

    fn manual_fetch_succeeded(&self, service: Service, elements: usize, elapsed: Duration) {
        info!("Manual {service} fetch yielded {elements} elements ({elapsed:?})");
    }

    fn manual_fetch_failed(&self, service: Service, error: &Vdv453Error, elapsed: Duration) {
        warn!("Manual {service} fetch failed after {elapsed:?}: {error}");
    }

    fn page_fetched(&self, service: Service, iteration: usize, elements: usize, elapsed: Duration) {
        debug!("Fetched {service} page {iteration} with {elements} elements ({elapsed:?})");
    }

    fn data_fetch_started(&self, service: Service) {
        debug!("{service} data fetch started");
    }

    fn data_fetch_succeeded(&self, service: Service, elements: usize, elapsed: Duration) {
        info!("{service} data fetch yielded {elements} elements ({elapsed:?})");
    }

    fn data_fetch_failed(&self, service: Service, error: &Vdv453Error, elapsed: Duration) {
        error!("{service} data fetch failed after {elapsed:?}: {error}");
    }
}
