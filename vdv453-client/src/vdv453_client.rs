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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use log::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::abort::{AbortReason, AbortToken};
use crate::configuration::Vdv453Configuration;
use crate::epoch_tracker::{EpochChange, EpochTracker, RemoteEpoch};
use crate::error::{Result, Vdv453Error};
use crate::fetch_engine::{DataEvent, DataPage, FetchEngine};
use crate::hooks::Hooks;
use crate::push_handler::PushHandler;
use crate::server::{self, RequestListener, ServerState};
use crate::services::{Call, Service};
use crate::storage::Storage;
use crate::subscription_manager::{
    self, Subscription, SubscriptionEvent, SubscriptionId, SubscriptionLedger,
    SubscriptionManager,
};
use crate::transport::{assert_status_ok, Transport};
use crate::xml::element::XmlElement;
use crate::xml::zst::format_zst;
use crate::{helpers, listeners};

/// Default `Vorschauzeit` of `aus` and `dfi` subscriptions
pub const DEFAULT_VORSCHAUZEIT: Duration = Duration::from_secs(30 * 60);
/// Default `Hysterese` of `aus` and `dfi` subscriptions
pub const DEFAULT_HYSTERESE: Duration = Duration::from_secs(60);

/// This trait is simply there to have a generic type that the `listeners` deal with, so that `Vdv453Client` can be
/// properly mocked.
#[async_trait]
pub trait Vdv453ClientAbstract: Send + Sync {
    /// `StartDienstZst` of this client instance
    fn start_dienst_zst(&self) -> String;
    async fn observe_remote_epoch(&self, service: Service, epoch: RemoteEpoch)
        -> Result<EpochChange>;
    async fn on_daten_bereit(&self, service: Service) -> Result<bool>;
}

/// Outcome of a `StatusAnfrage`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusInfo {
    pub zst: Option<String>,
    /// Whether the remote has data ready for us
    pub daten_bereit: bool,
    pub epoch: RemoteEpoch,
    pub epoch_change: EpochChange,
}

/// This object holds all mutable content associated with a running `Vdv453Client`, and is returned when calling
/// `Vdv453Client::run()`. It offers a well-defined way to stop the client by calling `Vdv453Stopper::stop()`.
pub struct Vdv453Stopper {
    root: AbortToken,
    subscription_joiner: Option<JoinHandle<()>>,
}

impl Vdv453Stopper {
    /// Cancel all subscription tokens and pending requests with `AbortReason::Shutdown`, and wait for the subscription
    /// ledger to wind down. Persisted subscriptions are kept, to be picked up by `restore_on_startup()`.
    pub async fn stop(&mut self) {
        self.root.cancel(AbortReason::Shutdown);

        let Some(joiner) = self.subscription_joiner.take() else {
            warn!("Vdv453Client has already been stopped");
            return;
        };
        if let Err(e) = joiner.await {
            error!("Error shutting down subscription ledger: {e}");
        }
    }
}

/// Core landing point of the client: subscription handling, data retrieval and the inbound server all hang off this.
///
/// Data fetched in the background (poll loops and `DatenBereitAnfrage`s) is delivered through the
/// `mpsc::Receiver<DataEvent>` returned from `run()`.
pub struct Vdv453Client {
    config: Arc<Vdv453Configuration>,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn Hooks>,
    subscription_manager: Arc<SubscriptionManager>,
    fetch_engine: Arc<FetchEngine>,
    epoch_tracker: EpochTracker,
    push_handler: PushHandler,
    root: AbortToken,
    start_dienst_zst: String,
}

impl Vdv453Client {
    /// Start a new `Vdv453Client`; this spawns the subscription ledger task.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration details for this client
    /// * `transport` - Implementation of `Transport` for talking to the remote party, usually an `HttpTransport`
    /// * `storage` - Where subscriptions and remote epochs get persisted
    /// * `hooks` - Receiver of lifecycle events, e.g. for metrics
    ///
    /// # Returns
    ///
    /// * the client inside an Arc
    /// * a `Vdv453Stopper` object which can be used to explicitly shut down the client
    /// * the receiving end of the data channel
    pub fn run(
        config: Arc<Vdv453Configuration>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn Storage>,
        hooks: Arc<dyn Hooks>,
    ) -> (Arc<Vdv453Client>, Vdv453Stopper, mpsc::Receiver<DataEvent>) {
        helpers::init_once();

        let root = AbortToken::new();

        // Set up subscription ledger actor
        let storage_cloned = storage.clone();
        let hooks_cloned = hooks.clone();
        let root_cloned = root.clone();
        let (subscription_sender, subscription_receiver) =
            mpsc::channel::<SubscriptionEvent>(config.subscription_command_buffer);
        let subscription_joiner = helpers::spawn_and_log_error(async move {
            subscription_manager::handle_message(
                storage_cloned,
                hooks_cloned,
                subscription_receiver,
                root_cloned,
            )
            .await;
            Ok(())
        });
        let ledger = SubscriptionLedger::new(subscription_sender);

        let (data_sender, data_receiver) = mpsc::channel::<DataEvent>(config.data_buffer);
        let fetch_engine = Arc::new(FetchEngine::new(
            config.clone(),
            transport.clone(),
            hooks.clone(),
            ledger.clone(),
            data_sender,
            root.clone(),
        ));
        let subscription_manager = Arc::new(SubscriptionManager::new(
            config.clone(),
            storage.clone(),
            transport.clone(),
            hooks.clone(),
            ledger.clone(),
            fetch_engine.clone(),
            root.clone(),
        ));
        let epoch_tracker = EpochTracker::new(storage, hooks.clone(), subscription_manager.clone());
        let push_handler = PushHandler::new(ledger, fetch_engine.clone(), root.clone());

        (
            Arc::new(Vdv453Client {
                config,
                transport,
                hooks,
                subscription_manager,
                fetch_engine,
                epoch_tracker,
                push_handler,
                root: root.clone(),
                start_dienst_zst: format_zst(Utc::now()),
            }),
            Vdv453Stopper {
                root,
                subscription_joiner: Some(subscription_joiner),
            },
            data_receiver,
        )
    }

    pub fn config(&self) -> &Arc<Vdv453Configuration> {
        &self.config
    }

    /// Inbound HTTP endpoint, to be served e.g. via `axum::serve()`; the remote party sends `ClientStatusAnfrage`s
    /// and `DatenBereitAnfrage`s here.
    pub fn router(self: &Arc<Self>) -> axum::Router {
        let client: Arc<dyn Vdv453ClientAbstract> = self.clone();
        let mut handlers: HashMap<Call, Arc<dyn RequestListener>> = HashMap::new();
        handlers.insert(
            Call::ClientStatus,
            Arc::new(listeners::ClientStatusListener::new(client.clone())),
        );
        handlers.insert(
            Call::DatenBereit,
            Arc::new(listeners::DatenBereitListener::new(client)),
        );

        server::router(ServerState::new(
            self.config.leitstelle.clone(),
            self.config.request_timeout,
            handlers,
            self.root.clone(),
        ))
    }

    /// Ask the remote party about the state of `service`. The reported epoch is checked against the last known one,
    /// which might cancel all local subscriptions of `service`.
    pub async fn status(&self, service: Service) -> Result<StatusInfo> {
        let response = self
            .transport
            .send(service, Call::Status, "StatusAnfrage", Vec::new(), &self.root.child())
            .await?;
        let elements: Vec<(String, XmlElement)> = response
            .tags(&["Status", "DatenBereit", "StartDienstZst", "DatenVersionID", "Fehlertext"])
            .try_collect()
            .await?;

        let mut antwort = XmlElement::new("StatusAntwort");
        for (_, element) in elements {
            antwort.children.push(element);
        }
        let status = antwort.child("Status").ok_or_else(|| {
            Vdv453Error::Protocol(format!("{service}: StatusAntwort without Status"))
        })?;
        assert_status_ok(service, status, antwort.child_text("Fehlertext"))?;

        let epoch = RemoteEpoch::from_element(&antwort);
        let epoch_change = self.epoch_tracker.observe(service, &epoch).await?;
        Ok(StatusInfo {
            zst: status.attribute("Zst").map(String::from),
            daten_bereit: antwort
                .child_text("DatenBereit")
                .and_then(helpers::parse_vdv_bool)
                .unwrap_or(false),
            epoch,
            epoch_change,
        })
    }

    /// Subscribe to `service`; `body` are the service-specific children of the `Abo*` element. With a
    /// `poll_interval`, data gets fetched periodically, in addition to whenever the remote announces it.
    pub async fn subscribe(
        &self,
        service: Service,
        body: Vec<XmlElement>,
        expires_at: DateTime<Utc>,
        poll_interval: Option<Duration>,
    ) -> Result<SubscriptionId> {
        self.subscription_manager
            .subscribe(service, body, expires_at, poll_interval)
            .await
    }

    /// Real-time trip data (VDV 454 AUS)
    pub async fn aus_subscribe(
        &self,
        expires_at: DateTime<Utc>,
        poll_interval: Option<Duration>,
        vorschauzeit: Option<Duration>,
        hysterese: Option<Duration>,
    ) -> Result<SubscriptionId> {
        self.subscribe(
            Service::Aus,
            aus_body(vorschauzeit, hysterese),
            expires_at,
            poll_interval,
        )
        .await
    }

    /// Timetable data (VDV 454 REF-AUS) for trips within `gueltig_von..gueltig_bis`
    pub async fn ref_aus_subscribe(
        &self,
        expires_at: DateTime<Utc>,
        poll_interval: Option<Duration>,
        gueltig_von: DateTime<Utc>,
        gueltig_bis: DateTime<Utc>,
    ) -> Result<SubscriptionId> {
        let body = ref_aus_body(gueltig_von, gueltig_bis)?;
        self.subscribe(Service::RefAus, body, expires_at, poll_interval)
            .await
    }

    /// Departure board data (VDV 453 DFI) for the display area `anzeigerbereich_id`
    pub async fn dfi_subscribe(
        &self,
        anzeigerbereich_id: &str,
        expires_at: DateTime<Utc>,
        poll_interval: Option<Duration>,
        vorschauzeit: Option<Duration>,
    ) -> Result<SubscriptionId> {
        let body = dfi_body(anzeigerbereich_id, vorschauzeit)?;
        self.subscribe(Service::Dfi, body, expires_at, poll_interval)
            .await
    }

    /// Delete subscriptions `ids` of `service`. With `tolerate_not_found`, the remote not knowing them is fine.
    pub async fn unsubscribe(
        &self,
        service: Service,
        ids: &[SubscriptionId],
        tolerate_not_found: bool,
    ) -> Result<()> {
        self.subscription_manager
            .unsubscribe(service, ids, tolerate_not_found)
            .await
    }

    pub async fn unsubscribe_all(&self, service: Service) -> Result<()> {
        self.subscription_manager.unsubscribe_all(service).await
    }

    /// Re-activate subscriptions persisted by an earlier run; returns how many were restored.
    pub async fn restore_on_startup(&self) -> Result<usize> {
        self.subscription_manager.restore_on_startup().await
    }

    pub async fn subscriptions(&self, service: Service) -> Result<Vec<Subscription>> {
        self.subscription_manager.ledger().list(service).await
    }

    pub async fn subscription_count(&self, service: Service) -> Result<usize> {
        self.subscription_manager.ledger().count(service).await
    }

    /// Fetch all pages of `service` data right now, independent of subscriptions and background fetches.
    /// The data is returned rather than sent to the data channel.
    pub async fn fetch(&self, service: Service, want_full_snapshot: bool) -> Result<Vec<DataEvent>> {
        self.hooks.manual_fetch_started(service);
        let started = Instant::now();

        let result: Result<Vec<DataEvent>> = self
            .fetch_engine
            .fetch_all_pages(service, want_full_snapshot, self.root.child())
            .try_collect()
            .await;
        match &result {
            Ok(events) => self
                .hooks
                .manual_fetch_succeeded(service, events.len(), started.elapsed()),
            Err(e) => self
                .hooks
                .manual_fetch_failed(service, e, started.elapsed()),
        }
        result
    }

    /// A single `DatenAbrufenAnfrage` round trip
    pub async fn fetch_page(&self, service: Service, want_full_snapshot: bool) -> Result<DataPage> {
        self.fetch_engine
            .fetch_one_page(service, want_full_snapshot, &self.root.child())
            .await
    }
}

#[async_trait]
impl Vdv453ClientAbstract for Vdv453Client {
    fn start_dienst_zst(&self) -> String {
        self.start_dienst_zst.clone()
    }

    async fn observe_remote_epoch(
        &self,
        service: Service,
        epoch: RemoteEpoch,
    ) -> Result<EpochChange> {
        self.epoch_tracker.observe(service, &epoch).await
    }

    async fn on_daten_bereit(&self, service: Service) -> Result<bool> {
        self.push_handler.on_daten_bereit(service).await
    }
}

fn minutes(duration: Duration) -> String {
    (duration.as_secs() / 60).to_string()
}

pub(crate) fn aus_body(vorschauzeit: Option<Duration>, hysterese: Option<Duration>) -> Vec<XmlElement> {
    vec![
        XmlElement::new("Hysterese")
            .with_text(hysterese.unwrap_or(DEFAULT_HYSTERESE).as_secs().to_string()),
        XmlElement::new("Vorschauzeit")
            .with_text(minutes(vorschauzeit.unwrap_or(DEFAULT_VORSCHAUZEIT))),
    ]
}

pub(crate) fn ref_aus_body(
    gueltig_von: DateTime<Utc>,
    gueltig_bis: DateTime<Utc>,
) -> Result<Vec<XmlElement>> {
    if gueltig_bis <= gueltig_von {
        return Err(Vdv453Error::InvalidArgument(format!(
            "Empty Zeitfenster {gueltig_von}..{gueltig_bis}"
        )));
    }
    Ok(vec![XmlElement::new("Zeitfenster")
        .with_child(XmlElement::new("GueltigVon").with_text(format_zst(gueltig_von)))
        .with_child(XmlElement::new("GueltigBis").with_text(format_zst(gueltig_bis)))])
}

pub(crate) fn dfi_body(
    anzeigerbereich_id: &str,
    vorschauzeit: Option<Duration>,
) -> Result<Vec<XmlElement>> {
    if anzeigerbereich_id.trim().is_empty() {
        return Err(Vdv453Error::InvalidArgument(String::from(
            "Anzeigerbereich id must not be empty",
        )));
    }
    Ok(vec![
        XmlElement::new("AZBID").with_text(anzeigerbereich_id.trim()),
        XmlElement::new("Vorschauzeit")
            .with_text(minutes(vorschauzeit.unwrap_or(DEFAULT_VORSCHAUZEIT))),
        XmlElement::new("Hysterese").with_text(DEFAULT_HYSTERESE.as_secs().to_string()),
    ])
}
