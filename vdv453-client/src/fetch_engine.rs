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

use futures::stream::{self, BoxStream, StreamExt};
use log::*;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::abort::AbortToken;
use crate::configuration::Vdv453Configuration;
use crate::error::{Result, Vdv453Error};
use crate::helpers;
use crate::hooks::Hooks;
use crate::services::{Call, Service};
use crate::subscription_manager::SubscriptionLedger;
use crate::transport::{assert_confirmation_ok, Transport, TransportResponse};
use crate::xml::element::XmlElement;
use crate::xml::parser::TagStream;

/// Result of one `DatenAbrufenAnfrage` round trip
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPage {
    pub confirmation_ok: bool,
    pub has_more_pages: bool,
    pub data_elements: Vec<XmlElement>,
}

/// One data element received from the remote, as handed to the consumer of the data channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DataEvent {
    pub service: Service,
    pub tag: String,
    pub element: XmlElement,
    /// `Zst` of the page's `Bestaetigung`, if it preceded the element
    pub confirmation_zst: Option<String>,
}

// Reads one DatenAbrufenAntwort: Bestaetigung, WeitereDaten and Fehlertext are collected, everything else is data
struct PageReader {
    service: Service,
    tags: TagStream,
    confirmation: Option<XmlElement>,
    has_more_pages: bool,
    error_text: Option<String>,
}

struct PageSummary {
    confirmation: XmlElement,
    has_more_pages: bool,
    error_text: Option<String>,
}

impl PageSummary {
    fn confirmation_ok(&self) -> bool {
        self.confirmation.attribute("Ergebnis") == Some("ok")
    }
}

impl PageReader {
    fn new(service: Service, response: TransportResponse) -> Self {
        let mut tags = vec!["Bestaetigung", "WeitereDaten", "Fehlertext"];
        tags.extend_from_slice(service.data_tags());
        PageReader {
            service,
            tags: response.tags(&tags),
            confirmation: None,
            has_more_pages: false,
            error_text: None,
        }
    }

    fn confirmation_zst(&self) -> Option<String> {
        self.confirmation
            .as_ref()
            .and_then(|c| c.attribute("Zst"))
            .map(|zst| zst.to_string())
    }

    async fn next_data(&mut self) -> Result<Option<(String, XmlElement)>> {
        while let Some(tag) = self.tags.next().await {
            let (tag, element) = tag?;
            match tag.as_str() {
                "Bestaetigung" => self.confirmation = Some(element),
                "WeitereDaten" => {
                    self.has_more_pages = helpers::parse_vdv_bool(&element.text).unwrap_or(false)
                }
                "Fehlertext" => self.error_text = Some(element.text.trim().to_string()),
                _ => return Ok(Some((tag, element))),
            }
        }
        Ok(None)
    }

    fn finish(self) -> Result<PageSummary> {
        let confirmation = self.confirmation.ok_or_else(|| {
            Vdv453Error::Protocol(format!(
                "{}: DatenAbrufenAntwort without Bestaetigung",
                self.service
            ))
        })?;
        Ok(PageSummary {
            confirmation,
            has_more_pages: self.has_more_pages,
            error_text: self.error_text,
        })
    }
}

#[derive(Debug, Default)]
struct FetchState {
    is_fetching: bool,
    received_while_fetching: bool,
}

// Clears `is_fetching` when dropped, so that a panicking or canceled pass does not block its service forever
struct FetchGuard<'a> {
    engine: &'a FetchEngine,
    service: Service,
    released: bool,
}

impl FetchGuard<'_> {
    fn clear_received_while_fetching(&self) {
        self.engine
            .state
            .lock()
            .entry(self.service)
            .or_default()
            .received_while_fetching = false;
    }

    // Clears `is_fetching` unless a `DatenBereitAnfrage` came in meanwhile, checked under the same lock
    // so that no notification gets lost between the check and the release; returns whether it was released
    fn release_unless_received(&mut self) -> bool {
        let mut state = self.engine.state.lock();
        let entry = state.entry(self.service).or_default();
        if entry.received_while_fetching {
            return false;
        }
        entry.is_fetching = false;
        self.released = true;
        true
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.engine
            .state
            .lock()
            .entry(self.service)
            .or_default()
            .is_fetching = false;
    }
}

enum PagesState {
    Request {
        iteration: usize,
    },
    Reading {
        iteration: usize,
        reader: PageReader,
        started: Instant,
        elements: usize,
    },
    Done,
}

struct Pages {
    engine: Arc<FetchEngine>,
    service: Service,
    want_full_snapshot: bool,
    max_iterations: usize,
    token: AbortToken,
    state: PagesState,
}

/// Paginated data retrieval, at most one fetch pass per service at a time.
pub(crate) struct FetchEngine {
    config: Arc<Vdv453Configuration>,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn Hooks>,
    ledger: SubscriptionLedger,
    data_sender: mpsc::Sender<DataEvent>,
    // outlives every subscription, for passes owed to a notification whose triggering fetch got canceled
    root: AbortToken,
    state: Mutex<HashMap<Service, FetchState>>,
}

impl FetchEngine {
    pub(crate) fn new(
        config: Arc<Vdv453Configuration>,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn Hooks>,
        ledger: SubscriptionLedger,
        data_sender: mpsc::Sender<DataEvent>,
        root: AbortToken,
    ) -> Self {
        FetchEngine {
            config,
            transport,
            hooks,
            ledger,
            data_sender,
            root,
            state: Mutex::new(HashMap::new()),
        }
    }

    async fn send_daten_abrufen(
        &self,
        service: Service,
        want_full_snapshot: bool,
        token: &AbortToken,
    ) -> Result<TransportResponse> {
        let children = vec![
            XmlElement::new("DatensatzAlle").with_text(want_full_snapshot.to_string())
        ];
        self.transport
            .send(
                service,
                Call::DatenAbrufen,
                "DatenAbrufenAnfrage",
                children,
                token,
            )
            .await
    }

    /// Send one `DatenAbrufenAnfrage` and read the whole response.
    pub(crate) async fn fetch_one_page(
        &self,
        service: Service,
        want_full_snapshot: bool,
        token: &AbortToken,
    ) -> Result<DataPage> {
        let response = self
            .send_daten_abrufen(service, want_full_snapshot, token)
            .await?;
        let mut reader = PageReader::new(service, response);
        let mut data_elements = Vec::new();
        while let Some((_, element)) = reader.next_data().await? {
            data_elements.push(element);
        }
        let summary = reader.finish()?;
        Ok(DataPage {
            confirmation_ok: summary.confirmation_ok(),
            has_more_pages: summary.has_more_pages,
            data_elements,
        })
    }

    /// Lazily fetch pages while the remote announces `WeitereDaten`, yielding data elements as they are parsed.
    /// The next page is only requested once all elements of the current one have been consumed.
    ///
    /// Fails with `Vdv453Error::IterationCap` instead of sending more than the configured number of requests.
    pub(crate) fn fetch_all_pages(
        self: &Arc<Self>,
        service: Service,
        want_full_snapshot: bool,
        token: AbortToken,
    ) -> BoxStream<'static, Result<DataEvent>> {
        let pages = Pages {
            engine: self.clone(),
            service,
            want_full_snapshot,
            max_iterations: self.config.max_iterations(service),
            token,
            state: PagesState::Request { iteration: 0 },
        };

        stream::unfold(pages, |mut pages| async move {
            loop {
                match std::mem::replace(&mut pages.state, PagesState::Done) {
                    PagesState::Done => return None,
                    PagesState::Request { iteration } => {
                        if iteration >= pages.max_iterations {
                            return Some((
                                Err(Vdv453Error::IterationCap {
                                    service: pages.service,
                                    count: pages.max_iterations,
                                }),
                                pages,
                            ));
                        }
                        let response = pages
                            .engine
                            .send_daten_abrufen(pages.service, pages.want_full_snapshot, &pages.token)
                            .await;
                        match response {
                            Ok(response) => {
                                pages.state = PagesState::Reading {
                                    iteration: iteration + 1,
                                    reader: PageReader::new(pages.service, response),
                                    started: Instant::now(),
                                    elements: 0,
                                };
                            }
                            Err(e) => return Some((Err(e), pages)),
                        }
                    }
                    PagesState::Reading {
                        iteration,
                        mut reader,
                        started,
                        elements,
                    } => match reader.next_data().await {
                        Ok(Some((tag, element))) => {
                            let event = DataEvent {
                                service: pages.service,
                                tag,
                                element,
                                confirmation_zst: reader.confirmation_zst(),
                            };
                            pages.state = PagesState::Reading {
                                iteration,
                                reader,
                                started,
                                elements: elements + 1,
                            };
                            return Some((Ok(event), pages));
                        }
                        Ok(None) => {
                            let summary = match reader.finish() {
                                Ok(summary) => summary,
                                Err(e) => return Some((Err(e), pages)),
                            };
                            if let Err(e) = assert_confirmation_ok(
                                pages.service,
                                &summary.confirmation,
                                summary.error_text.as_deref(),
                            ) {
                                return Some((Err(e), pages));
                            }
                            pages.engine.hooks.page_fetched(
                                pages.service,
                                iteration,
                                elements,
                                started.elapsed(),
                            );
                            if summary.has_more_pages {
                                pages.state = PagesState::Request { iteration };
                            }
                        }
                        Err(e) => return Some((Err(e), pages)),
                    },
                }
            }
        })
        .boxed()
    }

    fn try_begin(&self, service: Service) -> Option<FetchGuard<'_>> {
        let mut state = self.state.lock();
        let entry = state.entry(service).or_default();
        if entry.is_fetching {
            return None;
        }
        entry.is_fetching = true;
        Some(FetchGuard {
            engine: self,
            service,
            released: false,
        })
    }

    /// Note a `DatenBereitAnfrage`, so that a running fetch of `service` does one more pass.
    pub(crate) fn mark_received_while_fetching(&self, service: Service) {
        self.state
            .lock()
            .entry(service)
            .or_default()
            .received_while_fetching = true;
    }

    #[cfg(test)]
    pub(crate) fn is_fetching(&self, service: Service) -> bool {
        self.state.lock().get(&service).is_some_and(|s| s.is_fetching)
    }

    #[cfg(test)]
    pub(crate) fn received_while_fetching(&self, service: Service) -> bool {
        self.state
            .lock()
            .get(&service)
            .is_some_and(|s| s.received_while_fetching)
    }

    // One pass over all pages, forwarding elements to the data channel; returns the number of elements
    async fn run_pass(self: &Arc<Self>, service: Service, token: AbortToken) -> usize {
        self.hooks.data_fetch_started(service);
        let started = Instant::now();
        let mut elements = 0;

        let mut data = self.fetch_all_pages(service, false, token.clone());
        while let Some(event) = data.next().await {
            match event {
                Ok(event) => {
                    let sent = tokio::select! {
                        sent = self.data_sender.send(event) => sent.is_ok(),
                        _ = token.cancelled() => false,
                    };
                    if !sent {
                        debug!("Stopped forwarding {service} data");
                        return elements;
                    }
                    elements += 1;
                }
                Err(e) => {
                    warn!("{service} data fetch failed after {elements} elements: {e}");
                    self.hooks.data_fetch_failed(service, &e, started.elapsed());
                    return elements;
                }
            }
        }
        self.hooks
            .data_fetch_succeeded(service, elements, started.elapsed());
        elements
    }

    /// Fetch passes for `service` until nothing more is available, unless another fetch of it is already running.
    ///
    /// Does nothing without active subscriptions. Runs at most `max_passes` passes (unlimited with `None`) while passes
    /// keep yielding data. An empty or failed pass ends the fetch, unless a `DatenBereitAnfrage` arrived during it, which
    /// always causes one more pass. Errors of individual passes are logged and reported to the hooks, never returned.
    ///
    /// Cancelling `parent` stops the passes run on its behalf; a pending notification is then still served, on a token
    /// of the client itself.
    pub(crate) async fn fetch_until_no_more_available(
        self: &Arc<Self>,
        service: Service,
        max_passes: Option<usize>,
        parent: &AbortToken,
    ) {
        match self.ledger.count(service).await {
            Ok(0) => {
                trace!("No {service} subscriptions, not fetching");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Error counting {service} subscriptions: {e}");
                return;
            }
        }

        let Some(mut guard) = self.try_begin(service) else {
            debug!("Already fetching {service} data");
            return;
        };

        let mut parent = parent.clone();
        let mut max_passes = max_passes;
        let mut passes = 0;
        loop {
            guard.clear_received_while_fetching();
            let elements = self.run_pass(service, parent.child()).await;
            passes += 1;

            if parent.is_cancelled() {
                if self.root.is_cancelled() || guard.release_unless_received() {
                    break;
                }
                debug!(
                    "{service} fetch canceled ({:?}) with a notification pending",
                    parent.reason()
                );
                parent = self.root.clone();
                max_passes = None;
                continue;
            }
            let more_passes_allowed = max_passes.map_or(true, |max| passes < max);
            if !(more_passes_allowed && elements > 0) && guard.release_unless_received() {
                break;
            }
        }
        trace!("Fetched {service} data in {passes} passes");
    }
}
