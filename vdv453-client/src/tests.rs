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

mod vdv453_client_tests;

pub(crate) mod test_lib {
    pub(crate) mod helpers {
        use bytes::Bytes;
        use chrono::{DateTime, Utc};
        use std::sync::Arc;
        use std::time::Duration;
        use tokio::sync::mpsc;

        use crate::abort::AbortToken;
        use crate::configuration::Vdv453Configuration;
        use crate::fetch_engine::{DataEvent, FetchEngine};
        use crate::helpers;
        use crate::hooks::Hooks;
        use crate::services::{Call, Service};
        use crate::storage::InMemoryStorage;
        use crate::subscription_manager::{
            handle_message, Subscription, SubscriptionEvent, SubscriptionId, SubscriptionLedger,
            SubscriptionManager,
        };
        use crate::transport::{Transport, TransportResponse};
        use crate::xml::zst::format_zst;

        use super::mocks::RecordingHooks;

        pub(crate) const LEITSTELLE: &str = "test-client";
        pub(crate) const ENDPOINT: &str = "http://remote.example.org:8080/vdv";
        pub(crate) const ZST: &str = "2024-04-11T10:00:00Z";

        pub(crate) fn test_config() -> Arc<Vdv453Configuration> {
            Vdv453Configuration::create(
                String::from(LEITSTELLE),
                String::from(ENDPOINT),
                None,
                None,
            )
            .expect("Error creating test configuration")
            .with_poll_grace_delay(Duration::from_millis(10))
        }

        pub(crate) fn response(service: Service, call: Call, body: &str) -> TransportResponse {
            TransportResponse::from_bytes(
                service,
                call,
                Bytes::from(body.to_string()),
                AbortToken::new(),
            )
        }

        pub(crate) fn abo_antwort_ok() -> String {
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<AboAntwort><Bestaetigung Zst="{ZST}" Ergebnis="ok" Fehlernummer="0"/></AboAntwort>"#
            )
        }

        pub(crate) fn abo_antwort_notok(fehlernummer: u32, fehlertext: &str) -> String {
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<AboAntwort><Bestaetigung Zst="{ZST}" Ergebnis="notok" Fehlernummer="{fehlernummer}"/><Fehlertext>{fehlertext}</Fehlertext></AboAntwort>"#
            )
        }

        /// `DatenAbrufenAntwort` of the `aus` service with one `AUSNachricht` per entry of `ids`
        pub(crate) fn aus_page(ids: &[&str], weitere_daten: bool) -> String {
            let nachrichten: String = ids
                .iter()
                .map(|id| {
                    format!(
                        "<AUSNachricht AboID=\"1\"><IstFahrt Zst=\"{ZST}\"><LinienID>{id}</LinienID></IstFahrt></AUSNachricht>"
                    )
                })
                .collect();
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<DatenAbrufenAntwort><Bestaetigung Zst="{ZST}" Ergebnis="ok" Fehlernummer="0"/><WeitereDaten>{weitere_daten}</WeitereDaten>{nachrichten}</DatenAbrufenAntwort>"#
            )
        }

        pub(crate) fn linien_id(event: &DataEvent) -> String {
            event
                .element
                .child("IstFahrt")
                .and_then(|f| f.child_text("LinienID"))
                .unwrap_or_default()
                .to_string()
        }

        pub(crate) fn subscription(
            service: Service,
            id: SubscriptionId,
            expires_at: DateTime<Utc>,
            poll_interval: Option<Duration>,
        ) -> Subscription {
            Subscription {
                service,
                id,
                expires_at,
                request_payload: format!(
                    "<{} AboID=\"{id}\" VerfallZst=\"{}\"/>",
                    service.subscription_tag(),
                    format_zst(expires_at)
                ),
                poll_interval,
            }
        }

        /// The client's internals, wired up the way `Vdv453Client::run()` does it
        pub(crate) struct Components {
            pub(crate) storage: Arc<InMemoryStorage>,
            pub(crate) hooks: Arc<RecordingHooks>,
            pub(crate) ledger: SubscriptionLedger,
            pub(crate) fetch_engine: Arc<FetchEngine>,
            pub(crate) manager: Arc<SubscriptionManager>,
            pub(crate) root: AbortToken,
            pub(crate) data: mpsc::Receiver<DataEvent>,
        }

        pub(crate) fn components(
            config: Arc<Vdv453Configuration>,
            transport: Arc<dyn Transport>,
        ) -> Components {
            helpers::init_once();
            let storage = Arc::new(InMemoryStorage::new());
            let hooks = Arc::new(RecordingHooks::default());
            let root = AbortToken::new();

            let (command_sender, command_receiver) =
                mpsc::channel::<SubscriptionEvent>(config.subscription_command_buffer);
            let storage_cloned = storage.clone();
            let hooks_cloned: Arc<dyn Hooks> = hooks.clone();
            let root_cloned = root.clone();
            helpers::spawn_and_log_error(async move {
                handle_message(storage_cloned, hooks_cloned, command_receiver, root_cloned).await;
                Ok(())
            });
            let ledger = SubscriptionLedger::new(command_sender);

            let (data_sender, data) = mpsc::channel::<DataEvent>(config.data_buffer);
            let fetch_engine = Arc::new(FetchEngine::new(
                config.clone(),
                transport.clone(),
                hooks.clone(),
                ledger.clone(),
                data_sender,
                root.clone(),
            ));
            let manager = Arc::new(SubscriptionManager::new(
                config,
                storage.clone(),
                transport,
                hooks.clone(),
                ledger.clone(),
                fetch_engine.clone(),
                root.clone(),
            ));

            Components {
                storage,
                hooks,
                ledger,
                fetch_engine,
                manager,
                root,
                data,
            }
        }
    }

    pub(crate) mod mocks {
        use async_trait::async_trait;
        use mockall::mock;
        use parking_lot::Mutex;
        use std::collections::VecDeque;
        use std::sync::Arc;
        use std::time::Duration;
        use tokio::sync::Notify;

        use crate::abort::{AbortReason, AbortToken};
        use crate::epoch_tracker::{EpochChange, RemoteEpoch};
        use crate::error::{Result, Vdv453Error};
        use crate::hooks::Hooks;
        use crate::services::{Call, Service};
        use crate::subscription_manager::Subscription;
        use crate::transport::{Transport, TransportResponse};
        use crate::vdv453_client::Vdv453ClientAbstract;
        use crate::xml::element::XmlElement;

        use super::helpers::response;

        mock! {
            pub Vdv453ClientMock {}
            #[async_trait]
            impl Vdv453ClientAbstract for Vdv453ClientMock {
                fn start_dienst_zst(&self) -> String;
                async fn observe_remote_epoch(&self, service: Service, epoch: RemoteEpoch) -> Result<EpochChange>;
                async fn on_daten_bereit(&self, service: Service) -> Result<bool>;
            }
        }

        mock! {
            pub TransportMock {}
            #[async_trait]
            impl Transport for TransportMock {
                async fn send(
                    &self,
                    service: Service,
                    call: Call,
                    root_tag: &str,
                    children: Vec<XmlElement>,
                    token: &AbortToken,
                ) -> Result<TransportResponse>;
            }
        }

        #[derive(Clone, Debug)]
        pub(crate) struct RecordedRequest {
            pub(crate) service: Service,
            pub(crate) call: Call,
            pub(crate) root_tag: String,
            pub(crate) children: Vec<XmlElement>,
        }

        /// Holds back a scripted response: `entered` is notified once the request came in, and the response is sent
        /// after `release` got notified.
        #[derive(Default)]
        pub(crate) struct Gate {
            pub(crate) entered: Notify,
            pub(crate) release: Notify,
        }

        enum Scripted {
            Body(String, Option<Arc<Gate>>),
            Error(Vdv453Error),
        }

        /// `Transport` answering requests from a queue of prepared responses, recording every request
        #[derive(Default)]
        pub(crate) struct ScriptedTransport {
            script: Mutex<VecDeque<Scripted>>,
            // answer used once the queue is exhausted
            fallback: Mutex<Option<String>>,
            requests: Mutex<Vec<RecordedRequest>>,
        }

        impl ScriptedTransport {
            pub(crate) fn new() -> Arc<Self> {
                Arc::new(ScriptedTransport::default())
            }

            pub(crate) fn push(&self, body: String) -> &Self {
                self.script.lock().push_back(Scripted::Body(body, None));
                self
            }

            pub(crate) fn push_gated(&self, body: String, gate: Arc<Gate>) -> &Self {
                self.script
                    .lock()
                    .push_back(Scripted::Body(body, Some(gate)));
                self
            }

            pub(crate) fn push_error(&self, error: Vdv453Error) -> &Self {
                self.script.lock().push_back(Scripted::Error(error));
                self
            }

            pub(crate) fn set_fallback(&self, body: String) -> &Self {
                *self.fallback.lock() = Some(body);
                self
            }

            pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
                self.requests.lock().clone()
            }

            pub(crate) fn count(&self, call: Call) -> usize {
                self.requests.lock().iter().filter(|r| r.call == call).count()
            }
        }

        #[async_trait]
        impl Transport for ScriptedTransport {
            async fn send(
                &self,
                service: Service,
                call: Call,
                root_tag: &str,
                children: Vec<XmlElement>,
                token: &AbortToken,
            ) -> Result<TransportResponse> {
                token.check()?;
                self.requests.lock().push(RecordedRequest {
                    service,
                    call,
                    root_tag: root_tag.to_string(),
                    children,
                });

                let scripted = self.script.lock().pop_front();
                let scripted = match scripted {
                    Some(scripted) => scripted,
                    None => match self.fallback.lock().clone() {
                        Some(body) => Scripted::Body(body, None),
                        None => {
                            return Err(Vdv453Error::Transport(format!(
                                "no scripted response for {root_tag}"
                            )))
                        }
                    },
                };
                match scripted {
                    Scripted::Body(body, gate) => {
                        if let Some(gate) = gate {
                            gate.entered.notify_one();
                            tokio::select! {
                                _ = gate.release.notified() => {},
                                _ = token.cancelled() => return Err(token.error()),
                            }
                        }
                        Ok(response(service, call, &body))
                    }
                    Scripted::Error(error) => Err(error),
                }
            }
        }

        /// `Hooks` remembering every observation as a short string, e.g. `expired:aus:17`
        #[derive(Default)]
        pub(crate) struct RecordingHooks {
            events: Mutex<Vec<String>>,
        }

        impl RecordingHooks {
            fn record(&self, event: String) {
                self.events.lock().push(event);
            }

            pub(crate) fn events(&self) -> Vec<String> {
                self.events.lock().clone()
            }

            pub(crate) fn count(&self, prefix: &str) -> usize {
                self.events
                    .lock()
                    .iter()
                    .filter(|e| e.starts_with(prefix))
                    .count()
            }
        }

        impl Hooks for RecordingHooks {
            fn subscription_created(&self, subscription: &Subscription, _elapsed: Duration) {
                self.record(format!("created:{}:{}", subscription.service, subscription.id));
            }
            fn subscription_restored(&self, subscription: &Subscription) {
                self.record(format!("restored:{}:{}", subscription.service, subscription.id));
            }
            fn subscription_expired(&self, subscription: &Subscription) {
                self.record(format!("expired:{}:{}", subscription.service, subscription.id));
            }
            fn subscription_canceled(&self, subscription: &Subscription, reason: AbortReason) {
                self.record(format!(
                    "canceled:{}:{}:{reason}",
                    subscription.service, subscription.id
                ));
            }
            fn subscriptions_reset_by_remote(&self, service: Service, count: usize) {
                self.record(format!("reset:{service}:{count}"));
            }
            fn manual_fetch_started(&self, service: Service) {
                self.record(format!("manual_started:{service}"));
            }
            fn manual_fetch_succeeded(&self, service: Service, elements: usize, _elapsed: Duration) {
                self.record(format!("manual_succeeded:{service}:{elements}"));
            }
            fn manual_fetch_failed(&self, service: Service, _error: &Vdv453Error, _elapsed: Duration) {
                self.record(format!("manual_failed:{service}"));
            }
            fn page_fetched(&self, service: Service, iteration: usize, elements: usize, _elapsed: Duration) {
                self.record(format!("page:{service}:{iteration}:{elements}"));
            }
            fn data_fetch_started(&self, service: Service) {
                self.record(format!("fetch_started:{service}"));
            }
            fn data_fetch_succeeded(&self, service: Service, elements: usize, _elapsed: Duration) {
                self.record(format!("fetch_succeeded:{service}:{elements}"));
            }
            fn data_fetch_failed(&self, service: Service, _error: &Vdv453Error, _elapsed: Duration) {
                self.record(format!("fetch_failed:{service}"));
            }
        }
    }
}
