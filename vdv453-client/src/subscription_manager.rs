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

use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::oneshot;

use crate::abort::{AbortReason, AbortToken};
use crate::configuration::Vdv453Configuration;
use crate::error::{Result, Vdv453Error};
use crate::fetch_engine::FetchEngine;
use crate::hooks::Hooks;
use crate::services::{Call, Service};
use crate::storage::{
    subscription_key, Storage, SUBSCRIPTION_ID_COUNTER_KEY, SUBSCRIPTION_KEY_PREFIX,
};
use crate::transport::{expect_confirmation, Transport};
use crate::xml::element::XmlElement;
use crate::xml::encode::encode_element;
use crate::xml::zst::format_zst;
use crate::helpers;

// This is the core business logic for tracking subscriptions. The ledger of active subscriptions is owned by a single
// event-consuming function `handle_message()`, which is spawned into a task and processes `SubscriptionEvent`s it receives
// via tokio mpsc channel, as well as expiration events from the timers it arms. This design allows to forgo the use of any
// synchronization primitives on the subscription-tracking containers, as any access is serialized via the event selection loop.
//
// Talking to the remote party (subscribe, unsubscribe) happens outside of the actor, in `SubscriptionManager`.

/// Subscription id ("AboID")
pub type SubscriptionId = u64;

/// Longest delay a single expiration timer supports, 2^31-1 milliseconds (~24.8 days)
pub const MAX_EXPIRATION_DELAY: Duration = Duration::from_millis(2_147_483_647);

/// One subscription ("Abonnement") at the remote party.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub service: Service,
    pub id: SubscriptionId,
    pub expires_at: DateTime<Utc>,
    /// The encoded `Abo*` element sent to the remote
    pub request_payload: String,
    /// Interval of the poll loop, `None` if this subscription relies on `DatenBereitAnfrage`s only
    pub poll_interval: Option<Duration>,
}

#[derive(Debug)]
struct ActiveSubscription {
    subscription: Subscription,
    token: AbortToken,
}

// This is the 'outside API' of the subscription ledger, it includes an event that is only to be used in (and only enabled for) testing.
#[derive(Debug)]
pub(crate) enum SubscriptionEvent {
    NextSubscriptionId {
        respond_to: oneshot::Sender<Result<SubscriptionId>>,
    },
    // Start tracking a subscription the remote has confirmed, arming its expiration timer; responds `false` if it is already tracked
    Activate {
        subscription: Subscription,
        token: AbortToken,
        respond_to: oneshot::Sender<bool>,
    },
    // Cancel the given (or, with `ids: None`, all) subscriptions of a service; responds with the subscriptions actually canceled
    Cancel {
        service: Service,
        ids: Option<Vec<SubscriptionId>>,
        reason: AbortReason,
        respond_to: oneshot::Sender<Vec<Subscription>>,
    },
    CountSubscriptions {
        service: Service,
        respond_to: oneshot::Sender<usize>,
    },
    ListSubscriptions {
        service: Service,
        respond_to: oneshot::Sender<Vec<Subscription>>,
    },
    // Purely for use during testing: get copy of current subscription ledger
    #[cfg(test)]
    GetLedger {
        respond_to: oneshot::Sender<HashMap<Service, HashMap<SubscriptionId, Subscription>>>,
    },
    #[cfg(test)]
    GetToken {
        service: Service,
        id: SubscriptionId,
        respond_to: oneshot::Sender<Option<AbortToken>>,
    },
}

// Internal API, sent by expiration timers
struct ExpirationEvent {
    service: Service,
    id: SubscriptionId,
}

enum Event {
    Command(SubscriptionEvent),
    Expiration(ExpirationEvent),
}

fn respond<T>(respond_to: oneshot::Sender<T>, value: T) {
    if respond_to.send(value).is_err() {
        error!("Problem with internal communication");
    }
}

// Subscription ids are unique per service at any point in time; we keep a persisted counter, and never hand out anything smaller
// than the current unix time so that ids do not repeat even if storage got wiped.
async fn next_subscription_id(storage: &dyn Storage) -> Result<SubscriptionId> {
    let stored = match storage.get(SUBSCRIPTION_ID_COUNTER_KEY).await? {
        Some(value) => value.parse::<SubscriptionId>().map_err(|e| {
            Vdv453Error::Storage(format!("Invalid subscription id counter {value}: {e}"))
        })?,
        None => 0,
    };
    let id = (stored + 1).max(Utc::now().timestamp().max(0) as SubscriptionId);
    storage
        .set(SUBSCRIPTION_ID_COUNTER_KEY, id.to_string(), None)
        .await?;
    Ok(id)
}

fn arm_expiration_timer(
    subscription: &Subscription,
    token: AbortToken,
    expiration_sender: mpsc::UnboundedSender<ExpirationEvent>,
) {
    let service = subscription.service;
    let id = subscription.id;
    let delay = (subscription.expires_at - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_EXPIRATION_DELAY);

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let _ = expiration_sender.send(ExpirationEvent { service, id });
            }
            // cancelling removes the timer
            _ = token.cancelled() => {}
        }
    });
}

// Core business logic of subscription tracking. Interfacing with this purely works via channels, so we do not have to deal with mutexes and similar concepts.
pub(crate) async fn handle_message(
    storage: Arc<dyn Storage>,
    hooks: Arc<dyn Hooks>,
    mut command_receiver: Receiver<SubscriptionEvent>,
    shutdown: AbortToken,
) {
    helpers::init_once();

    // every subscription in this ledger is ACTIVE: confirmed by the remote, with a live token and a persisted entry
    let mut ledger: HashMap<Service, HashMap<SubscriptionId, ActiveSubscription>> = HashMap::new();

    let (expiration_sender, mut expiration_receiver) =
        mpsc::unbounded_channel::<ExpirationEvent>();

    loop {
        let event: Event = tokio::select! {
            event = command_receiver.recv() => match event {
                None => {
                    error!("Problem with subscription command channel, received None-event");
                    break
                },
                Some(event) => Event::Command(event),
            },
            event = expiration_receiver.recv() => match event {
                None => {
                    error!("Problem with subscription expiration channel, received None-event");
                    break
                },
                Some(event) => Event::Expiration(event),
            },
            _ = shutdown.cancelled() => break,
        };
        match event {
            Event::Command(event) => match event {
                SubscriptionEvent::NextSubscriptionId { respond_to } => {
                    respond(respond_to, next_subscription_id(storage.as_ref()).await);
                }
                SubscriptionEvent::Activate {
                    subscription,
                    token,
                    respond_to,
                } => {
                    let entries = ledger.entry(subscription.service).or_default();
                    if entries.contains_key(&subscription.id) {
                        debug!(
                            "{} subscription {} is already active",
                            subscription.service, subscription.id
                        );
                        respond(respond_to, false);
                        continue;
                    }
                    arm_expiration_timer(&subscription, token.clone(), expiration_sender.clone());
                    entries.insert(
                        subscription.id,
                        ActiveSubscription {
                            subscription,
                            token,
                        },
                    );
                    respond(respond_to, true);
                }
                SubscriptionEvent::Cancel {
                    service,
                    ids,
                    reason,
                    respond_to,
                } => {
                    let mut canceled = Vec::new();
                    if let Some(entries) = ledger.get_mut(&service) {
                        let ids: Vec<SubscriptionId> =
                            ids.unwrap_or_else(|| entries.keys().copied().collect());
                        for id in ids {
                            let Some(active) = entries.remove(&id) else {
                                continue;
                            };
                            active.token.cancel(reason);
                            // on shutdown, entries stay persisted so that they can be restored on the next start
                            if reason != AbortReason::Shutdown {
                                if let Err(e) = storage.del(&subscription_key(service, id)).await {
                                    error!("Error removing {service} subscription {id} from storage: {e}");
                                }
                            }
                            hooks.subscription_canceled(&active.subscription, reason);
                            canceled.push(active.subscription);
                        }
                    }
                    respond(respond_to, canceled);
                }
                SubscriptionEvent::CountSubscriptions {
                    service,
                    respond_to,
                } => {
                    respond(respond_to, ledger.get(&service).map_or(0, |e| e.len()));
                }
                SubscriptionEvent::ListSubscriptions {
                    service,
                    respond_to,
                } => {
                    let mut subscriptions: Vec<Subscription> = ledger
                        .get(&service)
                        .map(|e| e.values().map(|a| a.subscription.clone()).collect())
                        .unwrap_or_default();
                    subscriptions.sort_by_key(|s| s.id);
                    respond(respond_to, subscriptions);
                }
                #[cfg(test)]
                SubscriptionEvent::GetLedger { respond_to } => {
                    let copy = ledger
                        .iter()
                        .map(|(service, entries)| {
                            (
                                *service,
                                entries
                                    .iter()
                                    .map(|(id, a)| (*id, a.subscription.clone()))
                                    .collect(),
                            )
                        })
                        .collect();
                    let _r = respond_to.send(copy);
                }
                #[cfg(test)]
                SubscriptionEvent::GetToken {
                    service,
                    id,
                    respond_to,
                } => {
                    let token = ledger
                        .get(&service)
                        .and_then(|e| e.get(&id))
                        .map(|a| a.token.clone());
                    let _r = respond_to.send(token);
                }
            },
            // expiration timer fired; a no-op if the subscription got canceled in the meantime
            Event::Expiration(ExpirationEvent { service, id }) => {
                let Some(active) = ledger.get_mut(&service).and_then(|e| e.remove(&id)) else {
                    continue;
                };
                active.token.cancel(AbortReason::Expired);
                if let Err(e) = storage.del(&subscription_key(service, id)).await {
                    error!("Error removing expired {service} subscription {id} from storage: {e}");
                }
                hooks.subscription_expired(&active.subscription);
            }
        }
    }

    // stopped: cancel whatever is left, without touching storage
    for (_, entries) in ledger.drain() {
        for (_, active) in entries {
            active.token.cancel(AbortReason::Shutdown);
        }
    }
    debug!("Subscription ledger stopped");
}

/// Front-end to the subscription ledger actor.
#[derive(Clone, Debug)]
pub(crate) struct SubscriptionLedger {
    command_sender: Sender<SubscriptionEvent>,
}

impl SubscriptionLedger {
    pub(crate) fn new(command_sender: Sender<SubscriptionEvent>) -> Self {
        SubscriptionLedger { command_sender }
    }

    async fn request<T>(
        &self,
        make_event: impl FnOnce(oneshot::Sender<T>) -> SubscriptionEvent,
    ) -> Result<T> {
        let (respond_to, receive_from) = oneshot::channel::<T>();
        self.command_sender
            .send(make_event(respond_to))
            .await
            .map_err(|e| {
                Vdv453Error::Internal(format!("Error sending subscription command: {e}"))
            })?;
        receive_from.await.map_err(|e| {
            Vdv453Error::Internal(format!("Error receiving subscription response: {e}"))
        })
    }

    pub(crate) async fn next_id(&self) -> Result<SubscriptionId> {
        self.request(|respond_to| SubscriptionEvent::NextSubscriptionId { respond_to })
            .await?
    }

    pub(crate) async fn activate(
        &self,
        subscription: Subscription,
        token: AbortToken,
    ) -> Result<bool> {
        self.request(|respond_to| SubscriptionEvent::Activate {
            subscription,
            token,
            respond_to,
        })
        .await
    }

    pub(crate) async fn cancel(
        &self,
        service: Service,
        ids: Option<Vec<SubscriptionId>>,
        reason: AbortReason,
    ) -> Result<Vec<Subscription>> {
        self.request(|respond_to| SubscriptionEvent::Cancel {
            service,
            ids,
            reason,
            respond_to,
        })
        .await
    }

    pub(crate) async fn count(&self, service: Service) -> Result<usize> {
        self.request(|respond_to| SubscriptionEvent::CountSubscriptions {
            service,
            respond_to,
        })
        .await
    }

    pub(crate) async fn list(&self, service: Service) -> Result<Vec<Subscription>> {
        self.request(|respond_to| SubscriptionEvent::ListSubscriptions {
            service,
            respond_to,
        })
        .await
    }

    #[cfg(test)]
    pub(crate) async fn get_ledger(
        &self,
    ) -> HashMap<Service, HashMap<SubscriptionId, Subscription>> {
        self.request(|respond_to| SubscriptionEvent::GetLedger { respond_to })
            .await
            .expect("Error fetching subscription ledger")
    }

    #[cfg(test)]
    pub(crate) async fn token(&self, service: Service, id: SubscriptionId) -> Option<AbortToken> {
        self.request(|respond_to| SubscriptionEvent::GetToken {
            service,
            id,
            respond_to,
        })
        .await
        .expect("Error fetching subscription token")
    }
}

/// Creates, restores and deletes subscriptions at the remote party, keeping ledger and storage in line with it.
pub(crate) struct SubscriptionManager {
    config: Arc<Vdv453Configuration>,
    storage: Arc<dyn Storage>,
    transport: Arc<dyn Transport>,
    hooks: Arc<dyn Hooks>,
    ledger: SubscriptionLedger,
    fetch_engine: Arc<FetchEngine>,
    // parent of all subscription tokens
    root: AbortToken,
}

impl SubscriptionManager {
    pub(crate) fn new(
        config: Arc<Vdv453Configuration>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        hooks: Arc<dyn Hooks>,
        ledger: SubscriptionLedger,
        fetch_engine: Arc<FetchEngine>,
        root: AbortToken,
    ) -> Self {
        SubscriptionManager {
            config,
            storage,
            transport,
            hooks,
            ledger,
            fetch_engine,
            root,
        }
    }

    pub(crate) fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// Subscribe to `service` at the remote party; `body` are the service-specific children of the `Abo*` element.
    pub(crate) async fn subscribe(
        &self,
        service: Service,
        body: Vec<XmlElement>,
        expires_at: DateTime<Utc>,
        poll_interval: Option<Duration>,
    ) -> Result<SubscriptionId> {
        let started = Instant::now();

        let ttl = (expires_at - Utc::now())
            .to_std()
            .ok()
            .filter(|ttl| !ttl.is_zero())
            .ok_or_else(|| Vdv453Error::InvalidArgument(format!("Expiry {expires_at} is not in the future")))?;
        if ttl > MAX_EXPIRATION_DELAY {
            return Err(Vdv453Error::InvalidArgument(format!(
                "Expiry {expires_at} is too far in the future, maximum is {MAX_EXPIRATION_DELAY:?} from now"
            )));
        }
        if poll_interval.is_some_and(|i| i.is_zero()) {
            return Err(Vdv453Error::InvalidArgument(String::from(
                "Poll interval must not be zero",
            )));
        }

        let id = self.ledger.next_id().await?;
        let abo = XmlElement::new(service.subscription_tag())
            .with_attribute("AboID", id.to_string())
            .with_attribute("VerfallZst", format_zst(expires_at))
            .with_children(body);
        let subscription = Subscription {
            service,
            id,
            expires_at,
            request_payload: String::from_utf8_lossy(&encode_element(&abo)?).into_owned(),
            poll_interval,
        };

        // CREATING: persisted before the remote knows about it
        let key = subscription_key(service, id);
        self.storage
            .set(&key, serde_json::to_string(&subscription)?, Some(ttl))
            .await?;

        let token = self.root.child();
        let result = match self
            .transport
            .send(service, Call::AboVerwalten, "AboAnfrage", vec![abo], &token)
            .await
        {
            Ok(response) => expect_confirmation(response).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Subscribing to {service} with AboID {id} failed: {e}");
            if let Err(e) = self.storage.del(&key).await {
                error!("Error removing {service} subscription {id} from storage: {e}");
            }
            return Err(e);
        }

        self.start(subscription.clone(), token).await?;
        self.hooks
            .subscription_created(&subscription, started.elapsed());
        Ok(id)
    }

    // ACTIVE: arm expiration timer and poll loop
    async fn start(&self, subscription: Subscription, token: AbortToken) -> Result<bool> {
        let poll_interval = subscription.poll_interval;
        let service = subscription.service;
        if !self.ledger.activate(subscription, token.clone()).await? {
            return Ok(false);
        }
        if let Some(interval) = poll_interval {
            spawn_poll_loop(
                self.fetch_engine.clone(),
                service,
                self.config.poll_grace_delay,
                interval,
                token,
            );
        }
        Ok(true)
    }

    fn is_not_found(&self, error: &Vdv453Error) -> bool {
        match error {
            Vdv453Error::Api { code, text, .. } => {
                if code.is_some_and(|c| self.config.not_found_error_codes.contains(&c)) {
                    return true;
                }
                // some servers only report this in the Fehlertext
                let text = text.to_lowercase();
                text.contains("nicht gefunden")
                    || text.contains("not found")
                    || text.contains("unbekannt")
            }
            _ => false,
        }
    }

    async fn send_abo_anfrage(&self, service: Service, children: Vec<XmlElement>) -> Result<()> {
        let token = self.root.child();
        let response = self
            .transport
            .send(service, Call::AboVerwalten, "AboAnfrage", children, &token)
            .await?;
        expect_confirmation(response).await?;
        Ok(())
    }

    /// Delete subscriptions `ids` of `service` at the remote party. With `tolerate_not_found`, the remote reporting
    /// unknown ids is not an error, and local state is left alone.
    pub(crate) async fn unsubscribe(
        &self,
        service: Service,
        ids: &[SubscriptionId],
        tolerate_not_found: bool,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let children = ids
            .iter()
            .map(|id| XmlElement::new("AboLoeschen").with_text(id.to_string()))
            .collect();

        match self.send_abo_anfrage(service, children).await {
            Err(e) if tolerate_not_found && self.is_not_found(&e) => {
                debug!("Remote does not know {service} subscriptions {ids:?}: {e}");
                return Ok(());
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        self.ledger
            .cancel(service, Some(ids.to_vec()), AbortReason::Unsubscribed)
            .await?;
        // ids might be persisted without being active, e.g. when not restored yet
        for id in ids {
            self.storage.del(&subscription_key(service, *id)).await?;
        }
        Ok(())
    }

    /// Delete all subscriptions of `service` at the remote party, using a single `AboLoeschenAlle`
    pub(crate) async fn unsubscribe_all(&self, service: Service) -> Result<()> {
        self.send_abo_anfrage(
            service,
            vec![XmlElement::new("AboLoeschenAlle").with_text("true")],
        )
        .await?;

        self.ledger
            .cancel(service, None, AbortReason::Unsubscribed)
            .await?;
        for key in self
            .storage
            .keys(&format!("{SUBSCRIPTION_KEY_PREFIX}{service}:"))
            .await?
        {
            self.storage.del(&key).await?;
        }
        Ok(())
    }

    /// Re-activate all persisted, non-expired subscriptions, without contacting the remote party.
    pub(crate) async fn restore_on_startup(&self) -> Result<usize> {
        let mut restored = 0;
        for (key, value) in self.storage.entries(SUBSCRIPTION_KEY_PREFIX).await? {
            let subscription: Subscription = match serde_json::from_str(&value) {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!("Dropping malformed persisted subscription {key}: {e}");
                    self.storage.del(&key).await?;
                    continue;
                }
            };
            if subscription.expires_at <= Utc::now() {
                self.storage.del(&key).await?;
                continue;
            }
            if self.start(subscription.clone(), self.root.child()).await? {
                self.hooks.subscription_restored(&subscription);
                restored += 1;
            }
        }
        debug!("Restored {restored} subscriptions");
        Ok(restored)
    }

    /// Cancel all local subscriptions of `service` because the remote lost them; returns how many were affected.
    pub(crate) async fn reset_by_remote(&self, service: Service) -> Result<usize> {
        Ok(self
            .ledger
            .cancel(service, None, AbortReason::ResetByRemote)
            .await?
            .len())
    }
}

// Poll loop: one fetch pass, wait, repeat until the subscription's token gets cancelled
fn spawn_poll_loop(
    fetch_engine: Arc<FetchEngine>,
    service: Service,
    grace_delay: Duration,
    interval: Duration,
    token: AbortToken,
) {
    tokio::spawn(async move {
        if helpers::sleep_unless_cancelled(grace_delay, &token).await {
            while !token.is_cancelled() {
                fetch_engine
                    .fetch_until_no_more_available(service, Some(1), &token)
                    .await;
                if !helpers::sleep_unless_cancelled(interval, &token).await {
                    break;
                }
            }
        }
        debug!(
            "{service} poll loop stopped ({})",
            token.reason().map_or("running", |r| r.as_str())
        );
    });
}
