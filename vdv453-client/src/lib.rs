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

/*!
vdv453-client is a client for the [VDV 453](https://www.vdv.de/schnittstellen-initiative.aspx) and VDV 454 public transport
data interfaces, for the rust programming language.

It subscribes to data services of a remote party ("Leitstelle"), keeps these subscriptions in line with the remote's
state, and fetches data as the remote announces it (or periodically), handing it out through a channel.

## Library contents

* `Vdv453Client` as the frontend for the subscription ledger, the paginated data retrieval and the inbound server
* `listeners` module, with the handlers of the calls the remote party sends to us
* `HttpTransport` and `InMemoryStorage`, default implementations of the `Transport` and `Storage` traits
* `records` module, with typed views of VDV 454 trip data

## Note

For a batteries-included approach, the `vdv453-client-cli` module provides a command line frontend which subscribes to
a service and prints the received data as JSON lines.

## References

* VDV 453 "Ist-Daten-Schnittstelle", version 2.6
* VDV 454 "Ist-Daten-Schnittstelle Fahrplanauskunft", version 2.2

*/

mod common {
    pub(crate) mod helpers;
}
pub use common::helpers::init_once;
pub(crate) use common::*;

mod abort;
mod epoch_tracker;
mod error;
mod fetch_engine;
mod hooks;
mod http_transport;
mod push_handler;
mod services;
mod storage;
mod subscription_manager;
mod transport;

pub mod records;
pub mod server;
pub mod xml {
    pub mod element;
    pub mod encode;
    pub mod parser;
    pub mod zst;
}

mod configuration;
pub use vdv453_client::*;
mod vdv453_client;

pub use abort::{AbortReason, AbortToken};
pub use configuration::{
    ConfigurationError, Vdv453Configuration, DEFAULT_POLL_GRACE_DELAY, DEFAULT_REQUEST_TIMEOUT,
};
pub use epoch_tracker::{EpochChange, RemoteEpoch};
pub use error::{Result, Vdv453Error};
pub use fetch_engine::{DataEvent, DataPage};
pub use hooks::{Hooks, LoggingHooks, NoopHooks};
pub use http_transport::HttpTransport;
pub use services::{Call, Service};
pub use storage::{InMemoryStorage, Storage};
pub use subscription_manager::{Subscription, SubscriptionId, MAX_EXPIRATION_DELAY};
pub use transport::{
    assert_confirmation_ok, assert_status_ok, expect_confirmation, Transport, TransportResponse,
};
pub use xml::element::XmlElement;

pub mod listeners {
    pub mod client_status;
    pub mod daten_bereit;

    pub use client_status::ClientStatusListener;
    pub use daten_bereit::DatenBereitListener;
}

#[cfg(test)]
mod tests;
#[cfg(test)]
pub(crate) use tests::*;
