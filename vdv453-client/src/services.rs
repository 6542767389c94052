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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Vdv453Error;

/// Data categories ("Dienste") of VDV 453, plus the two VDV 454 passenger information services.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    /// Connection protection, reference data
    #[serde(rename = "ansref")]
    RefAns,
    /// Connection protection, process data
    #[serde(rename = "ans")]
    Ans,
    /// Passenger information displays, reference data
    #[serde(rename = "dfiref")]
    RefDfi,
    /// Passenger information displays, process data
    #[serde(rename = "dfi")]
    Dfi,
    /// Trip visualisation
    #[serde(rename = "vis")]
    Vis,
    /// Textual messages
    #[serde(rename = "and")]
    And,
    /// Journey planner data (VDV 454), reference data
    #[serde(rename = "ausref")]
    RefAus,
    /// Journey planner data (VDV 454), process data
    #[serde(rename = "aus")]
    Aus,
}

impl Service {
    pub const ALL: [Service; 8] = [
        Service::RefAns,
        Service::Ans,
        Service::RefDfi,
        Service::Dfi,
        Service::Vis,
        Service::And,
        Service::RefAus,
        Service::Aus,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::RefAns => "ansref",
            Service::Ans => "ans",
            Service::RefDfi => "dfiref",
            Service::Dfi => "dfi",
            Service::Vis => "vis",
            Service::And => "and",
            Service::RefAus => "ausref",
            Service::Aus => "aus",
        }
    }

    /// Element used as a child of `AboAnfrage` to subscribe to this service
    pub fn subscription_tag(&self) -> &'static str {
        match self {
            Service::RefAns => "AboASBRef",
            Service::Ans => "AboASB",
            Service::RefDfi => "AboAZBRef",
            Service::Dfi => "AboAZB",
            Service::Vis => "AboVIS",
            Service::And => "AboAND",
            Service::RefAus => "AboAUSRef",
            Service::Aus => "AboAUS",
        }
    }

    /// Elements carrying the payload within a `DatenAbrufenAntwort` of this service
    pub fn data_tags(&self) -> &'static [&'static str] {
        match self {
            Service::RefAns => &["ASBRefNachricht"],
            Service::Ans => &["ASBNachricht"],
            Service::RefDfi => &["AZBRefNachricht"],
            Service::Dfi => &["AZBNachricht"],
            Service::Vis => &["VISNachricht"],
            Service::And => &["ANDNachricht"],
            Service::RefAus => &["AUSNachricht"],
            Service::Aus => &["AUSNachricht"],
        }
    }

    /// Upper bound of `DatenAbrufenAnfrage` round trips within a single fetch.
    ///
    /// Reference data services deliver whole timetables and therefore page a lot more.
    pub fn default_max_iterations(&self) -> usize {
        match self {
            Service::RefAns | Service::RefDfi | Service::RefAus => 1000,
            Service::And => 10,
            Service::Ans | Service::Dfi | Service::Vis | Service::Aus => 100,
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = Vdv453Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str() == s)
            .ok_or_else(|| Vdv453Error::InvalidArgument(format!("Unknown service: {s}")))
    }
}

/// Request types ("Anfragekennungen"), the last segment of the request path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Call {
    /// client -> server: is the service up?
    Status,
    /// server -> client: is the client up?
    ClientStatus,
    /// client -> server: create or delete subscriptions
    AboVerwalten,
    /// server -> client: data is ready to be fetched
    DatenBereit,
    /// client -> server: fetch data
    DatenAbrufen,
}

impl Call {
    pub fn as_str(&self) -> &'static str {
        match self {
            Call::Status => "status.xml",
            Call::ClientStatus => "clientstatus.xml",
            Call::AboVerwalten => "aboverwalten.xml",
            Call::DatenBereit => "datenbereit.xml",
            Call::DatenAbrufen => "datenabrufen.xml",
        }
    }

    /// Whether this call is sent by the remote to us (as opposed to by us to the remote)
    pub fn is_inbound(&self) -> bool {
        matches!(self, Call::ClientStatus | Call::DatenBereit)
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Call {
    type Err = Vdv453Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Call::Status,
            Call::ClientStatus,
            Call::AboVerwalten,
            Call::DatenBereit,
            Call::DatenAbrufen,
        ]
        .into_iter()
        .find(|call| call.as_str() == s)
        .ok_or_else(|| Vdv453Error::InvalidArgument(format!("Unknown call: {s}")))
    }
}
