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

use serde::Serialize;

use vdv453_client::records::{self, IstFahrt, SollFahrt};
use vdv453_client::{DataEvent, Service, XmlElement};

#[derive(Serialize)]
#[serde(untagged)]
enum Payload<'a> {
    IstFahrten(Vec<IstFahrt>),
    SollFahrten(Vec<SollFahrt>),
    Raw(&'a XmlElement),
}

#[derive(Serialize)]
struct Line<'a> {
    service: Service,
    tag: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    zst: Option<&'a str>,
    data: Payload<'a>,
}

/// One JSON document per data event; trips of `aus` and `ausref` are translated into records, everything else is
/// printed as the raw element tree.
pub(crate) fn json_line(event: &DataEvent) -> serde_json::Result<String> {
    let data = match event.service {
        Service::Aus => Payload::IstFahrten(records::ist_fahrten(event)),
        Service::RefAus => Payload::SollFahrten(records::soll_fahrten(event)),
        _ => Payload::Raw(&event.element),
    };
    serde_json::to_string(&Line {
        service: event.service,
        tag: &event.tag,
        zst: event.confirmation_zst.as_deref(),
        data,
    })
}
