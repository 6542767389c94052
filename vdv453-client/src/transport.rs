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
use bytes::Bytes;
use futures::StreamExt;
use std::io::Cursor;
use std::pin::Pin;
use tokio::io::AsyncBufRead;

use crate::abort::AbortToken;
use crate::error::{Result, Vdv453Error};
use crate::services::{Call, Service};
use crate::xml::element::XmlElement;
use crate::xml::parser::{parse_tags, TagStream};

/// Response to one outbound request; the body is consumed lazily via `tags()`.
pub struct TransportResponse {
    pub service: Service,
    pub call: Call,
    body: Pin<Box<dyn AsyncBufRead + Send>>,
    // cancelling this stops reading the body
    token: AbortToken,
}

impl TransportResponse {
    pub fn new(
        service: Service,
        call: Call,
        body: Pin<Box<dyn AsyncBufRead + Send>>,
        token: AbortToken,
    ) -> Self {
        TransportResponse {
            service,
            call,
            body,
            token,
        }
    }

    /// Response with an already complete body
    pub fn from_bytes(service: Service, call: Call, body: Bytes, token: AbortToken) -> Self {
        Self::new(service, call, Box::pin(Cursor::new(body)), token)
    }

    pub fn token(&self) -> &AbortToken {
        &self.token
    }

    /// Parse the body, yielding the elements named in `tags` in document order.
    pub fn tags(self, tags: &[&str]) -> TagStream {
        parse_tags(self.body, tags, self.token)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("service", &self.service)
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

/// One request/response exchange with the remote party.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a `root_tag` document with the given children (`Sender` and `Zst` are added by the transport)
    /// as `call` of `service`. The returned response stays readable until `token` or the transport's
    /// own request deadline cancels it.
    async fn send(
        &self,
        service: Service,
        call: Call,
        root_tag: &str,
        children: Vec<XmlElement>,
        token: &AbortToken,
    ) -> Result<TransportResponse>;
}

fn fehlernummer(element: &XmlElement) -> Option<u32> {
    element
        .attribute("Fehlernummer")
        .and_then(|n| n.trim().parse().ok())
}

/// Fails with `Vdv453Error::Api` unless `bestaetigung` carries `Ergebnis="ok"`
pub fn assert_confirmation_ok(
    service: Service,
    bestaetigung: &XmlElement,
    error_text: Option<&str>,
) -> Result<()> {
    assert_result_ok(service, bestaetigung, error_text)
}

/// Fails with `Vdv453Error::Api` unless `status` carries `Ergebnis="ok"`
pub fn assert_status_ok(service: Service, status: &XmlElement, error_text: Option<&str>) -> Result<()> {
    assert_result_ok(service, status, error_text)
}

fn assert_result_ok(service: Service, element: &XmlElement, error_text: Option<&str>) -> Result<()> {
    match element.attribute("Ergebnis") {
        Some("ok") => Ok(()),
        _ => Err(Vdv453Error::Api {
            service,
            code: fehlernummer(element),
            text: error_text
                .or_else(|| element.child_text("Fehlertext"))
                .unwrap_or("no error text")
                .to_string(),
        }),
    }
}

/// Read a response consisting of a `Bestaetigung` plus an optional `Fehlertext`, failing unless it is ok.
pub async fn expect_confirmation(response: TransportResponse) -> Result<XmlElement> {
    let service = response.service;
    let mut tags = response.tags(&["Bestaetigung", "Fehlertext"]);
    let mut bestaetigung = None;
    let mut fehlertext = None;
    while let Some(tag) = tags.next().await {
        let (name, element) = tag?;
        match name.as_str() {
            "Bestaetigung" => bestaetigung = Some(element),
            "Fehlertext" => fehlertext = Some(element.text.trim().to_string()),
            _ => {}
        }
    }
    let bestaetigung = bestaetigung.ok_or_else(|| {
        Vdv453Error::Protocol(format!("{service}: response without Bestaetigung"))
    })?;
    assert_confirmation_ok(service, &bestaetigung, fehlertext.as_deref())?;
    Ok(bestaetigung)
}
