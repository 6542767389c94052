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
use axum::http::StatusCode;
use log::*;
use std::sync::Arc;

use crate::server::{confirmation, ListenerResponse, RequestListener};
use crate::services::Service;
use crate::vdv453_client::Vdv453ClientAbstract;
use crate::xml::element::XmlElement;

#[derive(Clone)]
pub struct DatenBereitListener {
    client: Arc<dyn Vdv453ClientAbstract>,
}

impl DatenBereitListener {
    pub fn new(client: Arc<dyn Vdv453ClientAbstract>) -> Self {
        DatenBereitListener { client }
    }
}

#[async_trait]
impl RequestListener for DatenBereitListener {
    fn request_root(&self) -> &'static str {
        "DatenBereitAnfrage"
    }

    fn response_root(&self) -> &'static str {
        "DatenBereitAntwort"
    }

    // The remote announces new data; fetching it happens in the background
    async fn on_receive(&self, service: Service, _request: XmlElement) -> ListenerResponse {
        match self.client.on_daten_bereit(service).await {
            Ok(true) => ListenerResponse {
                status: StatusCode::OK,
                children: vec![confirmation(true, 0)],
            },
            Ok(false) => ListenerResponse {
                status: StatusCode::BAD_REQUEST,
                children: vec![
                    confirmation(false, 300),
                    XmlElement::new("Fehlertext")
                        .with_text(format!("no active {service} subscriptions")),
                ],
            },
            Err(e) => {
                error!("Error handling {service} DatenBereitAnfrage: {e}");
                ListenerResponse {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    children: vec![
                        confirmation(false, 400),
                        XmlElement::new("Fehlertext").with_text(e.to_string()),
                    ],
                }
            }
        }
    }
}
