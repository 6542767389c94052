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

use crate::epoch_tracker::RemoteEpoch;
use crate::server::{ListenerResponse, RequestListener};
use crate::services::Service;
use crate::vdv453_client::Vdv453ClientAbstract;
use crate::xml::element::XmlElement;
use crate::xml::zst::zst;

#[derive(Clone)]
pub struct ClientStatusListener {
    client: Arc<dyn Vdv453ClientAbstract>,
}

impl ClientStatusListener {
    pub fn new(client: Arc<dyn Vdv453ClientAbstract>) -> Self {
        ClientStatusListener { client }
    }
}

#[async_trait]
impl RequestListener for ClientStatusListener {
    fn request_root(&self) -> &'static str {
        "ClientStatusAnfrage"
    }

    fn response_root(&self) -> &'static str {
        "ClientStatusAntwort"
    }

    // The remote checks whether we are alive, and tells us about its own service instance on the way
    async fn on_receive(&self, service: Service, request: XmlElement) -> ListenerResponse {
        // 1. Compare the remote's epoch with what we know
        let epoch = RemoteEpoch::from_element(&request);
        if let Err(e) = self.client.observe_remote_epoch(service, epoch).await {
            warn!("Error checking {service} epoch from ClientStatusAnfrage: {e}");
        }

        // 2. Report our own status, which does not depend on the above
        ListenerResponse {
            status: StatusCode::OK,
            children: vec![
                XmlElement::new("Status")
                    .with_attribute("Zst", zst())
                    .with_attribute("Ergebnis", "ok"),
                XmlElement::new("StartDienstZst").with_text(self.client.start_dienst_zst()),
            ],
        }
    }
}
