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

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::{TimeDelta, Utc};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::abort::AbortToken;
    use crate::epoch_tracker::EpochChange;
    use crate::error::Vdv453Error;
    use crate::fetch_engine::DataEvent;
    use crate::services::{Call, Service};
    use crate::storage::{start_dienst_zst_key, subscription_key, InMemoryStorage, Storage};
    use crate::test_lib::{
        helpers::{self, abo_antwort_ok, aus_page, test_config, LEITSTELLE, ZST},
        mocks::{RecordingHooks, ScriptedTransport},
    };
    use crate::vdv453_client::{Vdv453Client, Vdv453ClientAbstract, Vdv453Stopper};
    use crate::xml::element::XmlElement;
    use crate::xml::parser::parse_whole_root;

    struct Running {
        client: Arc<Vdv453Client>,
        stopper: Vdv453Stopper,
        data: mpsc::Receiver<DataEvent>,
        storage: Arc<InMemoryStorage>,
        hooks: Arc<RecordingHooks>,
    }

    fn run(transport: Arc<ScriptedTransport>) -> Running {
        let storage = Arc::new(InMemoryStorage::new());
        let hooks = Arc::new(RecordingHooks::default());
        let (client, stopper, data) =
            Vdv453Client::run(test_config(), transport, storage.clone(), hooks.clone());
        Running {
            client,
            stopper,
            data,
            storage,
            hooks,
        }
    }

    fn status_antwort(ergebnis: &str, start: &str, version: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<StatusAntwort><Status Zst="{ZST}" Ergebnis="{ergebnis}"/><DatenBereit>true</DatenBereit><StartDienstZst>{start}</StartDienstZst><DatenVersionID>{version}</DatenVersionID></StatusAntwort>"#
        )
    }

    fn inbound(service: &str, call: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/{LEITSTELLE}/{service}/{call}"))
            .header(header::CONTENT_TYPE, "text/xml; charset=utf-8")
            .body(Body::from(body))
            .unwrap()
    }

    async fn response_root(response: axum::response::Response, root: &str) -> XmlElement {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        parse_whole_root(std::io::Cursor::new(body), root, AbortToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_status() {
        let transport = ScriptedTransport::new();
        transport
            .push(status_antwort("ok", "2024-04-11T03:00:00Z", "17"))
            .push(status_antwort("ok", "2024-04-11T03:00:00Z", "17"));
        let running = run(transport.clone());

        let status = running.client.status(Service::Aus).await.unwrap();
        assert_eq!(status.zst.as_deref(), Some(ZST));
        assert!(status.daten_bereit);
        assert_eq!(
            status.epoch.start_dienst_zst.as_deref(),
            Some("2024-04-11T03:00:00Z")
        );
        assert_eq!(status.epoch.daten_version_id.as_deref(), Some("17"));
        assert_eq!(status.epoch_change, EpochChange::Baseline);

        let status = running.client.status(Service::Aus).await.unwrap();
        assert_eq!(status.epoch_change, EpochChange::Unchanged);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].call, Call::Status);
        assert_eq!(requests[0].root_tag, "StatusAnfrage");
        assert!(requests[0].children.is_empty());
    }

    #[tokio::test]
    async fn test_status_notok() {
        let transport = ScriptedTransport::new();
        transport.push(format!(
            r#"<StatusAntwort><Status Zst="{ZST}" Ergebnis="notok" Fehlernummer="400"/><Fehlertext>Dienst gestoert</Fehlertext></StatusAntwort>"#
        ));
        let running = run(transport);

        match running.client.status(Service::Dfi).await {
            Err(Vdv453Error::Api {
                service,
                code,
                text,
            }) => {
                assert_eq!(service, Service::Dfi);
                assert_eq!(code, Some(400));
                assert_eq!(text, "Dienst gestoert");
            }
            other => panic!("Unexpected result {other:?}"),
        }
        // a failed status does not count as an observation
        assert!(!running
            .storage
            .has(&start_dienst_zst_key(Service::Dfi))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_status_without_status_element() {
        let transport = ScriptedTransport::new();
        transport.push(String::from(
            "<StatusAntwort><DatenBereit>false</DatenBereit></StatusAntwort>",
        ));
        let running = run(transport);

        assert!(matches!(
            running.client.status(Service::Aus).await,
            Err(Vdv453Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_daten_bereit_without_subscriptions() {
        let transport = ScriptedTransport::new();
        let running = run(transport.clone());

        let response = running
            .client
            .router()
            .oneshot(inbound(
                "aus",
                "datenbereit.xml",
                format!(r#"<DatenBereitAnfrage Sender="remote" Zst="{ZST}"/>"#),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let root = response_root(response, "DatenBereitAntwort").await;
        let bestaetigung = root.child("Bestaetigung").unwrap();
        assert_eq!(bestaetigung.attribute("Ergebnis"), Some("notok"));
        assert_eq!(bestaetigung.attribute("Fehlernummer"), Some("300"));
        assert!(root.child_text("Fehlertext").is_some());
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_daten_bereit_delivers_data() {
        let transport = ScriptedTransport::new();
        transport
            .push(abo_antwort_ok())
            .push(aus_page(&["7", "8"], false))
            .set_fallback(aus_page(&[], false));
        let mut running = run(transport.clone());

        let id = running
            .client
            .aus_subscribe(Utc::now() + TimeDelta::hours(1), None, None, None)
            .await
            .unwrap();
        assert_eq!(running.client.subscription_count(Service::Aus).await.unwrap(), 1);

        let response = running
            .client
            .router()
            .oneshot(inbound(
                "aus",
                "datenbereit.xml",
                format!(r#"<DatenBereitAnfrage Sender="remote" Zst="{ZST}"/>"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let root = response_root(response, "DatenBereitAntwort").await;
        assert_eq!(root.attribute("Sender"), Some(LEITSTELLE));
        assert_eq!(
            root.child("Bestaetigung").unwrap().attribute("Ergebnis"),
            Some("ok")
        );

        let first = running.data.recv().await.unwrap();
        let second = running.data.recv().await.unwrap();
        assert_eq!(first.service, Service::Aus);
        assert_eq!(helpers::linien_id(&first), "7");
        assert_eq!(helpers::linien_id(&second), "8");

        let abo = &transport.requests()[0];
        assert_eq!(abo.call, Call::AboVerwalten);
        let aus_abo = &abo.children[0];
        assert_eq!(aus_abo.name, "AboAUS");
        assert_eq!(aus_abo.attribute("AboID"), Some(id.to_string().as_str()));
        assert_eq!(aus_abo.child_text("Vorschauzeit"), Some("30"));
    }

    #[tokio::test]
    async fn test_client_status() {
        let transport = ScriptedTransport::new();
        let running = run(transport.clone());

        let response = running
            .client
            .router()
            .oneshot(inbound(
                "ausref",
                "clientstatus.xml",
                format!(
                    r#"<ClientStatusAnfrage Sender="remote" Zst="{ZST}"><StartDienstZst>2024-04-11T03:00:00Z</StartDienstZst></ClientStatusAnfrage>"#
                ),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let root = response_root(response, "ClientStatusAntwort").await;
        assert_eq!(
            root.child("Status").unwrap().attribute("Ergebnis"),
            Some("ok")
        );
        assert_eq!(
            root.child_text("StartDienstZst"),
            Some(running.client.start_dienst_zst().as_str())
        );
        // the remote's epoch got recorded on the way
        assert_eq!(
            running
                .storage
                .get(&start_dienst_zst_key(Service::RefAus))
                .await
                .unwrap()
                .as_deref(),
            Some("2024-04-11T03:00:00Z")
        );
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_manual_fetch() {
        let transport = ScriptedTransport::new();
        transport
            .push(aus_page(&["1", "2"], true))
            .push(aus_page(&["3"], false));
        let mut running = run(transport.clone());

        // no subscription needed
        let events = running.client.fetch(Service::Aus, true).await.unwrap();

        let ids: Vec<String> = events.iter().map(helpers::linien_id).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(
            running.hooks.events(),
            vec![
                "manual_started:aus",
                "page:aus:1:2",
                "page:aus:2:1",
                "manual_succeeded:aus:3"
            ]
        );
        assert_eq!(transport.requests()[0].children[0].text, "true");
        // nothing goes to the data channel
        assert!(running.data.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_fetch_failure() {
        let transport = ScriptedTransport::new();
        transport.push_error(Vdv453Error::Transport(String::from("connection reset")));
        let running = run(transport);

        assert!(matches!(
            running.client.fetch(Service::Dfi, false).await,
            Err(Vdv453Error::Transport(_))
        ));
        assert_eq!(
            running.hooks.events(),
            vec!["manual_started:dfi", "manual_failed:dfi"]
        );
    }

    #[tokio::test]
    async fn test_fetch_page() {
        let transport = ScriptedTransport::new();
        transport.push(aus_page(&["1"], true));
        let running = run(transport);

        let page = running.client.fetch_page(Service::Aus, false).await.unwrap();
        assert!(page.confirmation_ok);
        assert!(page.has_more_pages);
        assert_eq!(page.data_elements.len(), 1);
        assert!(running.hooks.events().is_empty());
    }

    #[tokio::test]
    async fn test_stop() {
        let transport = ScriptedTransport::new();
        transport.push(abo_antwort_ok());
        let mut running = run(transport.clone());

        let id = running
            .client
            .subscribe(
                Service::Aus,
                Vec::new(),
                Utc::now() + TimeDelta::hours(1),
                None,
            )
            .await
            .unwrap();

        running.stopper.stop().await;
        running.stopper.stop().await;

        // persisted for the next start
        assert!(running
            .storage
            .has(&subscription_key(Service::Aus, id))
            .await
            .unwrap());
        assert_eq!(running.hooks.count("canceled"), 0);
        // requests after the stop are canceled right away
        assert!(matches!(
            running.client.fetch_page(Service::Aus, false).await,
            Err(Vdv453Error::Canceled(_))
        ));
        assert_eq!(transport.count(Call::DatenAbrufen), 0);
    }
}
