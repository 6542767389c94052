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
use futures::{StreamExt, TryStreamExt};
use log::*;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::io::StreamReader;

use crate::abort::AbortToken;
use crate::configuration::Vdv453Configuration;
use crate::error::{Result, Vdv453Error};
use crate::services::{Call, Service};
use crate::transport::{Transport, TransportResponse};
use crate::xml::encode::encode_document;
use crate::xml::element::XmlElement;
use crate::xml::parser::parse_tags;
use crate::xml::zst::zst;

pub(crate) const XML_CONTENT_TYPE: &str = "text/xml; charset=\"utf-8\"";

/// `Transport` sending requests to the remote party via HTTP POST.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    config: Arc<Vdv453Configuration>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: Arc<Vdv453Configuration>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Vdv453Error::Internal(format!("Error creating HTTP client: {e}")))?;
        Ok(HttpTransport { config, client })
    }

    pub fn with_client(config: Arc<Vdv453Configuration>, client: reqwest::Client) -> Self {
        HttpTransport { config, client }
    }
}

fn transport_error(url: &str, e: reqwest::Error) -> Vdv453Error {
    Vdv453Error::Transport(format!("{url}: {e}"))
}

// Best effort extraction of a Fehlertext from an error response body
async fn remote_error_text(body: bytes::Bytes, token: AbortToken) -> Option<String> {
    let mut tags = parse_tags(std::io::Cursor::new(body), &["Fehlertext"], token);
    match tags.next().await {
        Some(Ok((_, element))) => Some(element.text.trim().to_string()).filter(|t| !t.is_empty()),
        _ => None,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        service: Service,
        call: Call,
        root_tag: &str,
        children: Vec<XmlElement>,
        token: &AbortToken,
    ) -> Result<TransportResponse> {
        let url = self.config.request_url(service, call.as_str());
        let root = XmlElement::new(root_tag)
            .with_attribute("Sender", self.config.leitstelle.as_str())
            .with_attribute("Zst", zst())
            .with_children(children);
        let body = encode_document(&root)?;

        debug!("Sending {root_tag} to {url}");
        if log_enabled!(Level::Trace) {
            trace!("Request body: {}", String::from_utf8_lossy(&body));
        }

        let request_token = token.child_with_timeout(self.config.request_timeout);
        let started = Instant::now();
        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, XML_CONTENT_TYPE)
            .header(reqwest::header::CONNECTION, "keep-alive")
            .body(body)
            .send();

        let response = tokio::select! {
            response = request => response.map_err(|e| transport_error(&url, e))?,
            _ = request_token.cancelled() => return Err(request_token.error()),
        };

        let status = response.status();
        debug!(
            "Received response {} from {url} after {:?}",
            status,
            started.elapsed()
        );

        if !status.is_success() {
            let body = tokio::select! {
                body = response.bytes() => body.ok(),
                _ = request_token.cancelled() => None,
            };
            let remote_message = match body {
                Some(body) => remote_error_text(body, request_token.clone()).await,
                None => None,
            };
            return Err(Vdv453Error::Http {
                url,
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
                remote_message,
            });
        }

        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        Ok(TransportResponse::new(
            service,
            call,
            Box::pin(StreamReader::new(body)),
            request_token,
        ))
    }
}

#[cfg(test)]
mod tests {
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use futures::TryStreamExt;
    use std::time::Duration;

    use super::*;
    use crate::abort::AbortReason;

    const LEITSTELLE: &str = "client";

    // Remote party describing the received DatenAbrufenAnfrage, failing status and never answering AboAnfrage in time
    async fn serve() -> String {
        let app = Router::new()
            .route(
                "/vdv/client/aus/datenabrufen.xml",
                post(|headers: HeaderMap, body: String| async move {
                    let content_type = headers
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body = format!(
                        r#"<?xml version="1.0" encoding="UTF-8"?>
<DatenAbrufenAntwort><Bestaetigung Zst="2024-04-11T10:00:00Z" Ergebnis="ok" Fehlernummer="0"/><WeitereDaten>false</WeitereDaten><AUSNachricht AboID="1"><ContentType>{content_type}</ContentType><Laenge>{}</Laenge></AUSNachricht></DatenAbrufenAntwort>"#,
                        body.len()
                    );
                    ([(header::CONTENT_TYPE, XML_CONTENT_TYPE)], body)
                }),
            )
            .route(
                "/vdv/client/aus/status.xml",
                post(|| async {
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "<StatusAntwort><Fehlertext>Wartung</Fehlertext></StatusAntwort>",
                    )
                }),
            )
            .route(
                "/vdv/client/aus/aboverwalten.xml",
                post(|| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    "too late"
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{address}/vdv/")
    }

    async fn transport() -> HttpTransport {
        let config = Vdv453Configuration::create(String::from(LEITSTELLE), serve().await, None, None)
            .unwrap()
            .with_request_timeout(Duration::from_millis(300));
        HttpTransport::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_send() {
        let transport = transport().await;

        let response = transport
            .send(
                Service::Aus,
                Call::DatenAbrufen,
                "DatenAbrufenAnfrage",
                vec![XmlElement::new("DatensatzAlle").with_text("false")],
                &AbortToken::new(),
            )
            .await
            .unwrap();
        let elements: Vec<(String, XmlElement)> = response
            .tags(&["Bestaetigung", "AUSNachricht"])
            .try_collect()
            .await
            .unwrap();

        assert_eq!(elements.len(), 2);
        assert_eq!(elements[0].1.attribute("Ergebnis"), Some("ok"));
        let nachricht = &elements[1].1;
        assert_eq!(nachricht.child_text("ContentType"), Some(XML_CONTENT_TYPE));
        assert_ne!(nachricht.child_text("Laenge"), Some("0"));
    }

    #[tokio::test]
    async fn test_http_error() {
        let transport = transport().await;

        let error = transport
            .send(Service::Aus, Call::Status, "StatusAnfrage", Vec::new(), &AbortToken::new())
            .await
            .unwrap_err();
        match error {
            Vdv453Error::Http {
                url,
                status,
                remote_message,
                ..
            } => {
                assert!(url.ends_with("/vdv/client/aus/status.xml"));
                assert_eq!(status, 503);
                assert_eq!(remote_message.as_deref(), Some("Wartung"));
            }
            other => panic!("Unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let transport = transport().await;

        let response = transport
            .send(
                Service::Aus,
                Call::AboVerwalten,
                "AboAnfrage",
                Vec::new(),
                &AbortToken::new(),
            )
            .await;
        assert!(matches!(
            response,
            Err(Vdv453Error::Canceled(AbortReason::Timeout))
        ));
    }

    #[tokio::test]
    async fn test_canceled() {
        let transport = transport().await;
        let token = AbortToken::new();
        token.cancel(AbortReason::Unsubscribed);

        let response = transport
            .send(
                Service::Aus,
                Call::AboVerwalten,
                "AboAnfrage",
                Vec::new(),
                &token,
            )
            .await;
        assert!(matches!(
            response,
            Err(Vdv453Error::Canceled(AbortReason::Unsubscribed))
        ));
    }

    #[tokio::test]
    async fn test_unreachable() {
        let config = Vdv453Configuration::create(
            String::from(LEITSTELLE),
            String::from("http://127.0.0.1:1/vdv"),
            None,
            None,
        )
        .unwrap();
        let transport = HttpTransport::new(config).unwrap();

        let response = transport
            .send(Service::Aus, Call::Status, "StatusAnfrage", Vec::new(), &AbortToken::new())
            .await;
        assert!(matches!(response, Err(Vdv453Error::Transport(_))));
    }
}
