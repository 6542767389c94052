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
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures::TryStreamExt;
use log::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::io::StreamReader;

use crate::abort::AbortToken;
use crate::http_transport::XML_CONTENT_TYPE;
use crate::services::{Call, Service};
use crate::xml::element::XmlElement;
use crate::xml::encode::encode_document;
use crate::xml::parser::parse_whole_root;
use crate::xml::zst::zst;

// Inbound side of the protocol: the remote party calls us at `/{leitstelle}/{service}/{call}` to check whether we are
// alive (`clientstatus.xml`) and to announce new data (`datenbereit.xml`). Each supported call is handled by one of the
// `listeners`, this module only deals with HTTP and XML framing.

/// What a listener wants to send back, to be wrapped into its response root element
#[derive(Clone, Debug)]
pub struct ListenerResponse {
    pub status: StatusCode,
    pub children: Vec<XmlElement>,
}

/// Handler of one inbound call
#[async_trait]
pub trait RequestListener: Send + Sync {
    fn request_root(&self) -> &'static str;
    fn response_root(&self) -> &'static str;
    async fn on_receive(&self, service: Service, request: XmlElement) -> ListenerResponse;
}

/// `Bestaetigung` as sent in our responses
pub(crate) fn confirmation(ok: bool, fehlernummer: u32) -> XmlElement {
    XmlElement::new("Bestaetigung")
        .with_attribute("Zst", zst())
        .with_attribute("Ergebnis", if ok { "ok" } else { "notok" })
        .with_attribute("Fehlernummer", fehlernummer.to_string())
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("POST only")]
    MethodNotAllowed,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self {
            ServerError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

#[derive(Clone)]
pub(crate) struct ServerState {
    leitstelle: String,
    request_timeout: Duration,
    listeners: Arc<HashMap<Call, Arc<dyn RequestListener>>>,
    root: AbortToken,
}

impl ServerState {
    pub(crate) fn new(
        leitstelle: String,
        request_timeout: Duration,
        listeners: HashMap<Call, Arc<dyn RequestListener>>,
        root: AbortToken,
    ) -> Self {
        ServerState {
            leitstelle,
            request_timeout,
            listeners: Arc::new(listeners),
            root,
        }
    }
}

pub(crate) fn router(state: ServerState) -> Router {
    Router::new()
        .route("/{leitstelle}/{service}/{call}", any(handle_request))
        .with_state(state)
}

// `text/xml`, optionally with a utf-8 charset; remotes are known to send `Charset` as well as `charset`
fn check_content_type(headers: &HeaderMap) -> Result<(), ServerError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .ok_or_else(|| ServerError::BadRequest(String::from("missing Content-Type header")))?
        .to_str()
        .map_err(|_| ServerError::BadRequest(String::from("malformed Content-Type header")))?;

    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case("text/xml") {
        return Err(ServerError::BadRequest(format!(
            "invalid content type \"{media_type}\""
        )));
    }
    for parameter in parts {
        let Some((key, value)) = parameter.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("charset") {
            continue;
        }
        let charset = value.trim().trim_matches('"');
        if !charset.eq_ignore_ascii_case("utf-8") {
            return Err(ServerError::BadRequest(format!(
                "invalid charset \"{charset}\""
            )));
        }
    }
    Ok(())
}

async fn handle_request(
    State(state): State<ServerState>,
    method: Method,
    Path((leitstelle, service, call)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ServerError> {
    debug!("Received {method} /{leitstelle}/{service}/{call}");

    if method != Method::POST {
        return Err(ServerError::MethodNotAllowed);
    }
    check_content_type(&headers)?;
    if leitstelle != state.leitstelle {
        return Err(ServerError::NotFound(String::from("wrong leitstelle")));
    }
    let service: Service = service
        .parse()
        .map_err(|_| ServerError::NotFound(String::from("unsupported service")))?;
    let listener = call
        .parse::<Call>()
        .ok()
        .and_then(|call| state.listeners.get(&call))
        .ok_or_else(|| ServerError::NotFound(String::from("unsupported call")))?;

    let token = state.root.child_with_timeout(state.request_timeout);
    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let request = parse_whole_root(reader, listener.request_root(), token)
        .await
        .map_err(|e| ServerError::BadRequest(e.to_string()))?;
    trace!("{service} {call} request: {request:?}");

    let response = listener.on_receive(service, request).await;
    let root = XmlElement::new(listener.response_root())
        .with_attribute("Sender", state.leitstelle.as_str())
        .with_attribute("Zst", zst())
        .with_children(response.children);
    let body = encode_document(&root).map_err(|e| ServerError::Internal(e.to_string()))?;

    debug!("Responding to {service} {call} with {}", response.status);
    Ok((
        response.status,
        [
            (header::CONTENT_TYPE, XML_CONTENT_TYPE),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response())
}
