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

use thiserror::Error;

use crate::{abort::AbortReason, services::Service};

/// Errors surfaced by the VDV 453 client.
///
/// `Fehlernummer` conventions of the protocol: 0 means ok, 300-399 are errors caused by a faulty
/// request (do not repeat it as-is), 400-499 are temporary conditions where a later retry may succeed.
#[derive(Debug, Error)]
pub enum Vdv453Error {
    /// Connection failures and similar problems below the HTTP layer
    #[error("Transport error: {0}")]
    Transport(String),

    /// Remote answered with a non-2xx HTTP status
    #[error("{url}: HTTP {status} {message}{}", remote_message.as_ref().map(|m| format!(" ({m})")).unwrap_or_default())]
    Http {
        url: String,
        status: u16,
        message: String,
        remote_message: Option<String>,
    },

    /// Remote answered with `Ergebnis="notok"`
    #[error("{service}: remote reported an error (Fehlernummer {}): {text}", code.map(|c| c.to_string()).unwrap_or_else(|| String::from("-")))]
    Api {
        service: Service,
        code: Option<u32>,
        text: String,
    },

    /// Response does not have the expected shape, or the XML could not be parsed/encoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{service}: exceeded the maximum of {count} pages in one fetch")]
    IterationCap { service: Service, count: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation canceled ({0})")]
    Canceled(AbortReason),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Vdv453Error {
    /// Whether repeating the same request later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Vdv453Error::Transport(_) => true,
            Vdv453Error::Http { status, .. } => *status >= 500,
            Vdv453Error::Api { code, .. } => code.is_some_and(|c| (400..500).contains(&c)),
            Vdv453Error::Canceled(reason) => *reason == AbortReason::Timeout,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Vdv453Error {
    fn from(e: serde_json::Error) -> Self {
        Vdv453Error::Storage(format!("Error (de)serializing stored value: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Vdv453Error>;
