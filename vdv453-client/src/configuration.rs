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

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use uriparse::{Segment, URI};

use crate::services::Service;

/// Default subscription command and data channel buffer size
pub(crate) const DEFAULT_COMMAND_BUFFER_SIZE: usize = 1024;

/// Default deadline for one outbound request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between a successful subscribe and the first poll
pub const DEFAULT_POLL_GRACE_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct ConfigurationError(String);

impl ConfigurationError {
    pub fn new<T>(message: T) -> ConfigurationError
    where
        T: Into<String>,
    {
        ConfigurationError(message.into())
    }
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Configuration error: {}", self.0))
    }
}

impl std::error::Error for ConfigurationError {}

#[derive(Clone, Debug)]
pub struct Vdv453Configuration {
    /// Our own control center id ("Leitstellenkennung"), used as `Sender` and as the first request path segment
    pub leitstelle: String,
    /// Base URL of the remote party, e.g. `https://vdv.example.org/vdv453`
    pub endpoint: String,
    pub subscription_command_buffer: usize,
    pub data_buffer: usize,
    pub request_timeout: Duration,
    pub poll_grace_delay: Duration,
    max_iterations: HashMap<Service, usize>,
    /// `Fehlernummer` values the remote uses to report unknown subscription ids
    pub not_found_error_codes: Vec<u32>,
}

/// Holder object for client configuration options; this performs validation of configuration parameters at construction time.
impl Vdv453Configuration {
    /// Create an "immutable" (Arc) `Vdv453Configuration` object from a set of configuration parameters.
    ///
    /// Note: the default internal channel buffer size is DEFAULT_COMMAND_BUFFER_SIZE = 1024
    ///
    /// # Arguments
    ///
    /// * `leitstelle` - our own control center id, must be usable as a single URL path segment
    /// * `endpoint` - absolute http(s) URL of the remote party
    /// * `subscription_command_buffer` - buffer size for subscription manager commands, defaults to DEFAULT_COMMAND_BUFFER_SIZE when `None` is passed
    /// * `data_buffer` - buffer size of the data event channel, defaults to DEFAULT_COMMAND_BUFFER_SIZE when `None` is passed
    ///
    /// # Errors
    ///
    /// Returns a ConfigurationError in case an invalid leitstelle or endpoint is provided; this is determined via the uriparse crate.
    pub fn create(
        leitstelle: String,
        endpoint: String,
        subscription_command_buffer: Option<usize>,
        data_buffer: Option<usize>,
    ) -> Result<Arc<Vdv453Configuration>, ConfigurationError> {
        if leitstelle.is_empty() {
            return Err(ConfigurationError::new("Leitstelle must not be empty"));
        }
        if leitstelle == "." || leitstelle == ".." {
            return Err(ConfigurationError::new(format!(
                "Invalid leitstelle: {leitstelle}"
            )));
        }
        if let Err(e) = Segment::try_from(leitstelle.as_str()) {
            return Err(ConfigurationError::new(format!(
                "Invalid leitstelle {leitstelle}: {e}"
            )));
        }

        match URI::try_from(endpoint.as_str()) {
            Err(e) => {
                return Err(ConfigurationError::new(format!(
                    "Invalid endpoint {endpoint}: {e}"
                )));
            }
            Ok(uri) => {
                let scheme = uri.scheme().as_str().to_ascii_lowercase();
                if scheme != "http" && scheme != "https" {
                    return Err(ConfigurationError::new(format!(
                        "Endpoint must be an http(s) URL, got scheme {scheme}"
                    )));
                }
                if !uri.has_authority() {
                    return Err(ConfigurationError::new(format!(
                        "Endpoint {endpoint} is missing a host"
                    )));
                }
            }
        }

        Ok(Arc::new(Vdv453Configuration {
            leitstelle,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            subscription_command_buffer: subscription_command_buffer
                .unwrap_or(DEFAULT_COMMAND_BUFFER_SIZE)
                .clamp(1, DEFAULT_COMMAND_BUFFER_SIZE),
            data_buffer: data_buffer
                .unwrap_or(DEFAULT_COMMAND_BUFFER_SIZE)
                .clamp(1, DEFAULT_COMMAND_BUFFER_SIZE),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_grace_delay: DEFAULT_POLL_GRACE_DELAY,
            max_iterations: HashMap::new(),
            not_found_error_codes: Vec::new(),
        }))
    }

    pub fn with_request_timeout(self: Arc<Self>, request_timeout: Duration) -> Arc<Self> {
        let mut config = Arc::unwrap_or_clone(self);
        config.request_timeout = request_timeout;
        Arc::new(config)
    }

    pub fn with_poll_grace_delay(self: Arc<Self>, poll_grace_delay: Duration) -> Arc<Self> {
        let mut config = Arc::unwrap_or_clone(self);
        config.poll_grace_delay = poll_grace_delay;
        Arc::new(config)
    }

    /// Override the page cap of a single fetch for `service`; values below 1 are raised to 1
    pub fn with_max_iterations(self: Arc<Self>, service: Service, max: usize) -> Arc<Self> {
        let mut config = Arc::unwrap_or_clone(self);
        config.max_iterations.insert(service, max.max(1));
        Arc::new(config)
    }

    pub fn with_not_found_error_codes(self: Arc<Self>, codes: Vec<u32>) -> Arc<Self> {
        let mut config = Arc::unwrap_or_clone(self);
        config.not_found_error_codes = codes;
        Arc::new(config)
    }

    pub fn max_iterations(&self, service: Service) -> usize {
        self.max_iterations
            .get(&service)
            .copied()
            .unwrap_or_else(|| service.default_max_iterations())
    }

    /// URL of `call` for `service` at the remote party
    pub(crate) fn request_url(&self, service: Service, call: &str) -> String {
        format!("{}/{}/{}/{}", self.endpoint, self.leitstelle, service, call)
    }
}
