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

//! Timestamps ("Zeitstempel", `Zst`) as used throughout VDV 453: ISO 8601, UTC, second precision.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

use crate::error::{Result, Vdv453Error};

/// Format `t` as e.g. `2024-04-11T10:00:00Z`; sub-second parts are dropped
pub fn format_zst(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// The current time as `Zst`
pub fn zst() -> String {
    format_zst(Utc::now())
}

/// Parse a `Zst`. Offsets other than UTC are accepted and converted, a missing offset means UTC.
pub fn parse_zst(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(input) {
        return Ok(t.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|t| t.and_utc())
        .map_err(|e| Vdv453Error::Protocol(format!("Invalid timestamp {input}: {e}")))
}
