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

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::Vdv453Error;

/// Why an `AbortToken` got cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AbortReason {
    Expired,
    Unsubscribed,
    ResetByRemote,
    Timeout,
    Shutdown,
}

impl AbortReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbortReason::Expired => "expired",
            AbortReason::Unsubscribed => "unsubscribed",
            AbortReason::ResetByRemote => "reset-by-remote",
            AbortReason::Timeout => "timeout",
            AbortReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation token carrying a reason, arranged in a tree: cancelling a token cancels all tokens derived
/// from it via `child()`, never the other way round.
///
/// Every subscription owns one of these; individual requests run on children of it.
#[derive(Clone, Debug, Default)]
pub struct AbortToken {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
    parent: Option<Arc<AbortToken>>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled together with `self`, but can also be cancelled on its own.
    pub fn child(&self) -> AbortToken {
        AbortToken {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Like `child()`, but the returned token cancels itself with `AbortReason::Timeout` once `timeout` elapsed.
    ///
    /// Needs to be called from within a tokio runtime.
    pub fn child_with_timeout(&self, timeout: Duration) -> AbortToken {
        let child = self.child();
        let timer = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    timer.cancel(AbortReason::Timeout);
                }
                _ = timer.cancelled() => {}
            }
        });
        child
    }

    /// Cancel this token and all its descendants. Returns `false` if the token was already cancelled,
    /// in which case the earlier reason is kept.
    pub fn cancel(&self, reason: AbortReason) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason this token was cancelled for, inherited from the nearest cancelled ancestor if it
    /// was not cancelled directly. `None` while the token is live.
    pub fn reason(&self) -> Option<AbortReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.reason
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub(crate) fn error(&self) -> Vdv453Error {
        Vdv453Error::Canceled(self.reason().unwrap_or(AbortReason::Shutdown))
    }

    /// `Err(Vdv453Error::Canceled(_))` if this token has been cancelled
    pub fn check(&self) -> Result<(), Vdv453Error> {
        if self.is_cancelled() {
            return Err(self.error());
        }
        Ok(())
    }
}
