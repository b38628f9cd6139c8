// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Data models for the application.

pub mod account;
pub mod event;
pub mod macros;
pub mod subscription;

pub use account::{Account, ConnectionState, LinkRequest, StoredCredential};
pub use event::{EventDelta, EventSummary, ResponseStatus, TrackedEvent};
pub use macros::{Macro, MacroScope};
pub use subscription::{RetiredChannel, Subscription};
