// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Middleware modules (bridge authentication, security headers).

pub mod bridge_auth;
pub mod security;

pub use bridge_auth::require_bridge_auth;
