// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod append;
pub mod channel;
pub mod client;
pub mod config;
pub mod constants;
pub mod credential;
pub mod discovery;
pub mod errors;
pub mod http;
pub mod orchestrator;
pub mod record;
pub mod retry;
pub mod sinks;
pub mod source;
pub mod stats;
