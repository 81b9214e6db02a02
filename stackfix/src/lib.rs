// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Operator tooling for stackfix shared test fixtures.
//!
//! `stackfix status` inspects the state directory shared by a test run's processes,
//! `stackfix cleanup` destroys resources that were left provisioned, and `stackfix query` looks
//! values up in recorded state documents.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{OutputContext, StderrStyles};
