// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core library for stackfix: shares expensive provisioned resources between the worker
//! processes of a distributed test run, and tears each one down exactly once, as soon as every
//! test that uses it has finished.
//!
//! Processes coordinate purely through a shared state directory:
//!
//! * [`lock`] provides the per-resource file mutex.
//! * [`marker`] records which resources exist, and who gets to create or destroy them.
//! * [`completion`] is the append-only log of finished tests.
//! * [`dependency`] maps each shared resource to the tests that use it.
//! * [`fixture`] provisions and destroys individual resources.
//! * [`coordinator`] ties these together for one process.
//!
//! Provisioning itself is delegated to a [`provision::Provisioner`], by default one that drives
//! the `terraform` binary.

pub mod completion;
pub mod config;
pub mod coordinator;
pub mod dependency;
pub mod errors;
pub mod fixture;
pub mod identifier;
pub mod lock;
pub mod marker;
pub mod provision;
pub mod registry;
pub mod state;
