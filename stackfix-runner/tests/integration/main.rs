// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Multi-process coordination tests. Each process is modeled as its own coordinator sharing a
//! temporary directory, the same way a master and its workers share one in a real run.

mod coordination;
mod fixtures;
