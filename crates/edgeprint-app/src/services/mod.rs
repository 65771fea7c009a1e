// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: locates the data directory and wires the engine together
// from the edgeprint-print components.

pub mod data_dir;
pub mod engine;
