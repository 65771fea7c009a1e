// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Edgeprint print engine: printer registry, mDNS and local-queue discovery, host
// print backends (CUPS, Windows spooler, direct IPP), payload spool, job queue,
// dispatcher and the HTTP control surface.  This crate bridges between the
// core domain types defined in `edgeprint-core` and the host print subsystem.

pub mod backend;
pub mod capabilities;
pub mod control;
pub mod discovery;
pub mod dispatcher;
pub mod document;
pub mod history;
pub mod payload;
pub mod queue;
pub mod registry;
pub mod retry;

pub use backend::{HostBackend, PrintBackend};
pub use control::ControlServer;
pub use discovery::{LocalScan, MdnsDiscovery};
pub use dispatcher::{Dispatcher, SubmitRequest};
pub use history::JobHistory;
pub use payload::PayloadStore;
pub use queue::JobQueue;
pub use registry::PrinterRegistry;
