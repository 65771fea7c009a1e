// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Live registry of known printers.
//
// Discovery sources push `on_discovered` / `on_lost` events; the dispatcher
// and control surface read point-in-time copies.  Entries are keyed by a
// stable identity and updated in place, so repeated announcements never
// produce duplicates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{MetadataExt, Printer, PrinterMetadata, PrinterSource, PrinterState};

use crate::capabilities::capabilities_from_metadata;

/// Thread-safe printer registry.
#[derive(Debug, Default)]
pub struct PrinterRegistry {
    printers: RwLock<BTreeMap<String, Printer>>,
}

impl PrinterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Printer>> {
        self.printers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Printer>> {
        self.printers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Upsert a printer from an announcement.  Never fails.
    pub fn on_discovered(&self, identity: &str, metadata: PrinterMetadata) {
        let now = Utc::now();
        let state = metadata
            .text("state")
            .map(|hint| PrinterState::from_hint(&hint))
            .unwrap_or(PrinterState::Online);

        let mut printers = self.write();
        match printers.get_mut(identity) {
            Some(existing) => {
                let previous = existing.state;
                apply_metadata(existing, metadata);
                existing.state = state;
                existing.last_seen = now;
                if previous != state {
                    info!(printer = identity, from = ?previous, to = ?state, "printer state changed");
                } else {
                    debug!(printer = identity, "printer announcement refreshed");
                }
            }
            None => {
                let mut printer = Printer {
                    identity: identity.to_string(),
                    display_name: identity.to_string(),
                    uri: None,
                    location: None,
                    make_and_model: None,
                    source: PrinterSource::Network,
                    capabilities: Default::default(),
                    metadata: PrinterMetadata::new(),
                    state,
                    last_seen: now,
                    last_error: None,
                };
                apply_metadata(&mut printer, metadata);
                info!(printer = identity, state = ?state, source = ?printer.source, "printer discovered");
                printers.insert(identity.to_string(), printer);
            }
        }
    }

    /// Mark a printer unreachable.  The entry stays until swept.
    pub fn on_lost(&self, identity: &str) {
        let mut printers = self.write();
        if let Some(printer) = printers.get_mut(identity) {
            if printer.state != PrinterState::Offline {
                info!(printer = identity, "printer lost");
            }
            printer.state = PrinterState::Offline;
        } else {
            debug!(printer = identity, "loss reported for unknown printer");
        }
    }

    /// Remove printers not seen for longer than `stale_after`.
    pub fn sweep(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<String> {
        let threshold = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        let mut printers = self.write();
        let stale: Vec<String> = printers
            .values()
            .filter(|p| now.signed_duration_since(p.last_seen) > threshold)
            .map(|p| p.identity.clone())
            .collect();
        for identity in &stale {
            printers.remove(identity);
            info!(printer = %identity, "stale printer removed");
        }
        stale
    }

    /// Snapshot of every printer, ordered by identity.
    pub fn list(&self) -> Vec<Printer> {
        self.read().values().cloned().collect()
    }

    pub fn get(&self, identity: &str) -> Result<Printer> {
        self.read()
            .get(identity)
            .cloned()
            .ok_or_else(|| EdgePrintError::PrinterNotFound(identity.to_string()))
    }

    /// Current state of every printer, taken under a single read lock.
    pub fn reachability(&self) -> HashMap<String, PrinterState> {
        self.read()
            .iter()
            .map(|(identity, p)| (identity.clone(), p.state))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

/// Refresh derived fields from the latest announcement.
fn apply_metadata(printer: &mut Printer, metadata: PrinterMetadata) {
    if let Some(name) = metadata.text("display-name") {
        printer.display_name = name;
    }
    if let Some(uri) = metadata.text("uri") {
        printer.uri = Some(uri);
    }
    if let Some(location) = metadata.text("location") {
        printer.location = Some(location);
    }
    if let Some(model) = metadata.text("make-and-model") {
        printer.make_and_model = Some(model);
    }
    if let Some(source) = metadata.text("source") {
        printer.source = if source.eq_ignore_ascii_case("local") {
            PrinterSource::Local
        } else {
            PrinterSource::Network
        };
    }
    printer.last_error = metadata.text("error");
    printer.capabilities = capabilities_from_metadata(&metadata);
    printer.metadata = metadata;
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeprint_core::types::MetaValue;

    fn meta(pairs: &[(&str, &str)]) -> PrinterMetadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), MetaValue::from(*v)))
            .collect()
    }

    #[test]
    fn announcement_creates_online_entry() {
        let registry = PrinterRegistry::new();
        registry.on_discovered(
            "P1",
            meta(&[("display-name", "Front desk"), ("color", "T"), ("source", "local")]),
        );

        let printer = registry.get("P1").expect("present");
        assert_eq!(printer.state, PrinterState::Online);
        assert_eq!(printer.display_name, "Front desk");
        assert_eq!(printer.source, PrinterSource::Local);
        assert_eq!(printer.capabilities.color, Some(true));
    }

    #[test]
    fn last_event_wins_without_duplicates() {
        let registry = PrinterRegistry::new();
        registry.on_discovered("P1", PrinterMetadata::new());
        registry.on_discovered("P2", PrinterMetadata::new());
        registry.on_lost("P1");
        registry.on_discovered("P2", meta(&[("state", "printing")]));
        registry.on_lost("P2");
        registry.on_discovered("P1", PrinterMetadata::new());

        let printers = registry.list();
        assert_eq!(printers.len(), 2);
        assert_eq!(printers[0].identity, "P1");
        assert_eq!(printers[0].state, PrinterState::Online);
        assert_eq!(printers[1].state, PrinterState::Offline);
    }

    #[test]
    fn lost_printer_is_kept_but_unreachable() {
        let registry = PrinterRegistry::new();
        registry.on_discovered("P1", PrinterMetadata::new());
        registry.on_lost("P1");
        registry.on_lost("ghost");

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.reachability().get("P1"), Some(&PrinterState::Offline));
    }

    #[test]
    fn state_hint_applies_to_new_entries() {
        let registry = PrinterRegistry::new();
        registry.on_discovered("P1", meta(&[("state", "disabled")]));
        registry.on_discovered("P2", meta(&[("state", "stopped"), ("error", "paper-jam")]));

        assert_eq!(registry.get("P1").expect("P1").state, PrinterState::Offline);
        let p2 = registry.get("P2").expect("P2");
        assert_eq!(p2.state, PrinterState::Error);
        assert_eq!(p2.last_error.as_deref(), Some("paper-jam"));
    }

    #[test]
    fn sweep_removes_only_stale_entries() {
        let registry = PrinterRegistry::new();
        registry.on_discovered("old", PrinterMetadata::new());
        registry.on_discovered("fresh", PrinterMetadata::new());

        let later = Utc::now() + chrono::Duration::seconds(400);
        registry.on_discovered("fresh", PrinterMetadata::new());
        {
            let mut printers = registry.write();
            if let Some(p) = printers.get_mut("fresh") {
                p.last_seen = later - chrono::Duration::seconds(10);
            }
        }

        let removed = registry.sweep(later, Duration::from_secs(300));
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(registry.get("old").is_err());
        assert!(registry.get("fresh").is_ok());
    }

    #[test]
    fn unknown_identity_is_not_found() {
        let registry = PrinterRegistry::new();
        assert!(matches!(
            registry.get("nope"),
            Err(EdgePrintError::PrinterNotFound(name)) if name == "nope"
        ));
        assert!(registry.is_empty());
    }
}
