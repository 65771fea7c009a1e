// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Discovery sources feeding the printer registry.
//
// `MdnsDiscovery` browses for `_ipp._tcp.local.` and `_ipps._tcp.local.` with
// the `mdns-sd` crate; resolved services become `on_discovered` calls keyed
// by the mDNS instance name.  A printer announced over both service types is
// lost only when both are withdrawn.  `LocalScan` asks the active backend for
// installed queues.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use edgeprint_core::error::{EdgePrintError, Result};
use edgeprint_core::types::{MetaValue, PrinterMetadata};

use crate::backend::PrintBackend;
use crate::registry::PrinterRegistry;

/// mDNS service type for plain IPP.
const IPP_SERVICE: &str = "_ipp._tcp.local.";

/// mDNS service type for TLS-secured IPP.
const IPPS_SERVICE: &str = "_ipps._tcp.local.";

/// Network printer discovery over mDNS-SD.
///
/// Each browsed service type gets a listener thread that drains the daemon's
/// event channel into the registry until browsing stops.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    registry: Arc<PrinterRegistry>,
    browsing: bool,
}

impl MdnsDiscovery {
    /// Start the mDNS daemon thread; browsing begins with [`start`](Self::start).
    pub fn new(registry: Arc<PrinterRegistry>) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| EdgePrintError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
        Ok(Self {
            daemon,
            registry,
            browsing: false,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        if self.browsing {
            debug!("mDNS discovery already running");
            return Ok(());
        }

        let live = Arc::new(Mutex::new(LiveServices::default()));
        for (service_type, tls) in [(IPP_SERVICE, false), (IPPS_SERVICE, true)] {
            let receiver = self
                .daemon
                .browse(service_type)
                .map_err(|e| EdgePrintError::Discovery(format!("browse {service_type}: {e}")))?;
            spawn_listener(
                service_type,
                tls,
                receiver,
                Arc::clone(&self.registry),
                Arc::clone(&live),
            )?;
        }

        self.browsing = true;
        info!("mDNS printer discovery started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.browsing {
            return Ok(());
        }
        for service_type in [IPP_SERVICE, IPPS_SERVICE] {
            self.daemon
                .stop_browse(service_type)
                .map_err(|e| EdgePrintError::Discovery(format!("stop browse {service_type}: {e}")))?;
        }
        self.browsing = false;
        info!("mDNS printer discovery stopped");
        Ok(())
    }

    /// Shut the daemon down; the instance cannot be reused.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()?;
        let _status_rx = self
            .daemon
            .shutdown()
            .map_err(|e| EdgePrintError::Discovery(format!("daemon shutdown: {e}")))?;
        info!("mDNS daemon shut down");
        Ok(())
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }
}

fn spawn_listener(
    service_type: &'static str,
    tls: bool,
    receiver: mdns_sd::Receiver<ServiceEvent>,
    registry: Arc<PrinterRegistry>,
    live: Arc<Mutex<LiveServices>>,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("mdns-{service_type}"))
        .spawn(move || {
            // Ends when browsing stops or the daemon shuts down.
            while let Ok(event) = receiver.recv() {
                match event {
                    ServiceEvent::SearchStarted(stype) => {
                        debug!(service_type = %stype, "mDNS search started");
                    }
                    ServiceEvent::ServiceFound(stype, fullname) => {
                        debug!(service_type = %stype, name = %fullname, "service found");
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        let identity = instance_name(info.get_fullname(), service_type);
                        let metadata = service_info_metadata(&info, &identity, tls);
                        debug!(printer = %identity, keys = metadata.len(), "printer resolved");
                        live.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .announce(&registry, &identity, service_type, metadata);
                    }
                    ServiceEvent::ServiceRemoved(stype, fullname) => {
                        let identity = instance_name(&fullname, &stype);
                        debug!(printer = %identity, service_type, "printer withdrawn");
                        live.lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .withdraw(&registry, &identity, service_type);
                    }
                    ServiceEvent::SearchStopped(stype) => {
                        debug!(service_type = %stype, "mDNS search stopped");
                        break;
                    }
                }
            }
        })
        .map_err(|e| EdgePrintError::Discovery(format!("spawn mDNS listener: {e}")))?;
    Ok(())
}

/// Latest announcement per printer and service type.
#[derive(Debug, Default)]
pub struct LiveServices {
    announced: HashMap<String, BTreeMap<String, PrinterMetadata>>,
}

impl LiveServices {
    /// Record an announcement and pass it to the registry.
    pub fn announce(
        &mut self,
        registry: &PrinterRegistry,
        identity: &str,
        service_type: &str,
        metadata: PrinterMetadata,
    ) {
        self.announced
            .entry(identity.to_string())
            .or_default()
            .insert(service_type.to_string(), metadata.clone());
        registry.on_discovered(identity, metadata);
    }

    /// Record a withdrawal.  While another service type still announces the
    /// printer its announcement is restored; otherwise the printer is lost.
    pub fn withdraw(&mut self, registry: &PrinterRegistry, identity: &str, service_type: &str) {
        let remaining = self.announced.get_mut(identity).and_then(|types| {
            types.remove(service_type);
            types.values().next_back().cloned()
        });
        match remaining {
            Some(metadata) => {
                debug!(printer = identity, service_type, "still announced over another service type");
                registry.on_discovered(identity, metadata);
            }
            None => {
                self.announced.remove(identity);
                registry.on_lost(identity);
            }
        }
    }
}

/// `Office Laser._ipp._tcp.local.` → `Office Laser`.
pub fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .filter(|s| !s.is_empty())
        .unwrap_or(fullname)
        .to_string()
}

fn service_info_metadata(info: &ServiceInfo, identity: &str, tls: bool) -> PrinterMetadata {
    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();
    // Prefer IPv4 for wider printer compatibility.
    let address = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied();
    announcement_metadata(identity, &txt, address, info.get_port(), tls)
}

/// Registry metadata for one mDNS announcement.
///
/// TXT keys are kept as announced (lookups are case-insensitive).  Derived:
///   - `display-name` / `make-and-model` from `ty`
///   - `location` from `note`
///   - `uri` from the address, port and `rp` resource path
pub fn announcement_metadata(
    identity: &str,
    txt: &HashMap<String, String>,
    address: Option<IpAddr>,
    port: u16,
    tls: bool,
) -> PrinterMetadata {
    let mut meta: PrinterMetadata = txt
        .iter()
        .map(|(k, v)| (k.clone(), MetaValue::from(v.as_str())))
        .collect();
    let get = |key: &str| {
        txt.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    };

    let model = get("ty").or_else(|| get("product").map(|p| p.trim_matches(['(', ')'])));
    meta.insert(
        "display-name".into(),
        MetaValue::from(model.unwrap_or(identity)),
    );
    if let Some(model) = model {
        meta.insert("make-and-model".into(), MetaValue::from(model));
    }
    if let Some(note) = get("note") {
        meta.insert("location".into(), MetaValue::from(note));
    }
    meta.insert("source".into(), MetaValue::from("network"));
    meta.insert("port".into(), MetaValue::Number(f64::from(port)));

    if let Some(ip) = address {
        let host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let scheme = if tls { "ipps" } else { "ipp" };
        let path = get("rp").unwrap_or("ipp/print").trim_start_matches('/');
        meta.insert("address".into(), MetaValue::from(ip.to_string()));
        meta.insert(
            "uri".into(),
            MetaValue::from(format!("{scheme}://{host}:{port}/{path}")),
        );
    }
    meta
}

/// Periodic scan of queues installed in the host print subsystem.
#[derive(Debug, Default)]
pub struct LocalScan {
    seen: BTreeSet<String>,
}

impl LocalScan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce every installed queue and report queues that disappeared
    /// since the previous scan.  Returns the number of queues found.
    pub async fn scan<B: PrintBackend>(&mut self, backend: &B, registry: &PrinterRegistry) -> Result<usize> {
        let printers = backend.list_printers().await?;
        let current: BTreeSet<String> = printers.iter().map(|p| p.name.clone()).collect();

        for printer in &printers {
            registry.on_discovered(&printer.name, printer.to_metadata());
        }
        for gone in self.seen.difference(&current) {
            info!(printer = %gone, backend = backend.name(), "local queue disappeared");
            registry.on_lost(gone);
        }

        if current.len() != self.seen.len() {
            debug!(count = current.len(), backend = backend.name(), "local queues scanned");
        }
        self.seen = current;
        Ok(printers.len())
    }
}

/// Run one local scan, logging instead of failing.
pub async fn scan_logged<B: PrintBackend>(scan: &mut LocalScan, backend: &B, registry: &PrinterRegistry) {
    if let Err(e) = scan.scan(backend, registry).await {
        warn!(backend = backend.name(), error = %e, "local printer scan failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalPrinter;
    use crate::backend::fake::FakeBackend;
    use edgeprint_core::types::{MetadataExt, PrinterCapabilities, PrinterSource, PrinterState};

    fn txt(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn local(name: &str) -> LocalPrinter {
        LocalPrinter {
            name: name.into(),
            display_name: name.into(),
            state: PrinterState::Online,
            location: None,
            make_and_model: None,
            uri: None,
            capabilities: PrinterCapabilities::default(),
        }
    }

    #[test]
    fn instance_name_strips_service_type() {
        assert_eq!(instance_name("Office Laser._ipp._tcp.local.", IPP_SERVICE), "Office Laser");
        assert_eq!(instance_name("Odd", IPP_SERVICE), "Odd");
    }

    #[test]
    fn announcement_builds_uri_and_capabilities() {
        let props = txt(&[
            ("ty", "HP LaserJet M404"),
            ("note", "Lab 2"),
            ("rp", "ipp/print"),
            ("Color", "F"),
            ("Duplex", "T"),
        ]);
        let meta = announcement_metadata(
            "HP LaserJet M404 [A1B2C3]",
            &props,
            Some("192.168.1.40".parse().expect("ip")),
            631,
            false,
        );
        assert_eq!(meta.text("uri").as_deref(), Some("ipp://192.168.1.40:631/ipp/print"));
        assert_eq!(meta.text("location").as_deref(), Some("Lab 2"));
        assert_eq!(meta.text("display-name").as_deref(), Some("HP LaserJet M404"));
        assert_eq!(meta.flag("color"), Some(false));
        assert_eq!(meta.flag("duplex"), Some(true));
    }

    #[test]
    fn announcement_without_address_has_no_uri() {
        let meta = announcement_metadata("Bare", &txt(&[]), None, 631, true);
        assert!(meta.text("uri").is_none());
        assert_eq!(meta.text("display-name").as_deref(), Some("Bare"));

        let v6 = announcement_metadata("V6", &txt(&[]), Some("fe80::1".parse().expect("ip")), 443, true);
        assert_eq!(v6.text("uri").as_deref(), Some("ipps://[fe80::1]:443/ipp/print"));
    }

    #[test]
    fn announcement_registers_network_printer() {
        let registry = PrinterRegistry::new();
        let meta = announcement_metadata("Lobby", &txt(&[("ty", "Brother HL")]), None, 631, false);
        registry.on_discovered("Lobby", meta);
        let printer = registry.get("Lobby").expect("registered");
        assert_eq!(printer.source, PrinterSource::Network);
        assert_eq!(printer.make_and_model.as_deref(), Some("Brother HL"));
    }

    #[test]
    fn printer_survives_withdrawal_of_one_service_type() {
        let registry = PrinterRegistry::new();
        let mut live = LiveServices::default();
        let ip = Some("10.0.0.5".parse().expect("ip"));
        live.announce(
            &registry,
            "Lobby",
            IPP_SERVICE,
            announcement_metadata("Lobby", &txt(&[]), ip, 631, false),
        );
        live.announce(
            &registry,
            "Lobby",
            IPPS_SERVICE,
            announcement_metadata("Lobby", &txt(&[]), ip, 443, true),
        );
        assert_eq!(
            registry.get("Lobby").expect("lobby").uri.as_deref(),
            Some("ipps://10.0.0.5:443/ipp/print")
        );

        live.withdraw(&registry, "Lobby", IPPS_SERVICE);
        let printer = registry.get("Lobby").expect("lobby");
        assert_eq!(printer.state, PrinterState::Online);
        assert_eq!(printer.uri.as_deref(), Some("ipp://10.0.0.5:631/ipp/print"));

        live.withdraw(&registry, "Lobby", IPP_SERVICE);
        assert_eq!(registry.get("Lobby").expect("lobby").state, PrinterState::Offline);

        // Withdrawals for printers never announced are ignored.
        live.withdraw(&registry, "Elsewhere", IPP_SERVICE);
        assert!(registry.get("Elsewhere").is_err());
    }

    #[tokio::test]
    async fn local_scan_announces_and_loses_queues() {
        let backend = FakeBackend::new();
        let registry = PrinterRegistry::new();
        let mut scan = LocalScan::new();

        backend.set_printers(vec![local("Office"), local("Photo")]);
        assert_eq!(scan.scan(&backend, &registry).await.expect("scan"), 2);
        assert_eq!(registry.get("Office").expect("office").source, PrinterSource::Local);
        assert_eq!(registry.get("Photo").expect("photo").state, PrinterState::Online);

        backend.set_printers(vec![local("Office")]);
        assert_eq!(scan.scan(&backend, &registry).await.expect("scan"), 1);
        assert_eq!(registry.get("Photo").expect("photo").state, PrinterState::Offline);
        assert_eq!(registry.get("Office").expect("office").state, PrinterState::Online);
    }
}
