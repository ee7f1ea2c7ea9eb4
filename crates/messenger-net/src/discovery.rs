//! Multicast DNS advertisement and browsing.
//!
//! Publishes this instance as `DesktopMessenger-<short id>` under
//! `_desktop-messenger._tcp.local.` with `id` and `version` txt entries, and
//! turns browse results for the same service type into
//! [`DiscoveryEvent`]s. Our own record is never reported.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use messenger_shared::constants::{MDNS_SERVICE_TYPE, PROTOCOL_VERSION, SERVICE_NAME_PREFIX};
use messenger_shared::types::{now_millis, DiscoveredService, MachineId};

use crate::error::NetError;

/// Something changed on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Appeared(DiscoveredService),
    /// Carries the id learned when the service appeared.
    Disappeared { id: MachineId, name: String },
}

/// The fields of a resolved mDNS record we care about.
#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub fullname: String,
    pub id: Option<String>,
    pub version: Option<String>,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

impl ResolvedRecord {
    fn from_info(info: &ServiceInfo) -> Self {
        Self {
            fullname: info.get_fullname().to_string(),
            id: info.get_property_val_str("id").map(str::to_string),
            version: info.get_property_val_str("version").map(str::to_string),
            addresses: info.get_addresses().iter().copied().collect(),
            port: info.get_port(),
        }
    }
}

/// Maps mDNS instance names to the identities they announced.
///
/// Removal events only name the instance, so the id seen at resolve time is
/// remembered here.
#[derive(Debug)]
pub struct BrowseState {
    own_id: MachineId,
    known: HashMap<String, DiscoveredService>,
}

impl BrowseState {
    pub fn new(own_id: MachineId) -> Self {
        Self {
            own_id,
            known: HashMap::new(),
        }
    }

    pub fn on_resolved(&mut self, record: ResolvedRecord) -> Option<DiscoveryEvent> {
        let Some(id) = record.id.filter(|id| !id.is_empty()) else {
            debug!(service = %record.fullname, "Ignoring record without id");
            return None;
        };
        if id == self.own_id.as_str() {
            return None;
        }
        let Some(host) = pick_address(&record.addresses) else {
            debug!(service = %record.fullname, "Ignoring record without addresses");
            return None;
        };

        if let Some(existing) = self.known.get(&record.fullname) {
            if existing.id.as_str() == id
                && existing.matches_endpoint(&host.to_string(), record.port)
            {
                return None;
            }
        }

        let service = DiscoveredService {
            id: MachineId(id),
            name: instance_name(&record.fullname).to_string(),
            host: host.to_string(),
            port: record.port,
            version: record
                .version
                .unwrap_or_else(|| PROTOCOL_VERSION.to_string()),
            discovered_at: now_millis(),
            connected: false,
        };
        self.known.insert(record.fullname, service.clone());
        Some(DiscoveryEvent::Appeared(service))
    }

    pub fn on_removed(&mut self, fullname: &str) -> Option<DiscoveryEvent> {
        self.known
            .remove(fullname)
            .map(|service| DiscoveryEvent::Disappeared {
                id: service.id,
                name: service.name,
            })
    }
}

/// First non-loopback IPv4, otherwise whatever comes first.
fn pick_address(addresses: &[IpAddr]) -> Option<IpAddr> {
    addresses
        .iter()
        .find(|a| a.is_ipv4() && !a.is_loopback())
        .or_else(|| addresses.first())
        .copied()
}

fn instance_name(fullname: &str) -> &str {
    fullname
        .strip_suffix(MDNS_SERVICE_TYPE)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or(fullname)
}

/// Advertises our mesh endpoint and browses for others.
pub struct DiscoveryService {
    identity: MachineId,
    daemon: Option<ServiceDaemon>,
    advertised: Option<String>,
    browser: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    pub fn new(identity: MachineId) -> Self {
        Self {
            identity,
            daemon: None,
            advertised: None,
            browser: None,
        }
    }

    pub fn instance_name(&self) -> String {
        format!("{SERVICE_NAME_PREFIX}{}", self.identity.short())
    }

    fn daemon(&mut self) -> Result<&ServiceDaemon, NetError> {
        let daemon = match self.daemon.take() {
            Some(daemon) => daemon,
            None => ServiceDaemon::new()?,
        };
        Ok(&*self.daemon.insert(daemon))
    }

    /// Publish our endpoint on `port`, withdrawing any earlier record first.
    pub fn advertise(&mut self, port: u16) -> Result<(), NetError> {
        self.withdraw();

        let name = self.instance_name();
        let host = format!("{name}.local.");
        let mut properties = HashMap::new();
        properties.insert("id".to_string(), self.identity.to_string());
        properties.insert("version".to_string(), PROTOCOL_VERSION.to_string());

        let info = ServiceInfo::new(MDNS_SERVICE_TYPE, &name, &host, "", port, properties)?
            .enable_addr_auto();
        let fullname = info.get_fullname().to_string();

        self.daemon()?.register(info)?;
        info!(service = %name, port, "Advertising on the local network");
        self.advertised = Some(fullname);
        Ok(())
    }

    fn withdraw(&mut self) {
        let Some(fullname) = self.advertised.take() else {
            return;
        };
        if let Some(daemon) = &self.daemon {
            match daemon.unregister(&fullname) {
                Ok(_) => debug!(service = %fullname, "Advertisement withdrawn"),
                Err(e) => warn!(service = %fullname, error = %e, "Failed to withdraw advertisement"),
            }
        }
    }

    pub fn is_browsing(&self) -> bool {
        self.browser.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start browsing. Events stop when [`Self::stop`] is called.
    pub fn browse(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>, NetError> {
        if self.is_browsing() {
            return Err(NetError::AlreadyBrowsing);
        }

        let receiver = self.daemon()?.browse(MDNS_SERVICE_TYPE)?;
        let (tx, rx) = mpsc::channel(64);
        let mut state = BrowseState::new(self.identity.clone());

        info!(service_type = MDNS_SERVICE_TYPE, "Browsing the local network");
        self.browser = Some(tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                let mapped = match event {
                    ServiceEvent::ServiceResolved(info) => {
                        state.on_resolved(ResolvedRecord::from_info(&info))
                    }
                    ServiceEvent::ServiceRemoved(_, fullname) => state.on_removed(&fullname),
                    _ => None,
                };
                if let Some(event) = mapped {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
            debug!("Browse loop ended");
        }));
        Ok(rx)
    }

    /// Withdraw the advertisement and stop browsing.
    pub fn stop(&mut self) {
        self.withdraw();
        if let Some(browser) = self.browser.take() {
            browser.abort();
            if let Some(daemon) = &self.daemon {
                if let Err(e) = daemon.stop_browse(MDNS_SERVICE_TYPE) {
                    debug!(error = %e, "Failed to stop browsing");
                }
            }
        }
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.shutdown();
        }
    }
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("identity", &self.identity)
            .field("advertised", &self.advertised)
            .field("browsing", &self.is_browsing())
            .finish()
    }
}
