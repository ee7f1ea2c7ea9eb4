//! Instance identity resolution.
//!
//! The identity is the OS machine id plus a short random suffix, so several
//! instances on one machine never collide. When the OS id cannot be read a
//! locally generated `fallback-...` id is used instead.

use std::sync::OnceLock;

use rand::Rng;
use tracing::{info, warn};

use crate::error::IdentityError;
use crate::types::{now_millis, MachineId};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Source of the OS-level stable machine identifier.
pub trait MachineIdSource: Send + Sync {
    fn machine_id(&self) -> Result<String, IdentityError>;
}

/// Reads the systemd / D-Bus machine id files.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMachineId;

impl MachineIdSource for OsMachineId {
    #[cfg(target_os = "linux")]
    fn machine_id(&self) -> Result<String, IdentityError> {
        let mut last_err = IdentityError::Empty;
        for path in ["/etc/machine-id", "/var/lib/dbus/machine-id"] {
            match std::fs::read_to_string(path) {
                Ok(raw) => {
                    let id = raw.trim();
                    if !id.is_empty() {
                        return Ok(id.to_string());
                    }
                }
                Err(e) => last_err = IdentityError::Io(e),
            }
        }
        Err(last_err)
    }

    #[cfg(not(target_os = "linux"))]
    fn machine_id(&self) -> Result<String, IdentityError> {
        Err(IdentityError::Unsupported)
    }
}

/// Resolves the process identity once and hands out the same value after.
pub struct IdentityProvider {
    source: Box<dyn MachineIdSource>,
    resolved: OnceLock<MachineId>,
}

impl IdentityProvider {
    pub fn new(source: impl MachineIdSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            resolved: OnceLock::new(),
        }
    }

    pub fn resolve(&self) -> MachineId {
        self.resolved
            .get_or_init(|| {
                let id = match self.source.machine_id() {
                    Ok(base) => format!("{base}-{}", random_base36(4)),
                    Err(e) => {
                        warn!(error = %e, "Machine id unavailable, using fallback identity");
                        fallback_id()
                    }
                };
                info!(machine_id = %id, "Resolved instance identity");
                MachineId(id)
            })
            .clone()
    }
}

impl Default for IdentityProvider {
    fn default() -> Self {
        Self::new(OsMachineId)
    }
}

fn fallback_id() -> String {
    format!("fallback-{}-{}", now_millis(), random_base36(9))
}

fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}
