/*!
Probe scriptée pour tests sans `adb`

Chaque appareil a un script: état de vie, contenus des trois snapshots et
latence. La probe compte les appels par opération et mesure la concurrence
maximale observée, ce qui permet de vérifier le plafond du fan-out.
*/

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use drono_kernel::commands::{CommandExecutor, CommandOutcome, CommandParams, DeviceAction};
use drono_kernel::error::ProbeError;
use drono_kernel::models::DeviceInfo;
use drono_kernel::probe::{DeviceDirectory, Probe};

/// Réponse de la sonde de vie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// Ne répond jamais; seul un timeout y met fin.
    Hang,
    /// Erreur de transport (appareil débranché).
    Fail,
}

#[derive(Debug, Clone)]
pub struct DeviceScript {
    pub liveness: Liveness,
    pub config: Option<Vec<u8>>,
    pub status: Option<Vec<u8>>,
    pub log: Option<Vec<u8>>,
}

impl DeviceScript {
    fn new(liveness: Liveness) -> Self {
        Self {
            liveness,
            config: None,
            status: None,
            log: None,
        }
    }
}

/// Probe, annuaire et exécuteur de commandes en mémoire.
pub struct MockProbe {
    devices: RwLock<BTreeMap<String, DeviceScript>>,
    latency: RwLock<Duration>,
    directory_down: AtomicBool,
    command_failures: RwLock<HashMap<DeviceAction, String>>,
    commands: Mutex<Vec<(String, DeviceAction, CommandParams)>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// Décrémente le compteur même si l'appel est annulé par un timeout.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProbe {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            latency: RwLock::new(Duration::ZERO),
            directory_down: AtomicBool::new(false),
            command_failures: RwLock::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Ajoute ou remplace un appareil.
    pub fn add_device(&self, id: &str, liveness: Liveness) -> &Self {
        self.devices
            .write()
            .insert(id.to_string(), DeviceScript::new(liveness));
        self
    }

    pub fn set_liveness(&self, id: &str, liveness: Liveness) {
        self.script(id, |s| s.liveness = liveness);
    }

    pub fn set_config(&self, id: &str, raw: Vec<u8>) {
        self.script(id, |s| s.config = Some(raw));
    }

    pub fn set_status(&self, id: &str, raw: Vec<u8>) {
        self.script(id, |s| s.status = Some(raw));
    }

    pub fn set_log(&self, id: &str, raw: Vec<u8>) {
        self.script(id, |s| s.log = Some(raw));
    }

    pub fn remove_device(&self, id: &str) {
        self.devices.write().remove(id);
    }

    /// Latence ajoutée à chaque sonde de vie.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn set_directory_down(&self, down: bool) {
        self.directory_down.store(down, Ordering::SeqCst);
    }

    pub fn fail_command(&self, action: DeviceAction, message: &str) {
        self.command_failures
            .write()
            .insert(action, message.to_string());
    }

    fn script(&self, id: &str, f: impl FnOnce(&mut DeviceScript)) {
        let mut devices = self.devices.write();
        let entry = devices
            .entry(id.to_string())
            .or_insert_with(|| DeviceScript::new(Liveness::Alive));
        f(entry);
    }

    fn get(&self, id: &str) -> Option<DeviceScript> {
        self.devices.read().get(id).cloned()
    }

    fn count(&self, op: &'static str) {
        *self.calls.lock().entry(op).or_insert(0) += 1;
    }

    /// Nombre d'appels d'une opération (`is_alive`, `config`, `status`, `log`, `list`).
    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
        self.peak.store(0, Ordering::SeqCst);
    }

    /// Sondes de vie simultanées au pic.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn executed_commands(&self) -> Vec<(String, DeviceAction, CommandParams)> {
        self.commands.lock().clone()
    }
}

impl Default for MockProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for MockProbe {
    async fn is_alive(&self, device_id: &str) -> Result<bool, ProbeError> {
        self.count("is_alive");
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match self.get(device_id).map(|s| s.liveness) {
            Some(Liveness::Alive) => Ok(true),
            Some(Liveness::Dead) => Ok(false),
            Some(Liveness::Hang) => {
                std::future::pending::<()>().await;
                Ok(false)
            }
            Some(Liveness::Fail) | None => Err(ProbeError::Exited {
                code: Some(1),
                stderr: format!("error: device '{}' not found", device_id),
            }),
        }
    }

    async fn fetch_config_snapshot(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        self.count("config");
        Ok(self.get(device_id).and_then(|s| s.config))
    }

    async fn fetch_status_snapshot(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        self.count("status");
        Ok(self.get(device_id).and_then(|s| s.status))
    }

    async fn fetch_log_tail(&self, device_id: &str) -> Result<Option<Vec<u8>>, ProbeError> {
        self.count("log");
        Ok(self.get(device_id).and_then(|s| s.log))
    }
}

#[async_trait]
impl DeviceDirectory for MockProbe {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ProbeError> {
        self.count("list");
        if self.directory_down.load(Ordering::SeqCst) {
            return Err(ProbeError::Unavailable("adb server not running".into()));
        }
        Ok(self
            .devices
            .read()
            .keys()
            .map(|id| DeviceInfo::online(id.as_str()))
            .collect())
    }
}

#[async_trait]
impl CommandExecutor for MockProbe {
    async fn execute(&self, device_id: &str, action: DeviceAction, params: &CommandParams) -> CommandOutcome {
        self.commands
            .lock()
            .push((device_id.to_string(), action, params.clone()));
        if let Some(message) = self.command_failures.read().get(&action) {
            return CommandOutcome::failed(message.clone());
        }
        CommandOutcome::ok(format!("{} sent", action))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_liveness() {
        let probe = MockProbe::new();
        probe.add_device("a", Liveness::Alive).add_device("b", Liveness::Dead);

        assert!(probe.is_alive("a").await.unwrap());
        assert!(!probe.is_alive("b").await.unwrap());
        assert!(probe.is_alive("unknown").await.is_err());
        assert_eq!(probe.calls("is_alive"), 3);
        assert_eq!(probe.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_directory_down() {
        let probe = MockProbe::new();
        probe.add_device("a", Liveness::Alive);
        assert_eq!(probe.list_devices().await.unwrap().len(), 1);

        probe.set_directory_down(true);
        assert!(probe.list_devices().await.is_err());
    }
}
