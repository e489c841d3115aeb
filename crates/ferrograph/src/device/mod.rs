//! Device inventory and exclusive acquisition.
//!
//! Hardware devices share attach slots with the multi-IPU groups that contain
//! them, so attaching a group takes every member IPU at once. A session takes
//! a [`DeviceLease`] on a hardware device and is its only user until the lease
//! drops. CPU, IPU-model and simulator devices are created on demand, are
//! always available and may be shared between sessions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::env;
use crate::error::{Error, Result};

pub const DEFAULT_TILES_PER_IPU: u32 = 1216;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Cpu,
    IpuModel,
    Sim,
    Ipu,
}

impl DeviceType {
    /// Name of the execution backend serving this device type.
    pub fn backend_name(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::IpuModel => "ipu-model",
            DeviceType::Sim => "sim",
            DeviceType::Ipu => "ipu",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.backend_name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SyncPattern {
    #[default]
    Full,
    /// Alternating execution across IPU pairs. Needs an even IPU count.
    PingPong,
}

impl SyncPattern {
    fn accepts(&self, num_ipus: u32) -> bool {
        match self {
            SyncPattern::Full => true,
            SyncPattern::PingPong => num_ipus % 2 == 0,
        }
    }
}

/// A device handle. Identity and capability never change after creation;
/// only the attach state does.
pub struct DeviceInfo {
    device_type: DeviceType,
    id: u32,
    num_ipus: u32,
    tiles_per_ipu: u32,
    version: String,
    driver_ids: Vec<u32>,
    compile_ipu_code: bool,
    /// Per-IPU holder, `0` when free, else the holding device's id plus one.
    slots: Arc<[AtomicU64]>,
    members: Vec<usize>,
    leased: AtomicBool,
}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInfo")
            .field("type", &self.device_type)
            .field("id", &self.id)
            .field("num_ipus", &self.num_ipus)
            .field("tiles_per_ipu", &self.tiles_per_ipu)
            .field("attached", &self.is_attached())
            .field("leased", &self.is_leased())
            .finish()
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device Type:{} Id:{} Version:{} NumIPUs:{} NumTilesPerIPU:{}",
            self.device_type, self.id, self.version, self.num_ipus, self.tiles_per_ipu
        )
    }
}

impl DeviceInfo {
    fn standalone(device_type: DeviceType, id: u32, num_ipus: u32, tiles_per_ipu: u32) -> Self {
        let version = match device_type {
            DeviceType::Cpu => "cpu",
            DeviceType::IpuModel => "ipu1-model",
            DeviceType::Sim => "ipu1-sim",
            DeviceType::Ipu => "ipu1",
        };
        DeviceInfo {
            device_type,
            id,
            num_ipus,
            tiles_per_ipu,
            version: version.to_string(),
            driver_ids: Vec::new(),
            compile_ipu_code: device_type != DeviceType::Cpu,
            slots: Arc::from(vec![AtomicU64::new(0)]),
            members: vec![0],
            leased: AtomicBool::new(false),
        }
    }

    fn holder(&self) -> u64 {
        u64::from(self.id) + 1
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn num_ipus(&self) -> u32 {
        self.num_ipus
    }

    pub fn tiles_per_ipu(&self) -> u32 {
        self.tiles_per_ipu
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn driver_ids(&self) -> &[u32] {
        &self.driver_ids
    }

    pub fn compile_ipu_code(&self) -> bool {
        self.compile_ipu_code
    }

    pub fn supports_profiling(&self) -> bool {
        self.device_type != DeviceType::Cpu
    }

    /// Whether compiled engines for this device may be cached on disk.
    pub fn supports_engine_caching(&self) -> bool {
        self.device_type != DeviceType::Cpu
    }

    /// Capability string folded into engine cache keys.
    pub fn capability_key(&self) -> String {
        format!(
            "{}:{}:{}x{}",
            self.device_type, self.version, self.num_ipus, self.tiles_per_ipu
        )
    }

    /// Hardware devices serve one session at a time.
    pub fn is_exclusive(&self) -> bool {
        self.device_type == DeviceType::Ipu
    }

    /// Whether every member IPU is held by this device.
    pub fn is_attached(&self) -> bool {
        let holder = self.holder();
        self.members
            .iter()
            .all(|&m| self.slots[m].load(Ordering::Acquire) == holder)
    }

    pub fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    /// Claims every member IPU. Either all are taken or none are.
    pub fn attach(&self) -> bool {
        let holder = self.holder();
        for (taken, &member) in self.members.iter().enumerate() {
            let claimed = self.slots[member]
                .compare_exchange(0, holder, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if !claimed {
                self.release_slots(&self.members[..taken]);
                return false;
            }
        }
        tracing::debug!(target: "ferrograph::device", device = %self, "attached");
        true
    }

    /// Releases the member IPUs this device holds. A device leased by a
    /// session stays attached until the lease drops.
    pub fn detach(&self) -> bool {
        if self.is_leased() {
            tracing::warn!(
                target: "ferrograph::device",
                id = self.id,
                "detach ignored: device is leased by a session"
            );
            return false;
        }
        self.release_slots(&self.members);
        tracing::debug!(target: "ferrograph::device", id = self.id, "detached");
        true
    }

    fn release_slots(&self, members: &[usize]) {
        let holder = self.holder();
        for &member in members {
            let _ = self.slots[member].compare_exchange(
                holder,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Takes the device for one session, attaching it first when needed.
    /// Shareable devices hand out no lease.
    pub fn lease(self: &Arc<Self>) -> Result<Option<DeviceLease>> {
        if !self.is_exclusive() {
            if !self.is_attached() {
                self.attach();
            }
            return Ok(None);
        }
        if self
            .leased
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::DeviceUnavailable(format!(
                "Device {} is in use by another session",
                self.id
            )));
        }
        if !self.is_attached() && !self.attach() {
            self.leased.store(false, Ordering::Release);
            return Err(Error::DeviceUnavailable(format!(
                "Device {} is attached to another device",
                self.id
            )));
        }
        tracing::debug!(target: "ferrograph::device", id = self.id, "leased");
        Ok(Some(DeviceLease {
            device: Arc::clone(self),
        }))
    }
}

/// Exclusive use of a hardware device. Dropping the lease detaches it.
#[derive(Debug)]
pub struct DeviceLease {
    device: Arc<DeviceInfo>,
}

impl DeviceLease {
    pub fn device(&self) -> &Arc<DeviceInfo> {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.device.release_slots(&self.device.members);
        self.device.leased.store(false, Ordering::Release);
        tracing::debug!(target: "ferrograph::device", id = self.device.id, "lease released");
    }
}

/// Inventory of hardware devices plus factories for the always-available ones.
pub struct DeviceManager {
    hardware: Vec<Arc<DeviceInfo>>,
}

static GLOBAL_MANAGER: Lazy<DeviceManager> =
    Lazy::new(|| DeviceManager::with_hardware(env::hw_device_count(), DEFAULT_TILES_PER_IPU));

impl DeviceManager {
    /// Process-wide manager. Its hardware count comes from `FERROGRAPH_HW_DEVICES`.
    pub fn global() -> &'static DeviceManager {
        &GLOBAL_MANAGER
    }

    /// Builds a rack of `count` single IPUs followed by aligned groups of
    /// 2, 4, 8... IPUs, numbered consecutively.
    pub fn with_hardware(count: usize, tiles_per_ipu: u32) -> Self {
        let slots: Arc<[AtomicU64]> = (0..count).map(|_| AtomicU64::new(0)).collect();
        let mut hardware = Vec::new();
        let mut size = 1usize;
        while size <= count {
            for start in (0..=count - size).step_by(size) {
                let members: Vec<usize> = (start..start + size).collect();
                hardware.push(Arc::new(DeviceInfo {
                    device_type: DeviceType::Ipu,
                    id: hardware.len() as u32,
                    num_ipus: size as u32,
                    tiles_per_ipu,
                    version: "ipu1".to_string(),
                    driver_ids: members.iter().map(|&m| m as u32).collect(),
                    compile_ipu_code: true,
                    slots: Arc::clone(&slots),
                    members,
                    leased: AtomicBool::new(false),
                }));
            }
            size *= 2;
        }
        DeviceManager { hardware }
    }

    /// Lazily lists hardware devices matching the request, attached or not.
    pub fn enumerate_devices(
        &self,
        pattern: SyncPattern,
        replication_factor: u32,
        num_ipus: u32,
        device_type: DeviceType,
    ) -> impl Iterator<Item = Arc<DeviceInfo>> + '_ {
        let wanted = num_ipus.saturating_mul(replication_factor.max(1));
        self.hardware
            .iter()
            .filter(move |d| d.device_type == device_type && d.num_ipus == wanted)
            .filter(move |d| pattern.accepts(d.num_ipus))
            .cloned()
    }

    /// Attaches the first free hardware device matching the request.
    /// `tiles_per_ipu == 0` accepts any tile count.
    pub fn acquire_available_device(
        &self,
        num_ipus: u32,
        tiles_per_ipu: u32,
        pattern: SyncPattern,
        replication_factor: u32,
    ) -> Option<Arc<DeviceInfo>> {
        self.enumerate_devices(pattern, replication_factor, num_ipus, DeviceType::Ipu)
            .filter(|d| tiles_per_ipu == 0 || d.tiles_per_ipu == tiles_per_ipu)
            .find(|d| d.attach())
    }

    pub fn acquire_device_by_id(&self, id: u32) -> Result<Arc<DeviceInfo>> {
        let device = self
            .hardware
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| Error::config(format!("No device with id {id}")))?;
        if !device.attach() {
            return Err(Error::DeviceUnavailable(format!(
                "Failed to acquire device with id '{id}': it is already attached"
            )));
        }
        Ok(Arc::clone(device))
    }

    pub fn create_cpu_device(&self) -> Arc<DeviceInfo> {
        Self::created(DeviceInfo::standalone(DeviceType::Cpu, 0, 1, 1))
    }

    /// Accepted keys: `compileIPUCode`, `numIPUs`, `tilesPerIPU`.
    pub fn create_ipu_model_device(
        &self,
        options: &BTreeMap<String, String>,
    ) -> Result<Arc<DeviceInfo>> {
        let mut compile_ipu_code = true;
        let mut num_ipus = 1;
        let mut tiles_per_ipu = DEFAULT_TILES_PER_IPU;
        for (key, value) in options {
            match key.as_str() {
                "compileIPUCode" => compile_ipu_code = parse_option(key, value)?,
                "numIPUs" => num_ipus = parse_option(key, value)?,
                "tilesPerIPU" => tiles_per_ipu = parse_option(key, value)?,
                _ => return Err(Error::config(format!("Unrecognised option '{key}'"))),
            }
        }
        let mut device = DeviceInfo::standalone(DeviceType::IpuModel, 0, num_ipus, tiles_per_ipu);
        device.compile_ipu_code = compile_ipu_code;
        Ok(Self::created(device))
    }

    /// Accepted keys: `numIPUs`, `tilesPerIPU`.
    pub fn create_sim_device(&self, options: &BTreeMap<String, String>) -> Result<Arc<DeviceInfo>> {
        let mut num_ipus = 1;
        let mut tiles_per_ipu = DEFAULT_TILES_PER_IPU;
        for (key, value) in options {
            match key.as_str() {
                "numIPUs" => num_ipus = parse_option(key, value)?,
                "tilesPerIPU" => tiles_per_ipu = parse_option(key, value)?,
                _ => return Err(Error::config(format!("Unrecognised option '{key}'"))),
            }
        }
        Ok(Self::created(DeviceInfo::standalone(
            DeviceType::Sim,
            0,
            num_ipus,
            tiles_per_ipu,
        )))
    }

    fn created(device: DeviceInfo) -> Arc<DeviceInfo> {
        device.attach();
        Arc::new(device)
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::config(format!("Invalid value '{value}' for device option '{key}'"))
    })
}
