/// Register map for the server role and cache for the master role
///
/// The map is the local data the device exposes to external masters. Every
/// entry is created by a range registration and lives for the rest of the
/// process; there is no removal. Each entry may carry a handler that is
/// invoked with `(address, value)` on every remote read or write and returns
/// the value actually reported or stored.
///
/// Single-bit kinds store `0` or `1`.
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{BusError, BusResult};
use crate::protocol::SlaveId;
use crate::utils::validation;

/// Register handler invoked as `(register_address, value) -> value`
pub type RegisterHandler = Arc<dyn Fn(u16, u16) -> u16 + Send + Sync>;

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl RegisterKind {
    /// Single-bit table
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Table a remote master may write
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }

    fn normalize(self, value: u16) -> u16 {
        if self.is_bit() {
            u16::from(value != 0)
        } else {
            value
        }
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            RegisterKind::Coil => "coil",
            RegisterKind::DiscreteInput => "discrete input",
            RegisterKind::InputRegister => "input register",
            RegisterKind::HoldingRegister => "holding register",
        };
        f.write_str(name)
    }
}

/// One addressable register or bit
#[derive(Clone)]
pub struct RegisterEntry {
    pub address: u16,
    pub kind: RegisterKind,
    pub value: u16,
    on_read: Option<RegisterHandler>,
    on_write: Option<RegisterHandler>,
}

impl RegisterEntry {
    fn new(kind: RegisterKind, address: u16, handler: Option<RegisterHandler>) -> Self {
        // Read-only tables only see reads
        let on_write = if kind.is_writable() { handler.clone() } else { None };
        Self {
            address,
            kind,
            value: 0,
            on_read: handler,
            on_write,
        }
    }

    pub fn has_handler(&self) -> bool {
        self.on_read.is_some() || self.on_write.is_some()
    }
}

impl fmt::Debug for RegisterEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RegisterEntry")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("on_read", &self.on_read.is_some())
            .field("on_write", &self.on_write.is_some())
            .finish()
    }
}

type EntryTable = BTreeMap<(RegisterKind, u16), RegisterEntry>;

/// Server-side register table
///
/// Clones share the same table, so the application can keep a handle to push
/// locally measured values while the channel serves them.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    entries: Arc<RwLock<EntryTable>>,
}

impl RegisterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `count` consecutive addresses of one kind
    ///
    /// All-or-nothing: if any address in the range is already registered the
    /// call fails with `RegistrationConflict` and the table is left untouched.
    pub fn insert_range(
        &self,
        kind: RegisterKind,
        start: u16,
        count: u16,
        handler: Option<RegisterHandler>,
    ) -> BusResult<()> {
        if count == 0 {
            return Err(BusError::invalid_data("Register range cannot be empty"));
        }
        validation::validate_address_range(start, count)?;

        let mut entries = self.write_lock()?;
        if let Some(address) = (start..=start + (count - 1)).find(|a| entries.contains_key(&(kind, *a))) {
            return Err(BusError::registration_conflict(kind, address));
        }
        for address in start..=start + (count - 1) {
            entries.insert((kind, address), RegisterEntry::new(kind, address, handler.clone()));
        }
        Ok(())
    }

    pub fn contains(&self, kind: RegisterKind, address: u16) -> bool {
        self.entries
            .read()
            .map(|entries| entries.contains_key(&(kind, address)))
            .unwrap_or(false)
    }

    /// Check that every address of a range is registered
    pub fn contains_range(&self, kind: RegisterKind, start: u16, count: u16) -> bool {
        if validation::validate_address_range(start, count).is_err() {
            return false;
        }
        match self.entries.read() {
            Ok(entries) => (start..=start + (count - 1)).all(|a| entries.contains_key(&(kind, a))),
            Err(_) => false,
        }
    }

    /// Snapshot of one entry
    pub fn entry(&self, kind: RegisterKind, address: u16) -> Option<RegisterEntry> {
        self.entries.read().ok()?.get(&(kind, address)).cloned()
    }

    /// Stored value without invoking any handler
    pub fn value(&self, kind: RegisterKind, address: u16) -> Option<u16> {
        self.entries.read().ok()?.get(&(kind, address)).map(|e| e.value)
    }

    /// Update a stored value locally (sensor refresh), bypassing handlers
    pub fn set_value(&self, kind: RegisterKind, address: u16, value: u16) -> BusResult<()> {
        let mut entries = self.write_lock()?;
        let entry = entries
            .get_mut(&(kind, address))
            .ok_or_else(|| BusError::invalid_address(address, 1))?;
        entry.value = kind.normalize(value);
        Ok(())
    }

    /// Remote read of one address, through the read handler
    pub fn read(&self, kind: RegisterKind, address: u16) -> BusResult<u16> {
        let (stored, handler) = {
            let entries = self.read_lock()?;
            let entry = entries
                .get(&(kind, address))
                .ok_or_else(|| BusError::invalid_address(address, 1))?;
            (entry.value, entry.on_read.clone())
        };

        let Some(handler) = handler else {
            return Ok(stored);
        };
        // Handler runs without the lock held so it may use the map itself
        let value = kind.normalize(handler(address, stored));
        self.store(kind, address, value)?;
        Ok(value)
    }

    /// Remote read of a range; fails before invoking any handler if a hole exists
    pub fn read_range(&self, kind: RegisterKind, start: u16, count: u16) -> BusResult<Vec<u16>> {
        if !self.contains_range(kind, start, count) {
            return Err(BusError::invalid_address(start, count));
        }
        (0..count).map(|i| self.read(kind, start + i)).collect()
    }

    /// Remote write of one address, through the write handler
    ///
    /// Returns the value that was stored.
    pub fn write(&self, kind: RegisterKind, address: u16, value: u16) -> BusResult<u16> {
        if !kind.is_writable() {
            return Err(BusError::invalid_data(format!("{} table is read-only", kind)));
        }
        let handler = {
            let entries = self.read_lock()?;
            let entry = entries
                .get(&(kind, address))
                .ok_or_else(|| BusError::invalid_address(address, 1))?;
            entry.on_write.clone()
        };

        let value = kind.normalize(value);
        let stored = match handler {
            Some(handler) => kind.normalize(handler(address, value)),
            None => value,
        };
        self.store(kind, address, stored)?;
        Ok(stored)
    }

    /// Remote write of a range; nothing is written if a hole exists
    pub fn write_range(&self, kind: RegisterKind, start: u16, values: &[u16]) -> BusResult<()> {
        let count = values.len() as u16;
        if values.len() > u16::MAX as usize || !self.contains_range(kind, start, count) {
            return Err(BusError::invalid_address(start, count));
        }
        for (i, &value) in values.iter().enumerate() {
            self.write(kind, start + i as u16, value)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register map statistics
    pub fn get_stats(&self) -> RegisterMapStats {
        let mut stats = RegisterMapStats::default();
        if let Ok(entries) = self.entries.read() {
            for ((kind, _), entry) in entries.iter() {
                if entry.has_handler() {
                    stats.handler_count += 1;
                }
                match kind {
                    RegisterKind::Coil => stats.coils_count += 1,
                    RegisterKind::DiscreteInput => stats.discrete_inputs_count += 1,
                    RegisterKind::InputRegister => stats.input_registers_count += 1,
                    RegisterKind::HoldingRegister => stats.holding_registers_count += 1,
                }
            }
        }
        stats
    }

    fn store(&self, kind: RegisterKind, address: u16, value: u16) -> BusResult<()> {
        let mut entries = self.write_lock()?;
        if let Some(entry) = entries.get_mut(&(kind, address)) {
            entry.value = value;
        }
        Ok(())
    }

    fn read_lock(&self) -> BusResult<std::sync::RwLockReadGuard<'_, EntryTable>> {
        self.entries
            .read()
            .map_err(|_| BusError::internal("Failed to lock register map"))
    }

    fn write_lock(&self) -> BusResult<std::sync::RwLockWriteGuard<'_, EntryTable>> {
        self.entries
            .write()
            .map_err(|_| BusError::internal("Failed to lock register map"))
    }
}

/// Register map statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterMapStats {
    pub coils_count: usize,
    pub discrete_inputs_count: usize,
    pub holding_registers_count: usize,
    pub input_registers_count: usize,
    /// Entries backed by a callback
    pub handler_count: usize,
}

/// Last value read from a remote slave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CachedRegister {
    pub value: u16,
    /// Clock time of the last successful read
    pub updated_at_ms: u64,
    /// Set when the latest poll of this address timed out
    pub stale: bool,
}

/// Master-side cache of remote registers keyed by `(slave, kind, address)`
///
/// A failed poll never zeroes a value; it only flags it stale.
#[derive(Debug, Clone, Default)]
pub struct RemoteCache {
    values: HashMap<(SlaveId, RegisterKind, u16), CachedRegister>,
}

impl RemoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, slave: SlaveId, kind: RegisterKind, start: u16, values: &[u16], now_ms: u64) {
        for (i, &value) in values.iter().enumerate() {
            let address = start.wrapping_add(i as u16);
            self.values.insert(
                (slave, kind, address),
                CachedRegister {
                    value: kind.normalize(value),
                    updated_at_ms: now_ms,
                    stale: false,
                },
            );
        }
    }

    /// Flag already cached addresses of a range as stale
    pub fn mark_stale(&mut self, slave: SlaveId, kind: RegisterKind, start: u16, count: u16) {
        for i in 0..count {
            if let Some(cached) = self.values.get_mut(&(slave, kind, start.wrapping_add(i))) {
                cached.stale = true;
            }
        }
    }

    pub fn get(&self, slave: SlaveId, kind: RegisterKind, address: u16) -> Option<CachedRegister> {
        self.values.get(&(slave, kind, address)).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};

    #[test]
    fn test_insert_and_read_range() {
        let map = RegisterMap::new();
        map.insert_range(RegisterKind::HoldingRegister, 70, 2, None).unwrap();
        map.set_value(RegisterKind::HoldingRegister, 71, 1234).unwrap();

        assert_eq!(map.read_range(RegisterKind::HoldingRegister, 70, 2).unwrap(), vec![0, 1234]);
        assert!(map.read_range(RegisterKind::HoldingRegister, 70, 3).is_err());
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_overlap_is_all_or_nothing() {
        let map = RegisterMap::new();
        let first: RegisterHandler = Arc::new(|_, _| 11);
        map.insert_range(RegisterKind::InputRegister, 20, 4, Some(first)).unwrap();

        let second: RegisterHandler = Arc::new(|_, _| 99);
        let err = map
            .insert_range(RegisterKind::InputRegister, 18, 4, Some(second))
            .unwrap_err();
        assert_eq!(err, BusError::registration_conflict(RegisterKind::InputRegister, 20));

        // 18 and 19 were not committed, 20 still answers through the first handler
        assert!(!map.contains(RegisterKind::InputRegister, 18));
        assert!(!map.contains(RegisterKind::InputRegister, 19));
        assert_eq!(map.read(RegisterKind::InputRegister, 20).unwrap(), 11);
    }

    #[test]
    fn test_same_address_different_kind_is_independent() {
        let map = RegisterMap::new();
        map.insert_range(RegisterKind::Coil, 10, 8, None).unwrap();
        map.insert_range(RegisterKind::DiscreteInput, 10, 8, None).unwrap();
        let stats = map.get_stats();
        assert_eq!(stats.coils_count, 8);
        assert_eq!(stats.discrete_inputs_count, 8);
        assert_eq!(stats.handler_count, 0);
    }

    #[test]
    fn test_write_handler_receives_address_and_value() {
        let map = RegisterMap::new();
        let seen = Arc::new(AtomicU16::new(0));
        let seen_clone = Arc::clone(&seen);
        let handler: RegisterHandler = Arc::new(move |address, value| {
            seen_clone.store(address, Ordering::SeqCst);
            value.min(4095)
        });
        map.insert_range(RegisterKind::HoldingRegister, 70, 2, Some(handler)).unwrap();

        assert_eq!(map.write(RegisterKind::HoldingRegister, 71, 5000).unwrap(), 4095);
        assert_eq!(seen.load(Ordering::SeqCst), 71);
        assert_eq!(map.value(RegisterKind::HoldingRegister, 71), Some(4095));
    }

    #[test]
    fn test_coils_are_normalized_and_inputs_read_only() {
        let map = RegisterMap::new();
        map.insert_range(RegisterKind::Coil, 0, 1, None).unwrap();
        map.insert_range(RegisterKind::InputRegister, 0, 1, None).unwrap();

        assert_eq!(map.write(RegisterKind::Coil, 0, 0xFF00).unwrap(), 1);
        assert!(map.write(RegisterKind::InputRegister, 0, 1).is_err());
    }

    #[test]
    fn test_remote_cache_keeps_value_when_stale() {
        let mut cache = RemoteCache::new();
        cache.update(2, RegisterKind::HoldingRegister, 0, &[10, 11], 100);
        cache.mark_stale(2, RegisterKind::HoldingRegister, 0, 3);

        let cached = cache.get(2, RegisterKind::HoldingRegister, 1).unwrap();
        assert_eq!(cached.value, 11);
        assert_eq!(cached.updated_at_ms, 100);
        assert!(cached.stale);
        assert!(cache.get(2, RegisterKind::HoldingRegister, 2).is_none());
    }
}
