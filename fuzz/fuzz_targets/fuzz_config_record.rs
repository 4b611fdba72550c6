//! Fuzz target: persisted settings records
//!
//! Plants arbitrary bytes under every component key and verifies:
//! - No panics while decoding
//! - `load` yields either `None` or settings that pass `validate()`
//! - A record that loads re-encodes and loads back identically
//!
//! cargo fuzz run fuzz_config_record

#![no_main]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use homenode::app::ports::{StorageError, StoragePort};
use homenode::config::{
    storage_key, BatterySettings, ConfigStore, ExchangeSettings, Persisted, SystemSettings,
    CONFIG_NAMESPACE,
};
use libfuzzer_sys::fuzz_target;

// ── In-memory StoragePort for fuzz testing ────────────────────

#[derive(Default)]
struct MemStore {
    data: HashMap<String, Vec<u8>>,
}

impl StoragePort for MemStore {
    fn read(&self, ns: &str, key: &str, buf: &mut [u8]) -> Result<usize, StorageError> {
        let v = self
            .data
            .get(&format!("{ns}::{key}"))
            .ok_or(StorageError::NotFound)?;
        if v.len() > buf.len() {
            return Err(StorageError::IoError);
        }
        buf[..v.len()].copy_from_slice(v);
        Ok(v.len())
    }

    fn write(&mut self, ns: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        self.data.insert(format!("{ns}::{key}"), data.to_vec());
        Ok(())
    }

    fn delete(&mut self, ns: &str, key: &str) -> Result<(), StorageError> {
        self.data.remove(&format!("{ns}::{key}"));
        Ok(())
    }

    fn exists(&self, ns: &str, key: &str) -> bool {
        self.data.contains_key(&format!("{ns}::{key}"))
    }
}

fn check<T: Persisted + PartialEq + core::fmt::Debug>(store: &ConfigStore, name: &str) {
    let Some(loaded) = store.load::<T>(name) else {
        return;
    };
    assert!(loaded.validate().is_ok(), "'{name}' loaded invalid settings");
    store.save(name, &loaded).expect("valid settings must save");
    assert_eq!(store.load::<T>(name), Some(loaded));
}

fuzz_target!(|data: &[u8]| {
    let mem = Rc::new(RefCell::new(MemStore::default()));
    for name in ["dataExchanger", "batteryMonitor", "systemMonitor"] {
        let _ = mem
            .borrow_mut()
            .write(CONFIG_NAMESPACE, storage_key(name), data);
    }
    let store = ConfigStore::new(mem);

    check::<ExchangeSettings>(&store, "dataExchanger");
    check::<BatterySettings>(&store, "batteryMonitor");
    check::<SystemSettings>(&store, "systemMonitor");
});
