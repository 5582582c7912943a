//! Object lifetime ledger for debug builds.
//!
//! A process-wide map from object address to (magic tag, description,
//! accounting size). Object constructors register their inner allocation,
//! `Drop` impls unregister it; double registration, double free and
//! unknown-object updates are logged as errors. [`report_leaks`] lists every
//! object still alive, which embedders can call at shutdown.
//!
//! The ledger is the only process-wide mutable state in the crate. It is
//! compiled out entirely in release builds; in debug builds it activates when
//! the `SCORIA_OBJECT_LEDGER` environment variable is set (tests always run
//! with it active). The accounting size is the process `VmSize` delta
//! observed while constructing the object, sampled from `/proc/self/status`
//! on Linux and zero elsewhere. Freeing re-samples `VmSize` and logs an
//! error when an entry registered with a measured size does not give that
//! much back.

use crate::object::ObjectMagic;

#[cfg(debug_assertions)]
mod imp {
    use super::ObjectMagic;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    struct Entry {
        magic: ObjectMagic,
        desc: String,
        size_kb: i64,
        /// Process `VmSize` sampled when the entry was registered.
        vm_kb: i64,
    }

    static LEDGER: OnceLock<Option<Mutex<HashMap<usize, Entry>>>> = OnceLock::new();

    fn ledger() -> Option<&'static Mutex<HashMap<usize, Entry>>> {
        LEDGER
            .get_or_init(|| {
                let enabled = cfg!(test) || std::env::var_os("SCORIA_OBJECT_LEDGER").is_some();
                enabled.then(|| Mutex::new(HashMap::new()))
            })
            .as_ref()
    }

    #[cfg(target_os = "linux")]
    fn virtual_mem_kb() -> i64 {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return 0;
        };
        status
            .lines()
            .find_map(|line| line.strip_prefix("VmSize:"))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
            .unwrap_or(0)
    }

    #[cfg(not(target_os = "linux"))]
    fn virtual_mem_kb() -> i64 {
        0
    }

    pub fn track_new(key: usize, magic: ObjectMagic, desc: &str, vm_before_kb: i64) {
        let Some(ledger) = ledger() else { return };
        let vm_kb = virtual_mem_kb();
        let size_kb = if vm_before_kb != 0 {
            vm_kb - vm_before_kb
        } else {
            0
        };
        let mut map = ledger.lock().unwrap();
        if let Some(prev) = map.get(&key) {
            tracing::error!(
                key = %format_args!("{key:#x}"),
                magic = prev.magic.name(),
                desc = %prev.desc,
                "object already registered"
            );
            return;
        }
        tracing::debug!(
            key = %format_args!("{key:#x}"),
            magic = magic.name(),
            desc,
            size_kb,
            "alloc"
        );
        map.insert(
            key,
            Entry {
                magic,
                desc: desc.to_string(),
                size_kb,
                vm_kb,
            },
        );
    }

    pub fn track_drop(key: usize, magic: ObjectMagic) {
        let Some(ledger) = ledger() else { return };
        let vm_kb = virtual_mem_kb();
        let mut map = ledger.lock().unwrap();
        let Some(entry) = map.remove(&key) else {
            tracing::error!(
                key = %format_args!("{key:#x}"),
                magic = magic.name(),
                "object already free"
            );
            return;
        };
        if entry.magic != magic {
            tracing::error!(
                key = %format_args!("{key:#x}"),
                expected = entry.magic.name(),
                got = magic.name(),
                "magic tag mismatch on free"
            );
            debug_assert_eq!(entry.magic, magic);
        }
        // Accounting check: an entry registered with a measured size should
        // give that much back by the time it is freed.
        let freed_kb = entry.vm_kb - vm_kb;
        if entry.size_kb != 0 && freed_kb != entry.size_kb {
            tracing::error!(
                key = %format_args!("{key:#x}"),
                magic = entry.magic.name(),
                expected_kb = entry.size_kb,
                got_kb = freed_kb,
                "size mismatch on free"
            );
        }
        tracing::debug!(
            key = %format_args!("{key:#x}"),
            magic = entry.magic.name(),
            desc = %entry.desc,
            size_kb = entry.size_kb,
            vm_kb,
            "free"
        );
    }

    pub fn update_description(key: usize, desc: &str) {
        let Some(ledger) = ledger() else { return };
        let mut map = ledger.lock().unwrap();
        let Some(entry) = map.get_mut(&key) else {
            tracing::error!(
                key = %format_args!("{key:#x}"),
                desc,
                "description update for unknown object"
            );
            return;
        };
        entry.desc = desc.to_string();
    }

    pub fn report_leaks() -> usize {
        let Some(ledger) = ledger() else { return 0 };
        let map = ledger.lock().unwrap();
        for (key, entry) in map.iter() {
            tracing::error!(
                key = %format_args!("{key:#x}"),
                magic = entry.magic.name(),
                desc = %entry.desc,
                size_kb = entry.size_kb,
                "object not freed"
            );
        }
        map.len()
    }

    pub fn vm_snapshot_kb() -> i64 {
        if ledger().is_some() {
            virtual_mem_kb()
        } else {
            0
        }
    }

    #[cfg(test)]
    pub fn contains(key: usize) -> bool {
        ledger().is_some_and(|l| l.lock().unwrap().contains_key(&key))
    }
}

#[cfg(not(debug_assertions))]
mod imp {
    use super::ObjectMagic;

    #[inline]
    pub fn track_new(_key: usize, _magic: ObjectMagic, _desc: &str, _vm_before_kb: i64) {}
    #[inline]
    pub fn track_drop(_key: usize, _magic: ObjectMagic) {}
    #[inline]
    pub fn update_description(_key: usize, _desc: &str) {}
    #[inline]
    pub fn report_leaks() -> usize {
        0
    }
    #[inline]
    pub fn vm_snapshot_kb() -> i64 {
        0
    }
    #[cfg(test)]
    pub fn contains(_key: usize) -> bool {
        false
    }
}

pub(crate) use imp::{track_drop, track_new, update_description, vm_snapshot_kb};

/// Logs every live tracked object and returns how many there are.
///
/// Always returns 0 in release builds or when the ledger is inactive.
pub fn report_leaks() -> usize {
    imp::report_leaks()
}

#[cfg(test)]
pub(crate) use imp::contains;
