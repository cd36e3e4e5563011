//! Key Rotation
//!
//! Rotates the key-encryption-key for an encrypted OSD: the new key lands
//! in LUKS slot 0, slot 1 briefly carries the old key so a crash mid-way
//! leaves the device openable with either. A device left in the dual-key
//! state is tolerated by the next rotation.

use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::kms::Kms;
use base64::Engine;
use rand::RngCore;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

const KEY_BYTES: usize = 32;

/// Generate fresh key material.
pub fn generate_key() -> String {
    let mut bytes = [0u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Scratch directory holding key files during a rotation. Removed on every
/// exit path.
struct KeyScratch {
    dir: PathBuf,
}

impl KeyScratch {
    async fn new() -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("key-rotate-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    async fn write(&self, name: &str, key: &str) -> Result<PathBuf> {
        let path = self.dir.join(name);
        tokio::fs::write(&path, key).await?;
        Ok(path)
    }
}

impl Drop for KeyScratch {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!("failed to clean key scratch {}: {}", self.dir.display(), e);
        }
    }
}

/// Rotate the KEK for `key` across `devices`.
///
/// 1. Fetch the current key.
/// 2. Add it to slot 1 on every device (idempotent).
/// 3. Generate a new key; replace slot 0 with it.
/// 4. Update the KMS record, then re-read and compare.
/// 5. Drop the old key from slot 1.
pub async fn rotate_key(
    kms: &dyn Kms,
    executor: &dyn Executor,
    key: &str,
    devices: &[String],
) -> Result<String> {
    let current = kms.get(key).await?.ok_or_else(|| Error::Kms {
        provider: kms.provider_name().to_string(),
        reason: format!("no existing key for {key}"),
    })?;

    let scratch = KeyScratch::new().await?;
    let current_file = scratch.write("current", &current).await?;

    for device in devices {
        add_key_slot(executor, device, &current_file, &current_file, 1).await?;
    }

    let new_key = generate_key();
    let new_file = scratch.write("new", &new_key).await?;

    for device in devices {
        kill_slot(executor, device, &current_file, 0).await;
        add_key_slot(executor, device, &current_file, &new_file, 0).await?;
    }

    kms.update(key, &new_key).await?;

    // Guard against a partial KMS write: what we read back must be what we
    // just stored, or the devices and the KMS disagree.
    let stored = kms.get(key).await?.unwrap_or_default();
    if stored != new_key {
        return Err(Error::Kms {
            provider: kms.provider_name().to_string(),
            reason: format!("post-rotation readback mismatch for {key}"),
        });
    }

    for device in devices {
        kill_slot(executor, device, &new_file, 1).await;
    }

    info!("rotated key {} across {} device(s)", key, devices.len());
    Ok(new_key)
}

/// Add a key to a specific slot, authenticating with an existing key file.
/// A slot already carrying a key is accepted as done.
async fn add_key_slot(
    executor: &dyn Executor,
    device: &str,
    auth_file: &Path,
    new_key_file: &Path,
    slot: u8,
) -> Result<()> {
    let args = vec![
        "luksAddKey".to_string(),
        "--key-file".to_string(),
        auth_file.display().to_string(),
        "--key-slot".to_string(),
        slot.to_string(),
        device.to_string(),
        new_key_file.display().to_string(),
    ];
    match executor.execute("cryptsetup", &args).await {
        Ok(_) => Ok(()),
        Err(Error::CommandFailed { stderr, .. }) if stderr.contains("in use") => {
            debug!("slot {} on {} already populated", slot, device);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Clear a slot, tolerating an already-empty one.
async fn kill_slot(executor: &dyn Executor, device: &str, auth_file: &Path, slot: u8) {
    let args = vec![
        "luksKillSlot".to_string(),
        "--key-file".to_string(),
        auth_file.display().to_string(),
        device.to_string(),
        slot.to_string(),
    ];
    if let Err(e) = executor.execute("cryptsetup", &args).await {
        debug!("luksKillSlot {} on {}: {}", slot, device, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::test_support::MockExecutor;
    use crate::kms::test_support::MemoryKms;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    /// Emulated LUKS slot table, keyed by slot number.
    type Slots = Arc<Mutex<BTreeMap<u8, String>>>;

    /// Responds to cryptsetup by mutating an in-memory slot table, reading
    /// key material from the key files the rotation writes.
    fn luks_responder(slots: Slots) -> impl Fn(&str, &[String]) -> crate::error::Result<String> {
        move |_cmd, args: &[String]| {
            let read = |path: &str| std::fs::read_to_string(path).unwrap();
            match args[0].as_str() {
                "luksAddKey" => {
                    let auth = read(&args[2]);
                    let slot: u8 = args[4].parse().unwrap();
                    let new_key = read(&args[6]);
                    let mut table = slots.lock();
                    if !table.values().any(|k| *k == auth) && !table.is_empty() {
                        return Err(Error::CommandFailed {
                            command: "cryptsetup luksAddKey".into(),
                            status: 1,
                            stderr: "No key available with this passphrase.".into(),
                        });
                    }
                    if table.contains_key(&slot) {
                        return Err(Error::CommandFailed {
                            command: "cryptsetup luksAddKey".into(),
                            status: 1,
                            stderr: format!("Key slot {slot} is in use."),
                        });
                    }
                    table.insert(slot, new_key);
                    Ok(String::new())
                }
                "luksKillSlot" => {
                    let slot: u8 = args[4].parse().unwrap();
                    slots.lock().remove(&slot);
                    Ok(String::new())
                }
                other => panic!("unexpected cryptsetup action {other}"),
            }
        }
    }

    fn seeded_slots(key: &str) -> Slots {
        let slots: Slots = Arc::new(Mutex::new(BTreeMap::new()));
        slots.lock().insert(0, key.to_string());
        slots
    }

    #[tokio::test]
    async fn test_rotation_leaves_single_fresh_slot() {
        let kms = MemoryKms::with_key("k1", "K_old");
        let slots = seeded_slots("K_old");
        let exec = MockExecutor::new(luks_responder(slots.clone()));

        let new_key = rotate_key(
            kms.as_ref(),
            &exec,
            "k1",
            &["/dev/sda1".to_string()],
        )
        .await
        .unwrap();

        assert_ne!(new_key, "K_old");
        assert_eq!(kms.get("k1").await.unwrap().unwrap(), new_key);

        // Exactly one active slot, slot 0, carrying the new key.
        let table = slots.lock();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&0).unwrap(), &new_key);
    }

    #[tokio::test]
    async fn test_rotation_spans_multiple_devices() {
        let kms = MemoryKms::with_key("k1", "K_old");
        let sda = seeded_slots("K_old");
        let sdb = seeded_slots("K_old");
        let sda2 = sda.clone();
        let sdb2 = sdb.clone();

        let exec = MockExecutor::new(move |cmd, args: &[String]| {
            let slots = if args.iter().any(|a| a.contains("sda")) {
                sda2.clone()
            } else {
                sdb2.clone()
            };
            luks_responder(slots)(cmd, args)
        });

        let new_key = rotate_key(
            kms.as_ref(),
            &exec,
            "k1",
            &["/dev/sda1".to_string(), "/dev/sdb1".to_string()],
        )
        .await
        .unwrap();

        for slots in [sda, sdb] {
            let table = slots.lock();
            assert_eq!(table.len(), 1);
            assert_eq!(table.get(&0).unwrap(), &new_key);
        }
    }

    #[tokio::test]
    async fn test_missing_key_aborts() {
        let kms = MemoryKms::default();
        let exec = MockExecutor::ok();
        let err = rotate_key(&kms, &exec, "k1", &["/dev/sda1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Kms { .. }));
        assert_eq!(exec.call_count(), 0);
    }

    #[test]
    fn test_generated_keys_are_unique() {
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
        assert!(a.len() > KEY_BYTES);
    }
}
