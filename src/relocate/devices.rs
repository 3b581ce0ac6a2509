use std::collections::HashMap;

pub type DeviceConfig = HashMap<String, String>;
pub type DeviceMap = HashMap<String, DeviceConfig>;

/// The effective root disk: a disk device mounted at `/`.
pub fn root_disk_device(devices: &DeviceMap) -> Option<(String, DeviceConfig)> {
    devices
        .iter()
        .find(|(_, config)| {
            config.get("type").map(String::as_str) == Some("disk")
                && config.get("path").map(String::as_str) == Some("/")
        })
        .map(|(name, config)| (name.clone(), config.clone()))
}

/// Prepares an instance's local devices for a pool or project move.
///
/// When the instance has no local root disk, the move may land in a project
/// whose profiles supply a different pool or size than the effective one. In
/// that case the effective root disk is materialized into the local devices,
/// preserving today's behavior; the pool override is applied afterwards
/// either way.
pub fn prepare_root_disk_for_move(
    local: &mut DeviceMap,
    expanded: &DeviceMap,
    target_pool: Option<&str>,
    target_profile_root: Option<&DeviceConfig>,
) -> Result<(), String> {
    let effective = root_disk_device(expanded)
        .ok_or_else(|| "instance has no root disk device".to_string())?;

    let local_root = root_disk_device(local);

    if local_root.is_none() {
        let differs = match target_profile_root {
            Some(profile_root) => {
                profile_root.get("pool") != effective.1.get("pool")
                    || profile_root.get("size") != effective.1.get("size")
            }
            // Without profile knowledge, any explicit pool override that
            // diverges from the effective pool needs the device pinned down.
            None => target_pool
                .map(|p| Some(p) != effective.1.get("pool").map(String::as_str))
                .unwrap_or(false),
        };
        if differs {
            local.insert(effective.0.clone(), effective.1.clone());
        }
    }

    if let Some(pool) = target_pool {
        if let Some((name, _)) = root_disk_device(local) {
            if let Some(config) = local.get_mut(&name) {
                config.insert("pool".to_string(), pool.to_string());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(pool: &str, size: Option<&str>) -> DeviceConfig {
        let mut config = HashMap::new();
        config.insert("type".to_string(), "disk".to_string());
        config.insert("path".to_string(), "/".to_string());
        config.insert("pool".to_string(), pool.to_string());
        if let Some(size) = size {
            config.insert("size".to_string(), size.to_string());
        }
        config
    }

    #[test]
    fn finds_root_disk_among_devices() {
        let mut devices = DeviceMap::new();
        let mut nic = DeviceConfig::new();
        nic.insert("type".to_string(), "nic".to_string());
        devices.insert("eth0".to_string(), nic);
        devices.insert("root".to_string(), disk("local", None));

        let (name, config) = root_disk_device(&devices).unwrap();
        assert_eq!(name, "root");
        assert_eq!(config.get("pool").unwrap(), "local");
    }

    #[test]
    fn local_root_disk_gets_pool_override() {
        let mut local = DeviceMap::new();
        local.insert("root".to_string(), disk("local", None));
        let mut expanded = local.clone();
        expanded.insert("root".to_string(), disk("local", None));

        prepare_root_disk_for_move(&mut local, &expanded, Some("fast"), None).unwrap();
        assert_eq!(local["root"]["pool"], "fast");
    }

    #[test]
    fn profile_root_disk_is_materialized_when_target_differs() {
        let mut local = DeviceMap::new();
        let mut expanded = DeviceMap::new();
        expanded.insert("root".to_string(), disk("local", Some("10GiB")));

        let profile_root = disk("other", Some("20GiB"));
        prepare_root_disk_for_move(&mut local, &expanded, Some("fast"), Some(&profile_root))
            .unwrap();

        // The effective disk was pinned into local devices, then overridden.
        assert_eq!(local["root"]["pool"], "fast");
        assert_eq!(local["root"]["size"], "10GiB");
    }

    #[test]
    fn matching_profiles_leave_local_devices_untouched() {
        let mut local = DeviceMap::new();
        let mut expanded = DeviceMap::new();
        expanded.insert("root".to_string(), disk("local", Some("10GiB")));

        let profile_root = disk("local", Some("10GiB"));
        prepare_root_disk_for_move(&mut local, &expanded, None, Some(&profile_root)).unwrap();
        assert!(local.is_empty());
    }

    #[test]
    fn missing_root_disk_is_an_error() {
        let mut local = DeviceMap::new();
        let expanded = DeviceMap::new();
        assert!(prepare_root_disk_for_move(&mut local, &expanded, None, None).is_err());
    }
}
