//! Named device collection with channel allocation.

use std::sync::Arc;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use tsrec_protocol::ChannelAllocation;

use crate::device::{DeviceError, DeviceFactory, RecordingDevice};

/// How device names are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameComparison {
    /// Byte-wise comparison.
    #[default]
    Ordinal,
    /// Comparison ignoring case.
    OrdinalIgnoreCase,
}

impl NameComparison {
    /// Check whether two names denote the same device.
    pub fn matches(&self, left: &str, right: &str) -> bool {
        match self {
            Self::Ordinal => left == right,
            Self::OrdinalIgnoreCase => {
                left.len() == right.len() && left.to_lowercase() == right.to_lowercase()
            }
        }
    }
}

/// All devices of the recorder, in priority order.
pub struct DeviceRegistry {
    devices: RwLock<Vec<Arc<dyn RecordingDevice>>>,
    comparison: NameComparison,
}

impl DeviceRegistry {
    /// Create one device per name.
    ///
    /// Priorities are assigned in list order starting at 1.
    pub fn new(
        names: &[String],
        comparison: NameComparison,
        factory: &dyn DeviceFactory,
    ) -> Result<Self, DeviceError> {
        for (index, name) in names.iter().enumerate() {
            if names[..index]
                .iter()
                .any(|other| comparison.matches(other, name))
            {
                return Err(DeviceError::DuplicateName(name.clone()));
            }
        }

        let mut devices = Vec::with_capacity(names.len());
        for (name, priority) in names.iter().zip(1u32..) {
            let device = factory.create_device(name, priority)?;
            info!("[Registry] Device {} registered with priority {}", name, priority);
            devices.push(device);
        }

        Ok(Self {
            devices: RwLock::new(devices),
            comparison,
        })
    }

    /// Look up a device by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn RecordingDevice>> {
        self.devices
            .read()
            .await
            .iter()
            .find(|device| self.comparison.matches(device.name(), name))
            .cloned()
    }

    /// Choose the device a new recording of `channel` should run on.
    ///
    /// Only devices that can receive the channel are considered. A device
    /// already recording another channel stays a candidate only if that
    /// channel and the requested one share a source group on it. Among the
    /// remaining devices the one with the lowest priority wins.
    pub async fn allocate(
        &self,
        channel: &str,
        allocated: &[ChannelAllocation],
    ) -> Option<String> {
        let devices = self.devices.read().await;
        let mut candidates: Vec<_> = devices
            .iter()
            .filter_map(|device| device.resolve(channel).map(|sources| (device, sources)))
            .collect();

        for allocation in allocated {
            let Some(index) = candidates
                .iter()
                .position(|(device, _)| self.comparison.matches(device.name(), &allocation.card_id))
            else {
                continue;
            };
            if allocation.channel_name == channel {
                continue;
            }

            let (device, requested) = &candidates[index];
            let shareable = device
                .resolve(&allocation.channel_name)
                .is_some_and(|existing| device.can_share_source_group(requested, &existing));
            if !shareable {
                debug!(
                    "[Registry] {} busy with {}, cannot add {}",
                    device.name(),
                    allocation.channel_name,
                    channel
                );
                candidates.remove(index);
                if candidates.is_empty() {
                    return None;
                }
            }
        }

        let chosen = candidates
            .iter()
            .min_by_key(|(device, _)| device.priority())
            .map(|(device, _)| device.name().to_string());
        debug!("[Registry] Allocated {:?} for {}", chosen, channel);
        chosen
    }

    /// Snapshot of all devices in priority order.
    pub async fn devices(&self) -> Vec<Arc<dyn RecordingDevice>> {
        self.devices.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    pub fn name_comparison(&self) -> NameComparison {
        self.comparison
    }

    /// Dispose every device and empty the registry.
    pub async fn dispose(&self) {
        let devices = std::mem::take(&mut *self.devices.write().await);
        for device in devices {
            let name = device.name().to_string();
            if let Err(e) = tokio::spawn(async move { device.dispose().await }).await {
                error!("[Registry] Failed to dispose device {}: {}", name, e);
            }
        }
        info!("[Registry] All devices disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockFactory;
    use tsrec_protocol::Channel;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn allocation(card: &str, channel: &str) -> ChannelAllocation {
        ChannelAllocation::new(card, &Channel::new(channel))
    }

    #[tokio::test]
    async fn test_priorities_follow_list_order() {
        let factory = MockFactory::new(&[("X", "g1")]);
        let registry =
            DeviceRegistry::new(&names(&["A", "B", "C"]), NameComparison::Ordinal, &factory)
                .unwrap();

        let priorities: Vec<_> = registry
            .devices()
            .await
            .iter()
            .map(|d| (d.name().to_string(), d.priority()))
            .collect();
        assert_eq!(
            priorities,
            vec![("A".to_string(), 1), ("B".to_string(), 2), ("C".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn test_allocate_prefers_lowest_priority() {
        let factory = MockFactory::new(&[("X", "g1"), ("Y", "g2")]);
        let registry =
            DeviceRegistry::new(&names(&["A", "B"]), NameComparison::Ordinal, &factory).unwrap();

        assert_eq!(registry.allocate("X", &[]).await.as_deref(), Some("A"));
        assert_eq!(registry.allocate("Z", &[]).await, None);
    }

    #[tokio::test]
    async fn test_allocate_skips_device_busy_with_other_group() {
        let factory = MockFactory::new(&[("X", "g1"), ("Y", "g2"), ("X2", "g1")]);
        let registry =
            DeviceRegistry::new(&names(&["A", "B"]), NameComparison::Ordinal, &factory).unwrap();

        let busy = [allocation("A", "Y")];
        assert_eq!(registry.allocate("X", &busy).await.as_deref(), Some("B"));

        // Same multiplex can be shared
        let shared = [allocation("A", "X2")];
        assert_eq!(registry.allocate("X", &shared).await.as_deref(), Some("A"));

        // Same channel name is always compatible
        let same = [allocation("A", "X")];
        assert_eq!(registry.allocate("X", &same).await.as_deref(), Some("A"));

        let all_busy = [allocation("A", "Y"), allocation("B", "Y")];
        assert_eq!(registry.allocate("X", &all_busy).await, None);

        // Unknown devices are ignored
        let unknown = [allocation("Q", "Y")];
        assert_eq!(registry.allocate("X", &unknown).await.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_allocate_only_considers_resolving_devices() {
        let factory = MockFactory::new(&[("X", "g1")]).with_device_channels("A", &[]);
        let registry =
            DeviceRegistry::new(&names(&["A", "B"]), NameComparison::Ordinal, &factory).unwrap();

        assert_eq!(registry.allocate("X", &[]).await.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_name_comparison() {
        let factory = MockFactory::new(&[("X", "g1")]);
        let registry = DeviceRegistry::new(
            &names(&["Tuner0", "Tuner1"]),
            NameComparison::OrdinalIgnoreCase,
            &factory,
        )
        .unwrap();
        assert_eq!(registry.get("tuner1").await.unwrap().name(), "Tuner1");

        let busy = [allocation("TUNER0", "Y")];
        assert_eq!(registry.allocate("X", &busy).await.as_deref(), Some("Tuner1"));

        let ordinal =
            DeviceRegistry::new(&names(&["Tuner0"]), NameComparison::Ordinal, &factory).unwrap();
        assert!(ordinal.get("tuner0").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let factory = MockFactory::new(&[]);
        assert!(matches!(
            DeviceRegistry::new(
                &names(&["a", "A"]),
                NameComparison::OrdinalIgnoreCase,
                &factory
            ),
            Err(DeviceError::DuplicateName(name)) if name == "A"
        ));
        assert!(
            DeviceRegistry::new(&names(&["a", "A"]), NameComparison::Ordinal, &factory).is_ok()
        );
    }

    #[tokio::test]
    async fn test_dispose_clears_registry() {
        let factory = MockFactory::new(&[("X", "g1")]);
        let registry =
            DeviceRegistry::new(&names(&["A", "B"]), NameComparison::Ordinal, &factory).unwrap();

        registry.dispose().await;
        assert!(registry.is_empty().await);
        assert_eq!(factory.backend("A").unwrap().calls(), vec!["dispose"]);
        assert!(registry.allocate("X", &[]).await.is_none());
    }
}
