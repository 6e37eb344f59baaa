// MIT License - Copyright (c) 2026 zway-core contributors
// Device / instance / command class registry on top of the data tree

use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::data::callback::CallbackList;
use crate::data::{CallbackArg, DataTree, HolderId};
use crate::error::{Result, ZWayError};
use crate::job::queue::NodeState;

bitflags! {
    /// Device change events, also used as the subscription mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceChangeType: u32 {
        const DEVICE_ADDED       = 0x01;
        const DEVICE_REMOVED     = 0x02;
        const INSTANCE_ADDED     = 0x04;
        const INSTANCE_REMOVED   = 0x08;
        const COMMAND_ADDED      = 0x10;
        const COMMAND_REMOVED    = 0x20;
        /// On registration, replay "added" events for everything present
        const ENUMERATE_EXISTING = 0x200;
    }
}

/// Receiver of device change events.
pub trait DeviceCallback: Send + Sync {
    fn on_device_change(
        &self,
        change: DeviceChangeType,
        node_id: u8,
        instance_id: u8,
        command_id: u8,
        arg: &CallbackArg,
    );
}

impl<F> DeviceCallback for F
where
    F: Fn(DeviceChangeType, u8, u8, u8, &CallbackArg) + Send + Sync,
{
    fn on_device_change(
        &self,
        change: DeviceChangeType,
        node_id: u8,
        instance_id: u8,
        command_id: u8,
        arg: &CallbackArg,
    ) {
        self(change, node_id, instance_id, command_id, arg)
    }
}

pub type DeviceCallbackRef = Arc<dyn DeviceCallback>;

/// Wrap a closure as a [`DeviceCallbackRef`].
pub fn device_callback<F>(f: F) -> DeviceCallbackRef
where
    F: Fn(DeviceChangeType, u8, u8, u8, &CallbackArg) + Send + Sync + 'static,
{
    Arc::new(f)
}

type Event = (DeviceChangeType, u8, u8, u8);

/// The `devices.<node>.instances.<instance>.commandClasses.<cc>` part of
/// the data tree, plus `controller.data`.
pub struct Devices {
    tree: Arc<DataTree>,
    callbacks: Mutex<CallbackList<dyn DeviceCallback, DeviceChangeType>>,
}

impl Devices {
    pub fn new(tree: Arc<DataTree>) -> Self {
        Self { tree, callbacks: Mutex::new(CallbackList::new()) }
    }

    pub fn tree(&self) -> &Arc<DataTree> {
        &self.tree
    }

    fn numeric_children(&self, holder: HolderId) -> Result<Vec<u8>> {
        let mut ids: Vec<u8> = self
            .tree
            .children(holder)?
            .filter_map(|c| self.tree.name(c).ok()?.parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn device_holder(&self, node_id: u8) -> Result<HolderId> {
        self.tree
            .find_existing(self.tree.root(), &format!("devices.{}", node_id))?
            .ok_or_else(|| ZWayError::invalid_arg(format!("device {} not found", node_id)))
    }

    fn instance_holder(&self, node_id: u8, instance_id: u8) -> Result<HolderId> {
        let device = self.device_holder(node_id)?;
        self.tree
            .find_existing(device, &format!("instances.{}", instance_id))?
            .ok_or_else(|| {
                ZWayError::invalid_arg(format!("instance {}:{} not found", node_id, instance_id))
            })
    }

    fn command_holder(&self, node_id: u8, instance_id: u8, command_id: u8) -> Result<HolderId> {
        let instance = self.instance_holder(node_id, instance_id)?;
        self.tree
            .find_existing(instance, &format!("commandClasses.{}", command_id))?
            .ok_or_else(|| {
                ZWayError::invalid_arg(format!(
                    "command class {:#04x} not found on {}:{}",
                    command_id, node_id, instance_id
                ))
            })
    }

    fn create_instance(&self, device: HolderId, instance_id: u8) -> Result<HolderId> {
        let instance = self.tree.find(device, &format!("instances.{}", instance_id))?;
        self.tree.find(instance, "data")?;
        self.tree.find(instance, "commandClasses")?;
        Ok(instance)
    }

    // --- Registry ---

    /// Register a node. Instance 0 is created with it. Adding a known node
    /// is a no-op.
    pub fn add_device(&self, node_id: u8) -> Result<HolderId> {
        let created = {
            let _lock = self.tree.lock();
            let path = format!("devices.{}", node_id);
            match self.tree.find_existing(self.tree.root(), &path)? {
                Some(device) => return Ok(device),
                None => {
                    let device = self.tree.find(self.tree.root(), &path)?;
                    let data = self.tree.find(device, "data")?;
                    let id = self.tree.find(data, "nodeId")?;
                    self.tree.set_int(id, i32::from(node_id))?;
                    self.tree.set_read_only(id, true)?;
                    self.create_instance(device, 0)?;
                    device
                }
            }
        };
        info!("Device {} added", node_id);
        self.fire(&[(DeviceChangeType::DEVICE_ADDED, node_id, 0, 0)]);
        Ok(created)
    }

    /// Remove a node with everything below it. Removal events fire for each
    /// command class and instance before the device itself.
    pub fn remove_device(&self, node_id: u8) -> Result<()> {
        let mut events = Vec::new();
        {
            let _lock = self.tree.lock();
            let device = self.device_holder(node_id)?;
            let instances = self.tree.find(device, "instances")?;
            for instance_id in self.numeric_children(instances)? {
                events.extend(self.instance_removal_events(node_id, instance_id)?);
            }
            events.push((DeviceChangeType::DEVICE_REMOVED, node_id, 0, 0));
            let devices = self.tree.find(self.tree.root(), "devices")?;
            self.tree.remove_child(devices, device)?;
        }
        info!("Device {} removed", node_id);
        self.fire(&events);
        Ok(())
    }

    fn instance_removal_events(&self, node_id: u8, instance_id: u8) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = self
            .command_classes_list(node_id, instance_id)?
            .into_iter()
            .map(|cc| (DeviceChangeType::COMMAND_REMOVED, node_id, instance_id, cc))
            .collect();
        if instance_id != 0 {
            events.push((DeviceChangeType::INSTANCE_REMOVED, node_id, instance_id, 0));
        }
        Ok(events)
    }

    pub fn add_instance(&self, node_id: u8, instance_id: u8) -> Result<HolderId> {
        let holder = {
            let _lock = self.tree.lock();
            let device = self.device_holder(node_id)?;
            if let Some(existing) =
                self.tree.find_existing(device, &format!("instances.{}", instance_id))?
            {
                return Ok(existing);
            }
            self.create_instance(device, instance_id)?
        };
        debug!("Instance {}:{} added", node_id, instance_id);
        self.fire(&[(DeviceChangeType::INSTANCE_ADDED, node_id, instance_id, 0)]);
        Ok(holder)
    }

    /// Remove a multi channel instance. Instance 0 goes only with its device.
    pub fn remove_instance(&self, node_id: u8, instance_id: u8) -> Result<()> {
        if instance_id == 0 {
            return Err(ZWayError::invalid_arg("instance 0 cannot be removed on its own"));
        }
        let events = {
            let _lock = self.tree.lock();
            let instance = self.instance_holder(node_id, instance_id)?;
            let events = self.instance_removal_events(node_id, instance_id)?;
            let instances = self.tree.find(self.device_holder(node_id)?, "instances")?;
            self.tree.remove_child(instances, instance)?;
            events
        };
        debug!("Instance {}:{} removed", node_id, instance_id);
        self.fire(&events);
        Ok(())
    }

    /// Attach a command class; `supported` is false for classes the node
    /// only controls.
    pub fn add_command_class(
        &self,
        node_id: u8,
        instance_id: u8,
        command_id: u8,
        supported: bool,
    ) -> Result<HolderId> {
        let (holder, created) = {
            let _lock = self.tree.lock();
            let instance = self.instance_holder(node_id, instance_id)?;
            let path = format!("commandClasses.{}", command_id);
            let existing = self.tree.find_existing(instance, &path)?;
            let holder = self.tree.find(instance, &path)?;
            let flag = self.tree.find(holder, "data.supported")?;
            self.tree.set_bool(flag, supported)?;
            (holder, existing.is_none())
        };
        if created {
            debug!("Command class {:#04x} added on {}:{}", command_id, node_id, instance_id);
            self.fire(&[(DeviceChangeType::COMMAND_ADDED, node_id, instance_id, command_id)]);
        }
        Ok(holder)
    }

    pub fn remove_command_class(&self, node_id: u8, instance_id: u8, command_id: u8) -> Result<()> {
        {
            let _lock = self.tree.lock();
            let holder = self.command_holder(node_id, instance_id, command_id)?;
            let instance = self.instance_holder(node_id, instance_id)?;
            let parent = self.tree.find(instance, "commandClasses")?;
            self.tree.remove_child(parent, holder)?;
        }
        self.fire(&[(DeviceChangeType::COMMAND_REMOVED, node_id, instance_id, command_id)]);
        Ok(())
    }

    // --- Listing ---

    /// Known node ids in ascending order.
    pub fn devices_list(&self) -> Vec<u8> {
        match self.tree.find_existing(self.tree.root(), "devices") {
            Ok(Some(devices)) => self.numeric_children(devices).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Multi channel instances of a node; instance 0 is not listed.
    pub fn instances_list(&self, node_id: u8) -> Result<Vec<u8>> {
        let device = self.device_holder(node_id)?;
        let instances = self.tree.find(device, "instances")?;
        Ok(self.numeric_children(instances)?.into_iter().filter(|i| *i != 0).collect())
    }

    pub fn command_classes_list(&self, node_id: u8, instance_id: u8) -> Result<Vec<u8>> {
        let instance = self.instance_holder(node_id, instance_id)?;
        let classes = self.tree.find(instance, "commandClasses")?;
        self.numeric_children(classes)
    }

    /// The command class exists and its `data.supported` flag is set.
    pub fn command_is_supported(&self, node_id: u8, instance_id: u8, command_id: u8) -> bool {
        let Ok(holder) = self.command_holder(node_id, instance_id, command_id) else {
            return false;
        };
        matches!(self.tree.find_existing(holder, "data.supported"), Ok(Some(flag))
            if self.tree.get_bool(flag).unwrap_or(false))
    }

    // --- Data lookup ---

    /// Resolve (creating as needed) a path under `controller.data`.
    pub fn find_controller_data(&self, path: &str) -> Result<HolderId> {
        let data = self.tree.find(self.tree.root(), "controller.data")?;
        self.tree.find(data, path)
    }

    pub fn find_device_data(&self, node_id: u8, path: &str) -> Result<HolderId> {
        let data = self.tree.find(self.device_holder(node_id)?, "data")?;
        self.tree.find(data, path)
    }

    pub fn find_device_instance_data(
        &self,
        node_id: u8,
        instance_id: u8,
        path: &str,
    ) -> Result<HolderId> {
        let data = self.tree.find(self.instance_holder(node_id, instance_id)?, "data")?;
        self.tree.find(data, path)
    }

    pub fn find_device_instance_cc_data(
        &self,
        node_id: u8,
        instance_id: u8,
        command_id: u8,
        path: &str,
    ) -> Result<HolderId> {
        let data = self.tree.find(self.command_holder(node_id, instance_id, command_id)?, "data")?;
        self.tree.find(data, path)
    }

    /// Mirror the queue's view of a node under `devices.<n>.data`. Unknown
    /// nodes are skipped.
    pub(crate) fn mirror_node_state(&self, node_id: u8, state: NodeState) -> Result<()> {
        let _lock = self.tree.lock();
        if self.tree.find_existing(self.tree.root(), &format!("devices.{}", node_id))?.is_none() {
            return Ok(());
        }
        for (name, value) in [
            ("isListening", state.listening),
            ("isAwake", state.awake),
            ("secureSession", state.secure_session),
        ] {
            let holder = self.find_device_data(node_id, name)?;
            self.tree.set_bool(holder, value)?;
        }
        Ok(())
    }

    // --- Callbacks ---

    /// Register a device callback; a callback already registered is not
    /// added again. With `ENUMERATE_EXISTING` it immediately receives
    /// "added" events for everything already present.
    pub fn add_callback(
        &self,
        mask: DeviceChangeType,
        callback: DeviceCallbackRef,
        arg: CallbackArg,
    ) -> Result<bool> {
        let added = self.callbacks.lock().add(callback.clone(), mask, arg.clone());
        if added && mask.contains(DeviceChangeType::ENUMERATE_EXISTING) {
            self.enumerate(mask, &callback, &arg)?;
        }
        Ok(added)
    }

    /// Like [`add_callback`](Self::add_callback) but the same callback may
    /// be registered again with a different argument.
    pub fn add_callback_ex(
        &self,
        mask: DeviceChangeType,
        callback: DeviceCallbackRef,
        arg: CallbackArg,
    ) -> Result<bool> {
        let added = self.callbacks.lock().add_ex(callback.clone(), mask, arg.clone());
        if added && mask.contains(DeviceChangeType::ENUMERATE_EXISTING) {
            self.enumerate(mask, &callback, &arg)?;
        }
        Ok(added)
    }

    pub fn remove_callback(&self, callback: &DeviceCallbackRef) -> usize {
        self.callbacks.lock().remove(callback)
    }

    pub fn remove_callback_ex(&self, callback: &DeviceCallbackRef, arg: &CallbackArg) -> bool {
        self.callbacks.lock().remove_ex(callback, arg)
    }

    fn enumerate(
        &self,
        mask: DeviceChangeType,
        callback: &DeviceCallbackRef,
        arg: &CallbackArg,
    ) -> Result<()> {
        let mut events = Vec::new();
        for node_id in self.devices_list() {
            events.push((DeviceChangeType::DEVICE_ADDED, node_id, 0, 0));
            let mut instances = vec![0];
            instances.extend(self.instances_list(node_id)?);
            for instance_id in instances {
                if instance_id != 0 {
                    events.push((DeviceChangeType::INSTANCE_ADDED, node_id, instance_id, 0));
                }
                for cc in self.command_classes_list(node_id, instance_id)? {
                    events.push((DeviceChangeType::COMMAND_ADDED, node_id, instance_id, cc));
                }
            }
        }
        for (change, node_id, instance_id, command_id) in events {
            if mask.intersects(change) {
                callback.on_device_change(change, node_id, instance_id, command_id, arg);
            }
        }
        Ok(())
    }

    fn fire(&self, events: &[Event]) {
        for &(change, node_id, instance_id, command_id) in events {
            let targets = self.callbacks.lock().snapshot(|mask| mask.intersects(change));
            for (callback, arg, _) in targets {
                callback.on_device_change(change, node_id, instance_id, command_id, &arg);
            }
        }
    }
}
