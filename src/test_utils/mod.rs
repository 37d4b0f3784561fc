use crate::auth::UserNamespace;
use crate::task::Task;
use crate::threads::{TaskConfig, TaskSet, ThreadGroup};
use anyhow::Result;
use std::sync::Arc;

// Exports
pub(crate) mod mocks;
pub(crate) use mocks::{ManualClock, SpyAddressSpace, SpyPlatform, TestInode};

/// A TaskSet with one init task in the root namespace, wired to spy
/// platform/address-space hooks.
pub(crate) struct KernelFixture {
    pub(crate) ts: Arc<TaskSet>,
    pub(crate) init_task: Arc<Task>,
    pub(crate) init_tg: Arc<ThreadGroup>,
    pub(crate) platform: Arc<SpyPlatform>,
    pub(crate) aspace: Arc<SpyAddressSpace>,
}

pub(crate) fn kernel_fixture() -> Result<KernelFixture> {
    let ts = TaskSet::new(UserNamespace::new_root());
    let platform = Arc::new(SpyPlatform::default());
    let aspace = Arc::new(SpyAddressSpace::new());

    let init_tg = ts.new_thread_group(ts.root());
    let init_task = ts.new_task(TaskConfig {
        thread_group: Arc::clone(&init_tg),
        parent: None,
        container_id: "test-container".into(),
        platform: Arc::clone(&platform) as Arc<dyn crate::platform::PlatformContext>,
        address_space: Arc::clone(&aspace) as Arc<dyn crate::platform::AddressSpace>,
    })?;

    Ok(KernelFixture {
        ts,
        init_task,
        init_tg,
        platform,
        aspace,
    })
}

impl KernelFixture {
    /// Admits a sibling task into the init thread group.
    pub(crate) fn new_sibling(&self) -> Result<Arc<Task>> {
        Ok(self.ts.new_task(TaskConfig {
            thread_group: Arc::clone(&self.init_tg),
            parent: Some(Arc::clone(&self.init_task)),
            container_id: "test-container".into(),
            platform: Arc::clone(&self.platform) as Arc<dyn crate::platform::PlatformContext>,
            address_space: Arc::clone(&self.aspace) as Arc<dyn crate::platform::AddressSpace>,
        })?)
    }

    /// Admits a child process (new thread group) of `parent`.
    pub(crate) fn new_child_process(&self, parent: &Arc<Task>) -> Result<Arc<Task>> {
        let ns = self.ts.namespace_for_children(parent);
        let tg = self.ts.new_thread_group(&ns);
        Ok(self.ts.new_task(TaskConfig {
            thread_group: tg,
            parent: Some(Arc::clone(parent)),
            container_id: parent.container_id().to_string(),
            platform: Arc::clone(&self.platform) as Arc<dyn crate::platform::PlatformContext>,
            address_space: Arc::clone(&self.aspace) as Arc<dyn crate::platform::AddressSpace>,
        })?)
    }
}
