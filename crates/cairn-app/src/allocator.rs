//! Allocator hierarchy: the OS allocator, the system heap and the manager
//! that routes named allocators.
//!
//! Memory itself is served by the process's global allocator. What this
//! module models is the *configuration and ownership* of the allocator
//! instances an application sets up before anything else runs:
//!
//! - the OS allocator, which hands out accounted [`MemoryBlock`]
//!   reservations;
//! - the system allocator, whose heap may be backed by one fixed block
//!   reserved from the OS allocator;
//! - the [`AllocatorManager`], holding name remappings and at most one
//!   process-wide [`OverrideSchema`].
//!
//! All of it lives in an [`AllocatorEnvironment`] behind a
//! [`SharedAllocators`] handle so that a host (or a test) can create the
//! allocators once and reuse them across several application lifetimes. An
//! [`AllocatorHost`] records which instances it created and only ever
//! destroys those.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::{AppDescriptor, RecordingMode};
use crate::AllocatorError;

// ---------------------------------------------------------------------------
// PlatformMemory
// ---------------------------------------------------------------------------

/// Upper bound used when the platform cannot report its memory.
pub const DEFAULT_MAX_ALLOCATOR_SIZE: u64 = 256 * 1024 * 1024;

/// Reports how much memory the OS makes available to the allocators.
///
/// Only consulted when [`AppDescriptor::grab_all_memory`] is set.
pub trait PlatformMemory: Send + Sync {
    fn available_memory(&self) -> u64;
}

/// Reports a fixed amount of memory. Used on platforms without a real
/// query.
#[derive(Debug, Clone, Copy)]
pub struct FixedPlatformMemory(pub u64);

impl Default for FixedPlatformMemory {
    fn default() -> Self {
        Self(DEFAULT_MAX_ALLOCATOR_SIZE)
    }
}

impl PlatformMemory for FixedPlatformMemory {
    fn available_memory(&self) -> u64 {
        tracing::warn!(
            available = self.0,
            "platform memory cannot be queried; using a fixed maximum for grab_all_memory"
        );
        self.0
    }
}

fn align_down(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value - value % alignment
    }
}

// ---------------------------------------------------------------------------
// OsAllocator
// ---------------------------------------------------------------------------

/// Handle to a block reserved from the [`OsAllocator`].
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryBlock {
    id: u64,
    size: u64,
    alignment: u64,
}

impl MemoryBlock {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }
}

/// The root allocator. Tracks every outstanding block.
#[derive(Debug, Default)]
pub struct OsAllocator {
    live: BTreeMap<u64, u64>,
    next_id: u64,
}

impl OsAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `size` bytes. `alignment` must be a power of two.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<MemoryBlock, AllocatorError> {
        if size == 0 || (alignment != 0 && !alignment.is_power_of_two()) {
            return Err(AllocatorError::InvalidBlock { size, alignment });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id, size);
        tracing::debug!(size, alignment, "reserved OS memory block");
        Ok(MemoryBlock { id, size, alignment })
    }

    /// Release a block. Returns `false` if the block did not come from this
    /// allocator.
    pub fn deallocate(&mut self, block: MemoryBlock) -> bool {
        self.live.remove(&block.id).is_some()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.live.values().sum()
    }

    pub fn live_blocks(&self) -> usize {
        self.live.len()
    }
}

// ---------------------------------------------------------------------------
// SystemAllocator
// ---------------------------------------------------------------------------

/// Allocation record keeping configured on the system allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecords {
    pub mode: RecordingMode,
    pub stack_record_levels: u64,
    pub save_names: bool,
    pub decode_immediately: bool,
    pub auto_integrity_check: bool,
    pub mark_unallocated_memory: bool,
}

/// Heap parameters of the system allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    pub page_size: u64,
    pub pool_page_size: u64,
    pub use_pools: bool,
    /// Size of the fixed block backing the heap; 0 when allocating on demand.
    pub fixed_block_size: u64,
}

/// The general purpose heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemAllocator {
    pub heap: HeapConfig,
    pub records: Option<AllocationRecords>,
}

impl SystemAllocator {
    /// Heap and record configuration for `descriptor`, backed by a fixed
    /// block of `fixed_block_size` bytes.
    pub fn from_descriptor(descriptor: &AppDescriptor, fixed_block_size: u64) -> Self {
        let records = descriptor.allocation_records.then(|| AllocationRecords {
            mode: descriptor.recording_mode,
            stack_record_levels: descriptor.stack_record_levels,
            save_names: descriptor.allocation_records_save_names,
            decode_immediately: descriptor.allocation_records_attempt_decode_immediately,
            auto_integrity_check: descriptor.auto_integrity_check,
            mark_unallocated_memory: descriptor.mark_unallocated_memory,
        });
        Self {
            heap: HeapConfig {
                page_size: descriptor.page_size,
                pool_page_size: descriptor.pool_page_size,
                use_pools: !descriptor.do_not_use_pools,
                fixed_block_size,
            },
            records,
        }
    }
}

// ---------------------------------------------------------------------------
// AllocatorManager
// ---------------------------------------------------------------------------

/// Process-wide allocation schema that replaces every allocator's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideSchema {
    /// Guard pages around every allocation.
    OverrunDetection,
    /// Pass everything straight to the platform `malloc`.
    Malloc,
}

/// Name remappings and the override schema.
///
/// Remappings are added while configuring; [`finalize_configuration`]
/// freezes them, after which [`resolve`] may be used.
///
/// [`finalize_configuration`]: AllocatorManager::finalize_configuration
/// [`resolve`]: AllocatorManager::resolve
#[derive(Debug, Default)]
pub struct AllocatorManager {
    remappings: BTreeMap<String, String>,
    override_schema: Option<OverrideSchema>,
    finalized: bool,
}

impl AllocatorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redirect allocator `from` to `to`.
    ///
    /// Re-adding an identical remapping is a no-op that still succeeds.
    pub fn add_allocator_remapping(&mut self, from: &str, to: &str) -> Result<(), AllocatorError> {
        if self.remappings.get(from).map(String::as_str) == Some(to) {
            return Ok(());
        }
        if self.finalized {
            return Err(AllocatorError::AlreadyFinalized);
        }
        let cycle = || AllocatorError::RemappingCycle {
            from: from.to_owned(),
            to: to.to_owned(),
        };
        let mut target = to;
        for _ in 0..=self.remappings.len() {
            if target == from {
                return Err(cycle());
            }
            match self.remappings.get(target) {
                Some(next) => target = next,
                None => break,
            }
        }
        self.remappings.insert(from.to_owned(), to.to_owned());
        tracing::debug!(from, to, "allocator remapping added");
        Ok(())
    }

    /// Install the process-wide override. At most one may be active.
    pub fn set_override_schema(&mut self, schema: OverrideSchema) -> Result<(), AllocatorError> {
        match self.override_schema {
            Some(active) if active != schema => Err(AllocatorError::OverrideAlreadyActive {
                active,
                requested: schema,
            }),
            _ => {
                self.override_schema = Some(schema);
                Ok(())
            }
        }
    }

    pub fn override_schema(&self) -> Option<OverrideSchema> {
        self.override_schema
    }

    pub fn reset_override_schemas(&mut self) {
        self.override_schema = None;
    }

    /// Drop every remapping and reopen the configuration.
    pub fn reset(&mut self) {
        self.remappings.clear();
        self.override_schema = None;
        self.finalized = false;
    }

    /// Freeze the remapping table. Idempotent.
    pub fn finalize_configuration(&mut self) {
        if !self.finalized {
            tracing::debug!(remappings = self.remappings.len(), "allocator configuration finalized");
        }
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The allocator that `name` ends up at after following remappings.
    pub fn resolve<'a>(&'a self, name: &'a str) -> Result<&'a str, AllocatorError> {
        if !self.finalized {
            return Err(AllocatorError::NotFinalized);
        }
        let mut current = name;
        while let Some(next) = self.remappings.get(current) {
            current = next;
        }
        Ok(current)
    }

    pub fn remapping_count(&self) -> usize {
        self.remappings.len()
    }
}

// ---------------------------------------------------------------------------
// AllocatorEnvironment
// ---------------------------------------------------------------------------

/// Every allocator singleton of a process.
#[derive(Debug, Default)]
pub struct AllocatorEnvironment {
    pub os: Option<OsAllocator>,
    pub system: Option<SystemAllocator>,
    pub manager: AllocatorManager,
    /// Debug trace facility that lives alongside the system allocator.
    pub trace_active: bool,
}

/// Shared handle to an [`AllocatorEnvironment`].
pub type SharedAllocators = Arc<Mutex<AllocatorEnvironment>>;

/// A fresh, empty environment.
pub fn new_environment() -> SharedAllocators {
    Arc::new(Mutex::new(AllocatorEnvironment::default()))
}

// ---------------------------------------------------------------------------
// AllocatorHost
// ---------------------------------------------------------------------------

/// Creates and destroys allocators on behalf of one application, tracking
/// which ones it owns.
#[derive(Debug)]
pub struct AllocatorHost {
    env: SharedAllocators,
    os_owner: bool,
    system_owner: bool,
    fixed_block: Option<MemoryBlock>,
}

impl AllocatorHost {
    pub fn new(env: SharedAllocators) -> Self {
        Self {
            env,
            os_owner: false,
            system_owner: false,
            fixed_block: None,
        }
    }

    pub fn environment(&self) -> &SharedAllocators {
        &self.env
    }

    /// Switch to `env`, first destroying whatever this host owns in the
    /// current environment.
    pub fn adopt_environment(&mut self, env: SharedAllocators) {
        if Arc::ptr_eq(&self.env, &env) {
            return;
        }
        self.destroy_allocator();
        self.env = env;
    }

    pub fn owns_os_allocator(&self) -> bool {
        self.os_owner
    }

    pub fn owns_system_allocator(&self) -> bool {
        self.system_owner
    }

    /// Create the OS allocator unless one already exists. An existing one is
    /// used without taking ownership.
    pub fn create_os_allocator(&mut self) {
        let mut env = self.env.lock();
        if env.os.is_none() {
            env.os = Some(OsAllocator::new());
            self.os_owner = true;
            tracing::debug!("OS allocator created");
        }
    }

    /// Create and configure the system allocator from `descriptor`.
    ///
    /// # Panics
    ///
    /// Panics if `descriptor.use_existing_allocator` is set but no system
    /// allocator exists.
    pub fn create_system_allocator(
        &mut self,
        descriptor: &AppDescriptor,
        platform: &dyn PlatformMemory,
    ) -> Result<(), AllocatorError> {
        let mut env = self.env.lock();
        if descriptor.use_existing_allocator || env.system.is_some() {
            assert!(
                env.system.is_some(),
                "use_existing_allocator is set but no system allocator has been created"
            );
            tracing::debug!("using existing system allocator");
        } else {
            self.fixed_block = construct_system_allocator(&mut env, descriptor, platform)?;
            self.system_owner = true;
        }

        let mut requested = Vec::new();
        if descriptor.use_overrun_detection {
            requested.push(OverrideSchema::OverrunDetection);
        }
        if descriptor.use_malloc {
            tracing::warn!("malloc override enabled; registered allocators will use malloc");
            requested.push(OverrideSchema::Malloc);
        }
        for schema in requested {
            if let Err(e) = env.manager.set_override_schema(schema) {
                tracing::error!(error = %e, "allocator override not installed");
            }
        }

        for remapping in &descriptor.allocator_remappings {
            if let Err(e) = env.manager.add_allocator_remapping(&remapping.from, &remapping.to) {
                tracing::error!(from = %remapping.from, to = %remapping.to, error = %e, "allocator remapping skipped");
            }
        }
        env.manager.finalize_configuration();
        Ok(())
    }

    /// Tear the owned allocators down in dependency order: trace facility,
    /// system allocator, its fixed block, override schemas, OS allocator.
    pub fn destroy_allocator(&mut self) {
        let mut env = self.env.lock();
        if self.system_owner {
            env.trace_active = false;
            env.system = None;
            if let Some(block) = self.fixed_block.take() {
                let released = env.os.as_mut().map(|os| os.deallocate(block)).unwrap_or(false);
                if !released {
                    tracing::error!("fixed memory block was not returned to the OS allocator");
                }
            }
            self.system_owner = false;
            env.manager.reset();
            tracing::debug!("system allocator destroyed");
        }

        env.manager.reset_override_schemas();

        if self.os_owner {
            env.os = None;
            self.os_owner = false;
            tracing::debug!("OS allocator destroyed");
        }
    }
}

impl Drop for AllocatorHost {
    fn drop(&mut self) {
        self.destroy_allocator();
    }
}

/// Build the system allocator in `env`, reserving its fixed block from the
/// OS allocator. Returns the reserved block, if any.
fn construct_system_allocator(
    env: &mut AllocatorEnvironment,
    descriptor: &AppDescriptor,
    platform: &dyn PlatformMemory,
) -> Result<Option<MemoryBlock>, AllocatorError> {
    let block_size = if descriptor.grab_all_memory {
        let available = platform.available_memory();
        assert!(available > 0, "the OS reports no memory available");
        let usable = available
            .saturating_sub(descriptor.reserved_os)
            .saturating_sub(descriptor.reserved_debug);
        align_down(usable, descriptor.page_size)
    } else {
        descriptor.block_size
    };

    let fixed_block = if block_size > 0 {
        let os = env.os.as_mut().ok_or(AllocatorError::OsAllocatorMissing)?;
        Some(os.allocate(block_size, descriptor.block_alignment)?)
    } else {
        None
    };

    env.system = Some(SystemAllocator::from_descriptor(descriptor, block_size));
    env.trace_active = true;
    tracing::info!(
        page_size = descriptor.page_size,
        pool_page_size = descriptor.pool_page_size,
        fixed_block = block_size,
        "system allocator created"
    );
    Ok(fixed_block)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::AllocatorRemapping;

    // -- ownership --

    #[test]
    fn host_destroys_only_what_it_created() {
        let env = new_environment();
        let mut host = AllocatorHost::new(Arc::clone(&env));
        host.create_os_allocator();
        host.create_system_allocator(&AppDescriptor::default(), &FixedPlatformMemory::default())
            .unwrap();
        assert!(host.owns_os_allocator());
        assert!(host.owns_system_allocator());

        host.destroy_allocator();
        let env = env.lock();
        assert!(env.os.is_none());
        assert!(env.system.is_none());
        assert!(!env.trace_active);
    }

    #[test]
    fn existing_allocators_are_adopted() {
        let env = new_environment();
        {
            let mut guard = env.lock();
            guard.os = Some(OsAllocator::new());
            guard.system = Some(SystemAllocator::from_descriptor(&AppDescriptor::default(), 0));
        }

        let mut host = AllocatorHost::new(Arc::clone(&env));
        host.create_os_allocator();
        let descriptor = AppDescriptor {
            use_existing_allocator: true,
            ..AppDescriptor::default()
        };
        host.create_system_allocator(&descriptor, &FixedPlatformMemory::default())
            .unwrap();
        assert!(!host.owns_os_allocator());
        assert!(!host.owns_system_allocator());

        drop(host);
        let env = env.lock();
        assert!(env.os.is_some());
        assert!(env.system.is_some());
    }

    #[test]
    fn existing_allocator_still_gets_remappings_and_overrides() {
        let env = new_environment();
        {
            let mut guard = env.lock();
            guard.os = Some(OsAllocator::new());
            guard.system = Some(SystemAllocator::from_descriptor(&AppDescriptor::default(), 0));
        }

        let mut host = AllocatorHost::new(Arc::clone(&env));
        host.create_os_allocator();
        let descriptor = AppDescriptor {
            use_existing_allocator: true,
            use_overrun_detection: true,
            allocator_remappings: vec![AllocatorRemapping {
                from: "Audio".into(),
                to: "SystemAllocator".into(),
            }],
            ..AppDescriptor::default()
        };
        host.create_system_allocator(&descriptor, &FixedPlatformMemory::default())
            .unwrap();

        let env = env.lock();
        assert!(env.manager.is_finalized());
        assert_eq!(env.manager.resolve("Audio").unwrap(), "SystemAllocator");
        assert_eq!(env.manager.override_schema(), Some(OverrideSchema::OverrunDetection));
    }

    #[test]
    #[should_panic(expected = "use_existing_allocator")]
    fn use_existing_without_allocator_panics() {
        let mut host = AllocatorHost::new(new_environment());
        host.create_os_allocator();
        let descriptor = AppDescriptor {
            use_existing_allocator: true,
            ..AppDescriptor::default()
        };
        let _ = host.create_system_allocator(&descriptor, &FixedPlatformMemory::default());
    }

    // -- fixed block --

    #[test]
    fn explicit_block_is_reserved_and_released() {
        let env = new_environment();
        let mut host = AllocatorHost::new(Arc::clone(&env));
        host.create_os_allocator();
        let descriptor = AppDescriptor {
            block_size: 1 << 20,
            ..AppDescriptor::default()
        };
        host.create_system_allocator(&descriptor, &FixedPlatformMemory::default())
            .unwrap();
        {
            let env = env.lock();
            assert_eq!(env.os.as_ref().unwrap().allocated_bytes(), 1 << 20);
            assert_eq!(env.system.as_ref().unwrap().heap.fixed_block_size, 1 << 20);
        }

        host.destroy_allocator();
        let env = env.lock();
        assert!(env.os.is_none());
        assert!(env.system.is_none());
    }

    #[test]
    fn grab_all_memory_subtracts_reserves_and_aligns() {
        let env = new_environment();
        let mut host = AllocatorHost::new(Arc::clone(&env));
        host.create_os_allocator();
        let descriptor = AppDescriptor {
            grab_all_memory: true,
            page_size: 4096,
            reserved_os: 1000,
            reserved_debug: 24,
            ..AppDescriptor::default()
        };
        host.create_system_allocator(&descriptor, &FixedPlatformMemory(10 * 4096 + 7))
            .unwrap();
        let env = env.lock();
        // 40967 - 1024 = 39943, aligned down to 4096.
        assert_eq!(env.system.as_ref().unwrap().heap.fixed_block_size, 9 * 4096);
    }

    #[test]
    fn block_goes_back_to_os_allocator_before_it_is_destroyed() {
        let env = new_environment();
        let mut host = AllocatorHost::new(Arc::clone(&env));
        host.create_os_allocator();
        let descriptor = AppDescriptor {
            block_size: 4096,
            ..AppDescriptor::default()
        };
        host.create_system_allocator(&descriptor, &FixedPlatformMemory::default())
            .unwrap();

        // Another host shares the environment but owns nothing.
        let mut guest = AllocatorHost::new(Arc::clone(&env));
        guest.create_os_allocator();
        assert!(!guest.owns_os_allocator());
        drop(guest);
        assert_eq!(env.lock().os.as_ref().unwrap().live_blocks(), 1);

        host.destroy_allocator();
        assert!(env.lock().os.is_none());
    }

    // -- manager --

    #[test]
    fn remappings_resolve_after_finalize() {
        let mut manager = AllocatorManager::new();
        manager.add_allocator_remapping("Physics", "Pool").unwrap();
        manager.add_allocator_remapping("Pool", "System").unwrap();
        assert!(matches!(manager.resolve("Physics"), Err(AllocatorError::NotFinalized)));

        manager.finalize_configuration();
        assert_eq!(manager.resolve("Physics").unwrap(), "System");
        assert_eq!(manager.resolve("Audio").unwrap(), "Audio");
        assert!(matches!(
            manager.add_allocator_remapping("Audio", "System"),
            Err(AllocatorError::AlreadyFinalized)
        ));
        // Identical remapping is still accepted.
        manager.add_allocator_remapping("Physics", "Pool").unwrap();
    }

    #[test]
    fn remapping_cycles_are_rejected() {
        let mut manager = AllocatorManager::new();
        manager.add_allocator_remapping("A", "B").unwrap();
        manager.add_allocator_remapping("B", "C").unwrap();
        assert!(matches!(
            manager.add_allocator_remapping("C", "A"),
            Err(AllocatorError::RemappingCycle { .. })
        ));
        assert!(manager.add_allocator_remapping("X", "X").is_err());
    }

    #[test]
    fn at_most_one_override_schema() {
        let mut manager = AllocatorManager::new();
        manager.set_override_schema(OverrideSchema::OverrunDetection).unwrap();
        assert!(manager.set_override_schema(OverrideSchema::Malloc).is_err());
        assert_eq!(manager.override_schema(), Some(OverrideSchema::OverrunDetection));
        manager.reset_override_schemas();
        manager.set_override_schema(OverrideSchema::Malloc).unwrap();
    }

    #[test]
    fn descriptor_remappings_are_applied_and_overrides_reset() {
        let env = new_environment();
        let mut host = AllocatorHost::new(Arc::clone(&env));
        host.create_os_allocator();
        let descriptor = AppDescriptor {
            use_overrun_detection: true,
            use_malloc: true,
            allocator_remappings: vec![AllocatorRemapping {
                from: "Legacy".into(),
                to: "SystemAllocator".into(),
            }],
            ..AppDescriptor::default()
        };
        host.create_system_allocator(&descriptor, &FixedPlatformMemory::default())
            .unwrap();
        {
            let env = env.lock();
            assert!(env.manager.is_finalized());
            assert_eq!(env.manager.resolve("Legacy").unwrap(), "SystemAllocator");
            assert_eq!(env.manager.override_schema(), Some(OverrideSchema::OverrunDetection));
        }
        host.destroy_allocator();
        assert_eq!(env.lock().manager.override_schema(), None);
    }

    #[test]
    fn owned_cycles_start_from_a_fresh_configuration() {
        let env = new_environment();
        for to in ["SystemAllocator", "PoolAllocator"] {
            let mut host = AllocatorHost::new(Arc::clone(&env));
            host.create_os_allocator();
            let descriptor = AppDescriptor {
                allocator_remappings: vec![AllocatorRemapping {
                    from: "Legacy".into(),
                    to: to.into(),
                }],
                ..AppDescriptor::default()
            };
            host.create_system_allocator(&descriptor, &FixedPlatformMemory::default())
                .unwrap();
            assert_eq!(env.lock().manager.resolve("Legacy").unwrap(), to);

            host.destroy_allocator();
            let guard = env.lock();
            assert!(!guard.manager.is_finalized());
            assert_eq!(guard.manager.remapping_count(), 0);
        }
    }
}
