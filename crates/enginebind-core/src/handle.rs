//! Host handles to engine objects and the registry that tracks them.
//!
//! Every engine pointer the host holds is wrapped in a [`Handle`]. The handle
//! carries its ownership mode in its type ([`Owned`], [`Borrowed`],
//! [`Observed`]); the registry keeps exactly one [`HandleRecord`] per live
//! pointer and decides, when the last owning view goes away, whether to drop
//! an engine reference, report a leak, or do nothing.
//!
//! ## Ownership states
//!
//! | State          | Created by                         | Release path                   |
//! |----------------|------------------------------------|--------------------------------|
//! | `OwnedShared`  | adopting a ref-counted pointer     | one `unreference` on last drop |
//! | `OwnedUnique`  | adopting a non-ref-counted pointer | explicit [`Handle::free`]      |
//! | `Borrowed`     | a pointer owned by another handle  | never; dies with its parent    |
//! | `EngineOwned`  | observing an engine-managed object | never                          |
//!
//! Records are generational: if the engine destroys an object and hands out
//! the same address again, the new object gets a fresh record and handles to
//! the old one stay null.

use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::abi::{EngineInterface, InstanceId, ObjectPtr};
use crate::error::{BindError, BindResult};
use crate::ClassTag;

/// Upper bound on class-chain walks; guards against a malformed class db.
const MAX_CLASS_DEPTH: usize = 256;

mod sealed {
    pub trait Sealed {}
}

/// Ownership mode of a [`Handle`], fixed at the type level.
pub trait HandleMode: sealed::Sealed + 'static {
    /// Whether views of this mode keep the engine object alive.
    const OWNING: bool;
    const NAME: &'static str;
}

/// The host owns the object (or one shared reference to it).
#[derive(Debug)]
pub enum Owned {}

/// The object is owned by another handle; valid while the parent is.
#[derive(Debug)]
pub enum Borrowed {}

/// Weak view of an engine-managed object, checked by instance id.
#[derive(Debug)]
pub enum Observed {}

impl sealed::Sealed for Owned {}
impl sealed::Sealed for Borrowed {}
impl sealed::Sealed for Observed {}

impl HandleMode for Owned {
    const OWNING: bool = true;
    const NAME: &'static str = "Owned";
}

impl HandleMode for Borrowed {
    const OWNING: bool = false;
    const NAME: &'static str = "Borrowed";
}

impl HandleMode for Observed {
    const OWNING: bool = false;
    const NAME: &'static str = "Observed";
}

/// Who is responsible for releasing an engine object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnershipState {
    OwnedUnique,
    OwnedShared,
    Borrowed,
    EngineOwned,
}

impl OwnershipState {
    pub fn is_owned(self) -> bool {
        matches!(self, OwnershipState::OwnedUnique | OwnershipState::OwnedShared)
    }
}

/// Bookkeeping for one engine pointer.
#[derive(Debug, Clone)]
pub struct HandleRecord {
    pub ptr: ObjectPtr,
    /// Runtime class reported by the engine when the record was created.
    pub class: ClassTag,
    pub instance_id: InstanceId,
    pub state: OwnershipState,
    /// Record id of the owner, for borrowed records.
    pub parent: Option<u64>,
    /// Live handle views of any mode.
    pub views: u32,
    /// Live `Owned` views.
    pub owners: u32,
    /// Explicit `retain` calls not yet balanced by `release`.
    pub retains: u32,
    pub released: bool,
    /// Set when a host closure captured a handle to this object.
    pub cyclic: bool,
}

/// Why a record showed up in a shutdown leak report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakReason {
    /// A unique handle was dropped without being freed.
    Orphaned,
    /// A unique handle is still held at shutdown.
    StillOwned,
    /// An owned handle is still held and was captured by a host closure.
    CycleHeld,
    /// `retain` without a matching `release`.
    UnbalancedRetain,
}

impl fmt::Display for LeakReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakReason::Orphaned => write!(f, "unique handle dropped without free"),
            LeakReason::StillOwned => write!(f, "unique handle still owned at shutdown"),
            LeakReason::CycleHeld => write!(f, "handle held by a host closure at shutdown"),
            LeakReason::UnbalancedRetain => write!(f, "retain without matching release"),
        }
    }
}

/// One entry of [`HandleRegistry::leak_report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakedRecord {
    pub object: ObjectPtr,
    pub class: ClassTag,
    pub state: OwnershipState,
    pub cyclic: bool,
    pub reason: LeakReason,
}

#[derive(Default)]
struct RegistryState {
    records: FxHashMap<u64, HandleRecord>,
    by_ptr: FxHashMap<ObjectPtr, u64>,
    next_id: u64,
}

impl RegistryState {
    /// Live record for `ptr` if it still describes the object with `instance_id`.
    fn current(&mut self, ptr: ObjectPtr, instance_id: InstanceId) -> Option<(u64, &mut HandleRecord)> {
        let id = *self.by_ptr.get(&ptr)?;
        let record = self.records.get_mut(&id)?;
        (!record.released && record.instance_id == instance_id).then_some((id, record))
    }

    fn insert(&mut self, record: HandleRecord) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.by_ptr.insert(record.ptr, id);
        self.records.insert(id, record);
        id
    }

    fn remove(&mut self, id: u64) {
        if let Some(record) = self.records.remove(&id)
            && self.by_ptr.get(&record.ptr) == Some(&id)
        {
            self.by_ptr.remove(&record.ptr);
        }
    }
}

/// What to do with the engine after the registry lock is dropped.
enum EngineAction {
    None,
    Unreference(ObjectPtr),
    Destroy(ObjectPtr),
}

/// Table of ownership records, one per engine pointer the host holds.
///
/// The registry never calls into the engine while its lock is held: engine
/// releases can run host destructors that drop further handles.
pub struct HandleRegistry {
    engine: Arc<dyn EngineInterface>,
    state: Mutex<RegistryState>,
}

impl HandleRegistry {
    pub fn new(engine: Arc<dyn EngineInterface>) -> Self {
        HandleRegistry {
            engine,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn run(&self, action: EngineAction) {
        match action {
            EngineAction::None => {}
            EngineAction::Unreference(ptr) => {
                let destroyed = self.engine.unreference(ptr);
                trace!(target: "enginebind::handle", ?ptr, destroyed, "unreference");
            }
            EngineAction::Destroy(ptr) => {
                trace!(target: "enginebind::handle", ?ptr, "destroy");
                self.engine.destroy_object(ptr);
            }
        }
    }

    /// Runtime class and identity of a live object.
    fn probe(&self, ptr: ObjectPtr, view: ClassTag) -> BindResult<(ClassTag, InstanceId)> {
        let class = self.engine.object_class(ptr);
        let id = self.engine.object_instance_id(ptr);
        match (class, id) {
            (Some(class), Some(id)) => Ok((ClassTag::new(&class), id)),
            _ => Err(BindError::NullHandle {
                class: view.name().to_owned(),
            }),
        }
    }

    /// Whether `class` is `ancestor` or inherits from it in the engine's
    /// class database.
    pub fn is_subclass(&self, class: ClassTag, ancestor: ClassTag) -> bool {
        if class == ancestor {
            return true;
        }
        let mut current = class.name().to_owned();
        for _ in 0..MAX_CLASS_DEPTH {
            match self.engine.class_parent(&current) {
                Some(parent) if parent == ancestor.name() => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    fn new_handle<M: HandleMode>(self: &Arc<Self>, record: u64, ptr: ObjectPtr, class: ClassTag) -> Handle<M> {
        Handle {
            registry: Arc::clone(self),
            record,
            ptr,
            class,
            _mode: PhantomData,
        }
    }

    /// Take ownership of a pointer the engine transferred to the host.
    ///
    /// Ref-counted objects become `OwnedShared`, everything else
    /// `OwnedUnique`. Adopting a pointer that already has an owned shared
    /// record drops the duplicate engine reference immediately, so the host
    /// never holds more than one.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn adopt_owned(self: &Arc<Self>, ptr: ObjectPtr, class: ClassTag) -> BindResult<Handle<Owned>> {
        let (runtime, instance_id) = self.probe(ptr, class)?;
        let refcounted = self.engine.class_is_refcounted(runtime.name());
        let owned_state = if refcounted {
            OwnershipState::OwnedShared
        } else {
            OwnershipState::OwnedUnique
        };

        let mut duplicate = false;
        let record = {
            let mut state = self.lock();
            match state.current(ptr, instance_id) {
                Some((id, record)) => {
                    match record.state {
                        OwnershipState::OwnedShared => duplicate = true,
                        OwnershipState::OwnedUnique => {}
                        OwnershipState::Borrowed | OwnershipState::EngineOwned => {
                            record.state = owned_state;
                            record.parent = None;
                        }
                    }
                    record.views += 1;
                    record.owners += 1;
                    id
                }
                None => state.insert(HandleRecord {
                    ptr,
                    class: runtime,
                    instance_id,
                    state: owned_state,
                    parent: None,
                    views: 1,
                    owners: 1,
                    retains: 0,
                    released: false,
                    cyclic: false,
                }),
            }
        };

        if duplicate {
            debug!(target: "enginebind::handle", ?ptr, class = %runtime, "releasing duplicate reference");
            self.run(EngineAction::Unreference(ptr));
        }
        trace!(target: "enginebind::handle", ?ptr, class = %runtime, state = ?owned_state, "adopt owned");
        Ok(self.new_handle(record, ptr, class))
    }

    /// Wrap a pointer owned by `parent`. The handle turns null once the
    /// parent is released.
    pub fn adopt_borrowed<P: HandleMode>(
        self: &Arc<Self>,
        ptr: ObjectPtr,
        class: ClassTag,
        parent: &Handle<P>,
    ) -> BindResult<Handle<Borrowed>> {
        if !parent.is_alive() {
            return Err(BindError::NullHandle {
                class: parent.class.name().to_owned(),
            });
        }
        let (runtime, instance_id) = self.probe(ptr, class)?;
        let record = {
            let mut state = self.lock();
            match state.current(ptr, instance_id) {
                Some((id, record)) => {
                    record.views += 1;
                    id
                }
                None => state.insert(HandleRecord {
                    ptr,
                    class: runtime,
                    instance_id,
                    state: OwnershipState::Borrowed,
                    parent: Some(parent.record),
                    views: 1,
                    owners: 0,
                    retains: 0,
                    released: false,
                    cyclic: false,
                }),
            }
        };
        Ok(self.new_handle(record, ptr, class))
    }

    /// Observe an engine-managed object without taking any ownership.
    pub fn observe(self: &Arc<Self>, ptr: ObjectPtr, class: ClassTag) -> BindResult<Handle<Observed>> {
        let (runtime, instance_id) = self.probe(ptr, class)?;
        let record = {
            let mut state = self.lock();
            match state.current(ptr, instance_id) {
                Some((id, record)) => {
                    record.views += 1;
                    id
                }
                None => state.insert(HandleRecord {
                    ptr,
                    class: runtime,
                    instance_id,
                    state: OwnershipState::EngineOwned,
                    parent: None,
                    views: 1,
                    owners: 0,
                    retains: 0,
                    released: false,
                    cyclic: false,
                }),
            }
        };
        Ok(self.new_handle(record, ptr, class))
    }

    /// Validate a raw pointer handed in by the engine (a callback receiver)
    /// and wrap it as an observed view of `class`.
    pub fn must_assert_instance(
        self: &Arc<Self>,
        ptr: Option<ObjectPtr>,
        class: ClassTag,
    ) -> BindResult<Handle<Observed>> {
        let ptr = ptr.ok_or_else(|| BindError::NullHandle {
            class: class.name().to_owned(),
        })?;
        let (runtime, _) = self.probe(ptr, class)?;
        if !self.is_subclass(runtime, class) {
            return Err(BindError::type_mismatch(class.name(), runtime.name()));
        }
        self.observe(ptr, class)
    }

    /// Snapshot of a record.
    pub fn record(&self, id: u64) -> Option<HandleRecord> {
        self.lock().records.get(&id).cloned()
    }

    /// Number of records currently tracked.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record_alive(&self, mut id: u64) -> bool {
        for _ in 0..MAX_CLASS_DEPTH {
            let (ptr, instance_id, parent) = {
                let state = self.lock();
                match state.records.get(&id) {
                    Some(record) if !record.released => (record.ptr, record.instance_id, record.parent),
                    _ => return false,
                }
            };
            if self.engine.object_instance_id(ptr) != Some(instance_id) {
                return false;
            }
            match parent {
                Some(parent) => id = parent,
                None => return true,
            }
        }
        false
    }

    fn add_view(&self, id: u64, owning: bool) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(&id) {
            record.views += 1;
            if owning {
                record.owners += 1;
            }
        }
    }

    fn drop_view(&self, id: u64, owning: bool) {
        let action = {
            let mut state = self.lock();
            let Some(record) = state.records.get_mut(&id) else {
                return;
            };
            record.views = record.views.saturating_sub(1);
            let mut action = EngineAction::None;
            if owning {
                record.owners = record.owners.saturating_sub(1);
                if record.owners == 0 && !record.released {
                    match record.state {
                        OwnershipState::OwnedShared => {
                            record.released = true;
                            action = EngineAction::Unreference(record.ptr);
                        }
                        OwnershipState::OwnedUnique => {
                            warn!(
                                target: "enginebind::handle",
                                ptr = ?record.ptr,
                                class = %record.class,
                                "unique handle dropped without free"
                            );
                        }
                        OwnershipState::Borrowed | OwnershipState::EngineOwned => {}
                    }
                }
            }
            let keep = record.views > 0
                || record.retains > 0
                || (record.state == OwnershipState::OwnedUnique && !record.released);
            if !keep {
                state.remove(id);
            }
            action
        };
        self.run(action);
    }

    fn live_record(&self, handle_record: u64, class: ClassTag) -> BindResult<HandleRecord> {
        if !self.record_alive(handle_record) {
            return Err(BindError::NullHandle {
                class: class.name().to_owned(),
            });
        }
        self.record(handle_record).ok_or_else(|| BindError::NullHandle {
            class: class.name().to_owned(),
        })
    }

    fn free(&self, id: u64, class: ClassTag) -> BindResult<()> {
        self.live_record(id, class)?;
        let action = {
            let mut state = self.lock();
            match state.records.get_mut(&id) {
                Some(record) if !record.released => {
                    record.released = true;
                    match record.state {
                        OwnershipState::OwnedUnique => EngineAction::Destroy(record.ptr),
                        OwnershipState::OwnedShared => EngineAction::Unreference(record.ptr),
                        _ => EngineAction::None,
                    }
                }
                _ => EngineAction::None,
            }
        };
        self.run(action);
        Ok(())
    }

    fn retain(&self, id: u64, class: ClassTag) -> BindResult<()> {
        let record = self.live_record(id, class)?;
        if record.state != OwnershipState::OwnedShared || !self.engine.reference(record.ptr) {
            return Err(BindError::type_mismatch("RefCounted", record.class.name()));
        }
        if let Some(record) = self.lock().records.get_mut(&id) {
            record.retains += 1;
        }
        Ok(())
    }

    fn release(&self, id: u64, class: ClassTag) -> BindResult<()> {
        let record = self.live_record(id, class)?;
        if record.state != OwnershipState::OwnedShared {
            return Err(BindError::type_mismatch("RefCounted", record.class.name()));
        }
        let balanced = {
            let mut state = self.lock();
            match state.records.get_mut(&id) {
                Some(record) if record.retains > 0 => {
                    record.retains -= 1;
                    true
                }
                _ => false,
            }
        };
        if balanced {
            self.run(EngineAction::Unreference(record.ptr));
            Ok(())
        } else {
            self.free(id, class)
        }
    }

    fn cast(&self, id: u64, view: ClassTag, target: ClassTag, owning: bool) -> BindResult<()> {
        let record = self.live_record(id, view)?;
        if !self.is_subclass(record.class, target) {
            return Err(BindError::type_mismatch(target.name(), record.class.name()));
        }
        self.add_view(id, owning);
        Ok(())
    }

    fn mark_cyclic(&self, id: u64) {
        if let Some(record) = self.lock().records.get_mut(&id) {
            record.cyclic = true;
        }
    }

    /// Records still owned by the host whose engine objects are alive.
    ///
    /// Called at process shutdown; see [`LeakReason`] for what counts.
    pub fn leak_report(&self) -> Vec<LeakedRecord> {
        let candidates: Vec<HandleRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| r.state.is_owned())
            .cloned()
            .collect();

        let mut leaks: Vec<LeakedRecord> = candidates
            .into_iter()
            .filter(|r| self.engine.object_instance_id(r.ptr) == Some(r.instance_id))
            .filter_map(|r| {
                let reason = if r.retains > 0 {
                    LeakReason::UnbalancedRetain
                } else if r.released {
                    return None;
                } else if r.owners > 0 && r.cyclic {
                    LeakReason::CycleHeld
                } else if r.state == OwnershipState::OwnedUnique && r.owners == 0 {
                    LeakReason::Orphaned
                } else if r.state == OwnershipState::OwnedUnique {
                    LeakReason::StillOwned
                } else {
                    return None;
                };
                Some(LeakedRecord {
                    object: r.ptr,
                    class: r.class,
                    state: r.state,
                    cyclic: r.cyclic,
                    reason,
                })
            })
            .collect();
        leaks.sort_by_key(|leak| leak.object);
        leaks
    }
}

impl fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("records", &self.len())
            .finish()
    }
}

/// Host-side view of an engine object.
///
/// Handles are main-thread only (`!Send`). Every operation that dereferences
/// the engine pointer first validates the record and fails with
/// [`BindError::NullHandle`] once the object is gone.
pub struct Handle<M: HandleMode> {
    registry: Arc<HandleRegistry>,
    record: u64,
    ptr: ObjectPtr,
    class: ClassTag,
    _mode: PhantomData<(M, *const ())>,
}

impl<M: HandleMode> Handle<M> {
    /// Validated engine pointer.
    pub fn ptr(&self) -> BindResult<ObjectPtr> {
        if self.is_alive() {
            Ok(self.ptr)
        } else {
            Err(BindError::NullHandle {
                class: self.class.name().to_owned(),
            })
        }
    }

    /// Engine pointer without validation, for identity comparisons.
    #[inline]
    pub fn raw_ptr(&self) -> ObjectPtr {
        self.ptr
    }

    /// Class this handle views the object as.
    #[inline]
    pub fn class(&self) -> ClassTag {
        self.class
    }

    /// Runtime class recorded for the object.
    pub fn runtime_class(&self) -> Option<ClassTag> {
        self.registry.record(self.record).map(|r| r.class)
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.registry.record(self.record).map(|r| r.instance_id)
    }

    /// Current ownership state, `None` once released.
    pub fn ownership(&self) -> Option<OwnershipState> {
        self.registry
            .record(self.record)
            .filter(|r| !r.released)
            .map(|r| r.state)
    }

    pub fn is_alive(&self) -> bool {
        self.registry.record_alive(self.record)
    }

    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }

    /// Id of the backing record.
    #[inline]
    pub fn record_id(&self) -> u64 {
        self.record
    }

    /// View the same object as `target`.
    ///
    /// Fails with [`BindError::TypeMismatch`] unless the object's runtime
    /// class is `target` or inherits from it. Never changes ownership.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn cast(&self, target: impl Into<ClassTag>) -> BindResult<Handle<M>> {
        let target = target.into();
        self.registry.cast(self.record, self.class, target, M::OWNING)?;
        Ok(self.registry.new_handle(self.record, self.ptr, target))
    }

    /// Non-owning view of the same object.
    pub fn downgrade(&self) -> Handle<Observed> {
        self.registry.add_view(self.record, false);
        self.registry.new_handle(self.record, self.ptr, self.class)
    }

    /// Flag the record as captured by a host closure stored in the engine.
    pub fn mark_cyclic(&self) {
        self.registry.mark_cyclic(self.record);
    }
}

impl Handle<Owned> {
    /// Release the object now: destroy a unique object, or drop the host's
    /// reference to a shared one. Every view of the record turns null.
    pub fn free(self) -> BindResult<()> {
        self.registry.free(self.record, self.class)
    }

    /// Take one extra engine reference.
    pub fn retain(&self) -> BindResult<()> {
        self.registry.retain(self.record, self.class)
    }

    /// Drop one engine reference: an outstanding `retain` if there is one,
    /// otherwise the host's own reference.
    pub fn release(&self) -> BindResult<()> {
        self.registry.release(self.record, self.class)
    }

    /// Engine reference count of a ref-counted object.
    pub fn reference_count(&self) -> Option<u32> {
        self.registry.engine.reference_count(self.ptr().ok()?)
    }
}

impl<M: HandleMode> Clone for Handle<M> {
    fn clone(&self) -> Self {
        self.registry.add_view(self.record, M::OWNING);
        self.registry.new_handle(self.record, self.ptr, self.class)
    }
}

impl<M: HandleMode> Drop for Handle<M> {
    fn drop(&mut self) {
        self.registry.drop_view(self.record, M::OWNING);
    }
}

impl<M: HandleMode> PartialEq for Handle<M> {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record && Arc::ptr_eq(&self.registry, &other.registry)
    }
}

impl<M: HandleMode> Eq for Handle<M> {}

impl<M: HandleMode> fmt::Debug for Handle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle<{}>({}@{:#x})", M::NAME, self.class, self.ptr.addr())
    }
}
