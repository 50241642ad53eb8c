//! Argument frames for pointer-calls.
//!
//! A pointer-call takes an array of argument pointers plus one return slot.
//! [`ArgumentFrame`] stages both: every argument is copied into a slot in a
//! per-frame arena, and the pointer array handed to the engine points into
//! that arena. Releasing the frame releases every slot at once.
//!
//! ```ignore
//! let mut frame = ArgumentFrame::new(&context);
//! frame.arg(&42i64)?;
//! frame.arg("hello")?;
//! let ret = frame.reserve_return::<bool>();
//! cache.invoke(&bind, Some(receiver), &frame)?;
//! let ok = ret.read(&frame)?;
//! frame.free();
//! ```
//!
//! Frames are single-threaded: the raw pointers they hold make them `!Send`.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bumpalo::Bump;

use crate::abi::{ArgPtr, ObjectPtr, RetPtr};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult, ErrorCode};
use crate::handle::{Handle, HandleMode, Observed, Owned};
use crate::proxy::GString;
use crate::variant::{Color, Vector2, Vector3};
use crate::ClassTag;

/// Argument capacity of [`ArgumentFrame::new`].
pub const DEFAULT_FRAME_CAPACITY: usize = 16;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static LIVE_SLOTS: Cell<usize> = const { Cell::new(0) };
}

/// Number of frame slots (arguments and return slots) currently allocated on
/// this thread.
pub fn live_slots() -> usize {
    LIVE_SLOTS.with(Cell::get)
}

fn add_live_slots(delta: usize) {
    LIVE_SLOTS.with(|slots| slots.set(slots.get() + delta));
}

fn sub_live_slots(delta: usize) {
    LIVE_SLOTS.with(|slots| slots.set(slots.get().saturating_sub(delta)));
}

/// A host value that can be passed by pointer.
///
/// `to_slot` produces the plain value the engine reads through the argument
/// pointer. Values that need engine storage (a `&str` becomes an engine
/// string) park that storage in the frame until it is freed.
pub trait PtrArg {
    type Slot: Copy + 'static;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<Self::Slot>;
}

/// A host value that can be read back from a return slot.
pub trait PtrReturn: Sized {
    type Slot: Copy + 'static;

    /// Initial slot contents before the engine writes.
    fn empty_slot() -> Self::Slot;

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self>;
}

/// Staging area for one pointer-call.
pub struct ArgumentFrame {
    context: Arc<EngineContext>,
    arena: Bump,
    args: Vec<ArgPtr>,
    capacity: usize,
    ret: RetPtr,
    has_return: bool,
    keep_alive: Vec<Box<dyn Any>>,
    id: u64,
    released: bool,
}

impl ArgumentFrame {
    /// Frame with [`DEFAULT_FRAME_CAPACITY`] argument slots.
    pub fn new(context: &Arc<EngineContext>) -> Self {
        Self::with_capacity(context, DEFAULT_FRAME_CAPACITY)
    }

    pub fn with_capacity(context: &Arc<EngineContext>, capacity: usize) -> Self {
        ArgumentFrame {
            context: Arc::clone(context),
            arena: Bump::new(),
            args: Vec::with_capacity(capacity),
            capacity,
            ret: std::ptr::null_mut(),
            has_return: false,
            keep_alive: Vec::new(),
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            released: false,
        }
    }

    #[inline]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    /// Arguments staged so far.
    #[inline]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an argument.
    ///
    /// # Panics
    ///
    /// Panics when the frame is full. Generated bindings size frames from the
    /// method signature, so overflowing one is a generator bug.
    #[cfg_attr(feature = "profiling", profiling::function)]
    pub fn arg<T: PtrArg + ?Sized>(&mut self, value: &T) -> BindResult<()> {
        assert!(
            self.args.len() < self.capacity,
            "argument frame capacity ({}) exceeded",
            self.capacity
        );
        let slot = value.to_slot(self)?;
        self.push_slot(slot);
        Ok(())
    }

    /// Append an argument and keep the value alive until the frame is freed.
    pub fn arg_owned<T: PtrArg + 'static>(&mut self, value: T) -> BindResult<()> {
        self.arg(&value)?;
        self.hold(value);
        Ok(())
    }

    /// Keep `value` alive until the frame is freed.
    pub fn hold<T: 'static>(&mut self, value: T) {
        self.keep_alive.push(Box::new(value));
    }

    fn push_slot<S: Copy + 'static>(&mut self, slot: S) {
        let ptr: *const S = self.arena.alloc(slot);
        self.args.push(ptr.cast());
        add_live_slots(1);
    }

    /// Reserve the return slot.
    ///
    /// # Panics
    ///
    /// Panics if a return slot was already reserved.
    pub fn reserve_return<T: PtrReturn>(&mut self) -> ReturnSlot<T> {
        assert!(!self.has_return, "return slot already reserved");
        let slot: *mut T::Slot = self.arena.alloc(T::empty_slot());
        self.ret = slot.cast();
        self.has_return = true;
        add_live_slots(1);
        ReturnSlot {
            slot,
            frame: self.id,
            _marker: PhantomData,
        }
    }

    /// Return slot for a void method: the engine receives a null pointer.
    pub fn nil_return(&self) -> ReturnSlot<()> {
        ReturnSlot {
            slot: NonNull::dangling().as_ptr(),
            frame: self.id,
            _marker: PhantomData,
        }
    }

    /// Argument pointer array to pass to the engine.
    #[inline]
    pub fn array_ptr(&self) -> *const ArgPtr {
        self.args.as_ptr()
    }

    /// Return pointer to pass to the engine; null unless a slot is reserved.
    #[inline]
    pub fn return_ptr(&self) -> RetPtr {
        self.ret
    }

    /// Release every slot and everything the frame keeps alive.
    pub fn free(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let slots = self.args.len() + usize::from(self.has_return);
        self.args.clear();
        self.ret = std::ptr::null_mut();
        self.has_return = false;
        self.keep_alive.clear();
        self.arena.reset();
        sub_live_slots(slots);
    }
}

impl Drop for ArgumentFrame {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ArgumentFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgumentFrame")
            .field("id", &self.id)
            .field("args", &self.args.len())
            .field("capacity", &self.capacity)
            .field("has_return", &self.has_return)
            .finish()
    }
}

/// Typed view of a frame's return slot.
pub struct ReturnSlot<T: PtrReturn> {
    slot: *mut T::Slot,
    frame: u64,
    _marker: PhantomData<T>,
}

impl<T: PtrReturn> ReturnSlot<T> {
    /// Decode what the engine wrote.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not the frame that reserved this slot, or if it
    /// has already been freed.
    pub fn read(self, frame: &ArgumentFrame) -> BindResult<T> {
        assert_eq!(self.frame, frame.id, "return slot read through a different frame");
        assert!(!frame.released, "return slot read after frame was freed");
        // SAFETY: the slot was allocated in `frame`'s arena, which is alive and
        // not yet reset, and holds an initialized `T::Slot`.
        let slot = unsafe { self.slot.read() };
        T::from_slot(slot, &frame.context)
    }
}

impl<T: PtrReturn> fmt::Debug for ReturnSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReturnSlot<{}>(frame {})", std::any::type_name::<T>(), self.frame)
    }
}

// ============================================================================
// Primitive implementations
// ============================================================================

impl PtrReturn for () {
    type Slot = ();

    fn empty_slot() {}

    fn from_slot(_: (), _: &Arc<EngineContext>) -> BindResult<Self> {
        Ok(())
    }
}

impl PtrArg for bool {
    type Slot = bool;

    fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<bool> {
        Ok(*self)
    }
}

impl PtrReturn for bool {
    type Slot = bool;

    fn empty_slot() -> bool {
        false
    }

    fn from_slot(slot: bool, _: &Arc<EngineContext>) -> BindResult<Self> {
        Ok(slot)
    }
}

// Engine integers are 64-bit on the wire.
macro_rules! impl_ptr_int {
    ($($ty:ty),*) => {
        $(
            impl PtrArg for $ty {
                type Slot = i64;

                fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<i64> {
                    Ok(i64::from(*self))
                }
            }

            impl PtrReturn for $ty {
                type Slot = i64;

                fn empty_slot() -> i64 {
                    0
                }

                fn from_slot(slot: i64, _: &Arc<EngineContext>) -> BindResult<Self> {
                    <$ty>::try_from(slot).map_err(|_| {
                        BindError::type_mismatch(stringify!($ty), format!("int {slot} (out of range)"))
                    })
                }
            }
        )*
    };
}

impl_ptr_int!(i8, i16, i32, i64, u8, u16, u32);

impl PtrArg for f64 {
    type Slot = f64;

    fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<f64> {
        Ok(*self)
    }
}

impl PtrReturn for f64 {
    type Slot = f64;

    fn empty_slot() -> f64 {
        0.0
    }

    fn from_slot(slot: f64, _: &Arc<EngineContext>) -> BindResult<Self> {
        Ok(slot)
    }
}

impl PtrArg for f32 {
    type Slot = f64;

    fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<f64> {
        Ok(f64::from(*self))
    }
}

impl PtrReturn for f32 {
    type Slot = f64;

    fn empty_slot() -> f64 {
        0.0
    }

    fn from_slot(slot: f64, _: &Arc<EngineContext>) -> BindResult<Self> {
        Ok(slot as f32)
    }
}

macro_rules! impl_ptr_vector {
    ($($ty:ident = $n:literal),*) => {
        $(
            impl PtrArg for $ty {
                type Slot = [f32; $n];

                fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<[f32; $n]> {
                    Ok(self.to_array())
                }
            }

            impl PtrReturn for $ty {
                type Slot = [f32; $n];

                fn empty_slot() -> [f32; $n] {
                    [0.0; $n]
                }

                fn from_slot(slot: [f32; $n], _: &Arc<EngineContext>) -> BindResult<Self> {
                    Ok($ty::from_array(slot))
                }
            }
        )*
    };
}

impl_ptr_vector!(Vector2 = 2, Vector3 = 3, Color = 4);

/// Methods returning the engine's error enum.
impl PtrArg for ErrorCode {
    type Slot = i64;

    fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<i64> {
        Ok(i64::from(self.as_i32()))
    }
}

impl PtrReturn for ErrorCode {
    type Slot = i64;

    fn empty_slot() -> i64 {
        0
    }

    fn from_slot(slot: i64, _: &Arc<EngineContext>) -> BindResult<Self> {
        Ok(i32::try_from(slot)
            .ok()
            .and_then(|code| ErrorCode::try_from(code).ok())
            .unwrap_or(ErrorCode::Failed))
    }
}

// ============================================================================
// Strings
// ============================================================================

/// A host string crosses as a temporary engine string owned by the frame.
impl PtrArg for str {
    type Slot = crate::abi::BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<Self::Slot> {
        let string = GString::new(frame.context(), self);
        let ptr = string.as_builtin();
        frame.hold(string);
        Ok(ptr)
    }
}

impl PtrArg for String {
    type Slot = crate::abi::BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<Self::Slot> {
        self.as_str().to_slot(frame)
    }
}

/// Copies the returned engine string into host memory and destroys it.
impl PtrReturn for String {
    type Slot = Option<crate::abi::BuiltinPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        GString::from_slot(slot, context)?.to_host()
    }
}

// ============================================================================
// Objects
// ============================================================================

impl<M: HandleMode> PtrArg for Handle<M> {
    type Slot = Option<ObjectPtr>;

    fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<Self::Slot> {
        self.ptr().map(Some)
    }
}

impl<M: HandleMode> PtrArg for Option<Handle<M>> {
    type Slot = Option<ObjectPtr>;

    fn to_slot(&self, _: &mut ArgumentFrame) -> BindResult<Self::Slot> {
        self.as_ref().map(Handle::ptr).transpose()
    }
}

fn runtime_class(context: &EngineContext, ptr: ObjectPtr) -> BindResult<ClassTag> {
    context
        .engine()
        .object_class(ptr)
        .map(|class| ClassTag::new(&class))
        .ok_or_else(|| BindError::NullHandle {
            class: "Object".to_owned(),
        })
}

/// Ownership of the returned object transfers to the host.
impl PtrReturn for Option<Handle<Owned>> {
    type Slot = Option<ObjectPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        slot.map(|ptr| {
            let class = runtime_class(context, ptr)?;
            context.handles().adopt_owned(ptr, class)
        })
        .transpose()
    }
}

impl PtrReturn for Handle<Owned> {
    type Slot = Option<ObjectPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        Option::<Handle<Owned>>::from_slot(slot, context)?.ok_or_else(|| BindError::NullHandle {
            class: "Object".to_owned(),
        })
    }
}

/// The engine keeps ownership of the returned object.
impl PtrReturn for Option<Handle<Observed>> {
    type Slot = Option<ObjectPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        slot.map(|ptr| {
            let class = runtime_class(context, ptr)?;
            context.handles().observe(ptr, class)
        })
        .transpose()
    }
}

impl PtrReturn for Handle<Observed> {
    type Slot = Option<ObjectPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        Option::<Handle<Observed>>::from_slot(slot, context)?.ok_or_else(|| {
            BindError::NullHandle {
                class: "Object".to_owned(),
            }
        })
    }
}
