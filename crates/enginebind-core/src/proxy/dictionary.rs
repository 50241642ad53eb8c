use std::fmt;
use std::sync::Arc;

use super::{OwnedBuiltin, PackPolicy, VariantProxy};
use crate::abi::{BuiltinPtr, VariantType};
use crate::context::EngineContext;
use crate::error::{BindError, BindResult};
use crate::frame::{ArgumentFrame, PtrArg, PtrReturn};
use crate::variant::{VarDictionary, Variant, VariantBridge};

/// Owned engine `Dictionary`.
pub struct DictionaryProxy {
    raw: OwnedBuiltin,
    policy: PackPolicy,
}

impl DictionaryProxy {
    pub fn new(context: &Arc<EngineContext>) -> Self {
        let ptr = context.engine().dictionary_new();
        Self::wrap(OwnedBuiltin::new(context, ptr))
    }

    fn wrap(raw: OwnedBuiltin) -> Self {
        DictionaryProxy {
            raw,
            policy: PackPolicy::default(),
        }
    }

    /// Build an engine dictionary from host entries, in iteration order.
    pub fn from_host(context: &Arc<EngineContext>, entries: &VarDictionary) -> BindResult<Self> {
        let dictionary = DictionaryProxy::new(context);
        for (key, value) in entries.iter() {
            dictionary.set(key, value)?;
        }
        Ok(dictionary)
    }

    pub fn from_owned_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
        OwnedBuiltin::adopt(context, ptr, VariantType::Dictionary).map(Self::wrap)
    }

    pub fn from_borrowed_ptr(context: &Arc<EngineContext>, ptr: BuiltinPtr) -> BindResult<Self> {
        OwnedBuiltin::copy_of(context, ptr, VariantType::Dictionary).map(Self::wrap)
    }

    pub fn with_policy(mut self, policy: PackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> PackPolicy {
        self.policy
    }

    #[inline]
    pub fn as_builtin(&self) -> BuiltinPtr {
        self.raw.ptr()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        self.raw.context()
    }

    pub fn len(&self) -> usize {
        self.context().engine().dictionary_len(self.raw.ptr())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &Variant) -> BindResult<Option<Variant>> {
        VariantBridge::dictionary_get(self.context(), self, key)
    }

    pub fn set(&self, key: &Variant, value: &Variant) -> BindResult<()> {
        VariantBridge::dictionary_set(self.context(), self, key, value)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> BindResult<Vec<Variant>> {
        let engine = self.context().engine();
        (0..self.len())
            .map(|index| {
                let key = engine
                    .dictionary_key_at(self.raw.ptr(), index)
                    .ok_or_else(|| BindError::codec(format!("dictionary key {index} vanished")))?;
                VariantProxy::from_owned_ptr(self.context(), key).to_host()
            })
            .collect()
    }

    /// Decode every entry.
    pub fn to_host(&self) -> BindResult<VarDictionary> {
        let mut entries = VarDictionary::new();
        for key in self.keys()? {
            let value = self.get(&key)?.unwrap_or_default();
            entries.insert(key, value);
        }
        Ok(entries)
    }

    pub fn duplicate(&self) -> BindResult<Self> {
        Ok(Self::wrap(self.raw.duplicate()?).with_policy(self.policy))
    }

    pub fn into_raw(self) -> BuiltinPtr {
        self.raw.into_raw()
    }
}

impl fmt::Debug for DictionaryProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DictionaryProxy")
            .field("ptr", &self.raw.ptr())
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

impl PtrArg for DictionaryProxy {
    type Slot = BuiltinPtr;

    fn to_slot(&self, frame: &mut ArgumentFrame) -> BindResult<BuiltinPtr> {
        self.raw.pack(self.policy, frame)
    }
}

impl PtrReturn for DictionaryProxy {
    type Slot = Option<BuiltinPtr>;

    fn empty_slot() -> Self::Slot {
        None
    }

    fn from_slot(slot: Self::Slot, context: &Arc<EngineContext>) -> BindResult<Self> {
        let ptr = slot.ok_or_else(|| BindError::codec("engine wrote no Dictionary"))?;
        DictionaryProxy::from_owned_ptr(context, ptr)
    }
}
