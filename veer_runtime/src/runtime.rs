//! The reference managed runtime.
//!
//! Methods are defined against a small type system and compiled lazily:
//! a fresh method's entry address points at a precode stub page, and the
//! first call (or an explicit prepare) runs the template JIT and moves
//! the entry to real native code. Invocation always dispatches through
//! the method's *current* entry bytes, so an installed trampoline is
//! honored and a restored prologue is observable.
//!
//! The runtime itself holds only weak references to method definitions.
//! A descriptor (or a root-set clone of one) is what keeps a method and
//! its code pages alive; `collect()` sweeps the rest.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use veer_core::host::{HostRuntime, InvokeError, MethodHandle, MethodKind, Param};

use crate::body::{self, Body};
use crate::emit;
use crate::exec_mem::ExecutableBuffer;
use crate::precode::{self, PrecodeForm};
use crate::value::{Instance, Value};

// =============================================================================
// Identifiers and configuration
// =============================================================================

/// Index into the runtime's type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    /// Built-in 64-bit integer value type.
    pub const INT: TypeId = TypeId(0);
    /// Built-in root reference type.
    pub const OBJECT: TypeId = TypeId(1);
}

/// Which non-public member exposes dynamic-method handles on this
/// runtime revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionVersion {
    /// A `GetMethodDescriptor` member method.
    Modern,
    /// An `mhandle` field.
    Legacy,
}

/// Knobs for the hosted runtime's observable surface.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// How dynamic-method handles are reachable.
    pub reflection: ReflectionVersion,
    /// Whether the prepare-method facility is exposed at all.
    pub prepare_facility: bool,
    /// Whether the uninitialized-object primitive is exposed.
    pub uninitialized_objects: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            reflection: ReflectionVersion::Modern,
            prepare_facility: true,
            uninitialized_objects: true,
        }
    }
}

// =============================================================================
// Exceptions
// =============================================================================

/// What method bodies (and the invocation machinery) throw.
#[derive(Debug)]
pub struct Exception {
    message: String,
}

impl Exception {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Exception {}

// =============================================================================
// Method definitions
// =============================================================================

/// One formal parameter of a method under definition.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub ty: TypeId,
    pub default: Option<Value>,
}

impl ParamSpec {
    /// Parameter of `ty` with no declared default.
    pub fn of(ty: TypeId) -> Self {
        Self { ty, default: None }
    }

    /// Parameter of `ty` with a declared default value.
    pub fn with_default(ty: TypeId, default: Value) -> Self {
        Self {
            ty,
            default: Some(default),
        }
    }
}

enum MethodState {
    /// Entry is a precode stub page; no native body yet.
    Precode(ExecutableBuffer),
    /// Entry is the JIT-emitted native body.
    Compiled(ExecutableBuffer),
}

impl MethodState {
    fn entry(&self) -> *const u8 {
        match self {
            MethodState::Precode(buf) | MethodState::Compiled(buf) => buf.as_ptr(),
        }
    }

    fn is_compiled(&self) -> bool {
        matches!(self, MethodState::Compiled(_))
    }
}

struct MethodDef {
    slot: usize,
    name: String,
    kind: MethodKind,
    is_static: bool,
    declaring: TypeId,
    params: Vec<ParamSpec>,
    body: Body,
    state: Mutex<MethodState>,
}

/// An opaque method descriptor. Cloning is cheap; any live clone,
/// including one parked in the process root set, keeps the method's
/// definition and code pages alive.
#[derive(Clone)]
pub struct Method(Arc<MethodDef>);

impl Method {
    /// The method's declared name.
    pub fn name(&self) -> &str {
        &self.0.name
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.0.name)
            .field("slot", &self.0.slot)
            .finish()
    }
}

/// Everything needed to define a regular method.
pub struct MethodSpec {
    name: String,
    declaring: TypeId,
    is_static: bool,
    params: Vec<ParamSpec>,
    body: Body,
}

impl MethodSpec {
    /// A static method on the root type with no parameters.
    pub fn static_fn(name: &str, body: Body) -> Self {
        Self {
            name: name.into(),
            declaring: TypeId::OBJECT,
            is_static: true,
            params: Vec::new(),
            body,
        }
    }

    /// An instance method on `declaring` with no parameters.
    pub fn instance(name: &str, declaring: TypeId, body: Body) -> Self {
        Self {
            name: name.into(),
            declaring,
            is_static: false,
            params: Vec::new(),
            body,
        }
    }

    /// Attach formal parameters.
    pub fn with_params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }
}

// =============================================================================
// Type definitions
// =============================================================================

struct TypeDef {
    name: String,
    value_type: bool,
    is_abstract: bool,
    ctors: Vec<Method>,
}

// =============================================================================
// Runtime
// =============================================================================

/// The hosted runtime.
pub struct Runtime {
    config: RuntimeConfig,
    types: RwLock<Vec<TypeDef>>,
    type_names: RwLock<FxHashMap<String, TypeId>>,
    /// Weak method table; the index is the runtime handle. Swept slots
    /// become `None`.
    methods: RwLock<Vec<Option<Weak<MethodDef>>>>,
}

impl Runtime {
    /// A runtime with the default configuration.
    pub fn new() -> Arc<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// A runtime with explicit configuration knobs.
    pub fn with_config(config: RuntimeConfig) -> Arc<Self> {
        let runtime = Arc::new(Self {
            config,
            types: RwLock::new(Vec::new()),
            type_names: RwLock::new(FxHashMap::default()),
            methods: RwLock::new(Vec::new()),
        });
        runtime.add_type("Int64", true, false);
        runtime.add_type("Object", false, false);
        runtime
    }

    // --- type registration -----------------------------------------------------

    fn add_type(&self, name: &str, value_type: bool, is_abstract: bool) -> TypeId {
        let mut types = self.types.write();
        let id = TypeId(types.len() as u32);
        types.push(TypeDef {
            name: name.into(),
            value_type,
            is_abstract,
            ctors: Vec::new(),
        });
        self.type_names.write().insert(name.into(), id);
        id
    }

    /// Define an inline value type.
    pub fn define_value_type(&self, name: &str) -> TypeId {
        self.add_type(name, true, false)
    }

    /// Define an instantiable reference type.
    pub fn define_class(&self, name: &str) -> TypeId {
        self.add_type(name, false, false)
    }

    /// Define a reference type that cannot be instantiated.
    pub fn define_abstract_class(&self, name: &str) -> TypeId {
        self.add_type(name, false, true)
    }

    /// Look a type up by name.
    pub fn type_named(&self, name: &str) -> Option<TypeId> {
        self.type_names.read().get(name).copied()
    }

    // --- method registration ----------------------------------------------------

    fn register(
        &self,
        name: String,
        kind: MethodKind,
        is_static: bool,
        declaring: TypeId,
        params: Vec<ParamSpec>,
        body: Body,
    ) -> Method {
        let mut methods = self.methods.write();
        let slot = methods.len();
        let form = match kind {
            MethodKind::Dynamic => PrecodeForm::Fixup,
            _ => PrecodeForm::Stub,
        };
        let stub = precode::stub_page(form, slot);
        tracing::trace!(
            method = %name,
            slot,
            entry = stub.as_ptr() as usize,
            "method defined, precode installed"
        );
        let def = Arc::new(MethodDef {
            slot,
            name,
            kind,
            is_static,
            declaring,
            params,
            body,
            state: Mutex::new(MethodState::Precode(stub)),
        });
        methods.push(Some(Arc::downgrade(&def)));
        Method(def)
    }

    /// Define a regular method.
    pub fn define_method(&self, spec: MethodSpec) -> Method {
        self.register(
            spec.name,
            MethodKind::Regular,
            spec.is_static,
            spec.declaring,
            spec.params,
            spec.body,
        )
    }

    /// Emit a dynamic method: no natural handle property, reachable only
    /// through the runtime's non-public reflection members.
    pub fn emit_dynamic(&self, name: &str, params: Vec<ParamSpec>, body: Body) -> Method {
        self.register(
            name.into(),
            MethodKind::Dynamic,
            true,
            TypeId::OBJECT,
            params,
            body,
        )
    }

    /// Define a constructor on `declaring`.
    pub fn define_constructor(
        &self,
        declaring: TypeId,
        params: Vec<ParamSpec>,
        body: Body,
    ) -> Method {
        let ctor = self.register(
            format!(".ctor@{}", self.types.read()[declaring.0 as usize].name),
            MethodKind::Constructor,
            false,
            declaring,
            params,
            body,
        );
        self.types.write()[declaring.0 as usize]
            .ctors
            .push(ctor.clone());
        ctor
    }

    // --- compilation ------------------------------------------------------------

    fn ensure_compiled(&self, def: &MethodDef) {
        let mut state = def.state.lock();
        if state.is_compiled() {
            return;
        }
        let code = emit::compile(&def.body);
        tracing::debug!(
            method = %def.name,
            entry = code.as_ptr() as usize,
            "method compiled"
        );
        *state = MethodState::Compiled(code);
    }

    // --- collection -------------------------------------------------------------

    /// Sweep method-table slots whose definitions no longer have any
    /// strong referent. Returns the number of slots reclaimed.
    pub fn collect(&self) -> usize {
        let mut methods = self.methods.write();
        let mut reclaimed = 0;
        for slot in methods.iter_mut() {
            if slot.as_ref().is_some_and(|weak| weak.upgrade().is_none()) {
                *slot = None;
                reclaimed += 1;
            }
        }
        tracing::debug!(reclaimed, "collection finished");
        reclaimed
    }

    /// Methods still reachable through some strong descriptor.
    pub fn live_methods(&self) -> usize {
        self.methods
            .read()
            .iter()
            .filter(|slot| {
                slot.as_ref()
                    .is_some_and(|weak| weak.upgrade().is_some())
            })
            .count()
    }

    // --- invocation -------------------------------------------------------------

    fn call_native(
        &self,
        def: &MethodDef,
        receiver: Option<&Value>,
        args: &[Value],
    ) -> Result<i64, InvokeError<Exception>> {
        if args.len() != def.params.len() {
            return Err(InvokeError::Machinery(Exception::new(format!(
                "{}: expected {} arguments, got {}",
                def.name,
                def.params.len(),
                args.len()
            ))));
        }
        if !def.is_static && receiver.is_none() {
            return Err(InvokeError::Machinery(Exception::new(format!(
                "{}: instance method called without a receiver",
                def.name
            ))));
        }

        // JIT on first call.
        self.ensure_compiled(def);
        let entry = def.state.lock().entry();

        let (slot0, slot1) = if def.is_static {
            (
                args.first().map(Value::to_slot).unwrap_or(0),
                args.get(1).map(Value::to_slot).unwrap_or(0),
            )
        } else {
            (
                receiver.map(Value::to_slot).unwrap_or(0),
                args.first().map(Value::to_slot).unwrap_or(0),
            )
        };

        body::clear_pending_raise();
        // SAFETY: `entry` holds a complete body for the uniform signature;
        // dispatching through the current bytes is the whole point.
        let thunk: unsafe extern "C" fn(i64, i64) -> i64 =
            unsafe { std::mem::transmute(entry) };
        let result = unsafe { thunk(slot0, slot1) };
        if body::take_pending_raise() {
            return Err(InvokeError::Raised(Exception::new(format!(
                "{} threw",
                def.name
            ))));
        }
        Ok(result)
    }
}

// =============================================================================
// HostRuntime implementation
// =============================================================================

impl HostRuntime for Runtime {
    type Method = Method;
    type Type = TypeId;
    type Value = Value;
    type Exception = Exception;

    fn method_kind(&self, method: &Method) -> MethodKind {
        method.0.kind
    }

    fn is_static(&self, method: &Method) -> bool {
        method.0.is_static
    }

    fn declaring_type(&self, method: &Method) -> TypeId {
        method.0.declaring
    }

    fn parameters(&self, method: &Method) -> Vec<Param<TypeId, Value>> {
        method
            .0
            .params
            .iter()
            .map(|p| Param {
                ty: p.ty,
                default: p.default.clone(),
            })
            .collect()
    }

    fn method_handle(&self, method: &Method) -> Option<MethodHandle> {
        match method.0.kind {
            MethodKind::Dynamic => None,
            _ => Some(MethodHandle(method.0.slot)),
        }
    }

    fn handle_from_member_method(&self, method: &Method, name: &str) -> Option<MethodHandle> {
        if method.0.kind == MethodKind::Dynamic
            && self.config.reflection == ReflectionVersion::Modern
            && name == "GetMethodDescriptor"
        {
            Some(MethodHandle(method.0.slot))
        } else {
            None
        }
    }

    fn handle_from_member_field(&self, method: &Method, name: &str) -> Option<MethodHandle> {
        if method.0.kind == MethodKind::Dynamic
            && self.config.reflection == ReflectionVersion::Legacy
            && name == "mhandle"
        {
            Some(MethodHandle(method.0.slot))
        } else {
            None
        }
    }

    fn function_pointer(&self, handle: MethodHandle) -> *const u8 {
        self.methods
            .read()
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .and_then(Weak::upgrade)
            .map(|def| def.state.lock().entry())
            .unwrap_or(std::ptr::null())
    }

    fn prepare_method(&self, handle: MethodHandle) -> Option<bool> {
        if !self.config.prepare_facility {
            return None;
        }
        let def = self
            .methods
            .read()
            .get(handle.0)
            .and_then(|slot| slot.as_ref())
            .and_then(Weak::upgrade);
        match def {
            Some(def) => {
                self.ensure_compiled(&def);
                Some(true)
            }
            None => Some(false),
        }
    }

    fn is_value_type(&self, ty: TypeId) -> bool {
        self.types.read()[ty.0 as usize].value_type
    }

    fn is_abstract(&self, ty: TypeId) -> bool {
        self.types.read()[ty.0 as usize].is_abstract
    }

    fn zeroed_value(&self, _ty: TypeId) -> Value {
        Value::Int(0)
    }

    fn null_value(&self) -> Value {
        Value::Null
    }

    fn uninitialized_instance(&self, ty: TypeId) -> Option<Value> {
        if !self.config.uninitialized_objects {
            return None;
        }
        let types = self.types.read();
        let def = &types[ty.0 as usize];
        if def.value_type || def.is_abstract {
            return None;
        }
        Some(Value::Obj(Instance::new(ty)))
    }

    fn constructors(&self, ty: TypeId) -> Vec<Method> {
        self.types.read()[ty.0 as usize].ctors.clone()
    }

    fn invoke(
        &self,
        method: &Method,
        receiver: Option<Value>,
        args: &[Value],
    ) -> Result<Value, InvokeError<Exception>> {
        self.call_native(&method.0, receiver.as_ref(), args)
            .map(Value::Int)
    }

    fn construct(
        &self,
        ctor: &Method,
        args: &[Value],
    ) -> Result<Value, InvokeError<Exception>> {
        if ctor.0.kind != MethodKind::Constructor {
            return Err(InvokeError::Machinery(Exception::new(format!(
                "{} is not a constructor",
                ctor.0.name
            ))));
        }
        let instance = Value::Obj(Instance::new(ctor.0.declaring));
        self.call_native(&ctor.0, Some(&instance), args)?;
        Ok(instance)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use veer_core::arch::{precode as core_precode, Arch};

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    #[test]
    fn test_invoke_static_method() {
        let rt = Runtime::new();
        let add1 = rt.define_method(
            MethodSpec::static_fn("add1", Body::AddArg0(1))
                .with_params(vec![ParamSpec::of(TypeId::INT)]),
        );
        let result = rt.invoke(&add1, None, &[int(10)]).unwrap();
        assert_eq!(result.as_int(), Some(11));
    }

    #[test]
    fn test_first_call_compiles_and_moves_entry() {
        let rt = Runtime::new();
        let m = rt.define_method(MethodSpec::static_fn("lazy", Body::ReturnInt(5)));
        let handle = rt.method_handle(&m).unwrap();
        let arch = Arch::current().unwrap();

        let before = rt.function_pointer(handle);
        // SAFETY: precode page is readable.
        assert!(!unsafe { veer_core::jit::is_compiled(before, core_precode::patterns(arch)) });

        rt.invoke(&m, None, &[]).unwrap();

        let after = rt.function_pointer(handle);
        assert_ne!(before, after);
        // SAFETY: compiled body is readable.
        assert!(unsafe { veer_core::jit::is_compiled(after, core_precode::patterns(arch)) });
    }

    #[test]
    fn test_prepare_facility_compiles() {
        let rt = Runtime::new();
        let m = rt.define_method(MethodSpec::static_fn("prep", Body::ReturnInt(5)));
        let handle = rt.method_handle(&m).unwrap();
        assert_eq!(rt.prepare_method(handle), Some(true));
        let arch = Arch::current().unwrap();
        // SAFETY: compiled body is readable.
        assert!(unsafe {
            veer_core::jit::is_compiled(rt.function_pointer(handle), core_precode::patterns(arch))
        });
    }

    #[test]
    fn test_prepare_facility_can_be_disabled() {
        let rt = Runtime::with_config(RuntimeConfig {
            prepare_facility: false,
            ..RuntimeConfig::default()
        });
        let m = rt.define_method(MethodSpec::static_fn("noprep", Body::ReturnInt(5)));
        let handle = rt.method_handle(&m).unwrap();
        assert_eq!(rt.prepare_method(handle), None);
    }

    #[test]
    fn test_instance_method_receives_receiver() {
        let rt = Runtime::new();
        let cls = rt.define_class("Widget");
        let getter = rt.define_method(MethodSpec::instance("value", cls, Body::ReturnInt(7)));
        let receiver = Value::Obj(Instance::new(cls));
        assert_eq!(
            rt.invoke(&getter, Some(receiver), &[]).unwrap().as_int(),
            Some(7)
        );
        // Missing receiver is a machinery failure.
        assert!(matches!(
            rt.invoke(&getter, None, &[]),
            Err(InvokeError::Machinery(_))
        ));
    }

    #[test]
    fn test_raise_body_surfaces_as_raised() {
        let rt = Runtime::new();
        let m = rt.define_method(MethodSpec::static_fn("boom", Body::Helper(body::Helper::Raise)));
        assert!(matches!(
            rt.invoke(&m, None, &[]),
            Err(InvokeError::Raised(_))
        ));
    }

    #[test]
    fn test_arity_mismatch_is_machinery() {
        let rt = Runtime::new();
        let m = rt.define_method(
            MethodSpec::static_fn("one", Body::AddArg0(1))
                .with_params(vec![ParamSpec::of(TypeId::INT)]),
        );
        assert!(matches!(
            rt.invoke(&m, None, &[]),
            Err(InvokeError::Machinery(_))
        ));
    }

    #[test]
    fn test_dynamic_reflection_surfaces() {
        let modern = Runtime::new();
        let m = modern.emit_dynamic("dyn", Vec::new(), Body::ReturnInt(3));
        assert!(modern.method_handle(&m).is_none());
        assert!(modern
            .handle_from_member_method(&m, "GetMethodDescriptor")
            .is_some());
        assert!(modern.handle_from_member_field(&m, "mhandle").is_none());

        let legacy = Runtime::with_config(RuntimeConfig {
            reflection: ReflectionVersion::Legacy,
            ..RuntimeConfig::default()
        });
        let m = legacy.emit_dynamic("dyn", Vec::new(), Body::ReturnInt(3));
        assert!(legacy
            .handle_from_member_method(&m, "GetMethodDescriptor")
            .is_none());
        assert!(legacy.handle_from_member_field(&m, "mhandle").is_some());
        assert!(legacy.handle_from_member_field(&m, "m_method").is_none());
    }

    #[test]
    fn test_constructor_roundtrip() {
        let rt = Runtime::new();
        let cls = rt.define_class("Point");
        let ctor = rt.define_constructor(cls, Vec::new(), Body::ReturnInt(0));
        let instance = rt.construct(&ctor, &[]).unwrap();
        match instance {
            Value::Obj(obj) => assert_eq!(obj.ty(), cls),
            other => panic!("expected an instance, got {other:?}"),
        }
        assert_eq!(rt.constructors(cls).len(), 1);
    }

    #[test]
    fn test_collect_reclaims_dropped_methods() {
        let rt = Runtime::new();
        let keep = rt.define_method(MethodSpec::static_fn("keep", Body::ReturnInt(1)));
        let drop_me = rt.define_method(MethodSpec::static_fn("drop", Body::ReturnInt(2)));
        assert_eq!(rt.live_methods(), 2);

        drop(drop_me);
        assert_eq!(rt.collect(), 1);
        assert_eq!(rt.live_methods(), 1);
        // A second sweep finds nothing new.
        assert_eq!(rt.collect(), 0);

        drop(keep);
        assert_eq!(rt.collect(), 1);
    }

    #[test]
    fn test_type_lookup() {
        let rt = Runtime::new();
        assert_eq!(rt.type_named("Int64"), Some(TypeId::INT));
        assert_eq!(rt.type_named("Object"), Some(TypeId::OBJECT));
        let cls = rt.define_class("Widget");
        assert_eq!(rt.type_named("Widget"), Some(cls));
        assert_eq!(rt.type_named("Gadget"), None);
    }
}
