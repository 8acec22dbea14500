//! In-crate mock host for unit tests.
//!
//! Method "bodies" are plain heap pages: compiled entries are filled with
//! `ret` bytes, uncompiled entries carry the current architecture's
//! precode stub shape. Nothing is ever executed; the invocation path
//! reports the first byte it would have dispatched through, which is
//! exactly what the restore-contract tests need to observe.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::arch::{precode, Arch};
use crate::host::{HostRuntime, InvokeError, MethodHandle, MethodKind, Param};

const PAGE: usize = 4096;

// =============================================================================
// Values and errors
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockValue {
    Null,
    Int(i64),
    Obj(u32),
}

#[derive(Debug)]
pub struct MockError(pub String);

impl fmt::Display for MockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockError {}

/// How this "runtime version" exposes dynamic-method handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockReflection {
    DescriptorMethod,
    Field(&'static str),
    None,
}

// =============================================================================
// Method records
// =============================================================================

struct PageCell(UnsafeCell<[u8; PAGE]>);

// SAFETY: tests mutate pages only through the redirection machinery under
// the root-set test guard; the cell exists to make those writes sound.
unsafe impl Sync for PageCell {}
unsafe impl Send for PageCell {}

struct MethodRec {
    kind: MethodKind,
    is_static: bool,
    declaring: u32,
    params: Vec<(u32, Option<MockValue>)>,
    page: Arc<PageCell>,
    offset: usize,
    compiled: Mutex<bool>,
    raises: bool,
    broken: bool,
    invocations: AtomicUsize,
    last_args: Mutex<Vec<MockValue>>,
    last_receiver: Mutex<Option<MockValue>>,
}

impl MethodRec {
    fn entry(&self) -> *mut u8 {
        // SAFETY: offset stays well inside the page.
        unsafe { (self.page.0.get() as *mut u8).add(self.offset) }
    }

    fn fill_compiled(&self) {
        // SAFETY: the record owns (a slice of) the page.
        unsafe {
            std::ptr::write_bytes(self.entry(), 0xC3, 32);
        }
        *self.compiled.lock() = true;
    }

    fn fill_precode(&self) {
        let pattern = precode::stub_pattern(Arch::current().unwrap());
        // SAFETY: as in fill_compiled; patterns are far smaller than a page.
        unsafe {
            std::ptr::write_bytes(self.entry(), 0, 32);
            std::ptr::copy_nonoverlapping(
                pattern.bytes.as_ptr(),
                self.entry().add(pattern.offset),
                pattern.bytes.len(),
            );
        }
        *self.compiled.lock() = false;
    }
}

/// Opaque descriptor handed to the library.
#[derive(Clone)]
pub struct MockMethod(usize);

struct TypeRec {
    value_type: bool,
    is_abstract: bool,
    ctors: Vec<usize>,
}

// =============================================================================
// MockHost
// =============================================================================

pub struct MockHost {
    reflection: MockReflection,
    prepare_enabled: bool,
    uninitialized_enabled: bool,
    methods: Mutex<Vec<Arc<MethodRec>>>,
    types: Mutex<Vec<TypeRec>>,
    prepare_calls: AtomicUsize,
    member_method_probes: AtomicUsize,
    member_field_probes: AtomicUsize,
}

impl MockHost {
    /// Built-in integer value type.
    pub const INT: u32 = 0;

    pub fn new() -> Self {
        Self {
            reflection: MockReflection::DescriptorMethod,
            prepare_enabled: true,
            uninitialized_enabled: true,
            methods: Mutex::new(Vec::new()),
            types: Mutex::new(vec![
                TypeRec {
                    value_type: true,
                    is_abstract: false,
                    ctors: Vec::new(),
                },
                TypeRec {
                    value_type: false,
                    is_abstract: false,
                    ctors: Vec::new(),
                },
            ]),
            prepare_calls: AtomicUsize::new(0),
            member_method_probes: AtomicUsize::new(0),
            member_field_probes: AtomicUsize::new(0),
        }
    }

    pub fn with_reflection(reflection: MockReflection) -> Self {
        Self {
            reflection,
            ..Self::new()
        }
    }

    pub fn without_prepare(mut self) -> Self {
        self.prepare_enabled = false;
        self
    }

    pub fn without_uninitialized(mut self) -> Self {
        self.uninitialized_enabled = false;
        self
    }

    /// Built-in reference type with no constructors.
    pub fn object_type() -> u32 {
        1
    }

    // --- definition helpers ---------------------------------------------------

    fn add_method(
        &self,
        kind: MethodKind,
        is_static: bool,
        declaring: u32,
        params: Vec<(u32, Option<MockValue>)>,
        compiled: bool,
        raises: bool,
        broken: bool,
        page: Arc<PageCell>,
        offset: usize,
    ) -> MockMethod {
        let rec = Arc::new(MethodRec {
            kind,
            is_static,
            declaring,
            params,
            page,
            offset,
            compiled: Mutex::new(false),
            raises,
            broken,
            invocations: AtomicUsize::new(0),
            last_args: Mutex::new(Vec::new()),
            last_receiver: Mutex::new(None),
        });
        if compiled {
            rec.fill_compiled();
        } else {
            rec.fill_precode();
        }
        let mut methods = self.methods.lock();
        methods.push(rec);
        MockMethod(methods.len() - 1)
    }

    fn fresh_page() -> Arc<PageCell> {
        Arc::new(PageCell(UnsafeCell::new([0u8; PAGE])))
    }

    pub fn define_static_int(&self, _ret: i64) -> MockMethod {
        self.add_method(
            MethodKind::Regular,
            true,
            Self::object_type(),
            Vec::new(),
            true,
            false,
            false,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_dynamic_int(&self, _ret: i64) -> MockMethod {
        self.add_method(
            MethodKind::Dynamic,
            true,
            Self::object_type(),
            Vec::new(),
            true,
            false,
            false,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_uncompiled_static(&self, _ret: i64) -> MockMethod {
        self.add_method(
            MethodKind::Regular,
            true,
            Self::object_type(),
            Vec::new(),
            false,
            false,
            false,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_uncompiled_instance(&self, declaring: u32, _ret: i64) -> MockMethod {
        self.add_method(
            MethodKind::Regular,
            false,
            declaring,
            Vec::new(),
            false,
            false,
            false,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_static_with_params(
        &self,
        _ret: i64,
        params: Vec<(u32, Option<MockValue>)>,
    ) -> MockMethod {
        self.add_method(
            MethodKind::Regular,
            true,
            Self::object_type(),
            params,
            false,
            false,
            false,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_raising_static(&self) -> MockMethod {
        self.add_method(
            MethodKind::Regular,
            true,
            Self::object_type(),
            Vec::new(),
            true,
            true,
            false,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_broken_static(&self) -> MockMethod {
        self.add_method(
            MethodKind::Regular,
            true,
            Self::object_type(),
            Vec::new(),
            true,
            false,
            true,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_instance_method(&self, declaring: u32, _ret: i64) -> MockMethod {
        self.add_method(
            MethodKind::Regular,
            false,
            declaring,
            Vec::new(),
            true,
            false,
            false,
            Self::fresh_page(),
            0,
        )
    }

    pub fn define_abstract_type(&self) -> u32 {
        let mut types = self.types.lock();
        types.push(TypeRec {
            value_type: false,
            is_abstract: true,
            ctors: Vec::new(),
        });
        (types.len() - 1) as u32
    }

    pub fn define_reference_type(&self) -> u32 {
        let mut types = self.types.lock();
        types.push(TypeRec {
            value_type: false,
            is_abstract: false,
            ctors: Vec::new(),
        });
        (types.len() - 1) as u32
    }

    pub fn define_ctor(&self, declaring: u32, arity: usize) -> MockMethod {
        let params = (0..arity).map(|_| (Self::object_type(), None)).collect();
        let ctor = self.add_method(
            MethodKind::Constructor,
            false,
            declaring,
            params,
            true,
            false,
            false,
            Self::fresh_page(),
            0,
        );
        self.types.lock()[declaring as usize].ctors.push(ctor.0);
        ctor
    }

    /// Two compiled methods four bytes apart in one page.
    pub fn define_close_pair(&self) -> (MockMethod, MockMethod) {
        let page = Self::fresh_page();
        let a = self.add_method(
            MethodKind::Regular,
            true,
            Self::object_type(),
            Vec::new(),
            true,
            false,
            false,
            Arc::clone(&page),
            0,
        );
        let b = self.add_method(
            MethodKind::Regular,
            true,
            Self::object_type(),
            Vec::new(),
            true,
            false,
            false,
            page,
            4,
        );
        (a, b)
    }

    // --- observation helpers ---------------------------------------------------

    fn rec(&self, m: &MockMethod) -> Arc<MethodRec> {
        Arc::clone(&self.methods.lock()[m.0])
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::Relaxed)
    }

    pub fn member_method_probes(&self) -> usize {
        self.member_method_probes.load(Ordering::Relaxed)
    }

    pub fn member_field_probes(&self) -> usize {
        self.member_field_probes.load(Ordering::Relaxed)
    }

    pub fn invocations(&self, m: &MockMethod) -> usize {
        self.rec(m).invocations.load(Ordering::Relaxed)
    }

    pub fn last_arguments(&self, m: &MockMethod) -> Vec<MockValue> {
        self.rec(m).last_args.lock().clone()
    }

    pub fn last_receiver(&self, m: &MockMethod) -> Option<MockValue> {
        self.rec(m).last_receiver.lock().clone()
    }

    fn dispatch(
        &self,
        rec: &MethodRec,
        receiver: Option<MockValue>,
        args: &[MockValue],
    ) -> Result<MockValue, InvokeError<MockError>> {
        if rec.broken {
            return Err(InvokeError::Machinery(MockError(
                "reflection machinery rejected the call".into(),
            )));
        }
        // First call through an uncompiled entry runs the JIT.
        if !*rec.compiled.lock() {
            rec.fill_compiled();
        }
        rec.invocations.fetch_add(1, Ordering::Relaxed);
        *rec.last_args.lock() = args.to_vec();
        *rec.last_receiver.lock() = receiver;
        if rec.raises {
            return Err(InvokeError::Raised(MockError("body threw".into())));
        }
        // SAFETY: the entry stays readable for the record's lifetime.
        let first = unsafe { rec.entry().read() };
        Ok(MockValue::Int(first as i64))
    }
}

impl HostRuntime for MockHost {
    type Method = MockMethod;
    type Type = u32;
    type Value = MockValue;
    type Exception = MockError;

    fn method_kind(&self, method: &MockMethod) -> MethodKind {
        self.rec(method).kind
    }

    fn is_static(&self, method: &MockMethod) -> bool {
        self.rec(method).is_static
    }

    fn declaring_type(&self, method: &MockMethod) -> u32 {
        self.rec(method).declaring
    }

    fn parameters(&self, method: &MockMethod) -> Vec<Param<u32, MockValue>> {
        self.rec(method)
            .params
            .iter()
            .map(|(ty, default)| Param {
                ty: *ty,
                default: default.clone(),
            })
            .collect()
    }

    fn method_handle(&self, method: &MockMethod) -> Option<MethodHandle> {
        match self.rec(method).kind {
            MethodKind::Dynamic => None,
            _ => Some(MethodHandle(method.0)),
        }
    }

    fn handle_from_member_method(&self, method: &MockMethod, name: &str) -> Option<MethodHandle> {
        self.member_method_probes.fetch_add(1, Ordering::Relaxed);
        match self.reflection {
            MockReflection::DescriptorMethod if name == "GetMethodDescriptor" => {
                Some(MethodHandle(method.0))
            }
            _ => None,
        }
    }

    fn handle_from_member_field(&self, method: &MockMethod, name: &str) -> Option<MethodHandle> {
        self.member_field_probes.fetch_add(1, Ordering::Relaxed);
        match self.reflection {
            MockReflection::Field(field) if name == field => Some(MethodHandle(method.0)),
            _ => None,
        }
    }

    fn function_pointer(&self, handle: MethodHandle) -> *const u8 {
        self.methods.lock()[handle.0].entry()
    }

    fn prepare_method(&self, handle: MethodHandle) -> Option<bool> {
        if !self.prepare_enabled {
            return None;
        }
        self.prepare_calls.fetch_add(1, Ordering::Relaxed);
        let rec = Arc::clone(&self.methods.lock()[handle.0]);
        if !*rec.compiled.lock() {
            rec.fill_compiled();
        }
        Some(true)
    }

    fn is_value_type(&self, ty: u32) -> bool {
        self.types.lock()[ty as usize].value_type
    }

    fn is_abstract(&self, ty: u32) -> bool {
        self.types.lock()[ty as usize].is_abstract
    }

    fn zeroed_value(&self, _ty: u32) -> MockValue {
        MockValue::Int(0)
    }

    fn null_value(&self) -> MockValue {
        MockValue::Null
    }

    fn uninitialized_instance(&self, ty: u32) -> Option<MockValue> {
        self.uninitialized_enabled.then_some(MockValue::Obj(ty))
    }

    fn constructors(&self, ty: u32) -> Vec<MockMethod> {
        self.types.lock()[ty as usize]
            .ctors
            .iter()
            .map(|&id| MockMethod(id))
            .collect()
    }

    fn invoke(
        &self,
        method: &MockMethod,
        receiver: Option<MockValue>,
        args: &[MockValue],
    ) -> Result<MockValue, InvokeError<MockError>> {
        let rec = self.rec(method);
        self.dispatch(&rec, receiver, args)
    }

    fn construct(
        &self,
        ctor: &MockMethod,
        args: &[MockValue],
    ) -> Result<MockValue, InvokeError<MockError>> {
        let rec = self.rec(ctor);
        let instance = MockValue::Obj(rec.declaring);
        self.dispatch(&rec, Some(instance.clone()), args)?;
        Ok(instance)
    }
}
