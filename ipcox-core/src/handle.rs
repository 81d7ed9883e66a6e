//! Conversion of rich values into transferable handles.
//!
//! Some context boundaries only let plain structures through: no prototypes, no bound methods, no
//! live references.  [`HandleConverter`] walks a [`Value`] and produces a [`Handle`], a plain
//! mirror of the value's exposed surface.  Functions become wrappers that convert whatever they
//! return, promises become promises of converted values, and objects become handle objects
//! holding the converted exposed members.
//!
//! Conversion is memoized by source identity: converting the same object, function or promise
//! twice yields the very same handle, and self-referential structures terminate because a handle object
//! is cached before its members are populated.
mod class;
mod value;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::binder::{BindKey, Binder, addr_of};
use crate::sync::{MutexExt, RwLockExt};
use crate::{HandleError, Result};

pub use class::{ClassBuilder, ClassDescriptor, ClassRef, NativeMethod, exposed_keys};
pub use value::{FunctionRef, Member, NativeFn, ObjectRef, PromiseRef, Value, ValueKind};

/// The transferable mirror of a [`Value`].
#[derive(Clone)]
pub enum Handle {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Handle>),
    Object(HandleObject),
    Function(HandleFn),
    Promise(HandlePromise),
}

impl Handle {
    pub fn as_object(&self) -> Option<&HandleObject> {
        match self {
            Handle::Object(object) => Some(object),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HandleFn> {
        match self {
            Handle::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Handle::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Handle::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Handle::Null)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Null => f.write_str("null"),
            Handle::Bool(b) => write!(f, "{b}"),
            Handle::Number(n) => write!(f, "{n}"),
            Handle::String(s) => write!(f, "{s:?}"),
            Handle::Array(items) => f.debug_list().entries(items).finish(),
            Handle::Object(object) => write!(f, "handle@{:#x}{:?}", object.id(), object.keys()),
            Handle::Function(function) => write!(f, "handle fn@{:#x}", function.id()),
            Handle::Promise(_) => f.write_str("handle promise"),
        }
    }
}

/// Plain object mirror.  Clones refer to the same handle object.
#[derive(Clone)]
pub struct HandleObject(Arc<RwLock<Vec<(String, Handle)>>>);

impl HandleObject {
    fn empty() -> Self {
        Self(Arc::new(RwLock::new(Vec::new())))
    }

    fn insert(&self, key: String, handle: Handle) {
        self.0.write_unpoisoned().push((key, handle));
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.read_unpoisoned().iter().map(|(key, _)| key.clone()).collect()
    }

    pub fn get(&self, key: &str) -> Option<Handle> {
        self.0
            .read_unpoisoned()
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, handle)| handle.clone())
    }

    pub fn id(&self) -> usize {
        addr_of(&self.0)
    }

    pub fn ptr_eq(&self, other: &HandleObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Callable mirror of a function; calling it converts the function's return value.
#[derive(Clone)]
pub struct HandleFn(Arc<dyn Fn(&[Value]) -> Handle + Send + Sync>);

impl HandleFn {
    pub fn call(&self, args: &[Value]) -> Handle {
        (self.0)(args)
    }

    pub fn id(&self) -> usize {
        addr_of(&self.0)
    }

    pub fn ptr_eq(&self, other: &HandleFn) -> bool {
        self.id() == other.id()
    }
}

/// Promise of a converted value.  Rejection reasons are passed through unconverted.
#[derive(Clone)]
pub struct HandlePromise(Shared<BoxFuture<'static, Result<Handle, Value>>>);

impl HandlePromise {
    pub async fn settle(&self) -> Result<Handle, Value> {
        self.0.clone().await
    }

    pub fn ptr_eq(&self, other: &HandlePromise) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

/// Memoizing converter from [`Value`] to [`Handle`].
///
/// Cheap to clone; clones share the identity caches.  The caches hold on to the source values, so
/// a source is kept alive (and its identity unique) until the converter is dropped or
/// [`HandleConverter::clear`] is called.
#[derive(Clone, Default)]
pub struct HandleConverter {
    inner: Arc<ConverterInner>,
}

#[derive(Default)]
struct ConverterInner {
    objects: Mutex<HashMap<usize, (ObjectRef, HandleObject)>>,
    functions: Mutex<HashMap<usize, (FunctionRef, HandleFn)>>,
    promises: Mutex<HashMap<usize, (PromiseRef, HandlePromise)>>,
    replacements: Mutex<HashMap<usize, (Value, Handle)>>,
    bound_methods: Binder<NativeFn>,
}

impl HandleConverter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert `value` to `replacement` instead of walking it.  Only reference values (objects,
    /// functions, classes) can be replaced.
    pub fn replace_with(&self, value: &Value, replacement: Handle) -> Result<()> {
        let identity = value.identity().ok_or_else(|| HandleError::NotReplaceable {
            kind: value.kind().into(),
        })?;

        self.inner
            .replacements
            .lock_unpoisoned()
            .insert(identity, (value.clone(), replacement));
        Ok(())
    }

    /// Forget every handle converted so far, releasing the source values they pin.
    ///
    /// Replacements registered with [`Self::replace_with`] are kept.  Sources converted after this
    /// get new handles.
    pub fn clear(&self) {
        self.inner.objects.lock_unpoisoned().clear();
        self.inner.functions.lock_unpoisoned().clear();
        self.inner.promises.lock_unpoisoned().clear();
        self.inner.bound_methods.clear();
    }

    /// Number of sources with a cached handle.
    pub fn cached(&self) -> usize {
        self.inner.objects.lock_unpoisoned().len()
            + self.inner.functions.lock_unpoisoned().len()
            + self.inner.promises.lock_unpoisoned().len()
    }

    pub fn convert(&self, value: &Value) -> Handle {
        if let Some(replacement) = self.replacement_for(value) {
            return replacement;
        }

        match value {
            Value::Function(function) => Handle::Function(self.convert_function(function)),
            Value::Null => Handle::Null,
            Value::Bool(b) => Handle::Bool(*b),
            Value::Number(n) => Handle::Number(*n),
            Value::String(s) => Handle::String(s.clone()),
            Value::Class(class) => {
                tracing::error!(
                    class = class.name(),
                    "A class was passed where an instance was expected; converting it to null"
                );
                Handle::Null
            }
            Value::Array(items) => Handle::Array(items.iter().map(|item| self.convert(item)).collect()),
            Value::Promise(promise) => Handle::Promise(self.convert_promise(promise)),
            Value::Object(object) => Handle::Object(self.convert_object(object)),
        }
    }

    fn replacement_for(&self, value: &Value) -> Option<Handle> {
        let identity = value.identity()?;
        self.inner
            .replacements
            .lock_unpoisoned()
            .get(&identity)
            .map(|(_, replacement)| replacement.clone())
    }

    fn convert_function(&self, function: &FunctionRef) -> HandleFn {
        let mut functions = self.inner.functions.lock_unpoisoned();
        let (_, handle) = functions.entry(function.id()).or_insert_with(|| {
            let converter = Arc::downgrade(&self.inner);
            let source = function.clone();
            let handle = HandleFn(Arc::new(move |args: &[Value]| {
                let result = source.call(args);
                match upgrade(&converter) {
                    Some(converter) => converter.convert(&result),
                    None => {
                        tracing::warn!("Handle function called after its converter was dropped");
                        Handle::Null
                    }
                }
            }));
            (function.clone(), handle)
        });
        handle.clone()
    }

    fn convert_promise(&self, promise: &PromiseRef) -> HandlePromise {
        let mut promises = self.inner.promises.lock_unpoisoned();
        let (_, handle) = promises.entry(promise.id()).or_insert_with(|| {
            let converter = Arc::downgrade(&self.inner);
            let source = promise.clone();
            let future = async move {
                let value = source.settle().await?;
                match upgrade(&converter) {
                    Some(converter) => Ok(converter.convert(&value)),
                    None => Err(Value::from("handle converter was dropped before the promise settled")),
                }
            };
            (promise.clone(), HandlePromise(future.boxed().shared()))
        });
        handle.clone()
    }

    fn convert_object(&self, object: &ObjectRef) -> HandleObject {
        let handle = {
            let mut objects = self.inner.objects.lock_unpoisoned();
            if let Some((_, handle)) = objects.get(&object.id()) {
                return handle.clone();
            }

            // Cached before population so that cycles back to this object resolve to it
            let handle = HandleObject::empty();
            objects.insert(object.id(), (object.clone(), handle.clone()));
            handle
        };

        for key in exposed_keys(object) {
            let converted = match object.member(&key) {
                Some(Member::Field(value)) => self.convert(&value),
                Some(Member::Method(method)) => {
                    let bound = self.bind_method(object, &method);
                    Handle::Function(self.convert_function(&bound))
                }
                None => continue,
            };
            handle.insert(key, converted);
        }

        handle
    }

    /// Bind `method` to `object`, returning the same function for the same pair every time.
    fn bind_method(&self, object: &ObjectRef, method: &Arc<NativeMethod>) -> FunctionRef {
        let key = BindKey::new(addr_of(method), object.id());
        let bound = self.inner.bound_methods.bind_with(key, || {
            let this = object.clone();
            let method = method.clone();
            let bound: Arc<NativeFn> = Arc::new(move |args: &[Value]| method(&this, args));
            bound
        });
        FunctionRef::from_arc(bound)
    }
}

fn upgrade(inner: &Weak<ConverterInner>) -> Option<HandleConverter> {
    inner.upgrade().map(|inner| HandleConverter { inner })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use assert_matches::assert_matches;

    use super::*;
    use crate::testing;

    fn key_set(handle: &Handle) -> BTreeSet<String> {
        handle.as_object().unwrap().keys().into_iter().collect()
    }

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|key| key.to_string()).collect()
    }

    #[test]
    fn converting_twice_yields_same_handle() {
        testing::init_test_logging();

        let converter = HandleConverter::new();
        let object = ObjectRef::plain().field("name", "thing").field("size", 3.0);
        let value = Value::from(object);

        let first = converter.convert(&value);
        let second = converter.convert(&value);

        assert!(first.as_object().unwrap().ptr_eq(second.as_object().unwrap()));
        assert_eq!(first.as_object().unwrap().get("name").unwrap().as_str(), Some("thing"));
    }

    #[test]
    fn self_reference_resolves_to_same_handle() {
        testing::init_test_logging();

        let converter = HandleConverter::new();
        let object = ObjectRef::plain().field("label", "loop");
        object.set("self", object.clone());

        let handle = converter.convert(&Value::from(object.clone()));
        let inner = handle.as_object().unwrap().get("self").unwrap();

        assert!(handle.as_object().unwrap().ptr_eq(inner.as_object().unwrap()));
        let again = converter.convert(&Value::from(object));
        assert!(again.as_object().unwrap().ptr_eq(inner.as_object().unwrap()));
    }

    #[test]
    fn proxyable_class_exposes_only_annotated_members() {
        testing::init_test_logging();

        let base = ClassDescriptor::builder("Base")
            .proxyable(["id"])
            .method("describe", |_, _| Value::from("base"))
            .method("internal", |_, _| Value::Null)
            .proxy("describe")
            .build();
        let derived = ClassDescriptor::builder("Derived")
            .extends(&base)
            .proxyable(["title"])
            .method("rename", |this, args| {
                this.set("title", args.first().cloned().unwrap_or_default());
                Value::Null
            })
            .proxy("rename")
            .build();

        let object = ObjectRef::instance_of(&derived)
            .field("id", 7.0)
            .field("title", "untitled")
            .field("secret", "hunter2");

        let handle = HandleConverter::new().convert(&Value::from(object));
        assert_eq!(key_set(&handle), set(&["id", "title", "describe", "rename"]));
    }

    #[test]
    fn hidden_member_overrides_base_exposure() {
        let base = ClassDescriptor::builder("Base")
            .proxyable(["id", "token"])
            .build();
        let derived = ClassDescriptor::builder("Derived")
            .extends(&base)
            .hide("token")
            .build();

        let object = ObjectRef::instance_of(&derived)
            .field("id", 1.0)
            .field("token", "abc");

        let handle = HandleConverter::new().convert(&Value::from(object));
        assert_eq!(key_set(&handle), set(&["id"]));
    }

    #[test]
    fn exposed_member_missing_on_instance_is_skipped() {
        let class = ClassDescriptor::builder("Sparse").proxyable(["present", "absent"]).build();
        let object = ObjectRef::instance_of(&class).field("present", true);

        let handle = HandleConverter::new().convert(&Value::from(object));
        assert_eq!(key_set(&handle), set(&["present"]));
    }

    #[test]
    fn non_proxyable_class_exposes_own_and_inherited_members() {
        testing::init_test_logging();

        let base = ClassDescriptor::builder("Animal")
            .method("speak", |this, _| {
                Value::from(format!("{} speaks", this.get("name").unwrap_or_default().as_str().unwrap_or("?")))
            })
            .build();
        let derived = ClassDescriptor::builder("Dog")
            .extends(&base)
            .method("fetch", |_, _| Value::from("stick"))
            .build();

        let object = ObjectRef::instance_of(&derived).field("name", "rex").field("age", 4.0);
        let handle = HandleConverter::new().convert(&Value::from(object));

        assert_eq!(key_set(&handle), set(&["name", "age", "speak", "fetch"]));

        let speak = handle.as_object().unwrap().get("speak").unwrap();
        let said = speak.as_function().unwrap().call(&[]);
        assert_eq!(said.as_str(), Some("rex speaks"));
    }

    #[test]
    fn bound_methods_convert_to_same_handle() {
        let class = ClassDescriptor::builder("Counter")
            .method("read", |this, _| this.get("count").unwrap_or_default())
            .build();
        let object = ObjectRef::instance_of(&class).field("count", 2.0);
        let converter = HandleConverter::new();

        let first = converter.convert(&Value::from(object.clone()));
        let read = first.as_object().unwrap().get("read").unwrap();

        // A second object's handle that exposes the same bound method gets the same function
        let holder = ObjectRef::plain();
        let bound = converter.bind_method(&object, &class.method("read").unwrap());
        holder.set("method", bound);
        let holder_handle = converter.convert(&Value::from(holder));
        let method = holder_handle.as_object().unwrap().get("method").unwrap();

        assert!(read.as_function().unwrap().ptr_eq(method.as_function().unwrap()));
        assert_eq!(method.as_function().unwrap().call(&[]).as_f64(), Some(2.0));
    }

    #[test]
    fn function_results_are_converted() {
        let converter = HandleConverter::new();
        let shared = ObjectRef::plain().field("value", 1.0);
        let returned = shared.clone();
        let function = FunctionRef::new(move |_| Value::from(returned.clone()));

        let handle = converter.convert(&Value::from(function.clone()));
        let result = handle.as_function().unwrap().call(&[]);

        let direct = converter.convert(&Value::from(shared));
        assert!(result.as_object().unwrap().ptr_eq(direct.as_object().unwrap()));

        let again = converter.convert(&Value::from(function));
        assert!(handle.as_function().unwrap().ptr_eq(again.as_function().unwrap()));
    }

    #[test]
    fn replacement_registry_is_checked_first() {
        let converter = HandleConverter::new();
        let singleton = ObjectRef::plain().field("internal", true);
        converter
            .replace_with(&Value::from(singleton.clone()), Handle::String("<converter>".into()))
            .unwrap();

        let holder = ObjectRef::plain().field("converter", singleton);
        let handle = converter.convert(&Value::from(holder));

        assert_eq!(
            handle.as_object().unwrap().get("converter").unwrap().as_str(),
            Some("<converter>")
        );
    }

    #[test]
    fn primitives_cannot_be_replaced() {
        let converter = HandleConverter::new();
        assert_matches!(
            converter.replace_with(&Value::from(3.0), Handle::Null),
            Err(HandleError::NotReplaceable { kind: "number" })
        );
    }

    #[test]
    fn classes_convert_to_null() {
        testing::init_test_logging();

        let class = ClassDescriptor::builder("Oops").build();
        let handle = HandleConverter::new().convert(&Value::Class(class));
        assert!(handle.is_null());
    }

    #[test]
    fn arrays_convert_element_wise() {
        let object = ObjectRef::plain().field("n", 1.0);
        let value = Value::Array(vec![Value::from(object.clone()), Value::from("x"), Value::from(object)]);

        let handle = HandleConverter::new().convert(&value);
        assert_matches!(&handle, Handle::Array(items) if items.len() == 3);
        let Handle::Array(items) = handle else { unreachable!() };
        assert_eq!(items[1].as_str(), Some("x"));
        assert!(items[0].as_object().unwrap().ptr_eq(items[2].as_object().unwrap()));
    }

    #[tokio::test]
    async fn promises_convert_resolved_values_and_pass_rejections() {
        let converter = HandleConverter::new();
        let object = ObjectRef::plain().field("ready", true);

        let resolved = converter.convert(&Value::from(PromiseRef::resolved(object.clone())));
        let Handle::Promise(resolved) = resolved else {
            panic!("expected a promise handle");
        };
        let settled = resolved.settle().await.unwrap();
        let direct = converter.convert(&Value::from(object));
        assert!(settled.as_object().unwrap().ptr_eq(direct.as_object().unwrap()));

        let rejected = converter.convert(&Value::from(PromiseRef::rejected("boom")));
        let Handle::Promise(rejected) = rejected else {
            panic!("expected a promise handle");
        };
        let reason = rejected.settle().await.unwrap_err();
        assert_eq!(reason.as_str(), Some("boom"));
    }

    #[tokio::test]
    async fn promises_convert_to_same_handle() {
        let converter = HandleConverter::new();
        let promise = PromiseRef::resolved(2.0);

        let first = converter.convert(&Value::from(promise.clone()));
        let second = converter.convert(&Value::from(promise));
        let (Handle::Promise(first), Handle::Promise(second)) = (first, second) else {
            panic!("expected promise handles");
        };
        assert!(first.ptr_eq(&second));
        assert_eq!(second.settle().await.unwrap().as_f64(), Some(2.0));

        let other = converter.convert(&Value::from(PromiseRef::resolved(2.0)));
        assert_matches!(other, Handle::Promise(other) if !other.ptr_eq(&first));
    }

    #[test]
    fn clear_releases_cached_sources() {
        let converter = HandleConverter::new();
        let object = ObjectRef::plain().field("n", 1.0);
        let function = FunctionRef::new(|_| Value::Null);

        let before = converter.convert(&Value::from(object.clone()));
        converter.convert(&Value::from(function));
        assert_eq!(converter.cached(), 2);

        converter.clear();
        assert_eq!(converter.cached(), 0);

        let after = converter.convert(&Value::from(object));
        assert!(!before.as_object().unwrap().ptr_eq(after.as_object().unwrap()));
    }

    #[test]
    fn clear_keeps_replacements() {
        let converter = HandleConverter::new();
        let singleton = ObjectRef::plain();
        converter
            .replace_with(&Value::from(singleton.clone()), Handle::String("<singleton>".into()))
            .unwrap();

        converter.clear();
        assert_eq!(converter.convert(&Value::from(singleton)).as_str(), Some("<singleton>"));
    }
}
