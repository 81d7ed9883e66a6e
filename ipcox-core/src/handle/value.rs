//! The dynamic value model that the converter consumes.
//!
//! Values are what one context hands to another: primitives, arrays, and identity-bearing
//! references to objects, functions, promises and (by mistake) classes.
use std::fmt;
use std::sync::{Arc, RwLock};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use super::class::{ClassRef, NativeMethod};
use crate::binder::addr_of;
use crate::sync::RwLockExt;

/// Signature of a callable value.
pub type NativeFn = dyn Fn(&[Value]) -> Value + Send + Sync;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(ObjectRef),
    Function(FunctionRef),
    Promise(PromiseRef),
    /// A class descriptor itself rather than an instance of it.
    Class(ClassRef),
}

/// The kind of a [`Value`], for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Function,
    Promise,
    Class,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Function(_) => ValueKind::Function,
            Value::Promise(_) => ValueKind::Promise,
            Value::Class(_) => ValueKind::Class,
        }
    }

    /// Address identifying reference values; `None` for values compared by content.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Object(object) => Some(object.id()),
            Value::Function(function) => Some(function.id()),
            Value::Class(class) => Some(class.id()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Array(items) => f.debug_list().entries(items).finish(),
            Value::Object(object) => write!(f, "{object:?}"),
            Value::Function(function) => write!(f, "function@{:#x}", function.id()),
            Value::Promise(_) => f.write_str("promise"),
            Value::Class(class) => write!(f, "class {}", class.name()),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<ObjectRef> for Value {
    fn from(value: ObjectRef) -> Self {
        Value::Object(value)
    }
}

impl From<FunctionRef> for Value {
    fn from(value: FunctionRef) -> Self {
        Value::Function(value)
    }
}

impl From<PromiseRef> for Value {
    fn from(value: PromiseRef) -> Self {
        Value::Promise(value)
    }
}

/// What looking up a member name on an object produced.
#[derive(Clone)]
pub enum Member {
    Field(Value),
    /// A method inherited from the object's class chain, not yet bound to the object.
    Method(Arc<NativeMethod>),
}

/// Shared reference to an object instance.  Clones refer to the same instance.
#[derive(Clone)]
pub struct ObjectRef(Arc<ObjectData>);

struct ObjectData {
    class: Option<ClassRef>,
    fields: RwLock<Vec<(String, Value)>>,
}

impl ObjectRef {
    /// A plain data object with no class.
    pub fn plain() -> Self {
        Self::with_class(None)
    }

    pub fn instance_of(class: &ClassRef) -> Self {
        Self::with_class(Some(class.clone()))
    }

    fn with_class(class: Option<ClassRef>) -> Self {
        Self(Arc::new(ObjectData {
            class,
            fields: RwLock::new(Vec::new()),
        }))
    }

    /// Builder-style [`Self::set`].
    pub fn field(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set an own field, keeping the position of an existing field of the same name.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        let mut fields = self.0.fields.write_unpoisoned();
        match fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0
            .fields
            .read_unpoisoned()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.clone())
    }

    /// Own field names, in insertion order.
    pub fn own_keys(&self) -> Vec<String> {
        self.0
            .fields
            .read_unpoisoned()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn class(&self) -> Option<&ClassRef> {
        self.0.class.as_ref()
    }

    /// Resolve a member the way property access would: own fields shadow methods, and methods of
    /// derived classes shadow those of their bases.
    pub fn member(&self, name: &str) -> Option<Member> {
        if let Some(value) = self.get(name) {
            return Some(Member::Field(value));
        }

        self.class()?
            .lineage()
            .iter()
            .rev()
            .find_map(|class| class.method(name))
            .map(Member::Method)
    }

    pub fn id(&self) -> usize {
        addr_of(&self.0)
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = self.class().map(|class| class.name()).unwrap_or("Object");
        write!(f, "{class}@{:#x}", self.id())
    }
}

/// Shared reference to a callable.
#[derive(Clone)]
pub struct FunctionRef(Arc<NativeFn>);

impl FunctionRef {
    pub fn new(function: impl Fn(&[Value]) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(function))
    }

    pub fn from_arc(function: Arc<NativeFn>) -> Self {
        Self(function)
    }

    pub fn call(&self, args: &[Value]) -> Value {
        (self.0)(args)
    }

    pub fn id(&self) -> usize {
        addr_of(&self.0)
    }

    pub fn ptr_eq(&self, other: &FunctionRef) -> bool {
        self.id() == other.id()
    }
}

/// A value that settles later, to either a resolved value or a rejection reason.
#[derive(Clone)]
pub struct PromiseRef(Arc<Shared<BoxFuture<'static, Result<Value, Value>>>>);

impl PromiseRef {
    pub fn new(future: impl Future<Output = Result<Value, Value>> + Send + 'static) -> Self {
        Self(Arc::new(future.boxed().shared()))
    }

    pub fn resolved(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(async move { Ok(value) })
    }

    pub fn rejected(reason: impl Into<Value>) -> Self {
        let reason = reason.into();
        Self::new(async move { Err(reason) })
    }

    /// Wait for the promise to settle.  Every clone observes the same outcome.
    pub async fn settle(&self) -> Result<Value, Value> {
        self.0.as_ref().clone().await
    }

    pub fn id(&self) -> usize {
        addr_of(&self.0)
    }
}
