//! Declarative class descriptors.
//!
//! A class declares its methods, its base class, and which of its members may cross a context
//! boundary.  Marking a class proxyable opts it into explicit exposure: only the fields it lists
//! and the members annotated with [`ClassBuilder::proxy`] are exposed.  [`ClassBuilder::hide`]
//! removes a member that a base class exposed.
use std::collections::HashMap;
use std::sync::Arc;

use super::value::{ObjectRef, Value};
use crate::binder::addr_of;

/// Signature of a method: receives the object it was invoked on and the call arguments.
pub type NativeMethod = dyn Fn(&ObjectRef, &[Value]) -> Value + Send + Sync;

/// Shared reference to a [`ClassDescriptor`].
#[derive(Clone)]
pub struct ClassRef(Arc<ClassDescriptor>);

pub struct ClassDescriptor {
    name: String,
    base: Option<ClassRef>,
    methods: Vec<(String, Arc<NativeMethod>)>,
    /// `Some` when the class is proxyable, holding the extra field names it exposes.
    proxyable: Option<Vec<String>>,
    /// Member annotations; `true` exposes the member, `false` hides it.
    annotations: Vec<(String, bool)>,
}

impl ClassDescriptor {
    pub fn builder(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder {
            name: name.into(),
            base: None,
            methods: Vec::new(),
            proxyable: None,
            annotations: Vec::new(),
        }
    }
}

impl ClassRef {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn base(&self) -> Option<&ClassRef> {
        self.0.base.as_ref()
    }

    pub fn method(&self, name: &str) -> Option<Arc<NativeMethod>> {
        self.0
            .methods
            .iter()
            .find(|(method, _)| method == name)
            .map(|(_, method)| method.clone())
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.0.methods.iter().map(|(name, _)| name.as_str())
    }

    pub fn is_proxyable(&self) -> bool {
        self.0.proxyable.is_some()
    }

    pub fn proxyable_fields(&self) -> Option<&[String]> {
        self.0.proxyable.as_deref()
    }

    pub fn annotations(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0
            .annotations
            .iter()
            .map(|(member, exposed)| (member.as_str(), *exposed))
    }

    /// This class and its ancestors, root first.
    pub fn lineage(&self) -> Vec<ClassRef> {
        let mut chain = vec![self.clone()];
        while let Some(base) = chain.last().and_then(|class| class.base().cloned()) {
            chain.push(base);
        }
        chain.reverse();
        chain
    }

    pub fn id(&self) -> usize {
        addr_of(&self.0)
    }

    pub fn ptr_eq(&self, other: &ClassRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

pub struct ClassBuilder {
    name: String,
    base: Option<ClassRef>,
    methods: Vec<(String, Arc<NativeMethod>)>,
    proxyable: Option<Vec<String>>,
    annotations: Vec<(String, bool)>,
}

impl ClassBuilder {
    pub fn extends(mut self, base: &ClassRef) -> Self {
        self.base = Some(base.clone());
        self
    }

    pub fn method(
        mut self,
        name: impl Into<String>,
        method: impl Fn(&ObjectRef, &[Value]) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.methods.push((name.into(), Arc::new(method)));
        self
    }

    /// Opt the class into explicit exposure, additionally exposing the listed fields.
    pub fn proxyable<I, F>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.proxyable = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn proxy(self, member: impl Into<String>) -> Self {
        self.annotate(member.into(), true)
    }

    pub fn hide(self, member: impl Into<String>) -> Self {
        self.annotate(member.into(), false)
    }

    fn annotate(mut self, member: String, exposed: bool) -> Self {
        // Last annotation for a member wins
        self.annotations.retain(|(existing, _)| *existing != member);
        self.annotations.push((member, exposed));
        self
    }

    pub fn build(self) -> ClassRef {
        ClassRef(Arc::new(ClassDescriptor {
            name: self.name,
            base: self.base,
            methods: self.methods,
            proxyable: self.proxyable,
            annotations: self.annotations,
        }))
    }
}

/// The member names of `object` that are exposed across a context boundary.
///
/// If any class in the object's lineage is proxyable, exposure is explicit: proxyable fields and
/// `proxy` members are collected root first, and a later `hide` (or `proxy`) of the same name
/// overrides an earlier one.  Otherwise every own field and every method in the lineage is
/// exposed.
pub fn exposed_keys(object: &ObjectRef) -> Vec<String> {
    let lineage = object.class().map(ClassRef::lineage).unwrap_or_default();

    if lineage.iter().any(ClassRef::is_proxyable) {
        let mut order: Vec<String> = Vec::new();
        let mut exposure: HashMap<String, bool> = HashMap::new();
        let mut mark = |member: &str, exposed: bool| {
            if exposure.insert(member.to_string(), exposed).is_none() {
                order.push(member.to_string());
            }
        };

        for class in &lineage {
            for field in class.proxyable_fields().unwrap_or_default() {
                mark(field, true);
            }
            for (member, exposed) in class.annotations() {
                mark(member, exposed);
            }
        }

        order
            .into_iter()
            .filter(|member| exposure.get(member).copied().unwrap_or(false))
            .collect()
    } else {
        let mut keys = object.own_keys();
        for class in lineage.iter().rev() {
            for method in class.method_names() {
                if !keys.iter().any(|key| key == method) {
                    keys.push(method.to_string());
                }
            }
        }
        keys
    }
}
