//! Invokable type table
//!
//! Objects exposed through the bridge are plain Rust values behind
//! `Arc<dyn Any>`. What can be called on them is declared up front: each type
//! registers its methods, fields and constructors together with their parameter
//! types, and calls are resolved against that table at dispatch time.

use crate::builtins;
use crate::callback::ProxyHandle;
use crate::registry::ObjectHandle;
use objbridge_core::{BridgeError, Result};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by every method and constructor shim
pub type ShimFuture = Pin<Box<dyn Future<Output = Result<Native>> + Send>>;

type MethodShim = Arc<dyn Fn(ObjectHandle, Args) -> ShimFuture + Send + Sync>;
type ConstructorShim = Arc<dyn Fn(Args) -> ShimFuture + Send + Sync>;
type Getter = Arc<dyn Fn(&ObjectHandle) -> Result<Native> + Send + Sync>;
type Setter = Arc<dyn Fn(&ObjectHandle, Native) -> Result<()> + Send + Sync>;
type DisplayFn = Arc<dyn Fn(&ObjectHandle) -> Option<String> + Send + Sync>;

/// A value on the local side of the bridge
#[derive(Clone)]
pub enum Native {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Local object; registered when it crosses the bridge
    Object(ObjectHandle),
    /// Stored as a list object when it crosses the bridge
    List(Vec<Native>),
    /// Stored as a fixed-length array object when it crosses the bridge
    Array(Vec<Native>),
    /// Object owned by the peer
    Remote(ProxyHandle),
}

impl Native {
    /// Wrap a value as a new local object
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Native::Object(Arc::new(value))
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Native::Null => "null",
            Native::Bool(_) => "boolean",
            Native::Int(_) => "integer",
            Native::Double(_) => "double",
            Native::Str(_) => "string",
            Native::Bytes(_) => "bytes",
            Native::Object(_) => "object",
            Native::List(_) => "list",
            Native::Array(_) => "array",
            Native::Remote(_) => "proxy",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Native::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Native::Double(v) => Some(*v),
            Native::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Native::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Native::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Downcast a local object
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Native::Object(handle) => handle.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn as_remote(&self) -> Option<&ProxyHandle> {
        match self {
            Native::Remote(proxy) => Some(proxy),
            _ => None,
        }
    }
}

impl fmt::Debug for Native {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Native::Null => f.write_str("Null"),
            Native::Bool(v) => write!(f, "Bool({})", v),
            Native::Int(v) => write!(f, "Int({})", v),
            Native::Double(v) => write!(f, "Double({})", v),
            Native::Str(v) => write!(f, "Str({:?})", v),
            Native::Bytes(v) => write!(f, "Bytes({} bytes)", v.len()),
            Native::Object(handle) => write!(f, "Object({:p})", Arc::as_ptr(handle)),
            Native::List(items) => f.debug_tuple("List").field(items).finish(),
            Native::Array(items) => f.debug_tuple("Array").field(items).finish(),
            Native::Remote(proxy) => write!(f, "Remote({})", proxy.id()),
        }
    }
}

impl From<()> for Native {
    fn from(_: ()) -> Self {
        Native::Null
    }
}

impl From<bool> for Native {
    fn from(v: bool) -> Self {
        Native::Bool(v)
    }
}

impl From<i32> for Native {
    fn from(v: i32) -> Self {
        Native::Int(v as i64)
    }
}

impl From<i64> for Native {
    fn from(v: i64) -> Self {
        Native::Int(v)
    }
}

impl From<usize> for Native {
    fn from(v: usize) -> Self {
        Native::Int(v as i64)
    }
}

impl From<f64> for Native {
    fn from(v: f64) -> Self {
        Native::Double(v)
    }
}

impl From<&str> for Native {
    fn from(v: &str) -> Self {
        Native::Str(v.to_string())
    }
}

impl From<String> for Native {
    fn from(v: String) -> Self {
        Native::Str(v)
    }
}

impl From<Vec<u8>> for Native {
    fn from(v: Vec<u8>) -> Self {
        Native::Bytes(v)
    }
}

impl From<ProxyHandle> for Native {
    fn from(v: ProxyHandle) -> Self {
        Native::Remote(v)
    }
}

impl<T: Into<Native>> From<Option<T>> for Native {
    fn from(v: Option<T>) -> Self {
        v.map_or(Native::Null, Into::into)
    }
}

/// Declared parameter type of a method, field or constructor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Bool,
    /// Integer that fits in 32 bits
    Int,
    Long,
    Double,
    Str,
    Bytes,
    /// Local object of exactly this type
    Object(TypeId),
    /// Any local object
    AnyObject,
    List,
    Array,
    /// Object owned by the peer
    Callable,
    Any,
}

impl ParamType {
    pub fn object<T: Any>() -> Self {
        ParamType::Object(TypeId::of::<T>())
    }

    /// Cost of passing `arg` to a parameter of this type, or `None` if it does not fit
    ///
    /// Exact matches cost nothing; each widening step costs more, so the overload
    /// needing the fewest conversions wins.
    pub fn cost(&self, arg: &Native) -> Option<usize> {
        use ParamType as P;
        match (self, arg) {
            (P::Any, _) => Some(4),
            (P::Bool, Native::Bool(_)) => Some(0),
            (P::Int, Native::Int(v)) if i32::try_from(*v).is_ok() => Some(0),
            (P::Long, Native::Int(_)) => Some(1),
            (P::Double, Native::Double(_)) => Some(0),
            (P::Double, Native::Int(_)) => Some(2),
            (P::Str, Native::Str(_)) => Some(0),
            (P::Bytes, Native::Bytes(_)) => Some(0),
            (P::Object(expected), Native::Object(handle)) => {
                (type_of(handle) == *expected).then_some(0)
            }
            (P::List, Native::Object(handle)) => builtins::is_list(handle).then_some(0),
            (P::List, Native::List(_)) => Some(0),
            (P::Array, Native::Object(handle)) => builtins::is_array(handle).then_some(0),
            (P::Array, Native::Array(_)) => Some(0),
            (P::AnyObject, Native::Object(_)) => Some(3),
            (P::Callable, Native::Remote(_)) => Some(0),
            (P::Object(_) | P::List | P::Array | P::Callable, Native::Null) => Some(1),
            (P::AnyObject, Native::Null) => Some(2),
            _ => None,
        }
    }

    /// Apply the widening implied by a successful match
    pub fn coerce(&self, arg: Native) -> Native {
        match (self, arg) {
            (ParamType::Double, Native::Int(v)) => Native::Double(v as f64),
            (_, arg) => arg,
        }
    }
}

/// Anything that can take part in overload resolution
pub trait Signature {
    fn params(&self) -> &[ParamType];
}

/// Total cost of calling `params` with `args`, or `None` if any argument does not fit
pub fn signature_cost(params: &[ParamType], args: &[Native]) -> Option<usize> {
    if params.len() != args.len() {
        return None;
    }
    params
        .iter()
        .zip(args)
        .map(|(param, arg)| param.cost(arg))
        .sum()
}

/// Pick the cheapest applicable candidate; the first declared wins a tie
pub fn select_overload<'a, S, I>(candidates: I, args: &[Native]) -> Option<&'a S>
where
    S: Signature + 'a,
    I: IntoIterator<Item = &'a S>,
{
    let mut best: Option<(usize, &'a S)> = None;
    for candidate in candidates {
        let Some(cost) = signature_cost(candidate.params(), args) else {
            continue;
        };
        if best.is_none_or(|(lowest, _)| cost < lowest) {
            best = Some((cost, candidate));
        }
    }
    best.map(|(_, candidate)| candidate)
}

/// Concrete type behind a handle
pub fn type_of(object: &ObjectHandle) -> TypeId {
    let any: &dyn Any = &**object;
    any.type_id()
}

fn coerce_all(params: &[ParamType], args: Vec<Native>) -> Args {
    Args(
        params
            .iter()
            .zip(args)
            .map(|(param, arg)| param.coerce(arg))
            .collect(),
    )
}

fn describe_args(args: &[Native]) -> String {
    args.iter()
        .map(Native::type_label)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Arguments handed to a shim, already matched against its signature
#[derive(Debug, Clone, Default)]
pub struct Args(Vec<Native>);

impl Args {
    pub fn new(args: Vec<Native>) -> Self {
        Self(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&Native> {
        self.0.get(index).ok_or_else(|| {
            BridgeError::SerializationError(format!("Missing argument {}", index))
        })
    }

    pub fn into_vec(self) -> Vec<Native> {
        self.0
    }

    fn mismatch(&self, index: usize, expected: &str) -> BridgeError {
        let found = self.0.get(index).map_or("nothing", Native::type_label);
        BridgeError::SerializationError(format!(
            "Argument {} should be {}, found {}",
            index, expected, found
        ))
    }

    pub fn bool(&self, index: usize) -> Result<bool> {
        self.get(index)?
            .as_bool()
            .ok_or_else(|| self.mismatch(index, "boolean"))
    }

    pub fn int(&self, index: usize) -> Result<i32> {
        self.get(index)?
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| self.mismatch(index, "int"))
    }

    pub fn long(&self, index: usize) -> Result<i64> {
        self.get(index)?
            .as_i64()
            .ok_or_else(|| self.mismatch(index, "long"))
    }

    pub fn double(&self, index: usize) -> Result<f64> {
        self.get(index)?
            .as_f64()
            .ok_or_else(|| self.mismatch(index, "double"))
    }

    pub fn str(&self, index: usize) -> Result<&str> {
        self.get(index)?
            .as_str()
            .ok_or_else(|| self.mismatch(index, "string"))
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8]> {
        match self.get(index)? {
            Native::Bytes(bytes) => Ok(bytes),
            _ => Err(self.mismatch(index, "bytes")),
        }
    }

    pub fn object<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>> {
        self.get(index)?
            .downcast::<T>()
            .ok_or_else(|| self.mismatch(index, std::any::type_name::<T>()))
    }

    pub fn callable(&self, index: usize) -> Result<ProxyHandle> {
        self.get(index)?
            .as_remote()
            .cloned()
            .ok_or_else(|| self.mismatch(index, "callable"))
    }
}

/// One declared method overload
pub struct Method {
    name: String,
    params: Vec<ParamType>,
    shim: MethodShim,
}

impl Signature for Method {
    fn params(&self) -> &[ParamType] {
        &self.params
    }
}

/// One declared constructor overload
pub struct Constructor {
    params: Vec<ParamType>,
    shim: ConstructorShim,
}

impl Signature for Constructor {
    fn params(&self) -> &[ParamType] {
        &self.params
    }
}

struct Field {
    name: String,
    ty: ParamType,
    get: Getter,
    set: Option<Setter>,
}

/// Everything callable on one registered type
pub struct TypeInfo {
    name: String,
    methods: Vec<Method>,
    fields: Vec<Field>,
    display: Option<DisplayFn>,
}

impl TypeInfo {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            methods: Vec::new(),
            fields: Vec::new(),
            display: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared method names, each once, in declaration order
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for method in &self.methods {
            if !names.contains(&method.name) {
                names.push(method.name.clone());
            }
        }
        names
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    fn declares_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }
}

const UNKNOWN_CLASS: &str = "Object";

/// Registration table for every type the bridge can dispatch on
pub struct TypeTable {
    types: HashMap<TypeId, TypeInfo>,
    constructors: HashMap<String, Vec<Constructor>>,
}

impl Default for TypeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeTable {
    /// Empty table with the built-in list and array types
    pub fn new() -> Self {
        let mut table = Self {
            types: HashMap::new(),
            constructors: HashMap::new(),
        };
        builtins::register(&mut table);
        table
    }

    /// Start declaring members of `T` under `class_name`
    pub fn register<T: Any + Send + Sync>(&mut self, class_name: &str) -> TypeBuilder<'_, T> {
        self.types
            .entry(TypeId::of::<T>())
            .or_insert_with(|| TypeInfo::new(class_name));
        TypeBuilder {
            table: self,
            class_name: class_name.to_string(),
            _marker: PhantomData,
        }
    }

    pub fn info(&self, object: &ObjectHandle) -> Option<&TypeInfo> {
        self.types.get(&type_of(object))
    }

    pub fn class_name(&self, object: &ObjectHandle) -> &str {
        self.info(object).map_or(UNKNOWN_CLASS, |info| &info.name)
    }

    /// Method names advertised for an object, universal members included
    pub fn method_names(&self, object: &ObjectHandle) -> Vec<String> {
        let mut names = self.info(object).map(TypeInfo::method_names).unwrap_or_default();
        for universal in UNIVERSAL_MEMBERS {
            if !names.iter().any(|n| n == universal) {
                names.push(universal.to_string());
            }
        }
        names
    }

    pub fn has_constructor(&self, class_name: &str) -> bool {
        self.constructors.contains_key(class_name)
    }

    /// Resolve and run a method call on `target`
    pub async fn invoke(
        &self,
        target: &ObjectHandle,
        member: &str,
        args: Vec<Native>,
    ) -> Result<Native> {
        let info = self.info(target);
        let declared = info.is_some_and(|info| info.declares_method(member));

        if !declared {
            if let Some(result) = self.invoke_universal(target, member, &args) {
                return result;
            }
            return Err(BridgeError::NoSuchMember(format!(
                "{}.{}",
                self.class_name(target),
                member
            )));
        }

        let Some(info) = info else {
            return Err(BridgeError::NoSuchMember(member.to_string()));
        };
        let candidates = info.methods.iter().filter(|m| m.name == member);
        let method = select_overload(candidates, &args).ok_or_else(|| {
            BridgeError::NoSuchMember(format!(
                "{}.{}({})",
                info.name,
                member,
                describe_args(&args)
            ))
        })?;

        let args = coerce_all(&method.params, args);
        (method.shim)(target.clone(), args).await
    }

    fn invoke_universal(
        &self,
        target: &ObjectHandle,
        member: &str,
        args: &[Native],
    ) -> Option<Result<Native>> {
        if !args.is_empty() {
            return None;
        }
        let result = match member {
            "toString" => Native::Str(self.display(target)),
            "getClassName" => Native::Str(self.class_name(target).to_string()),
            "getMethodNames" => Native::List(
                self.method_names(target)
                    .into_iter()
                    .map(Native::Str)
                    .collect(),
            ),
            _ => return None,
        };
        Some(Ok(result))
    }

    /// String form of an object: its display hook, or class name and address
    pub fn display(&self, target: &ObjectHandle) -> String {
        self.info(target)
            .and_then(|info| info.display.as_ref())
            .and_then(|display| display(target))
            .unwrap_or_else(|| {
                format!("{}@{:x}", self.class_name(target), Arc::as_ptr(target) as *const () as usize)
            })
    }

    pub fn get_field(&self, target: &ObjectHandle, name: &str) -> Result<Native> {
        let field = self.field(target, name)?;
        (field.get)(target)
    }

    pub fn set_field(&self, target: &ObjectHandle, name: &str, value: Native) -> Result<()> {
        let field = self.field(target, name)?;
        let Some(set) = &field.set else {
            return Err(BridgeError::invocation(
                "FieldAccessError",
                format!("Field {}.{} is read-only", self.class_name(target), name),
            ));
        };
        if field.ty.cost(&value).is_none() {
            return Err(BridgeError::SerializationError(format!(
                "Field {}.{} cannot hold a {}",
                self.class_name(target),
                name,
                value.type_label()
            )));
        }
        set(target, field.ty.coerce(value))
    }

    fn field(&self, target: &ObjectHandle, name: &str) -> Result<&Field> {
        self.info(target)
            .and_then(|info| info.fields.iter().find(|f| f.name == name))
            .ok_or_else(|| {
                BridgeError::NoSuchMember(format!("{}.{}", self.class_name(target), name))
            })
    }

    /// Resolve and run a constructor of `class_name`
    pub async fn construct(&self, class_name: &str, args: Vec<Native>) -> Result<Native> {
        let overloads = self
            .constructors
            .get(class_name)
            .ok_or_else(|| BridgeError::NoSuchMember(format!("{}.<init>", class_name)))?;
        let constructor = select_overload(overloads, &args).ok_or_else(|| {
            BridgeError::NoSuchMember(format!("{}.<init>({})", class_name, describe_args(&args)))
        })?;
        let args = coerce_all(&constructor.params, args);
        (constructor.shim)(args).await
    }
}

/// Members every object answers unless its type declares a method of that name
pub const UNIVERSAL_MEMBERS: [&str; 3] = ["toString", "getClassName", "getMethodNames"];

/// Chained registration of one type's members
pub struct TypeBuilder<'a, T> {
    table: &'a mut TypeTable,
    class_name: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> TypeBuilder<'_, T> {
    fn info(&mut self) -> &mut TypeInfo {
        let class_name = &self.class_name;
        self.table
            .types
            .entry(TypeId::of::<T>())
            .or_insert_with(|| TypeInfo::new(class_name))
    }

    /// Declare an async method overload
    pub fn method<F, Fut>(mut self, name: &str, params: &[ParamType], f: F) -> Self
    where
        F: Fn(Arc<T>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Native>> + Send + 'static,
    {
        let class_name = self.class_name.clone();
        let shim: MethodShim = Arc::new(move |target: ObjectHandle, args: Args| {
            match target.downcast::<T>() {
                Ok(this) => Box::pin(f(this, args)) as ShimFuture,
                Err(_) => {
                    let err = BridgeError::SerializationError(format!(
                        "Target is not a {}",
                        class_name
                    ));
                    Box::pin(async move { Err(err) }) as ShimFuture
                }
            }
        });
        self.info().methods.push(Method {
            name: name.to_string(),
            params: params.to_vec(),
            shim,
        });
        self
    }

    /// Declare a method overload that completes without awaiting
    pub fn sync_method<F>(self, name: &str, params: &[ParamType], f: F) -> Self
    where
        F: Fn(&T, Args) -> Result<Native> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.method(name, params, move |this: Arc<T>, args: Args| {
            let f = f.clone();
            async move { f(&this, args) }
        })
    }

    /// Declare a read-only field
    pub fn field<G>(mut self, name: &str, ty: ParamType, get: G) -> Self
    where
        G: Fn(&T) -> Native + Send + Sync + 'static,
    {
        let get = getter::<T, G>(&self.class_name, get);
        self.info().fields.push(Field {
            name: name.to_string(),
            ty,
            get,
            set: None,
        });
        self
    }

    /// Declare a writable field; `set` receives a value already checked against `ty`
    pub fn field_mut<G, S>(mut self, name: &str, ty: ParamType, get: G, set: S) -> Self
    where
        G: Fn(&T) -> Native + Send + Sync + 'static,
        S: Fn(&T, Native) -> Result<()> + Send + Sync + 'static,
    {
        let get = getter::<T, G>(&self.class_name, get);
        let class_name = self.class_name.clone();
        let set: Setter = Arc::new(move |target: &ObjectHandle, value: Native| {
            let this = target.downcast_ref::<T>().ok_or_else(|| {
                BridgeError::SerializationError(format!("Target is not a {}", class_name))
            })?;
            set(this, value)
        });
        self.info().fields.push(Field {
            name: name.to_string(),
            ty,
            get,
            set: Some(set),
        });
        self
    }

    /// Declare a constructor overload, reachable by this type's class name
    pub fn constructor<F, Fut>(self, params: &[ParamType], f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Native>> + Send + 'static,
    {
        let shim: ConstructorShim = Arc::new(move |args: Args| Box::pin(f(args)) as ShimFuture);
        self.table
            .constructors
            .entry(self.class_name.clone())
            .or_default()
            .push(Constructor {
                params: params.to_vec(),
                shim,
            });
        self
    }

    /// Override the `toString` form
    pub fn display<F>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        let display: DisplayFn =
            Arc::new(move |target: &ObjectHandle| target.downcast_ref::<T>().map(&f));
        self.info().display = Some(display);
        self
    }
}

fn getter<T, G>(class_name: &str, get: G) -> Getter
where
    T: Any + Send + Sync,
    G: Fn(&T) -> Native + Send + Sync + 'static,
{
    let class_name = class_name.to_string();
    Arc::new(move |target: &ObjectHandle| {
        target
            .downcast_ref::<T>()
            .map(&get)
            .ok_or_else(|| BridgeError::SerializationError(format!("Target is not a {}", class_name)))
    })
}
