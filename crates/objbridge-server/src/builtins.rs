//! List and array objects every type table knows about

use crate::invokable::{Args, Native, ParamType, TypeTable};
use crate::registry::ObjectHandle;
use objbridge_core::{BridgeError, Result};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const LIST_CLASS: &str = "List";
pub const ARRAY_CLASS: &str = "Array";

fn out_of_bounds(index: i64, len: usize) -> BridgeError {
    BridgeError::invocation(
        "IndexOutOfBoundsError",
        format!("Index {} out of bounds for length {}", index, len),
    )
}

fn checked_index(index: i64, len: usize) -> Result<usize> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| out_of_bounds(index, len))
}

/// Growable list shared with the peer by reference
#[derive(Debug, Default)]
pub struct BridgeList {
    items: Mutex<Vec<Native>>,
}

impl BridgeList {
    pub fn new(items: Vec<Native>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    fn items(&self) -> MutexGuard<'_, Vec<Native>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn get(&self, index: i64) -> Result<Native> {
        let items = self.items();
        let i = checked_index(index, items.len())?;
        Ok(items[i].clone())
    }

    /// Replace an element, returning the previous one
    pub fn set(&self, index: i64, value: Native) -> Result<Native> {
        let mut items = self.items();
        let i = checked_index(index, items.len())?;
        Ok(std::mem::replace(&mut items[i], value))
    }

    pub fn push(&self, value: Native) {
        self.items().push(value);
    }

    /// Insert before `index`; `index == len` appends
    pub fn insert(&self, index: i64, value: Native) -> Result<()> {
        let mut items = self.items();
        let len = items.len();
        let i = usize::try_from(index)
            .ok()
            .filter(|i| *i <= len)
            .ok_or_else(|| out_of_bounds(index, len))?;
        items.insert(i, value);
        Ok(())
    }

    pub fn remove(&self, index: i64) -> Result<Native> {
        let mut items = self.items();
        let i = checked_index(index, items.len())?;
        Ok(items.remove(i))
    }

    pub fn clear(&self) {
        self.items().clear();
    }

    pub fn snapshot(&self) -> Vec<Native> {
        self.items().clone()
    }
}

/// Fixed-length array shared with the peer by reference
#[derive(Debug, Default)]
pub struct BridgeArray {
    items: Mutex<Vec<Native>>,
}

impl BridgeArray {
    pub fn new(items: Vec<Native>) -> Self {
        Self {
            items: Mutex::new(items),
        }
    }

    fn items(&self) -> MutexGuard<'_, Vec<Native>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn get(&self, index: i64) -> Result<Native> {
        let items = self.items();
        let i = checked_index(index, items.len())?;
        Ok(items[i].clone())
    }

    pub fn set(&self, index: i64, value: Native) -> Result<()> {
        let mut items = self.items();
        let i = checked_index(index, items.len())?;
        items[i] = value;
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<Native> {
        self.items().clone()
    }
}

pub fn is_list(object: &ObjectHandle) -> bool {
    object.downcast_ref::<BridgeList>().is_some()
}

pub fn is_array(object: &ObjectHandle) -> bool {
    object.downcast_ref::<BridgeArray>().is_some()
}

fn display_items(items: &[Native]) -> String {
    let parts: Vec<String> = items
        .iter()
        .map(|item| match item {
            Native::Str(s) => s.clone(),
            Native::Int(v) => v.to_string(),
            Native::Double(v) => v.to_string(),
            Native::Bool(v) => v.to_string(),
            Native::Null => "null".to_string(),
            other => format!("<{}>", other.type_label()),
        })
        .collect();
    format!("[{}]", parts.join(", "))
}

/// Declare the built-in types on a fresh table
pub(crate) fn register(types: &mut TypeTable) {
    types
        .register::<BridgeList>(LIST_CLASS)
        .sync_method("size", &[], |list, _| Ok(list.len().into()))
        .sync_method("get", &[ParamType::Long], |list, args: Args| {
            list.get(args.long(0)?)
        })
        .sync_method("set", &[ParamType::Long, ParamType::Any], |list, args: Args| {
            let index = args.long(0)?;
            list.set(index, args.get(1)?.clone())
        })
        .sync_method("add", &[ParamType::Any], |list, args: Args| {
            list.push(args.get(0)?.clone());
            Ok(Native::Bool(true))
        })
        .sync_method("add", &[ParamType::Long, ParamType::Any], |list, args: Args| {
            let index = args.long(0)?;
            list.insert(index, args.get(1)?.clone())?;
            Ok(Native::Null)
        })
        .sync_method("remove", &[ParamType::Long], |list, args: Args| {
            list.remove(args.long(0)?)
        })
        .sync_method("clear", &[], |list, _| {
            list.clear();
            Ok(Native::Null)
        })
        .display(|list| display_items(&list.snapshot()));

    types
        .register::<BridgeArray>(ARRAY_CLASS)
        .sync_method("length", &[], |array, _| Ok(array.len().into()))
        .sync_method("get", &[ParamType::Long], |array, args: Args| {
            array.get(args.long(0)?)
        })
        .sync_method("set", &[ParamType::Long, ParamType::Any], |array, args: Args| {
            let index = args.long(0)?;
            array.set(index, args.get(1)?.clone())?;
            Ok(Native::Null)
        })
        .display(|array| display_items(&array.snapshot()));
}
