//! Typed configuration registry.
//!
//! Configuration variables are registered by name with a default value and
//! looked up from anywhere in the process. Values are any `serde` type; they
//! can be updated programmatically or loaded from a JSON document whose
//! nested objects map onto dotted names (`{"fiber": {"stack_size": 65536}}`
//! sets `fiber.stack_size`).
//!
//! ```
//! use fibersched::config::Config;
//!
//! let var = Config::lookup("doc.example.limit", 10u32, "example limit").unwrap();
//! assert_eq!(var.value(), 10);
//! var.set_value(20);
//! assert_eq!(Config::find::<u32>("doc.example.limit").unwrap().value(), 20);
//! ```

use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bounds every configuration value type must satisfy.
pub trait ConfigValue:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> ConfigValue for T where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

type Listener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// A named, typed configuration value with change notification.
pub struct ConfigVar<T: ConfigValue> {
    name: String,
    description: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_listener: AtomicU64,
}

impl<T: ConfigValue> ConfigVar<T> {
    fn new(name: String, default: T, description: &str) -> Self {
        ConfigVar {
            name,
            description: description.to_string(),
            value: RwLock::new(default),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns a copy of the current value.
    pub fn value(&self) -> T {
        self.value.read().clone()
    }

    /// Replaces the value. Listeners run (outside the value lock) only when
    /// the new value differs from the old one.
    pub fn set_value(&self, value: T) {
        let old = {
            let mut current = self.value.write();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value.clone())
        };

        let listeners: Vec<Listener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&old, &value);
        }
    }

    /// Registers a change listener, called with `(old, new)`. Returns an id
    /// usable with [`ConfigVar::remove_listener`].
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().retain(|(listener_id, _)| *listener_id != id);
    }

    /// Serialises the current value as JSON text.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.value.read())
    }

    /// Parses JSON text and stores the result.
    pub fn load_json_str(&self, text: &str) -> Result<()> {
        let value = serde_json::from_str::<T>(text).map_err(|source| Error::ConfigParse {
            name: self.name.clone(),
            source,
        })?;
        self.set_value(value);
        Ok(())
    }
}

impl<T: ConfigValue + fmt::Debug> fmt::Debug for ConfigVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigVar")
            .field("name", &self.name)
            .field("value", &*self.value.read())
            .field("type", &type_name::<T>())
            .finish()
    }
}

/// Type-erased view of a registered variable.
trait RegisteredVar: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn load_value(&self, value: &serde_json::Value) -> Result<()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: ConfigValue> RegisteredVar for ConfigVar<T> {
    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }

    fn load_value(&self, value: &serde_json::Value) -> Result<()> {
        let value = serde_json::from_value::<T>(value.clone()).map_err(|source| Error::ConfigParse {
            name: self.name.clone(),
            source,
        })?;
        self.set_value(value);
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

lazy_static::lazy_static! {
    static ref VARS: RwLock<HashMap<String, Arc<dyn RegisteredVar>>> = RwLock::new(HashMap::new());
}

/// Entry point of the process-wide registry.
pub struct Config;

impl Config {
    /// Returns the variable registered under `name`, registering it with
    /// `default` first if it does not exist yet.
    pub fn lookup<T: ConfigValue>(
        name: &str,
        default: T,
        description: &str,
    ) -> Result<Arc<ConfigVar<T>>> {
        let name = name.to_ascii_lowercase();
        let mut vars = VARS.write();
        if let Some(existing) = vars.get(&name) {
            return downcast(&name, Arc::clone(existing));
        }

        validate_name(&name)?;
        let var = Arc::new(ConfigVar::new(name.clone(), default, description));
        vars.insert(name, var.clone());
        Ok(var)
    }

    /// Returns an already registered variable.
    ///
    /// Yields `None` when the name is unknown or registered with another type.
    pub fn find<T: ConfigValue>(name: &str) -> Option<Arc<ConfigVar<T>>> {
        let name = name.to_ascii_lowercase();
        let existing = VARS.read().get(&name).cloned()?;
        downcast(&name, existing).ok()
    }

    /// Applies every value of a JSON document to the registered variables.
    ///
    /// Nested objects are flattened into dotted names. Names that are not
    /// registered are ignored. All matching variables are updated; the first
    /// parse failure, if any, is returned.
    pub fn load_json(document: &serde_json::Value) -> Result<()> {
        let mut entries = Vec::new();
        flatten("", document, &mut entries);

        let mut first_error = None;
        for (name, value) in entries {
            let var = VARS.read().get(&name).cloned();
            if let Some(var) = var {
                if let Err(err) = var.load_value(value) {
                    log::warn!("config `{}` rejected {}: {}", name, value, err);
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn downcast<T: ConfigValue>(name: &str, var: Arc<dyn RegisteredVar>) -> Result<Arc<ConfigVar<T>>> {
    let registered = var.type_name();
    var.into_any()
        .downcast::<ConfigVar<T>>()
        .map_err(|_| Error::ConfigType {
            name: name.to_string(),
            registered,
            requested: type_name::<T>(),
        })
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::ConfigName(name.to_string()))
    }
}

fn flatten<'a>(
    prefix: &str,
    value: &'a serde_json::Value,
    out: &mut Vec<(String, &'a serde_json::Value)>,
) {
    if !prefix.is_empty() {
        out.push((prefix.to_ascii_lowercase(), value));
    }
    if let serde_json::Value::Object(map) = value {
        for (key, child) in map {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            flatten(&name, child, out);
        }
    }
}
