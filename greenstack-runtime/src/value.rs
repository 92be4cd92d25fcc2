//! Values Passed Across Switches
//!
//! A switch carries a positional channel and a keyed channel ([`Args`]). On
//! the receiving side the two are collapsed into a single [`Values`] by a
//! fixed rule:
//!
//! | positional | keyed     | received              |
//! |------------|-----------|-----------------------|
//! | none       | none      | `Values::Empty`       |
//! | one        | none      | `Values::One`         |
//! | several    | none      | `Values::Many`        |
//! | none       | some      | `Values::Keyed`       |
//! | any        | some      | `Values::Both`        |
//!
//! Values are type-erased. They never cross threads: every switch happens
//! on the thread that owns both coroutines.

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;

/// A single type-erased value.
pub struct Value {
    inner: Box<dyn Any>,
    type_name: &'static str,
}

impl Value {
    /// Box a value.
    pub fn new<T: Any>(value: T) -> Self {
        Self {
            inner: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Name of the stored type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the stored value is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Borrow the stored value as a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref()
    }

    /// Mutably borrow the stored value as a `T`.
    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.inner.downcast_mut()
    }

    /// Take the stored value out as a `T`, or get `self` back.
    pub fn downcast<T: Any>(self) -> Result<T, Value> {
        let type_name = self.type_name;
        self.inner
            .downcast::<T>()
            .map(|b| *b)
            .map_err(|inner| Value { inner, type_name })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        macro_rules! try_debug {
            ($($t:ty),*) => {
                $(if let Some(v) = self.inner.downcast_ref::<$t>() {
                    return write!(f, "{:?}", v);
                })*
            };
        }
        try_debug!(i32, i64, u32, u64, usize, f64, bool, char, (), &'static str, String);
        write!(f, "<{}>", self.type_name)
    }
}

/// The keyed channel.
pub type Keyed = BTreeMap<String, Value>;

/// Arguments for a switch: positional values plus keyed values.
#[derive(Debug, Default)]
pub struct Args {
    positional: Vec<Value>,
    keyed: Keyed,
}

impl Args {
    /// No arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// A single positional argument.
    pub fn one<T: Any>(value: T) -> Self {
        Self::new().arg(value)
    }

    /// Append a positional argument.
    pub fn arg<T: Any>(mut self, value: T) -> Self {
        self.positional.push(Value::new(value));
        self
    }

    /// Append an already boxed positional argument.
    pub fn value(mut self, value: Value) -> Self {
        self.positional.push(value);
        self
    }

    /// Add a keyed argument, replacing any previous value under `key`.
    pub fn kwarg<T: Any>(mut self, key: impl Into<String>, value: T) -> Self {
        self.keyed.insert(key.into(), Value::new(value));
        self
    }

    /// Total number of arguments on both channels.
    pub fn len(&self) -> usize {
        self.positional.len() + self.keyed.len()
    }

    /// Whether both channels are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collapse both channels into what the receiver sees.
    pub fn into_values(self) -> Values {
        let Args { mut positional, keyed } = self;
        match (positional.len(), keyed.is_empty()) {
            (0, true) => Values::Empty,
            (1, true) => match positional.pop() {
                Some(value) => Values::One(value),
                None => Values::Empty,
            },
            (_, true) => Values::Many(positional),
            (0, false) => Values::Keyed(keyed),
            (_, false) => Values::Both(positional, keyed),
        }
    }
}

impl From<Values> for Args {
    fn from(values: Values) -> Self {
        match values {
            Values::Empty => Args::new(),
            Values::One(value) => Args::new().value(value),
            Values::Many(positional) => Args { positional, keyed: Keyed::new() },
            Values::Keyed(keyed) => Args { positional: Vec::new(), keyed },
            Values::Both(positional, keyed) => Args { positional, keyed },
        }
    }
}

/// Build [`Args`] from positional expressions.
///
/// ```rust,ignore
/// let args = args![1, "two", 3.0];
/// ```
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::new()$(.arg($value))+
    };
}

/// What a switch delivers to the resumed side.
#[derive(Debug, Default)]
pub enum Values {
    /// Nothing was passed.
    #[default]
    Empty,
    /// Exactly one positional value.
    One(Value),
    /// Several positional values.
    Many(Vec<Value>),
    /// Keyed values only.
    Keyed(Keyed),
    /// Positional and keyed values.
    Both(Vec<Value>, Keyed),
}

impl Values {
    /// A single value.
    pub fn one<T: Any>(value: T) -> Self {
        Values::One(Value::new(value))
    }

    /// Whether nothing was delivered.
    pub fn is_empty(&self) -> bool {
        matches!(self, Values::Empty)
    }

    /// Number of values on both channels.
    pub fn len(&self) -> usize {
        match self {
            Values::Empty => 0,
            Values::One(_) => 1,
            Values::Many(values) => values.len(),
            Values::Keyed(keyed) => keyed.len(),
            Values::Both(values, keyed) => values.len() + keyed.len(),
        }
    }

    /// Take the single value out as a `T`.
    pub fn into_one<T: Any>(self) -> Option<T> {
        match self {
            Values::One(value) => value.downcast().ok(),
            _ => None,
        }
    }

    /// Borrow the single value as a `T`.
    pub fn as_one<T: Any>(&self) -> Option<&T> {
        match self {
            Values::One(value) => value.downcast_ref(),
            _ => None,
        }
    }

    /// The positional channel, in order.
    pub fn positional(&self) -> &[Value] {
        match self {
            Values::One(value) => std::slice::from_ref(value),
            Values::Many(values) | Values::Both(values, _) => values,
            Values::Empty | Values::Keyed(_) => &[],
        }
    }

    /// The keyed channel, if anything was passed on it.
    pub fn keyed(&self) -> Option<&Keyed> {
        match self {
            Values::Keyed(keyed) | Values::Both(_, keyed) => Some(keyed),
            _ => None,
        }
    }

    /// Borrow a keyed value as a `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.keyed()?.get(key)?.downcast_ref()
    }

    /// Split into the positional and keyed channels.
    pub fn into_parts(self) -> (Vec<Value>, Keyed) {
        match self {
            Values::Empty => (Vec::new(), Keyed::new()),
            Values::One(value) => (vec![value], Keyed::new()),
            Values::Many(values) => (values, Keyed::new()),
            Values::Keyed(keyed) => (Vec::new(), keyed),
            Values::Both(values, keyed) => (values, keyed),
        }
    }
}

impl From<Value> for Values {
    fn from(value: Value) -> Self {
        Values::One(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_args() {
        assert!(Args::new().into_values().is_empty());
        assert!(args![].is_empty());
    }

    #[test]
    fn test_single_positional_is_unwrapped() {
        let values = args![42_i32].into_values();
        assert_eq!(values.as_one::<i32>(), Some(&42));
        assert_eq!(values.len(), 1);
    }

    #[test]
    fn test_keyed_only() {
        let values = Args::new().kwarg("x", 3_i32).into_values();
        assert!(matches!(values, Values::Keyed(_)));
        assert_eq!(values.get::<i32>("x"), Some(&3));
        assert!(values.positional().is_empty());
    }

    #[test]
    fn test_both_channels() {
        let values = args![2_i32].kwarg("x", 3_i32).into_values();
        match &values {
            Values::Both(positional, keyed) => {
                assert_eq!(positional[0].downcast_ref::<i32>(), Some(&2));
                assert_eq!(keyed["x"].downcast_ref::<i32>(), Some(&3));
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_many_positional() {
        let values = args![3_i32, 9_i32].into_values();
        let got: Vec<i32> = values
            .positional()
            .iter()
            .filter_map(|v| v.downcast_ref::<i32>().copied())
            .collect();
        assert_eq!(got, vec![3, 9]);
    }

    #[test]
    fn test_downcast_failure_returns_value() {
        let value = Value::new(String::from("text"));
        let value = value.downcast::<i32>().unwrap_err();
        assert_eq!(value.downcast::<String>().unwrap(), "text");
    }

    #[test]
    fn test_value_debug() {
        assert_eq!(format!("{:?}", Value::new(5_i64)), "5");
        assert_eq!(format!("{:?}", Value::new("hi")), "\"hi\"");
        assert!(format!("{:?}", Value::new(vec![1u8])).contains("Vec<u8>"));
    }

    #[test]
    fn test_values_back_into_args() {
        let args: Args = args![1_i32, 2_i32].kwarg("k", true).into_values().into();
        assert_eq!(args.len(), 3);
    }
}
