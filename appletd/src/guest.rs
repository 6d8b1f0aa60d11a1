//! Capability tables for guest objects reachable from the script side.
//!
//! A guest type describes itself once through a [`ClassBuilder`]: readable
//! fields, optionally writable with a declared type, and methods with typed
//! parameter lists. The call bridge only ever touches guest objects through
//! these tables.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An object the script side can hold a handle to.
pub trait GuestObject: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    fn guest_class(&self) -> &GuestClass;
}

impl fmt::Debug for dyn GuestObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.guest_class().name())
    }
}

/// A value produced or consumed by guest code.
#[derive(Clone)]
pub enum GuestValue {
    Void,
    Null,
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    String(String),
    Object(Arc<dyn GuestObject>),
}

impl fmt::Debug for GuestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => write!(f, "Void"),
            Self::Null => write!(f, "Null"),
            Self::Boolean(v) => write!(f, "Boolean({v})"),
            Self::Byte(v) => write!(f, "Byte({v})"),
            Self::Short(v) => write!(f, "Short({v})"),
            Self::Int(v) => write!(f, "Int({v})"),
            Self::Long(v) => write!(f, "Long({v})"),
            Self::Float(v) => write!(f, "Float({v})"),
            Self::Double(v) => write!(f, "Double({v})"),
            Self::Char(v) => write!(f, "Char({v:?})"),
            Self::String(v) => write!(f, "String({v:?})"),
            Self::Object(o) => write!(f, "Object({o:?})"),
        }
    }
}

impl GuestValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Byte(v) => Some(v.into()),
            Self::Short(v) => Some(v.into()),
            Self::Int(v) => Some(v.into()),
            Self::Long(v) => Some(v),
            _ => None,
        }
    }
}

impl From<String> for GuestValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for GuestValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl<T: Into<GuestValue>> From<Option<T>> for GuestValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<bool> for GuestValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i32> for GuestValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for GuestValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Char,
}

/// Declared type of a method parameter or writable field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Primitive(Primitive),
    /// Like the primitive, but also accepts `null`.
    Boxed(Primitive),
    String,
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(p) => write!(f, "{}", format!("{p:?}").to_lowercase()),
            Self::Boxed(p) => write!(f, "{p:?}"),
            Self::String => write!(f, "String"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GuestError {
    #[error("no field `{0}`")]
    NoSuchField(String),

    #[error("field `{0}` is read-only")]
    ReadOnly(String),

    #[error("no method `{name}` taking {arity} argument(s)")]
    NoSuchMethod { name: String, arity: usize },

    #[error("cannot convert {value:?} to {expected}")]
    Coercion { value: String, expected: ParamType },

    #[error("object is not a {0}")]
    WrongReceiver(&'static str),

    #[error("{0}")]
    Invocation(String),
}

impl GuestError {
    pub fn invocation(message: impl Into<String>) -> Self {
        Self::Invocation(message.into())
    }
}

fn parse_number<T: std::str::FromStr>(raw: &str, ty: ParamType) -> Result<T, GuestError> {
    raw.trim().parse().map_err(|_| GuestError::Coercion {
        value: raw.to_string(),
        expected: ty,
    })
}

/// Convert a wire argument to the declared parameter type.
pub fn coerce(raw: &str, ty: ParamType) -> Result<GuestValue, GuestError> {
    let primitive = match ty {
        ParamType::String => return Ok(GuestValue::String(raw.to_string())),
        ParamType::Boxed(_) if raw == "null" => return Ok(GuestValue::Null),
        ParamType::Boxed(p) | ParamType::Primitive(p) => p,
    };
    let value = match primitive {
        Primitive::Boolean => GuestValue::Boolean(raw.trim().eq_ignore_ascii_case("true")),
        Primitive::Byte => GuestValue::Byte(parse_number(raw, ty)?),
        Primitive::Short => GuestValue::Short(parse_number(raw, ty)?),
        Primitive::Int => GuestValue::Int(parse_number(raw, ty)?),
        Primitive::Long => GuestValue::Long(parse_number(raw, ty)?),
        Primitive::Float => GuestValue::Float(parse_number(raw, ty)?),
        Primitive::Double => GuestValue::Double(parse_number(raw, ty)?),
        Primitive::Char => match raw.chars().next() {
            Some(c) => GuestValue::Char(c),
            None => {
                return Err(GuestError::Coercion {
                    value: String::new(),
                    expected: ty,
                });
            }
        },
    };
    Ok(value)
}

type Getter = Box<dyn Fn(&dyn GuestObject) -> Result<GuestValue, GuestError> + Send + Sync>;
type Setter = Box<dyn Fn(&dyn GuestObject, GuestValue) -> Result<(), GuestError> + Send + Sync>;
type Invoker =
    Box<dyn Fn(&dyn GuestObject, Vec<GuestValue>) -> Result<GuestValue, GuestError> + Send + Sync>;

struct Field {
    name: String,
    getter: Getter,
    setter: Option<(ParamType, Setter)>,
}

struct Method {
    name: String,
    params: Vec<ParamType>,
    invoker: Invoker,
}

/// Member table for one guest type.
pub struct GuestClass {
    name: &'static str,
    fields: Vec<Field>,
    methods: Vec<Method>,
}

impl fmt::Debug for GuestClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestClass")
            .field("name", &self.name)
            .field("fields", &self.fields.iter().map(|m| &m.name).collect::<Vec<_>>())
            .field("methods", &self.methods.len())
            .finish()
    }
}

impl GuestClass {
    pub fn builder<T: GuestObject>(name: &'static str) -> ClassBuilder<T> {
        ClassBuilder {
            class: GuestClass {
                name,
                fields: Vec::new(),
                methods: Vec::new(),
            },
            _marker: std::marker::PhantomData,
        }
    }

    /// A class exposing no members.
    pub fn empty(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name == name)
    }

    pub fn get(&self, target: &dyn GuestObject, name: &str) -> Result<GuestValue, GuestError> {
        let field = self
            .fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| GuestError::NoSuchField(name.to_string()))?;
        (field.getter)(target)
    }

    /// Coerce `raw` to the field's declared type and store it.
    pub fn set(&self, target: &dyn GuestObject, name: &str, raw: &str) -> Result<(), GuestError> {
        let field = self
            .fields
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| GuestError::NoSuchField(name.to_string()))?;
        let (ty, setter) = field
            .setter
            .as_ref()
            .ok_or_else(|| GuestError::ReadOnly(name.to_string()))?;
        setter(target, coerce(raw, *ty)?)
    }

    /// Resolve by exact name and arity (first declared wins), coerce, invoke.
    pub fn invoke(
        &self,
        target: &dyn GuestObject,
        name: &str,
        args: &[String],
    ) -> Result<GuestValue, GuestError> {
        let method = self
            .methods
            .iter()
            .find(|m| m.name == name && m.params.len() == args.len())
            .ok_or_else(|| GuestError::NoSuchMethod {
                name: name.to_string(),
                arity: args.len(),
            })?;
        let values = args
            .iter()
            .zip(&method.params)
            .map(|(raw, ty)| coerce(raw, *ty))
            .collect::<Result<Vec<_>, _>>()?;
        (method.invoker)(target, values)
    }
}

pub struct ClassBuilder<T> {
    class: GuestClass,
    _marker: std::marker::PhantomData<fn(&T)>,
}

fn receiver<'a, T: GuestObject>(
    target: &'a dyn GuestObject,
    class: &'static str,
) -> Result<&'a T, GuestError> {
    target
        .as_any()
        .downcast_ref::<T>()
        .ok_or(GuestError::WrongReceiver(class))
}

impl<T: GuestObject> ClassBuilder<T> {
    /// Read-only field.
    pub fn field<F>(mut self, name: &str, getter: F) -> Self
    where
        F: Fn(&T) -> GuestValue + Send + Sync + 'static,
    {
        let class = self.class.name;
        self.class.fields.push(Field {
            name: name.to_string(),
            getter: Box::new(move |target: &dyn GuestObject| {
                receiver::<T>(target, class).map(&getter)
            }),
            setter: None,
        });
        self
    }

    pub fn field_mut<G, S>(mut self, name: &str, ty: ParamType, getter: G, setter: S) -> Self
    where
        G: Fn(&T) -> GuestValue + Send + Sync + 'static,
        S: Fn(&T, GuestValue) -> Result<(), GuestError> + Send + Sync + 'static,
    {
        let class = self.class.name;
        self.class.fields.push(Field {
            name: name.to_string(),
            getter: Box::new(move |target: &dyn GuestObject| {
                receiver::<T>(target, class).map(&getter)
            }),
            setter: Some((
                ty,
                Box::new(move |target: &dyn GuestObject, value| {
                    setter(receiver::<T>(target, class)?, value)
                }),
            )),
        });
        self
    }

    pub fn method<F>(mut self, name: &str, params: &[ParamType], invoke: F) -> Self
    where
        F: Fn(&T, Vec<GuestValue>) -> Result<GuestValue, GuestError> + Send + Sync + 'static,
    {
        let class = self.class.name;
        self.class.methods.push(Method {
            name: name.to_string(),
            params: params.to_vec(),
            invoker: Box::new(move |target: &dyn GuestObject, args| {
                invoke(receiver::<T>(target, class)?, args)
            }),
        });
        self
    }

    pub fn build(self) -> GuestClass {
        self.class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    const INT: ParamType = ParamType::Primitive(Primitive::Int);

    struct Counter {
        count: Mutex<i32>,
    }

    impl GuestObject for Counter {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn guest_class(&self) -> &GuestClass {
            static CLASS: OnceLock<GuestClass> = OnceLock::new();
            CLASS.get_or_init(|| {
                GuestClass::builder::<Counter>("Counter")
                    .field_mut(
                        "count",
                        INT,
                        |c| GuestValue::Int(*c.count.lock().unwrap()),
                        |c, v| {
                            *c.count.lock().unwrap() = v.as_i64().unwrap_or_default() as i32;
                            Ok(())
                        },
                    )
                    .field("label", |_| "counter".into())
                    .method("add", &[], |c, _| {
                        *c.count.lock().unwrap() += 1;
                        Ok(GuestValue::Void)
                    })
                    .method("add", &[INT], |c, args| {
                        *c.count.lock().unwrap() += args[0].as_i64().unwrap_or_default() as i32;
                        Ok(GuestValue::Void)
                    })
                    .build()
            })
        }
    }

    fn counter() -> Counter {
        Counter {
            count: Mutex::new(0),
        }
    }

    #[test]
    fn overloads_resolve_by_arity() {
        let c = counter();
        let class = c.guest_class();
        class.invoke(&c, "add", &[]).unwrap();
        class.invoke(&c, "add", &["5".to_string()]).unwrap();
        assert_eq!(*c.count.lock().unwrap(), 6);

        let err = class
            .invoke(&c, "add", &["1".to_string(), "2".to_string()])
            .unwrap_err();
        assert!(matches!(err, GuestError::NoSuchMethod { arity: 2, .. }));
    }

    #[test]
    fn names_are_case_sensitive() {
        let c = counter();
        assert!(c.guest_class().invoke(&c, "Add", &[]).is_err());
        assert!(c.guest_class().has_method("add"));
        assert!(!c.guest_class().has_method("ADD"));
    }

    #[test]
    fn setter_coerces_to_declared_type() {
        let c = counter();
        let class = c.guest_class();
        class.set(&c, "count", " 41 ").unwrap();
        assert_eq!(class.get(&c, "count").unwrap().as_i64(), Some(41));

        assert!(matches!(
            class.set(&c, "count", "many"),
            Err(GuestError::Coercion { .. })
        ));
        assert!(matches!(
            class.set(&c, "label", "x"),
            Err(GuestError::ReadOnly(_))
        ));
        assert!(matches!(
            class.get(&c, "missing"),
            Err(GuestError::NoSuchField(_))
        ));
    }

    #[test]
    fn coercion_table() {
        use Primitive::*;
        let p = ParamType::Primitive;

        assert!(matches!(coerce("TRUE", p(Boolean)), Ok(GuestValue::Boolean(true))));
        assert!(matches!(coerce("yes", p(Boolean)), Ok(GuestValue::Boolean(false))));
        assert!(matches!(coerce("-7", p(Byte)), Ok(GuestValue::Byte(-7))));
        assert!(coerce("300", p(Byte)).is_err());
        assert!(matches!(coerce("1200", p(Short)), Ok(GuestValue::Short(1200))));
        assert!(matches!(coerce("9000000000", p(Long)), Ok(GuestValue::Long(9_000_000_000))));
        assert!(coerce("9000000000", p(Int)).is_err());
        assert!(matches!(coerce("2.5", p(Float)), Ok(GuestValue::Float(f)) if f == 2.5));
        assert!(matches!(coerce("1e3", p(Double)), Ok(GuestValue::Double(f)) if f == 1000.0));
        assert!(matches!(coerce("xyz", p(Char)), Ok(GuestValue::Char('x'))));
        assert!(coerce("", p(Char)).is_err());
        assert!(matches!(coerce("null", ParamType::Boxed(Int)), Ok(GuestValue::Null)));
        assert!(coerce("null", p(Int)).is_err());
        assert!(matches!(
            coerce("null", ParamType::String),
            Ok(GuestValue::String(s)) if s == "null"
        ));
    }

    #[test]
    fn wrong_receiver_is_an_error() {
        struct Other;
        impl GuestObject for Other {
            fn as_any(&self) -> &dyn Any {
                self
            }
            fn guest_class(&self) -> &GuestClass {
                static CLASS: OnceLock<GuestClass> = OnceLock::new();
                CLASS.get_or_init(|| GuestClass::empty("Other"))
            }
        }

        let c = counter();
        let err = c.guest_class().invoke(&Other, "add", &[]).unwrap_err();
        assert!(matches!(err, GuestError::WrongReceiver("Counter")));
    }
}
