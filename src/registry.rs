// src/registry.rs

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::ParseError;
use crate::object::ParseObject;

/// A typed view over one Parse class.
///
/// ```rust
/// use parse_live::{ParseClass, ParseError, ParseObject};
///
/// struct Player {
///     name: String,
/// }
///
/// impl ParseClass for Player {
///     const CLASS_NAME: &'static str = "Player";
///
///     fn from_object(object: &ParseObject) -> Result<Self, ParseError> {
///         let name = object
///             .get_as::<String>("name")
///             .ok_or_else(|| ParseError::InvalidInput("Player without name".into()))?;
///         Ok(Player { name })
///     }
/// }
/// ```
pub trait ParseClass: Sized + Send + Sync + 'static {
    const CLASS_NAME: &'static str;

    fn from_object(object: &ParseObject) -> Result<Self, ParseError>;
}

type DecodeFn =
    Arc<dyn Fn(&ParseObject) -> Result<Box<dyn Any + Send + Sync>, ParseError> + Send + Sync>;

/// Result of decoding a generic object through the registry.
pub enum Decoded {
    Typed(Box<dyn Any + Send + Sync>),
    Untyped(ParseObject),
}

impl Decoded {
    pub fn is_typed(&self) -> bool {
        matches!(self, Decoded::Typed(_))
    }

    pub fn downcast<T: ParseClass>(self) -> Option<T> {
        match self {
            Decoded::Typed(boxed) => boxed.downcast::<T>().ok().map(|b| *b),
            Decoded::Untyped(_) => None,
        }
    }

    pub fn into_object(self) -> Option<ParseObject> {
        match self {
            Decoded::Untyped(object) => Some(object),
            Decoded::Typed(_) => None,
        }
    }
}

/// Class name to typed-variant factory map.
#[derive(Default)]
pub struct ClassRegistry {
    decoders: RwLock<HashMap<String, DecodeFn>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` for its class name, replacing any previous registration.
    pub fn register<T: ParseClass>(&self) {
        let decoder: DecodeFn = Arc::new(|object: &ParseObject| {
            T::from_object(object).map(|typed| Box::new(typed) as Box<dyn Any + Send + Sync>)
        });
        if let Ok(mut decoders) = self.decoders.write() {
            decoders.insert(T::CLASS_NAME.to_string(), decoder);
        }
    }

    pub fn is_registered(&self, class_name: &str) -> bool {
        self.decoders
            .read()
            .map(|d| d.contains_key(class_name))
            .unwrap_or(false)
    }

    /// Decodes through the registered factory for the object's class, or hands
    /// the object back untouched when none is registered.
    pub fn decode(&self, object: ParseObject) -> Result<Decoded, ParseError> {
        let decoder = self
            .decoders
            .read()
            .ok()
            .and_then(|d| d.get(object.class_name()).cloned());
        match decoder {
            Some(decode) => decode(&object).map(Decoded::Typed),
            None => Ok(Decoded::Untyped(object)),
        }
    }
}

/// Decodes `object` as `T`, checking that the class names agree.
pub fn decode_as<T: ParseClass>(object: &ParseObject) -> Result<T, ParseError> {
    if object.class_name() != T::CLASS_NAME {
        return Err(ParseError::InvalidClassName(format!(
            "expected {}, got {}",
            T::CLASS_NAME,
            object.class_name()
        )));
    }
    T::from_object(object)
}
