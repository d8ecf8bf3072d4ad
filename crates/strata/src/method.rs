//! Method layering.
//!
//! Every method of a model is an ordered stack of layers, bottom first. The
//! base layer comes from the model (or mixin) that declared the method; each
//! `extend` pushes a layer on top. At bootstrap the layers contributed by
//! mixins are spliced below the model's own layers, so the top layer is
//! always the most specific implementation.
//!
//! Calls carry their position explicitly: dispatching a layer pushes a
//! [`Frame`] on the environment of the collection handed to it, and
//! `super_()` resumes at `frame.layer - 1`.

use crate::recordset::RecordCollection;
use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use strata_core::{Error, FromValue, Result, Value};

/// A type-erased method layer implementation.
pub type MethodFn = Arc<dyn Fn(&RecordCollection, &[Value]) -> Result<Value> + Send + Sync>;

/// Parameter and return types of a method, used to check that extensions
/// are compatible with the layers below them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<&'static str>,
    pub ret: &'static str,
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn({}) -> {}", self.params.join(", "), self.ret)
    }
}

/// Conversion of a typed closure into a method layer.
///
/// Implemented for closures taking the record collection followed by up to
/// four arguments that implement [`FromValue`], and returning a
/// `Result` of anything convertible into a [`Value`].
pub trait IntoMethod<Args>: Send + Sync + 'static {
    fn signature() -> Signature;
    fn into_method(self) -> MethodFn;
}

fn arity_error(expected: usize, got: usize) -> Error {
    Error::Custom(format!(
        "method takes {} argument(s) but {} were given",
        expected, got
    ))
}

macro_rules! impl_into_method {
    ($count:expr; $($arg:ident : $var:ident),*) => {
        impl<F, R, $($arg,)*> IntoMethod<($($arg,)*)> for F
        where
            F: Fn(&RecordCollection, $($arg),*) -> Result<R> + Send + Sync + 'static,
            R: Into<Value>,
            $($arg: FromValue + 'static,)*
        {
            fn signature() -> Signature {
                Signature {
                    params: vec![$(type_name::<$arg>()),*],
                    ret: type_name::<R>(),
                }
            }

            #[allow(unused_mut, unused_variables)]
            fn into_method(self) -> MethodFn {
                Arc::new(move |rs: &RecordCollection, args: &[Value]| {
                    if args.len() > $count {
                        return Err(arity_error($count, args.len()));
                    }
                    let mut it = args.iter();
                    $(let $var = $arg::from_value(it.next().unwrap_or(&Value::Null))?;)*
                    self(rs, $($var),*).map(Into::into)
                })
            }
        }
    };
}

impl_into_method!(0;);
impl_into_method!(1; A1: a1);
impl_into_method!(2; A1: a1, A2: a2);
impl_into_method!(3; A1: a1, A2: a2, A3: a3);
impl_into_method!(4; A1: a1, A2: a2, A3: a3, A4: a4);

/// One implementation in a method's override chain.
#[derive(Clone)]
pub struct MethodLayer {
    /// Model or mixin that contributed the layer
    pub origin: String,
    pub func: MethodFn,
}

impl fmt::Debug for MethodLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodLayer")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// A method of a model: its signature and its layers, bottom first.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub model: String,
    pub signature: Signature,
    pub layers: Vec<MethodLayer>,
    /// Whether the model declared the base layer itself, as opposed to only
    /// extending a method it gets from a mixin.
    pub(crate) declared: bool,
}

impl Method {
    pub(crate) fn new(model: &str, name: &str, signature: Signature, declared: bool) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            signature,
            layers: Vec::new(),
            declared,
        }
    }

    /// Index of the topmost layer.
    pub fn top(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    /// Models that contributed each layer, top first.
    pub fn layer_origins(&self) -> Vec<&str> {
        self.layers.iter().rev().map(|l| l.origin.as_str()).collect()
    }
}

/// An active method call: which layer of which method is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub model: String,
    pub method: String,
    pub layer: usize,
}
