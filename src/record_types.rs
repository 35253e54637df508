use std::borrow::Cow;
use std::rc::Rc;
use std::sync::Arc;

/// Implemented by everything that travels through a map/reduce run. The identity decides
/// which reducer a mapped record is routed to, so it has to be stable: two records that
/// should be aggregated together must return the same id.
pub trait Identifiable {
    fn id(&self) -> Cow<'_, str>;
}

impl Identifiable for String {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl<'a> Identifiable for &'a str {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl<T: Identifiable + ?Sized> Identifiable for Box<T> {
    fn id(&self) -> Cow<'_, str> {
        (**self).id()
    }
}

impl<T: Identifiable + ?Sized> Identifiable for Arc<T> {
    fn id(&self) -> Cow<'_, str> {
        (**self).id()
    }
}

impl<T: Identifiable + ?Sized> Identifiable for Rc<T> {
    fn id(&self) -> Cow<'_, str> {
        (**self).id()
    }
}

/// A (key,value) pair. The key is the identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub value: String,
}

impl Record {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Record {
        Record {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Identifiable for Record {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.key)
    }
}
