// Shoutout to https://github.com/sunshowers-code/borrow-complex-key-example/blob/main/src/lib.rs

use std::{
    borrow::Borrow,
    fmt::Display,
    hash::{Hash, Hasher},
};

/// A remote-forwarding binding as the client requested it: bind address
/// plus bind port. Cancellation looks bindings up by this exact pair, so
/// a forward requested with port 0 is cancelled with port 0.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct BindAddress(pub String, pub u32);

impl Display for BindAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

// Borrowed form, for map lookups without allocating the address string.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct BorrowedBindAddress<'a>(pub(crate) &'a str, pub(crate) &'a u32);

impl<'a> Borrow<dyn BindAddressKey + 'a> for BindAddress {
    fn borrow(&self) -> &(dyn BindAddressKey + 'a) {
        self
    }
}

pub(crate) trait BindAddressKey {
    fn key(&self) -> BorrowedBindAddress<'_>;
}

impl BindAddressKey for BindAddress {
    fn key(&self) -> BorrowedBindAddress<'_> {
        BorrowedBindAddress(self.0.as_str(), &self.1)
    }
}

impl BindAddressKey for BorrowedBindAddress<'_> {
    fn key(&self) -> BorrowedBindAddress<'_> {
        *self
    }
}

impl PartialEq for dyn BindAddressKey + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.key().eq(&other.key())
    }
}

impl Eq for dyn BindAddressKey + '_ {}

impl Hash for dyn BindAddressKey + '_ {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state)
    }
}
