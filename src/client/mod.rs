mod blocking;

pub(crate) mod core;

pub use self::blocking::{Client, ClientBuilder, SdrService};
