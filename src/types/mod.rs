pub mod provider;

pub use provider::{CAProviderClass, CAProviderClassSpec, ProviderRef};
